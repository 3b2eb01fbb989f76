//! ICMPv6 header descriptor. Adapted from `etherparse::Icmpv6Header`/
//! `Icmpv6Type`, trimmed the same way as [`crate::proto::icmpv4`].

use super::checksum::Sum16BitWords;
use super::{field_by_name, set_field, FieldSpec, FinalizeCtx, ProtocolDescriptor};
use crate::error::ProtocolError;
use crate::field::{Field, FieldType};
use std::net::IpAddr;

pub const HEADER_LEN: usize = 8;
/// ICMPv6 quotes as much of the original packet as fits the minimum IPv6
/// MTU; for our fixed-size IPv6+UDP probes that's the full 40 byte IPv6
/// header plus the full 8 byte UDP header.
pub const QUOTED_HEADER_LEN: usize = 48;

pub const TYPE_DEST_UNREACHABLE: u8 = 1;
pub const TYPE_TIME_EXCEEDED: u8 = 3;
pub const CODE_PORT_UNREACHABLE: u8 = 4;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec { name: "icmp_type", ty: FieldType::I8, bit_offset: 0, bit_width: 8 },
    FieldSpec { name: "code", ty: FieldType::I8, bit_offset: 8, bit_width: 8 },
    FieldSpec { name: "checksum", ty: FieldType::I16, bit_offset: 16, bit_width: 16 },
    FieldSpec { name: "rest_of_header", ty: FieldType::I32, bit_offset: 32, bit_width: 32 },
];

pub struct Icmpv6Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icmpv6Kind {
    TimeExceeded,
    DestinationUnreachable { port_unreachable: bool },
    Other { icmp_type: u8, code: u8 },
}

pub fn classify(icmp_type: u8, code: u8) -> Icmpv6Kind {
    match icmp_type {
        TYPE_TIME_EXCEEDED => Icmpv6Kind::TimeExceeded,
        TYPE_DEST_UNREACHABLE => Icmpv6Kind::DestinationUnreachable {
            port_unreachable: code == CODE_PORT_UNREACHABLE,
        },
        other => Icmpv6Kind::Other { icmp_type: other, code },
    }
}

impl ProtocolDescriptor for Icmpv6Protocol {
    fn name(&self) -> &'static str {
        "icmpv6"
    }

    fn schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn default_fields(&self) -> Vec<Field> {
        vec![
            Field::i8("icmp_type", TYPE_TIME_EXCEEDED),
            Field::i8("code", 0),
            Field::i16("checksum", 0),
            Field::i32("rest_of_header", 0),
        ]
    }

    fn flow_id_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn next_protocol(&self, _fields: &[Field]) -> Option<&'static str> {
        None
    }

    fn checksum_field(&self) -> Option<&'static str> {
        Some("checksum")
    }

    fn serialize(&self, fields: &[Field]) -> Result<Vec<u8>, ProtocolError> {
        let icmp_type = field_by_name(fields, "icmp_type")?.as_u8().unwrap_or(0);
        let code = field_by_name(fields, "code")?.as_u8().unwrap_or(0);
        let checksum = field_by_name(fields, "checksum")?.as_u16().unwrap_or(0);
        let rest = field_by_name(fields, "rest_of_header")?.as_u32().unwrap_or(0);

        let mut out = Vec::with_capacity(HEADER_LEN);
        out.push(icmp_type);
        out.push(code);
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&rest.to_be_bytes());
        Ok(out)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<Field>, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Field(crate::error::FieldError::BufferTooSmall {
                name: "icmpv6".to_string(),
                bit_offset: 0,
            }));
        }
        Ok(vec![
            Field::i8("icmp_type", bytes[0]),
            Field::i8("code", bytes[1]),
            Field::i16("checksum", u16::from_be_bytes([bytes[2], bytes[3]])),
            Field::i32(
                "rest_of_header",
                u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ),
        ])
    }

    /// ICMPv6's checksum, unlike ICMPv4's, is computed over an IPv6 pseudo
    /// header too (RFC 4443 §2.3) — so, unlike `icmpv4::finalize`, this
    /// needs `ctx.src_ip`/`ctx.dst_ip`.
    fn finalize(&self, fields: &mut Vec<Field>, ctx: &FinalizeCtx) -> Result<(), ProtocolError> {
        set_field(fields, Field::i16("checksum", 0));
        let header_bytes = self.serialize(fields)?;
        let icmp_len = (header_bytes.len() + ctx.payload.len()) as u32;

        let pseudo = match (ctx.src_ip, ctx.dst_ip) {
            (Some(IpAddr::V6(s)), Some(IpAddr::V6(d))) => Sum16BitWords::new()
                .add_16bytes(s.octets())
                .add_16bytes(d.octets())
                .add_4bytes(icmp_len.to_be_bytes())
                .add_2bytes([0, 58]),
            _ => Sum16BitWords::new(),
        };
        let sum = pseudo.add_slice(&header_bytes).add_slice(ctx.payload);
        set_field(fields, Field::i16("checksum", sum.ones_complement()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_time_exceeded() {
        assert_eq!(classify(3, 0), Icmpv6Kind::TimeExceeded);
    }

    #[test]
    fn classify_port_unreachable() {
        assert_eq!(
            classify(1, 4),
            Icmpv6Kind::DestinationUnreachable { port_unreachable: true }
        );
    }

    #[test]
    fn round_trip() {
        let proto = Icmpv6Protocol;
        let mut fields = proto.default_fields();
        proto.finalize(&mut fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: &[] }).unwrap();
        let bytes = proto.serialize(&fields).unwrap();
        let parsed = proto.parse(&bytes).unwrap();
        for original in &fields {
            let found = parsed.iter().find(|f| f.name() == original.name()).unwrap();
            assert_eq!(found, original);
        }
    }
}
