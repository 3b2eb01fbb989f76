//! IPv4 header descriptor. Adapted from `etherparse::Ipv4Header`/
//! `Ipv4HeaderSlice`, trimmed to the fixed 20 byte no-options case —
//! traceroute probes never carry IPv4 options.

use std::net::{IpAddr, Ipv4Addr};

use super::checksum::Sum16BitWords;
use super::{field_by_name, set_field, FieldSpec, FinalizeCtx, ProtocolDescriptor};
use crate::error::ProtocolError;
use crate::field::{Field, FieldType};

pub const HEADER_LEN: usize = 20;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec { name: "version", ty: FieldType::I4, bit_offset: 0, bit_width: 4 },
    FieldSpec { name: "ihl", ty: FieldType::I4, bit_offset: 4, bit_width: 4 },
    FieldSpec { name: "tos", ty: FieldType::I8, bit_offset: 8, bit_width: 8 },
    FieldSpec { name: "total_length", ty: FieldType::I16, bit_offset: 16, bit_width: 16 },
    FieldSpec { name: "identification", ty: FieldType::I16, bit_offset: 32, bit_width: 16 },
    FieldSpec { name: "flags", ty: FieldType::I8, bit_offset: 48, bit_width: 3 },
    FieldSpec { name: "fragment_offset", ty: FieldType::I16, bit_offset: 51, bit_width: 13 },
    FieldSpec { name: "ttl", ty: FieldType::I8, bit_offset: 64, bit_width: 8 },
    FieldSpec { name: "protocol", ty: FieldType::I8, bit_offset: 72, bit_width: 8 },
    FieldSpec { name: "checksum", ty: FieldType::I16, bit_offset: 80, bit_width: 16 },
    FieldSpec { name: "src_ip", ty: FieldType::Address, bit_offset: 96, bit_width: 32 },
    FieldSpec { name: "dst_ip", ty: FieldType::Address, bit_offset: 128, bit_width: 32 },
];

pub struct Ipv4Protocol;

fn addr4(field: &Field) -> Result<Ipv4Addr, ProtocolError> {
    match field.as_address() {
        Some(IpAddr::V4(a)) => Ok(a),
        _ => Err(ProtocolError::Field(crate::error::FieldError::TypeMismatch {
            name: field.name().to_string(),
            expected: FieldType::Address,
            actual: field.field_type(),
        })),
    }
}

/// Maps an IPv4 `protocol` byte to the next layer's registry name. The
/// reverse of `Ipv4Header::next_header` in the donor library.
fn protocol_name(byte: u8) -> Option<&'static str> {
    match byte {
        1 => Some("icmpv4"),
        17 => Some("udp"),
        _ => None,
    }
}

impl ProtocolDescriptor for Ipv4Protocol {
    fn name(&self) -> &'static str {
        "ipv4"
    }

    fn schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn default_fields(&self) -> Vec<Field> {
        vec![
            Field::i4("version", 4),
            Field::i4("ihl", 5),
            Field::i8("tos", 0),
            Field::i16("total_length", 0),
            Field::i16("identification", 0),
            Field::i8("flags", 0b010), // don't-fragment, as real traceroute implementations set
            Field::i16("fragment_offset", 0),
            Field::i8("ttl", 64),
            Field::i8("protocol", 17), // UDP by default
            Field::i16("checksum", 0),
            Field::address("src_ip", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Field::address("dst_ip", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        ]
    }

    fn flow_id_fields(&self) -> &'static [&'static str] {
        &["src_ip", "dst_ip", "protocol"]
    }

    fn next_protocol(&self, fields: &[Field]) -> Option<&'static str> {
        let byte = field_by_name(fields, "protocol").ok()?.as_u8()?;
        protocol_name(byte)
    }

    fn checksum_field(&self) -> Option<&'static str> {
        Some("checksum")
    }

    fn serialize(&self, fields: &[Field]) -> Result<Vec<u8>, ProtocolError> {
        let version = field_by_name(fields, "version")?.as_u8().unwrap_or(4);
        let ihl = field_by_name(fields, "ihl")?.as_u8().unwrap_or(5);
        let tos = field_by_name(fields, "tos")?.as_u8().unwrap_or(0);
        let total_length = field_by_name(fields, "total_length")?.as_u16().unwrap_or(0);
        let identification = field_by_name(fields, "identification")?.as_u16().unwrap_or(0);
        let flags = field_by_name(fields, "flags")?.as_u8().unwrap_or(0);
        let fragment_offset = field_by_name(fields, "fragment_offset")?.as_u16().unwrap_or(0);
        let ttl = field_by_name(fields, "ttl")?.as_u8().unwrap_or(64);
        let protocol = field_by_name(fields, "protocol")?.as_u8().unwrap_or(17);
        let checksum = field_by_name(fields, "checksum")?.as_u16().unwrap_or(0);
        let src = addr4(field_by_name(fields, "src_ip")?)?;
        let dst = addr4(field_by_name(fields, "dst_ip")?)?;

        let total_len_be = total_length.to_be_bytes();
        let id_be = identification.to_be_bytes();
        let frag_be = fragment_offset.to_be_bytes();
        let frag_and_flags = [(flags << 5) | (frag_be[0] & 0x1f), frag_be[1]];
        let checksum_be = checksum.to_be_bytes();

        let mut out = Vec::with_capacity(HEADER_LEN);
        out.push((version << 4) | ihl);
        out.push(tos);
        out.extend_from_slice(&total_len_be);
        out.extend_from_slice(&id_be);
        out.extend_from_slice(&frag_and_flags);
        out.push(ttl);
        out.push(protocol);
        out.extend_from_slice(&checksum_be);
        out.extend_from_slice(&src.octets());
        out.extend_from_slice(&dst.octets());
        Ok(out)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<Field>, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Field(crate::error::FieldError::BufferTooSmall {
                name: "ipv4".to_string(),
                bit_offset: 0,
            }));
        }
        let version = bytes[0] >> 4;
        let ihl = bytes[0] & 0x0f;
        let tos = bytes[1];
        let total_length = u16::from_be_bytes([bytes[2], bytes[3]]);
        let identification = u16::from_be_bytes([bytes[4], bytes[5]]);
        let flags = bytes[6] >> 5;
        let fragment_offset = u16::from_be_bytes([bytes[6] & 0x1f, bytes[7]]);
        let ttl = bytes[8];
        let protocol = bytes[9];
        let checksum = u16::from_be_bytes([bytes[10], bytes[11]]);
        let src = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
        let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);

        Ok(vec![
            Field::i4("version", version),
            Field::i4("ihl", ihl),
            Field::i8("tos", tos),
            Field::i16("total_length", total_length),
            Field::i16("identification", identification),
            Field::i8("flags", flags),
            Field::i16("fragment_offset", fragment_offset),
            Field::i8("ttl", ttl),
            Field::i8("protocol", protocol),
            Field::i16("checksum", checksum),
            Field::address("src_ip", IpAddr::V4(src)),
            Field::address("dst_ip", IpAddr::V4(dst)),
        ])
    }

    fn finalize(&self, fields: &mut Vec<Field>, ctx: &FinalizeCtx) -> Result<(), ProtocolError> {
        let total_length = (HEADER_LEN + ctx.payload.len()) as u16;
        set_field(fields, Field::i16("total_length", total_length));
        set_field(fields, Field::i16("checksum", 0));
        let header_without_checksum = self.serialize(fields)?;
        let sum = Sum16BitWords::new().add_slice(&header_without_checksum);
        set_field(fields, Field::i16("checksum", sum.ones_complement()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Field> {
        let mut fields = Ipv4Protocol.default_fields();
        set_field(&mut fields, Field::address("src_ip", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
        set_field(&mut fields, Field::address("dst_ip", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))));
        set_field(&mut fields, Field::i8("ttl", 5));
        fields
    }

    #[test]
    fn round_trip() {
        let proto = Ipv4Protocol;
        let mut fields = sample();
        proto
            .finalize(&mut fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: &[0u8; 8] })
            .unwrap();
        let bytes = proto.serialize(&fields).unwrap();
        let parsed = proto.parse(&bytes).unwrap();
        for original in &fields {
            let found = parsed.iter().find(|f| f.name() == original.name()).unwrap();
            assert_eq!(found, original, "field {} did not round-trip", original.name());
        }
    }

    #[test]
    fn checksum_verifies() {
        let proto = Ipv4Protocol;
        let mut fields = sample();
        proto
            .finalize(&mut fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: &[] })
            .unwrap();
        let bytes = proto.serialize(&fields).unwrap();
        // Checksumming the whole header (including the computed checksum
        // field) must fold to zero's ones complement (0xffff).
        let verify = Sum16BitWords::new().add_slice(&bytes).ones_complement();
        assert_eq!(verify, 0);
    }

    #[test]
    fn next_protocol_udp() {
        let fields = Ipv4Protocol.default_fields();
        assert_eq!(Ipv4Protocol.next_protocol(&fields), Some("udp"));
    }
}
