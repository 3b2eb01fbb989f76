//! IPv6 header descriptor. Adapted from `etherparse::Ipv6Header`
//! (RFC 8200), trimmed to the no-extension-headers case.

use std::net::{IpAddr, Ipv6Addr};

use super::{field_by_name, set_field, FieldSpec, FinalizeCtx, ProtocolDescriptor};
use crate::error::ProtocolError;
use crate::field::{Field, FieldType};

pub const HEADER_LEN: usize = 40;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec { name: "version", ty: FieldType::I4, bit_offset: 0, bit_width: 4 },
    FieldSpec { name: "traffic_class", ty: FieldType::I8, bit_offset: 4, bit_width: 8 },
    FieldSpec { name: "flow_label", ty: FieldType::I32, bit_offset: 12, bit_width: 20 },
    FieldSpec { name: "payload_length", ty: FieldType::I16, bit_offset: 32, bit_width: 16 },
    FieldSpec { name: "next_header", ty: FieldType::I8, bit_offset: 48, bit_width: 8 },
    FieldSpec { name: "hop_limit", ty: FieldType::I8, bit_offset: 56, bit_width: 8 },
    FieldSpec { name: "src_ip", ty: FieldType::Address, bit_offset: 64, bit_width: 128 },
    FieldSpec { name: "dst_ip", ty: FieldType::Address, bit_offset: 192, bit_width: 128 },
];

pub struct Ipv6Protocol;

fn addr6(field: &Field) -> Result<Ipv6Addr, ProtocolError> {
    match field.as_address() {
        Some(IpAddr::V6(a)) => Ok(a),
        _ => Err(ProtocolError::Field(crate::error::FieldError::TypeMismatch {
            name: field.name().to_string(),
            expected: FieldType::Address,
            actual: field.field_type(),
        })),
    }
}

fn protocol_name(byte: u8) -> Option<&'static str> {
    match byte {
        17 => Some("udp"),
        58 => Some("icmpv6"),
        _ => None,
    }
}

impl ProtocolDescriptor for Ipv6Protocol {
    fn name(&self) -> &'static str {
        "ipv6"
    }

    fn schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn default_fields(&self) -> Vec<Field> {
        vec![
            Field::i4("version", 6),
            Field::i8("traffic_class", 0),
            Field::i32("flow_label", 0),
            Field::i16("payload_length", 0),
            Field::i8("next_header", 17), // UDP by default
            Field::i8("hop_limit", 64),
            Field::address("src_ip", IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            Field::address("dst_ip", IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        ]
    }

    fn flow_id_fields(&self) -> &'static [&'static str] {
        &["src_ip", "dst_ip", "next_header", "flow_label"]
    }

    fn next_protocol(&self, fields: &[Field]) -> Option<&'static str> {
        let byte = field_by_name(fields, "next_header").ok()?.as_u8()?;
        protocol_name(byte)
    }

    fn serialize(&self, fields: &[Field]) -> Result<Vec<u8>, ProtocolError> {
        let version = field_by_name(fields, "version")?.as_u8().unwrap_or(6);
        let traffic_class = field_by_name(fields, "traffic_class")?.as_u8().unwrap_or(0);
        let flow_label = field_by_name(fields, "flow_label")?.as_u32().unwrap_or(0) & 0x000f_ffff;
        let payload_length = field_by_name(fields, "payload_length")?.as_u16().unwrap_or(0);
        let next_header = field_by_name(fields, "next_header")?.as_u8().unwrap_or(17);
        let hop_limit = field_by_name(fields, "hop_limit")?.as_u8().unwrap_or(64);
        let src = addr6(field_by_name(fields, "src_ip")?)?;
        let dst = addr6(field_by_name(fields, "dst_ip")?)?;

        let flow_label_be = flow_label.to_be_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.push((version << 4) | (traffic_class >> 4));
        out.push((traffic_class << 4) | flow_label_be[1]);
        out.extend_from_slice(&flow_label_be[2..4]);
        out.extend_from_slice(&payload_length.to_be_bytes());
        out.push(next_header);
        out.push(hop_limit);
        out.extend_from_slice(&src.octets());
        out.extend_from_slice(&dst.octets());
        Ok(out)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<Field>, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Field(crate::error::FieldError::BufferTooSmall {
                name: "ipv6".to_string(),
                bit_offset: 0,
            }));
        }
        let version = bytes[0] >> 4;
        let traffic_class = (bytes[0] << 4) | (bytes[1] >> 4);
        let flow_label = u32::from_be_bytes([0, bytes[1] & 0x0f, bytes[2], bytes[3]]);
        let payload_length = u16::from_be_bytes([bytes[4], bytes[5]]);
        let next_header = bytes[6];
        let hop_limit = bytes[7];
        let mut src_octets = [0u8; 16];
        src_octets.copy_from_slice(&bytes[8..24]);
        let mut dst_octets = [0u8; 16];
        dst_octets.copy_from_slice(&bytes[24..40]);

        Ok(vec![
            Field::i4("version", version),
            Field::i8("traffic_class", traffic_class),
            Field::i32("flow_label", flow_label),
            Field::i16("payload_length", payload_length),
            Field::i8("next_header", next_header),
            Field::i8("hop_limit", hop_limit),
            Field::address("src_ip", IpAddr::V6(Ipv6Addr::from(src_octets))),
            Field::address("dst_ip", IpAddr::V6(Ipv6Addr::from(dst_octets))),
        ])
    }

    fn finalize(&self, fields: &mut Vec<Field>, ctx: &FinalizeCtx) -> Result<(), ProtocolError> {
        let payload_length = ctx.payload.len() as u16;
        set_field(fields, Field::i16("payload_length", payload_length));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let proto = Ipv6Protocol;
        let mut fields = proto.default_fields();
        set_field(&mut fields, Field::address("src_ip", IpAddr::V6(Ipv6Addr::LOCALHOST)));
        set_field(&mut fields, Field::address("dst_ip", IpAddr::V6(Ipv6Addr::LOCALHOST)));
        set_field(&mut fields, Field::i8("hop_limit", 3));
        proto.finalize(&mut fields, &FinalizeCtx { src_ip: None, dst_ip: None, payload: &[0u8; 12] }).unwrap();
        let bytes = proto.serialize(&fields).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let parsed = proto.parse(&bytes).unwrap();
        for original in &fields {
            let found = parsed.iter().find(|f| f.name() == original.name()).unwrap();
            assert_eq!(found, original, "field {} did not round-trip", original.name());
        }
    }

    #[test]
    fn next_protocol_icmpv6() {
        let mut fields = Ipv6Protocol.default_fields();
        set_field(&mut fields, Field::i8("next_header", 58));
        assert_eq!(Ipv6Protocol.next_protocol(&fields), Some("icmpv6"));
    }
}
