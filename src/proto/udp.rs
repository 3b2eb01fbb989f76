//! UDP header descriptor and the Paris-traceroute checksum-as-serial trick.
//!
//! The pseudo-header checksum math is adapted from
//! `etherparse::UdpHeader::calc_checksum_ipv4/ipv6`. [`solve_payload_tag`]
//! is new: it inverts that same checksum so a 2-byte payload tag can be
//! chosen that makes the *correctly computed* UDP checksum equal an
//! arbitrary desired value — the serial that survives an ICMP quote of the
//! original header.

use std::net::IpAddr;

use super::checksum::Sum16BitWords;
use super::{field_by_name, set_field, FieldSpec, FinalizeCtx, ProtocolDescriptor};
use crate::error::ProtocolError;
use crate::field::{Field, FieldType};

pub const HEADER_LEN: usize = 8;

const SCHEMA: &[FieldSpec] = &[
    FieldSpec { name: "src_port", ty: FieldType::I16, bit_offset: 0, bit_width: 16 },
    FieldSpec { name: "dst_port", ty: FieldType::I16, bit_offset: 16, bit_width: 16 },
    FieldSpec { name: "length", ty: FieldType::I16, bit_offset: 32, bit_width: 16 },
    FieldSpec { name: "checksum", ty: FieldType::I16, bit_offset: 48, bit_width: 16 },
];

pub struct UdpProtocol;

impl ProtocolDescriptor for UdpProtocol {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn default_fields(&self) -> Vec<Field> {
        vec![
            Field::i16("src_port", 3838),
            Field::i16("dst_port", 3000),
            Field::i16("length", 0),
            Field::i16("checksum", 0),
        ]
    }

    fn flow_id_fields(&self) -> &'static [&'static str] {
        &["src_port", "dst_port"]
    }

    fn next_protocol(&self, _fields: &[Field]) -> Option<&'static str> {
        // UDP is always the last protocol layer a probe installs; any
        // reply quoting it is parsed by Network as a payload, not a layer.
        None
    }

    fn checksum_field(&self) -> Option<&'static str> {
        Some("checksum")
    }

    fn serialize(&self, fields: &[Field]) -> Result<Vec<u8>, ProtocolError> {
        let src_port = field_by_name(fields, "src_port")?.as_u16().unwrap_or(0);
        let dst_port = field_by_name(fields, "dst_port")?.as_u16().unwrap_or(0);
        let length = field_by_name(fields, "length")?.as_u16().unwrap_or(0);
        let checksum = field_by_name(fields, "checksum")?.as_u16().unwrap_or(0);

        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&src_port.to_be_bytes());
        out.extend_from_slice(&dst_port.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        Ok(out)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<Field>, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Field(crate::error::FieldError::BufferTooSmall {
                name: "udp".to_string(),
                bit_offset: 0,
            }));
        }
        Ok(vec![
            Field::i16("src_port", u16::from_be_bytes([bytes[0], bytes[1]])),
            Field::i16("dst_port", u16::from_be_bytes([bytes[2], bytes[3]])),
            Field::i16("length", u16::from_be_bytes([bytes[4], bytes[5]])),
            Field::i16("checksum", u16::from_be_bytes([bytes[6], bytes[7]])),
        ])
    }

    fn finalize(&self, fields: &mut Vec<Field>, ctx: &FinalizeCtx) -> Result<(), ProtocolError> {
        let length = (HEADER_LEN + ctx.payload.len()) as u16;
        set_field(fields, Field::i16("length", length));
        set_field(fields, Field::i16("checksum", 0));

        let (src_ip, dst_ip) = match (ctx.src_ip, ctx.dst_ip) {
            (Some(s), Some(d)) => (s, d),
            _ => return Ok(()), // no IP context (e.g. unit tests on a bare UDP layer): leave checksum at 0
        };
        let pseudo = pseudo_header_sum(src_ip, dst_ip, length);
        let header_bytes = self.serialize(fields)?;
        let sum = pseudo.add_slice(&header_bytes).add_slice(ctx.payload);
        set_field(fields, Field::i16("checksum", sum.to_ones_complement_with_no_zero()));
        Ok(())
    }
}

/// Sums the IPv4/IPv6 pseudo header (source, destination, zero-padded
/// protocol number, UDP length) — the part of the checksum that isn't in
/// the UDP header or payload bytes themselves.
pub fn pseudo_header_sum(src_ip: IpAddr, dst_ip: IpAddr, udp_length: u16) -> Sum16BitWords {
    let base = match (src_ip, dst_ip) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            Sum16BitWords::new().add_4bytes(s.octets()).add_4bytes(d.octets())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            Sum16BitWords::new().add_16bytes(s.octets()).add_16bytes(d.octets())
        }
        _ => Sum16BitWords::new(), // mismatched families: caller error, leave unchecksummed
    };
    base.add_2bytes([0, 17]).add_2bytes(udp_length.to_be_bytes())
}

/// Solves for the 2-byte payload tag that makes the UDP checksum computed
/// over `pseudo_header + udp_header(checksum=0) + payload_prefix + tag`
/// equal `desired_checksum`.
///
/// `desired_checksum` is the per-probe serial; callers must avoid
/// the reserved values `0x0000` (means "no checksum" on the wire) and
/// `0xffff` (ambiguous with the "no-zero" substitution rule), which this
/// function does not itself guard against — the serial allocator in
/// `network`/`algorithm` is responsible for skipping them.
pub fn solve_payload_tag(
    pseudo_and_header_and_prefix: &Sum16BitWords,
    desired_checksum: u16,
) -> [u8; 2] {
    let base16 = pseudo_and_header_and_prefix.folded();
    // We need the *final* folded sum (base16 + tag) to equal `target`, so
    // that its ones complement (its bitwise NOT) equals `desired_checksum`.
    let target = !desired_checksum;
    let tag_word: u16 = if target >= base16 {
        target - base16
    } else {
        // The addition carries past 0xffff once; account for the
        // end-around-carry fold by adding 0xffff back in.
        target.wrapping_sub(base16).wrapping_add(0xffff)
    };
    tag_word.to_be_bytes()
}
