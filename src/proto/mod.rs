//! Protocol registry: a catalog of known protocol layers, each exposing a
//! field schema, default values, a serializer/parser, and a next-header
//! rule.
//!
//! Header encode/decode for IPv4, IPv6, UDP, ICMPv4, and ICMPv6 is adapted
//! from `etherparse`'s per-protocol header structs, trimmed to the
//! fixed-size, no-options case this crate's probes need — traceroute
//! probes never carry IP options or TCP-style variable headers.

pub mod checksum;
pub mod icmpv4;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;
pub mod udp;

use std::net::IpAddr;

use crate::error::ProtocolError;
use crate::field::{Field, FieldType};

/// One entry in a protocol's field schema: name, type, and bit position
/// within the serialized header.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub bit_offset: usize,
    pub bit_width: usize,
}

/// Context a layer needs to finalize computed fields (length, checksum) that
/// depend on data outside its own bytes — the IP pseudo header for UDP/ICMP
/// checksums, or the serialized bytes of the layers below it.
pub struct FinalizeCtx<'a> {
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    /// Bytes of every layer below this one, concatenated, including the
    /// final payload. Used for pseudo-header checksums.
    pub payload: &'a [u8],
}

/// Immutable per-protocol record. Registered once at process start, never
/// mutated — implementations are stateless zero-sized types.
pub trait ProtocolDescriptor: Send + Sync {
    fn name(&self) -> &'static str;
    fn schema(&self) -> &'static [FieldSpec];
    /// Fixed serialized length in bytes. All protocols this registry knows
    /// about (IPv4/IPv6/UDP/ICMPv4/ICMPv6 without options) have one.
    fn header_len(&self) -> usize;
    fn default_fields(&self) -> Vec<Field>;
    /// Subset of field names ECMP routers hash on — the flow identifier.
    fn flow_id_fields(&self) -> &'static [&'static str];
    /// Name of the next protocol layer, decided from already-set fields
    /// (e.g. IPv4 `protocol` byte -> `"udp"`).
    fn next_protocol(&self, fields: &[Field]) -> Option<&'static str>;
    /// Serializes fields to their fixed-size wire layout. Computed fields
    /// (checksum, length) are written as currently held; call
    /// [`ProtocolDescriptor::finalize`] first to make them correct.
    fn serialize(&self, fields: &[Field]) -> Result<Vec<u8>, ProtocolError>;
    /// Best-effort parse of exactly `header_len()` bytes into fields.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<Field>, ProtocolError>;
    /// Recomputes any fields that depend on context outside this layer
    /// (checksum, total length). No-op for layers with no computed fields.
    fn finalize(&self, fields: &mut Vec<Field>, ctx: &FinalizeCtx) -> Result<(), ProtocolError>;
    /// Field name holding this layer's checksum, if any.
    fn checksum_field(&self) -> Option<&'static str> {
        None
    }
}

/// Looks up a protocol descriptor by name. Fatal error if unknown.
pub fn lookup(name: &str) -> Result<&'static dyn ProtocolDescriptor, ProtocolError> {
    static IPV4: ipv4::Ipv4Protocol = ipv4::Ipv4Protocol;
    static IPV6: ipv6::Ipv6Protocol = ipv6::Ipv6Protocol;
    static UDP: udp::UdpProtocol = udp::UdpProtocol;
    static ICMPV4: icmpv4::Icmpv4Protocol = icmpv4::Icmpv4Protocol;
    static ICMPV6: icmpv6::Icmpv6Protocol = icmpv6::Icmpv6Protocol;

    match name {
        "ipv4" => Ok(&IPV4),
        "ipv6" => Ok(&IPV6),
        "udp" => Ok(&UDP),
        "icmpv4" => Ok(&ICMPV4),
        "icmpv6" => Ok(&ICMPV6),
        other => Err(ProtocolError::UnknownProtocol(other.to_string())),
    }
}

/// Field lookup helper shared by every `parse`/`finalize` implementation:
/// find a field by name, erroring with `UnknownField` when the schema
/// doesn't declare it.
pub(crate) fn field_by_name<'a>(
    fields: &'a [Field],
    name: &str,
) -> Result<&'a Field, ProtocolError> {
    fields
        .iter()
        .find(|f| f.name() == name)
        .ok_or_else(|| ProtocolError::Field(crate::error::FieldError::UnknownField(name.to_string())))
}

pub(crate) fn set_field(fields: &mut Vec<Field>, field: Field) {
    if let Some(existing) = fields.iter_mut().find(|f| f.name() == field.name()) {
        *existing = field;
    } else {
        fields.push(field);
    }
}
