//! Typed field: the universal tagged value used for header fields and
//! event payloads.
//!
//! Modeled as a genuine Rust sum type ([`Field`] is an `enum`) rather than
//! a tagged union reinterpreted by hand — every place a C-style
//! implementation would `switch` on a type tag becomes an exhaustive
//! `match` the compiler checks for us.

use std::cmp::Ordering;
use std::net::IpAddr;

use crate::error::FieldError;

/// The type tag of a [`Field`]. `I4` is a nibble and may only be read/written
/// paired with another `I4` at a known byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    I4,
    I8,
    I16,
    I32,
    String,
    Bytes,
    Address,
}

impl FieldType {
    /// Size in bytes, rounded up. `I4` is half a byte.
    pub fn size(self) -> FieldSize {
        match self {
            FieldType::I4 => FieldSize::Nibble,
            FieldType::I8 => FieldSize::Bytes(1),
            FieldType::I16 => FieldSize::Bytes(2),
            FieldType::I32 => FieldSize::Bytes(4),
            FieldType::String | FieldType::Bytes => FieldSize::Variable,
            FieldType::Address => FieldSize::Variable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSize {
    Nibble,
    Bytes(usize),
    Variable,
}

/// A named, typed value. Owns its name and payload; copied by value into a
/// [`crate::probe::Probe`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    value: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A nibble, paired at a known position; see [`FieldType::I4`].
    I4(u8),
    I8(u8),
    I16(u16),
    I32(u32),
    String(String),
    Bytes(Vec<u8>),
    Address(IpAddr),
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Field {
            name: name.into(),
            value,
        }
    }

    pub fn i4(name: impl Into<String>, value: u8) -> Self {
        Field::new(name, FieldValue::I4(value & 0x0f))
    }

    pub fn i8(name: impl Into<String>, value: u8) -> Self {
        Field::new(name, FieldValue::I8(value))
    }

    pub fn i16(name: impl Into<String>, value: u16) -> Self {
        Field::new(name, FieldValue::I16(value))
    }

    pub fn i32(name: impl Into<String>, value: u32) -> Self {
        Field::new(name, FieldValue::I32(value))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Field::new(name, FieldValue::String(value.into()))
    }

    pub fn bytes(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Field::new(name, FieldValue::Bytes(value.into()))
    }

    pub fn address(name: impl Into<String>, value: IpAddr) -> Self {
        Field::new(name, FieldValue::Address(value))
    }

    /// Decodes a field from its on-wire (network byte order) representation.
    /// Only `I16`/`I32` need byte-swapping; `I8`, `Bytes`, and `Address` are
    /// already host-representable bytes.
    pub fn from_wire(name: impl Into<String>, ty: FieldType, bytes: &[u8]) -> Result<Self, FieldError> {
        let name = name.into();
        let value = match ty {
            FieldType::I4 => {
                let b = *bytes.first().ok_or(FieldError::BufferTooSmall {
                    name: name.clone(),
                    bit_offset: 0,
                })?;
                FieldValue::I4(b & 0x0f)
            }
            FieldType::I8 => FieldValue::I8(*bytes.first().ok_or(FieldError::BufferTooSmall {
                name: name.clone(),
                bit_offset: 0,
            })?),
            FieldType::I16 => {
                if bytes.len() < 2 {
                    return Err(FieldError::BufferTooSmall {
                        name,
                        bit_offset: 0,
                    });
                }
                FieldValue::I16(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            FieldType::I32 => {
                if bytes.len() < 4 {
                    return Err(FieldError::BufferTooSmall {
                        name,
                        bit_offset: 0,
                    });
                }
                FieldValue::I32(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            FieldType::String => FieldValue::String(String::from_utf8_lossy(bytes).into_owned()),
            FieldType::Bytes => FieldValue::Bytes(bytes.to_vec()),
            FieldType::Address => {
                return Err(FieldError::TypeMismatch {
                    name,
                    expected: FieldType::Bytes,
                    actual: FieldType::Address,
                })
            }
        };
        Ok(Field { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn field_type(&self) -> FieldType {
        match &self.value {
            FieldValue::I4(_) => FieldType::I4,
            FieldValue::I8(_) => FieldType::I8,
            FieldValue::I16(_) => FieldType::I16,
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Bytes(_) => FieldType::Bytes,
            FieldValue::Address(_) => FieldType::Address,
        }
    }

    /// Serializes the value to network byte order.
    pub fn to_wire(&self) -> Vec<u8> {
        match &self.value {
            FieldValue::I4(v) => vec![*v & 0x0f],
            FieldValue::I8(v) => vec![*v],
            FieldValue::I16(v) => v.to_be_bytes().to_vec(),
            FieldValue::I32(v) => v.to_be_bytes().to_vec(),
            FieldValue::String(s) => s.as_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
            FieldValue::Address(a) => match a {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            },
        }
    }

    /// Compares two fields. An error, not a total order, when the types
    /// differ — mirrors `field_compare`'s `-2` sentinel in the original C,
    /// but as a typed `Result` instead of a magic number.
    pub fn compare(&self, other: &Field) -> Result<Ordering, FieldError> {
        use FieldValue::*;
        match (&self.value, &other.value) {
            (I4(a), I4(b)) => Ok(a.cmp(b)),
            (I8(a), I8(b)) => Ok(a.cmp(b)),
            (I16(a), I16(b)) => Ok(a.cmp(b)),
            (I32(a), I32(b)) => Ok(a.cmp(b)),
            (String(a), String(b)) => Ok(a.cmp(b)),
            (Bytes(a), Bytes(b)) => Ok(a.cmp(b)),
            (Address(a), Address(b)) => Ok(a.cmp(b)),
            _ => Err(FieldError::Incomparable(self.field_type(), other.field_type())),
        }
    }

    /// Human text, mirroring `field_dump`.
    pub fn dump(&self) -> String {
        match &self.value {
            FieldValue::I4(v) => format!("{v}"),
            FieldValue::I8(v) => format!("{v}"),
            FieldValue::I16(v) => format!("{v}"),
            FieldValue::I32(v) => format!("{v}"),
            FieldValue::String(s) => s.clone(),
            FieldValue::Bytes(b) => b.iter().map(|x| format!("{x:02x}")).collect(),
            FieldValue::Address(a) => a.to_string(),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.value {
            FieldValue::I4(v) | FieldValue::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self.value {
            FieldValue::I16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.value {
            FieldValue::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<IpAddr> {
        match self.value {
            FieldValue::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_i16() {
        let f = Field::i16("src_port", 3838);
        let bytes = f.to_wire();
        let back = Field::from_wire("src_port", FieldType::I16, &bytes).unwrap();
        assert_eq!(f, back);
    }

    #[test]
    fn wire_round_trip_i32() {
        let f = Field::i32("ident", 0xdead_beef);
        let bytes = f.to_wire();
        let back = Field::from_wire("ident", FieldType::I32, &bytes).unwrap();
        assert_eq!(f, back);
    }

    #[test]
    fn i4_masks_to_nibble() {
        let f = Field::i4("ihl", 0xff);
        assert_eq!(f.as_u8(), Some(0x0f));
    }

    #[test]
    fn compare_same_type_orders() {
        let a = Field::i32("x", 1);
        let b = Field::i32("x", 2);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
    }

    #[test]
    fn compare_different_types_errors() {
        let a = Field::i32("x", 1);
        let b = Field::string("x", "1");
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn compare_strings_is_lexicographic() {
        let a = Field::string("x", "alpha");
        let b = Field::string("x", "beta");
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn i16_wire_round_trip(value in any::<u16>()) {
            let f = Field::i16("x", value);
            let back = Field::from_wire("x", FieldType::I16, &f.to_wire()).unwrap();
            prop_assert_eq!(f, back);
        }

        #[test]
        fn i32_wire_round_trip(value in any::<u32>()) {
            let f = Field::i32("x", value);
            let back = Field::from_wire("x", FieldType::I32, &f.to_wire()).unwrap();
            prop_assert_eq!(f, back);
        }

        #[test]
        fn i8_wire_round_trip(value in any::<u8>()) {
            let f = Field::i8("x", value);
            let back = Field::from_wire("x", FieldType::I8, &f.to_wire()).unwrap();
            prop_assert_eq!(f, back);
        }

        #[test]
        fn bytes_wire_round_trip(value in proptest::collection::vec(any::<u8>(), 0..32)) {
            let f = Field::bytes("x", value.clone());
            let back = Field::from_wire("x", FieldType::Bytes, &f.to_wire()).unwrap();
            prop_assert_eq!(f, back);
        }

        /// Same type, any values: ordering must be consistent with the
        /// underlying integer ordering, never an error.
        #[test]
        fn i32_compare_matches_integer_ordering(a in any::<u32>(), b in any::<u32>()) {
            let fa = Field::i32("x", a);
            let fb = Field::i32("x", b);
            prop_assert_eq!(fa.compare(&fb).unwrap(), a.cmp(&b));
        }
    }
}
