use crate::schema::ColumnType;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    fmt,
};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Uint(u128),
    Int(i128),
    Address([u8; 20]),
    Bytes32([u8; 32]),
    String(String),
    Bytes(Vec<u8>),
    Enum(u8),
}

/// Column name to value, ordered for stable comparison and output.
pub type FieldMap = BTreeMap<String, Value>;

impl Value {
    /// The value a column holds before anything has been written to it.
    pub fn default_for(ty: &ColumnType) -> Self {
        match ty {
            ColumnType::Bool => Value::Bool(false),
            ColumnType::Uint(_) => Value::Uint(0),
            ColumnType::Int(_) => Value::Int(0),
            ColumnType::Address => Value::Address([0; 20]),
            ColumnType::Bytes32 => Value::Bytes32([0; 32]),
            ColumnType::String => Value::String(String::new()),
            ColumnType::Bytes => Value::Bytes(Vec::new()),
            ColumnType::Enum(_) => Value::Enum(0),
        }
    }

    /// Whether the value can be stored in a column of the given type.
    pub fn conforms_to(&self, ty: &ColumnType, enum_len: Option<usize>) -> bool {
        if !ty.has_valid_width() {
            return false;
        }
        match (self, ty) {
            (Value::Bool(_), ColumnType::Bool) => true,
            (Value::Uint(v), ColumnType::Uint(bits)) => *bits == 128 || *v >> *bits == 0,
            (Value::Int(v), ColumnType::Int(bits)) => int_fits(*v, *bits),
            (Value::Address(_), ColumnType::Address) => true,
            (Value::Bytes32(_), ColumnType::Bytes32) => true,
            (Value::String(_), ColumnType::String) => true,
            (Value::Bytes(_), ColumnType::Bytes) => true,
            (Value::Enum(index), ColumnType::Enum(_)) => {
                enum_len.is_some_and(|len| usize::from(*index) < len)
            }
            _ => false,
        }
    }

    /// Decodes raw column bytes. `enum_len` is the variant count for enum columns.
    pub fn decode(
        ty: &ColumnType,
        bytes: &[u8],
        enum_len: Option<usize>,
    ) -> Result<Self, String> {
        if !ty.has_valid_width() {
            return Err(format!("unsupported column type {ty}"));
        }
        if let Some(width) = ty.static_width() {
            if bytes.len() != width {
                return Err(format!(
                    "{ty} expects {width} bytes, got {}",
                    bytes.len()
                ));
            }
        }
        let value = match ty {
            ColumnType::Bool => match bytes[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(format!("invalid bool byte {other:#04x}")),
            },
            ColumnType::Uint(_) => Value::Uint(be_to_u128(bytes)),
            ColumnType::Int(bits) => {
                let shift = 128 - u32::from(*bits);
                let raw = be_to_u128(bytes);
                Value::Int(((raw << shift) as i128) >> shift)
            }
            ColumnType::Address => {
                let mut address = [0u8; 20];
                address.copy_from_slice(bytes);
                Value::Address(address)
            }
            ColumnType::Bytes32 => {
                let mut word = [0u8; 32];
                word.copy_from_slice(bytes);
                Value::Bytes32(word)
            }
            ColumnType::String => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| format!("string is not valid UTF-8: {e}"))?;
                Value::String(text.to_string())
            }
            ColumnType::Bytes => Value::Bytes(bytes.to_vec()),
            ColumnType::Enum(name) => {
                let index = bytes[0];
                let len = enum_len.unwrap_or(0);
                if usize::from(index) >= len {
                    return Err(format!(
                        "enum {name} has {len} variants, got index {index}"
                    ));
                }
                Value::Enum(index)
            }
        };
        Ok(value)
    }

    /// Encodes the value with the column layout `decode` expects.
    pub fn encode(&self, ty: &ColumnType) -> Result<Vec<u8>, String> {
        if !self.conforms_to(ty, Some(256)) {
            return Err(format!("value {self} does not fit column type {ty}"));
        }
        let bytes = match (self, ty) {
            (Value::Bool(v), _) => vec![u8::from(*v)],
            (Value::Uint(v), ColumnType::Uint(bits)) => {
                v.to_be_bytes()[16 - usize::from(*bits) / 8..].to_vec()
            }
            (Value::Int(v), ColumnType::Int(bits)) => {
                (*v as u128).to_be_bytes()[16 - usize::from(*bits) / 8..].to_vec()
            }
            (Value::Address(v), _) => v.to_vec(),
            (Value::Bytes32(v), _) => v.to_vec(),
            (Value::String(v), _) => v.as_bytes().to_vec(),
            (Value::Bytes(v), _) => v.clone(),
            (Value::Enum(v), _) => vec![*v],
            _ => return Err(format!("value {self} does not fit column type {ty}")),
        };
        Ok(bytes)
    }

    pub fn encode_hex(&self, ty: &ColumnType) -> Result<String, String> {
        self.encode(ty).map(|bytes| format!("0x{}", hex::encode(bytes)))
    }
}

fn int_fits(v: i128, bits: u16) -> bool {
    if bits == 0 {
        return false;
    }
    if bits >= 128 {
        return true;
    }
    let half = 1i128 << (bits - 1);
    (-half..half).contains(&v)
}

fn be_to_u128(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte))
}

/// Parses a hex payload, with or without the `0x` prefix.
pub fn decode_hex(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(digits).map_err(|e| format!("invalid hex payload '{raw}': {e}"))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Address(v) => write!(f, "0x{}", hex::encode(v)),
            Value::Bytes32(v) => write!(f, "0x{}", hex::encode(v)),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Value::Enum(v) => write!(f, "#{v}"),
        }
    }
}

/// Composite primary key: one value per key column, in key-tuple order.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordKey(Vec<Value>);

impl RecordKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for RecordKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Value> for RecordKey {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn decode__uint_reads_big_endian() {
        // given
        let bytes = [0x01, 0x02];

        // when
        let value = Value::decode(&ColumnType::Uint(16), &bytes, None).unwrap();

        // then
        assert_eq!(value, Value::Uint(0x0102));
    }

    #[test]
    fn decode__int_sign_extends_negative_values() {
        // given
        let bytes = [0xff, 0xfe];

        // when
        let value = Value::decode(&ColumnType::Int(16), &bytes, None).unwrap();

        // then
        assert_eq!(value, Value::Int(-2));
    }

    #[test]
    fn decode__wrong_width_is_rejected() {
        let result = Value::decode(&ColumnType::Uint(32), &[0, 1], None);
        assert!(result.is_err());
    }

    #[test]
    fn decode__bool_rejects_values_other_than_zero_or_one() {
        let result = Value::decode(&ColumnType::Bool, &[2], None);
        assert!(result.is_err());
    }

    #[test]
    fn decode__enum_index_must_be_declared() {
        // given
        let ty = ColumnType::Enum("Direction".into());

        // when
        let ok = Value::decode(&ty, &[3], Some(4));
        let out_of_range = Value::decode(&ty, &[4], Some(4));

        // then
        assert_eq!(ok.unwrap(), Value::Enum(3));
        assert!(out_of_range.is_err());
    }

    #[test]
    fn decode__string_rejects_invalid_utf8() {
        let result = Value::decode(&ColumnType::String, &[0xff, 0xfe], None);
        assert!(result.is_err());
    }

    #[test]
    fn encode__int_uses_twos_complement_of_column_width() {
        // given
        let value = Value::Int(-1);

        // when
        let encoded = value.encode(&ColumnType::Int(24)).unwrap();

        // then
        assert_eq!(encoded, vec![0xff, 0xff, 0xff]);
    }

    #[test]
    fn encode__rejects_values_wider_than_column() {
        assert!(Value::Uint(256).encode(&ColumnType::Uint(8)).is_err());
        assert!(Value::Int(128).encode(&ColumnType::Int(8)).is_err());
    }

    #[test]
    fn encode__invalid_integer_width_is_an_error() {
        assert!(Value::Uint(4095).encode(&ColumnType::Uint(12)).is_err());
        assert!(Value::Uint(1).encode(&ColumnType::Uint(200)).is_err());
        assert!(Value::Int(0).encode(&ColumnType::Int(0)).is_err());
    }

    #[test]
    fn decode__invalid_integer_width_is_an_error() {
        assert!(Value::decode(&ColumnType::Uint(12), &[0xff], None).is_err());
        assert!(Value::decode(&ColumnType::Int(0), &[], None).is_err());
    }

    #[test]
    fn conforms_to__invalid_integer_width_never_matches() {
        assert!(!Value::Int(0).conforms_to(&ColumnType::Int(0), None));
        assert!(!Value::Uint(0).conforms_to(&ColumnType::Uint(200), None));
    }

    #[test]
    fn decode_hex__accepts_optional_prefix() {
        assert_eq!(decode_hex("0x0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(decode_hex("0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert!(decode_hex("0xzz").is_err());
    }
}
