//! PostgreSQL type identifiers and binary parameter encoding.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::error::{BuildError, PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMPTZ: Oid = Oid(1184);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Types whose binary form is the raw UTF-8 text.
    pub fn is_text_like(self) -> bool {
        matches!(self, Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Values
// ============================================================================

/// A parameter or column value.
///
/// The variant is only a carrier: the wire encoding of a parameter is chosen
/// by the type the backend declared for it in ParameterDescription.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    /// Already binary-encoded data for the given type.
    Raw { oid: Oid, data: Vec<u8> },
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Short name of the variant, used in build errors.
    pub fn kind(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            PgValue::Bool(_) => "bool",
            PgValue::Int2(_) => "int2",
            PgValue::Int4(_) => "int4",
            PgValue::Int8(_) => "int8",
            PgValue::Float4(_) => "float4",
            PgValue::Float8(_) => "float8",
            PgValue::Text(_) => "text",
            PgValue::Bytea(_) => "bytea",
            PgValue::Raw { .. } => "raw",
        }
    }

    /// Write this value as a Bind parameter: int32 length (-1 for NULL)
    /// followed by the binary encoding for the `declared` type.
    ///
    /// Integers widen losslessly (`Int2` into `int4`/`int8`, `Int4` into
    /// `int8`) and `Float4` widens into `float8`. Anything else that does not
    /// match the declared type is rejected before a byte is written.
    pub fn put_binary(
        &self,
        declared: Oid,
        index: usize,
        buf: &mut BytesMut,
    ) -> Result<(), BuildError> {
        match (declared, self) {
            (_, PgValue::Null) => buf.put_i32(-1),

            (Oid::INT4, PgValue::Int4(v)) => {
                buf.put_i32(4);
                buf.put_i32(*v);
            }
            (Oid::INT4, PgValue::Int2(v)) => {
                buf.put_i32(4);
                buf.put_i32(i32::from(*v));
            }
            (Oid::INT2, PgValue::Int2(v)) => {
                buf.put_i32(2);
                buf.put_i16(*v);
            }
            (Oid::INT8, PgValue::Int8(v)) => {
                buf.put_i32(8);
                buf.put_i64(*v);
            }
            (Oid::INT8, PgValue::Int4(v)) => {
                buf.put_i32(8);
                buf.put_i64(i64::from(*v));
            }
            (Oid::INT8, PgValue::Int2(v)) => {
                buf.put_i32(8);
                buf.put_i64(i64::from(*v));
            }

            (Oid::BOOL, PgValue::Bool(v)) => {
                buf.put_i32(1);
                buf.put_u8(u8::from(*v));
            }

            (Oid::FLOAT4, PgValue::Float4(v)) => {
                buf.put_i32(4);
                buf.put_f32(*v);
            }
            (Oid::FLOAT8, PgValue::Float8(v)) => {
                buf.put_i32(8);
                buf.put_f64(*v);
            }
            (Oid::FLOAT8, PgValue::Float4(v)) => {
                buf.put_i32(8);
                buf.put_f64(f64::from(*v));
            }

            (oid, PgValue::Text(s)) if oid.is_text_like() => put_bytes(s.as_bytes(), buf)?,
            (Oid::BYTEA, PgValue::Bytea(b)) => put_bytes(b, buf)?,
            (oid, PgValue::Raw { oid: raw_oid, data }) if oid == *raw_oid => put_bytes(data, buf)?,

            _ => {
                return Err(BuildError::UnsupportedParameterType {
                    index,
                    declared,
                    value: self.kind(),
                })
            }
        }
        Ok(())
    }

    /// Decode a column value received in binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
            data.try_into().map_err(|_| {
                PgError::Protocol(format!(
                    "invalid length {} for binary value of oid {}",
                    data.len(),
                    oid
                ))
            })
        }

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(fixed::<1>(oid, data)?[0] != 0)),
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(oid, data)?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(oid, data)?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(oid, data)?))),
            _ if oid.is_text_like() => String::from_utf8(data.to_vec())
                .map(PgValue::Text)
                .map_err(|e| PgError::Protocol(format!("invalid UTF-8 in text value: {}", e))),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }
}

fn put_bytes(data: &[u8], buf: &mut BytesMut) -> Result<(), BuildError> {
    let len = i32::try_from(data.len()).map_err(|_| BuildError::TooLarge {
        what: "parameter value",
    })?;
    buf.put_i32(len);
    buf.put_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &PgValue, declared: Oid) -> Result<Vec<u8>, BuildError> {
        let mut buf = BytesMut::new();
        value.put_binary(declared, 0, &mut buf)?;
        Ok(buf.to_vec())
    }

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());
    }

    #[test]
    fn test_int4_is_length_prefixed_big_endian() {
        let encoded = encode(&PgValue::Int4(0x0102_0304), Oid::INT4).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_int4_roundtrip_at_extremes() {
        for v in [i32::MIN, -1, 0, 1, 42, i32::MAX] {
            let encoded = encode(&PgValue::Int4(v), Oid::INT4).unwrap();
            let decoded = PgValue::decode_binary(Oid::INT4, &encoded[4..]).unwrap();
            assert_eq!(decoded, PgValue::Int4(v));
        }
    }

    #[test]
    fn test_integer_widening() {
        let encoded = encode(&PgValue::Int4(-7), Oid::INT8).unwrap();
        assert_eq!(&encoded[..4], &8i32.to_be_bytes());
        assert_eq!(&encoded[4..], &(-7i64).to_be_bytes());

        let encoded = encode(&PgValue::Int2(300), Oid::INT4).unwrap();
        assert_eq!(&encoded[4..], &300i32.to_be_bytes());
    }

    #[test]
    fn test_narrowing_is_rejected() {
        let err = encode(&PgValue::Int8(1), Oid::INT4).unwrap_err();
        assert_eq!(
            err,
            BuildError::UnsupportedParameterType {
                index: 0,
                declared: Oid::INT4,
                value: "int8",
            }
        );
    }

    #[test]
    fn test_undeclared_type_is_rejected() {
        let err = encode(&PgValue::Text("2024-01-01".into()), Oid::DATE).unwrap_err();
        assert!(matches!(
            err,
            BuildError::UnsupportedParameterType { declared: Oid::DATE, .. }
        ));
    }

    #[test]
    fn test_null_has_negative_length() {
        let encoded = encode(&PgValue::Null, Oid::INT4).unwrap();
        assert_eq!(encoded, (-1i32).to_be_bytes().to_vec());
    }

    #[test]
    fn test_text_and_bool() {
        let encoded = encode(&PgValue::Text("hi".into()), Oid::VARCHAR).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 2, b'h', b'i']);

        let encoded = encode(&PgValue::Bool(true), Oid::BOOL).unwrap();
        assert_eq!(encoded, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        assert!(PgValue::decode_binary(Oid::INT4, &[0, 1]).is_err());
    }
}
