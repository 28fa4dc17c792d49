//! Type converter registry (C2): maps a column's type OID to a decoder that
//! turns a raw column payload (text or binary, per the column's format byte)
//! into a language-neutral [`Value`].
//!
//! Grounded on the source checker's `event_sink/pg_type_conversion.rs`
//! (`PgType` OID table, text-format parsing for uuid/json/date/timestamp) and
//! extended per the full decimal/bytea/binary-numeric requirements: numeric
//! columns decode to [`rust_decimal::Decimal`] rather than a float so scale
//! survives into the envelope, and the binary wire format (base-10000 numeric
//! digits) is supported alongside text.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::buffer::BufferReader;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::utils::Oid;

/// The wire format a column's raw bytes were sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFormat {
    Text,
    Binary,
}

/// A decoded column value, independent of the source language.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    #[serde(serialize_with = "serialize_bytes_as_pg_hex")]
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(JsonValue),
    Uuid(Uuid),
    /// Unknown OID: raw payload preserved verbatim, never dropped.
    Raw { oid: Oid, text: String },
}

fn serialize_bytes_as_pg_hex<S: serde::Serializer>(
    bytes: &[u8],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use std::fmt::Write;
    let mut hex = String::with_capacity(2 + bytes.len() * 2);
    hex.push_str("\\x");
    for b in bytes {
        let _ = write!(hex, "{b:02x}");
    }
    serializer.serialize_str(&hex)
}

/// Well-known PostgreSQL type OIDs this registry knows how to convert.
/// Grounded on the source checker's `PgType` enum, extended with the OIDs
/// the full spec's converter table requires (bytea, int2/4/8, numeric).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool = 16,
    Bytea = 17,
    Char = 18,
    Name = 19,
    Int8 = 20,
    Int2 = 21,
    Int4 = 23,
    Text = 25,
    Oid = 26,
    Json = 114,
    Float4 = 700,
    Float8 = 701,
    Money = 790,
    Bpchar = 1042,
    Varchar = 1043,
    Date = 1082,
    Time = 1083,
    Timestamp = 1114,
    Timestamptz = 1184,
    Interval = 1186,
    Numeric = 1700,
    Uuid = 2950,
    Jsonb = 3802,
}

impl TryFrom<Oid> for PgType {
    type Error = ();

    fn try_from(value: Oid) -> Result<Self, Self::Error> {
        use PgType::*;
        Ok(match value {
            16 => Bool,
            17 => Bytea,
            18 => Char,
            19 => Name,
            20 => Int8,
            21 => Int2,
            23 => Int4,
            25 => Text,
            26 => Oid,
            114 => Json,
            700 => Float4,
            701 => Float8,
            790 => Money,
            1042 => Bpchar,
            1043 => Varchar,
            1082 => Date,
            1083 => Time,
            1114 => Timestamp,
            1184 => Timestamptz,
            1186 => Interval,
            1700 => Numeric,
            2950 => Uuid,
            3802 => Jsonb,
            _ => return Err(()),
        })
    }
}

/// Decode a single raw column payload into a [`Value`]. `oid` and `format`
/// select the converter; unparseable payloads fail `ConversionFailed` and the
/// caller drops the enclosing event rather than propagating the error up.
pub fn convert(oid: Oid, format: ColumnFormat, raw: &[u8]) -> ReplicationResult<Value> {
    let pg_type = match PgType::try_from(oid) {
        Ok(t) => t,
        Err(()) => {
            return Ok(Value::Raw {
                oid,
                text: String::from_utf8_lossy(raw).into_owned(),
            });
        }
    };

    match (pg_type, format) {
        (PgType::Bool, ColumnFormat::Text) => parse_bool_text(raw, oid),
        (PgType::Bool, ColumnFormat::Binary) => parse_bool_binary(raw, oid),

        (PgType::Int2 | PgType::Int4 | PgType::Int8 | PgType::Oid, ColumnFormat::Text) => {
            parse_int_text(raw, oid)
        }
        (PgType::Int2, ColumnFormat::Binary) => parse_int_binary(raw, oid, 2),
        (PgType::Int4 | PgType::Oid, ColumnFormat::Binary) => parse_int_binary(raw, oid, 4),
        (PgType::Int8, ColumnFormat::Binary) => parse_int_binary(raw, oid, 8),

        (PgType::Numeric | PgType::Money, ColumnFormat::Text) => parse_numeric_text(raw, oid),
        (PgType::Numeric, ColumnFormat::Binary) => parse_numeric_binary(raw, oid),

        (PgType::Float4 | PgType::Float8, _) => parse_float_text(raw, oid),

        (PgType::Text | PgType::Varchar | PgType::Bpchar | PgType::Name | PgType::Char, _) => {
            Ok(Value::Text(text_lossy(raw)))
        }

        (PgType::Bytea, ColumnFormat::Text) => parse_bytea_text(raw, oid),
        (PgType::Bytea, ColumnFormat::Binary) => Ok(Value::Bytes(raw.to_vec())),

        (PgType::Json | PgType::Jsonb, _) => parse_json(raw, oid),

        (PgType::Uuid, _) => parse_uuid(raw, oid),

        (PgType::Date, _) => parse_date(raw, oid),
        (PgType::Timestamp, _) => parse_timestamp(raw, oid),
        (PgType::Timestamptz, _) => parse_timestamptz(raw, oid),

        (PgType::Time | PgType::Interval, _) => Ok(Value::Text(text_lossy(raw))),
    }
}

fn text_lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn parse_bool_text(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    match text_lossy(raw).as_str() {
        "t" | "true" | "TRUE" | "1" => Ok(Value::Bool(true)),
        "f" | "false" | "FALSE" | "0" => Ok(Value::Bool(false)),
        other => Err(ReplicationError::conversion_failed(
            oid,
            format!("invalid boolean text {other:?}"),
        )),
    }
}

fn parse_bool_binary(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    match raw.first() {
        Some(0) => Ok(Value::Bool(false)),
        Some(_) => Ok(Value::Bool(true)),
        None => Err(ReplicationError::conversion_failed(
            oid,
            "empty boolean binary payload",
        )),
    }
}

fn parse_int_text(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    text_lossy(raw)
        .trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_int_binary(raw: &[u8], oid: Oid, width: usize) -> ReplicationResult<Value> {
    if raw.len() != width {
        return Err(ReplicationError::conversion_failed(
            oid,
            format!("expected {width}-byte integer, got {}", raw.len()),
        ));
    }
    let value = match width {
        2 => i16::from_be_bytes(raw.try_into().unwrap()) as i64,
        4 => i32::from_be_bytes(raw.try_into().unwrap()) as i64,
        8 => i64::from_be_bytes(raw.try_into().unwrap()),
        _ => unreachable!("width is always 2, 4 or 8"),
    };
    Ok(Value::Int(value))
}

fn parse_float_text(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    Decimal::from_str(text.trim())
        .map(Value::Decimal)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_numeric_text(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    Decimal::from_str(text.trim())
        .map(Value::Decimal)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

/// PostgreSQL's binary `numeric` representation: a header of four `int16`s
/// (`ndigits`, `weight`, `sign`, `dscale`) followed by `ndigits` base-10000
/// digits, each a big-endian `int16`.
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

fn parse_numeric_binary(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let mut reader = BufferReader::new(raw);
    let ndigits = reader.read_i16().map_err(|_| {
        ReplicationError::conversion_failed(oid, "truncated numeric binary header")
    })?;
    let weight = reader.read_i16().map_err(|_| {
        ReplicationError::conversion_failed(oid, "truncated numeric binary header")
    })?;
    let sign = reader
        .read_u16()
        .map_err(|_| ReplicationError::conversion_failed(oid, "truncated numeric binary header"))?;
    let dscale = reader
        .read_u16()
        .map_err(|_| ReplicationError::conversion_failed(oid, "truncated numeric binary header"))?;

    if sign == NUMERIC_NAN {
        return Err(ReplicationError::conversion_failed(oid, "numeric NaN"));
    }

    let mut digits = Vec::with_capacity(ndigits.max(0) as usize);
    for _ in 0..ndigits.max(0) {
        let digit = reader
            .read_i16()
            .map_err(|_| ReplicationError::conversion_failed(oid, "truncated numeric digits"))?;
        digits.push(digit);
    }

    // Reassemble as an integer mantissa scaled by 10^dscale, base-10000 digit
    // by base-10000 digit, most significant first.
    let mut mantissa: i128 = 0;
    for &digit in &digits {
        mantissa = mantissa * 10_000 + digit as i128;
    }

    // `weight` is the base-10000 exponent of the first digit; the decimal
    // point sits `dscale` digits from the right once rendered in base 10.
    let digits_after_point = (digits.len() as i32 - weight as i32 - 1) * 4;
    let mut decimal = Decimal::from_i128_with_scale(mantissa, digits_after_point.max(0) as u32);
    if digits_after_point < 0 {
        // weight implied trailing zeros beyond the transmitted digits.
        for _ in 0..(-digits_after_point) {
            decimal *= Decimal::from(10);
        }
    }
    decimal.rescale(dscale as u32);
    if sign == NUMERIC_NEG {
        decimal.set_sign_negative(true);
    }
    let _ = NUMERIC_POS;
    Ok(Value::Decimal(decimal))
}

fn parse_bytea_text(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| ReplicationError::conversion_failed(oid, "bytea text missing \\x prefix"))?;
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<char> = hex.chars().collect();
    for pair in chars.chunks(2) {
        if pair.len() != 2 {
            return Err(ReplicationError::conversion_failed(oid, "odd-length bytea hex"));
        }
        let byte_str: String = pair.iter().collect();
        let byte = u8::from_str_radix(&byte_str, 16)
            .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))?;
        bytes.push(byte);
    }
    Ok(Value::Bytes(bytes))
}

fn parse_json(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    JsonValue::from_str(&text)
        .map(Value::Json)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_uuid(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    Uuid::try_parse(&text_lossy(raw))
        .map(Value::Uuid)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_date(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    NaiveDate::from_str(text_lossy(raw).trim())
        .map(Value::Date)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_timestamp(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f")
        .map(Value::Timestamp)
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

fn parse_timestamptz(raw: &[u8], oid: Oid) -> ReplicationResult<Value> {
    let text = text_lossy(raw);
    DateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|dt| Value::TimestampTz(dt.to_utc()))
        .map_err(|e| ReplicationError::conversion_failed(oid, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_precision_is_preserved_not_floated() {
        for text in ["0.01", "99.99", "1000.00", "12345.67"] {
            let value = convert(1700, ColumnFormat::Text, text.as_bytes()).unwrap();
            match value {
                Value::Decimal(d) => assert_eq!(d.to_string(), text),
                other => panic!("expected Decimal, got {other:?}"),
            }
        }
    }

    #[test]
    fn bool_text_accepts_single_letter_form() {
        assert_eq!(
            convert(16, ColumnFormat::Text, b"t").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            convert(16, ColumnFormat::Text, b"f").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn unknown_oid_preserves_raw_payload() {
        let value = convert(999_999, ColumnFormat::Text, b"whatever").unwrap();
        match value {
            Value::Raw { oid, text } => {
                assert_eq!(oid, 999_999);
                assert_eq!(text, "whatever");
            }
            other => panic!("expected Raw, got {other:?}"),
        }
    }

    #[test]
    fn bytea_text_hex_decodes() {
        let value = convert(17, ColumnFormat::Text, b"\\xdeadbeef").unwrap();
        assert_eq!(value, Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn int_binary_width_mismatch_fails_conversion() {
        let err = convert(23, ColumnFormat::Binary, &[0, 1]).unwrap_err();
        assert!(matches!(err, ReplicationError::ConversionFailed { .. }));
    }
}
