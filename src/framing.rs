//! Serialized record framing (spec.md §6): a fixed binary envelope wraps
//! every value, both on the wire and at rest in the Spool.
//!
//! Layout: 2-byte BE serializer signature, 2-byte BE schema-name length `L`,
//! `L` bytes of schema name, then the serialized payload to end-of-buffer.

use crate::model::{DataType, Value};
use anyhow::{anyhow, bail, Result};

/// The only serializer this agent speaks; reserved so the framing can evolve
/// without breaking readers of old Spool rows.
const SERIALIZER_JSON: u16 = 1;

pub fn encode_value(value: &Value) -> Vec<u8> {
    let schema = value.datatype().schema_name();
    let payload = serde_json::to_vec(value).expect("Value serialization is infallible");

    let mut buf = Vec::with_capacity(4 + schema.len() + payload.len());
    buf.extend_from_slice(&SERIALIZER_JSON.to_be_bytes());
    buf.extend_from_slice(&(schema.len() as u16).to_be_bytes());
    buf.extend_from_slice(schema.as_bytes());
    buf.extend_from_slice(&payload);
    buf
}

pub fn decode_value(buf: &[u8]) -> Result<(DataType, Value)> {
    if buf.len() < 4 {
        bail!("framed record shorter than the fixed header");
    }
    let sig = u16::from_be_bytes([buf[0], buf[1]]);
    if sig != SERIALIZER_JSON {
        bail!("unknown serializer signature {sig}");
    }
    let schema_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let schema_start = 4;
    let schema_end = schema_start
        .checked_add(schema_len)
        .ok_or_else(|| anyhow!("schema length overflow"))?;
    if buf.len() < schema_end {
        bail!("framed record truncated in schema name");
    }
    let schema = std::str::from_utf8(&buf[schema_start..schema_end])?;
    let datatype = schema_to_datatype(schema)?;
    let payload = &buf[schema_end..];
    let value: Value = serde_json::from_slice(payload)?;
    if !datatype.matches(&value) {
        bail!("decoded value does not match its own schema name `{schema}`");
    }
    Ok((datatype, value))
}

fn schema_to_datatype(schema: &str) -> Result<DataType> {
    Ok(match schema {
        "bool" => DataType::Bool,
        "float" => DataType::Float,
        "integer" => DataType::Integer,
        "string" => DataType::String,
        "datetime" => DataType::Datetime,
        "duration" => DataType::Duration,
        "blob" => DataType::Blob,
        other => bail!("unregistered primitive schema `{other}`"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let datatype = value.datatype();
        let encoded = encode_value(&value);
        let (decoded_type, decoded_value) = decode_value(&encoded).unwrap();
        assert_eq!(decoded_type, datatype);
        assert_eq!(decoded_value, value);
    }

    #[test]
    fn roundtrips_every_primitive() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Float(1.5));
        roundtrip(Value::Integer(-7));
        roundtrip(Value::String("hello".into()));
        roundtrip(Value::Datetime(1_700_000_000_000));
        roundtrip(Value::Duration(42));
        roundtrip(Value::Blob(vec![1, 2, 3]));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(decode_value(&[0, 1]).is_err());
    }

    #[test]
    fn rejects_unknown_signature() {
        let mut buf = encode_value(&Value::Integer(1));
        buf[0] = 0xff;
        assert!(decode_value(&buf).is_err());
    }
}
