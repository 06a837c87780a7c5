use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::Error;
use crate::transport::Item;

/// Version written into every cursor
pub const CURSOR_VERSION: u8 = 1;

/// Digest of a query's structure, binding a cursor to the query that produced it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapeFingerprint(String);

impl ShapeFingerprint {
    /// Fingerprint of a canonical shape description
    pub fn of(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        let hex = digest[..16]
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        Self(hex)
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    #[serde(rename = "lastKey")]
    last_key: BTreeMap<String, Value>,
    shape: String,
}

/// Encode a last-evaluated key as an opaque cursor bound to `shape`
pub fn encode_cursor(last_key: &Item, shape: &ShapeFingerprint) -> Result<String, Error> {
    let last_key = last_key
        .iter()
        .map(|(name, value)| Ok((name.clone(), to_json(value)?)))
        .collect::<Result<BTreeMap<_, _>, Error>>()?;

    let envelope = Envelope {
        v: CURSOR_VERSION,
        last_key,
        shape: shape.as_str().to_string(),
    };
    let bytes = serde_json::to_vec(&envelope)
        .map_err(|e| Error::cursor(format!("failed to serialize cursor: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Decode a cursor, rejecting one produced for a different query shape
pub fn decode_cursor(cursor: &str, shape: &ShapeFingerprint) -> Result<Item, Error> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|e| Error::cursor(format!("not valid base64: {e}")))?;
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|e| Error::cursor(format!("malformed cursor: {e}")))?;

    if envelope.v != CURSOR_VERSION {
        return Err(Error::cursor(format!(
            "unsupported cursor version {} (expected {CURSOR_VERSION})",
            envelope.v
        )));
    }
    if envelope.shape != shape.as_str() {
        return Err(Error::cursor(
            "cursor was produced by a different query shape",
        ));
    }
    if envelope.last_key.is_empty() {
        return Err(Error::cursor("cursor carries an empty key"));
    }

    envelope
        .last_key
        .into_iter()
        .map(|(name, value)| {
            let value = from_json(&value).map_err(|e| Error::cursor(format!("attribute '{name}': {e}")))?;
            Ok((name, value))
        })
        .collect()
}

fn to_json(value: &AttributeValue) -> Result<Value, Error> {
    let json = match value {
        AttributeValue::S(s) => json!({ "S": s }),
        AttributeValue::N(n) => json!({ "N": n }),
        AttributeValue::B(b) => json!({ "B": STANDARD.encode(b) }),
        AttributeValue::Bool(b) => json!({ "BOOL": b }),
        AttributeValue::Null(_) => json!({ "NULL": true }),
        AttributeValue::Ss(values) => json!({ "SS": values }),
        AttributeValue::Ns(values) => json!({ "NS": values }),
        AttributeValue::Bs(values) => {
            let encoded: Vec<String> = values.iter().map(|b| STANDARD.encode(b)).collect();
            json!({ "BS": encoded })
        }
        AttributeValue::L(values) => {
            let list = values.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
            json!({ "L": list })
        }
        AttributeValue::M(values) => {
            let map = values
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v)?)))
                .collect::<Result<Map<String, Value>, Error>>()?;
            json!({ "M": map })
        }
        _ => return Err(Error::cursor("unsupported attribute value type in key")),
    };
    Ok(json)
}

fn from_json(value: &Value) -> Result<AttributeValue, String> {
    let object = value
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| "expected a single-entry object".to_string())?;
    let (tag, inner) = object
        .iter()
        .next()
        .ok_or_else(|| "expected a type tag".to_string())?;

    let string = |v: &Value| {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("{tag} value must be a string"))
    };
    let strings = |v: &Value| -> Result<Vec<String>, String> {
        v.as_array()
            .ok_or_else(|| format!("{tag} value must be an array"))?
            .iter()
            .map(&string)
            .collect()
    };
    let binary = |s: String| {
        STANDARD
            .decode(s)
            .map(Blob::new)
            .map_err(|e| format!("invalid binary: {e}"))
    };

    let value = match tag.as_str() {
        "S" => AttributeValue::S(string(inner)?),
        "N" => AttributeValue::N(string(inner)?),
        "B" => AttributeValue::B(binary(string(inner)?)?),
        "BOOL" => AttributeValue::Bool(
            inner
                .as_bool()
                .ok_or_else(|| "BOOL value must be a boolean".to_string())?,
        ),
        "NULL" => AttributeValue::Null(true),
        "SS" => AttributeValue::Ss(strings(inner)?),
        "NS" => AttributeValue::Ns(strings(inner)?),
        "BS" => AttributeValue::Bs(
            strings(inner)?
                .into_iter()
                .map(binary)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        "L" => AttributeValue::L(
            inner
                .as_array()
                .ok_or_else(|| "L value must be an array".to_string())?
                .iter()
                .map(from_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        "M" => AttributeValue::M(
            inner
                .as_object()
                .ok_or_else(|| "M value must be an object".to_string())?
                .iter()
                .map(|(k, v)| Ok((k.clone(), from_json(v)?)))
                .collect::<Result<_, String>>()?,
        ),
        other => return Err(format!("unknown type tag '{other}'")),
    };
    Ok(value)
}
