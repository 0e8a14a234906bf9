//! Wire encoding for node values.
//!
//! Values cross the backend boundary as JSON with type-tagged placeholders
//! for the kinds JSON cannot express natively: a tagged value is a two-entry
//! map `{"type": <code>, "value": <payload>}` where datetimes encode as epoch
//! milliseconds, binary data as ASCII85 text, and references as absolute path
//! strings. Strings, numbers and booleans encode natively; maps and lists
//! recurse.
//!
//! Decoding rehydrates any recognized `{type, value}` map back to its native
//! kind and recurses through ordinary maps and lists. A user object that
//! happens to carry exactly the keys `type` and `value` with a valid code is
//! indistinguishable from a placeholder; this matches the original wire
//! format.

use serde_json::{Map, Number, json};

use super::{Value, ValueError, ValueKind};
use crate::path::PathBuf;

/// Encodes a value into its tagged JSON wire form.
pub fn encode_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect(),
        ),
        Value::Array(vec) => serde_json::Value::Array(vec.iter().map(encode_value).collect()),
        Value::Number(n) => Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::DateTime(ms) => json!({ "type": ValueKind::DateTime.code(), "value": ms }),
        Value::Binary(bytes) => {
            json!({ "type": ValueKind::Binary.code(), "value": ascii85::encode(bytes) })
        }
        Value::Reference(path) => {
            json!({ "type": ValueKind::Reference.code(), "value": path.as_str() })
        }
    }
}

/// Decodes a tagged JSON wire form back into a value.
pub fn decode_value(json: &serde_json::Value) -> Result<Value, ValueError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            let n = n.as_f64().ok_or_else(|| ValueError::UnsupportedJson {
                reason: format!("number {n} out of f64 range"),
            })?;
            Ok(Value::Number(n))
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_json::Value::Array(elements) => Ok(Value::Array(
            elements
                .iter()
                .map(decode_value)
                .collect::<Result<_, _>>()?,
        )),
        serde_json::Value::Object(map) => {
            if let Some(tagged) = decode_tagged(map)? {
                return Ok(tagged);
            }
            Ok(Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                    .collect::<Result<_, ValueError>>()?,
            ))
        }
    }
}

/// Rehydrates a `{type, value}` placeholder, or returns `None` if the map is
/// an ordinary object.
fn decode_tagged(map: &Map<String, serde_json::Value>) -> Result<Option<Value>, ValueError> {
    if map.len() != 2 {
        return Ok(None);
    }
    let (Some(tag), Some(payload)) = (map.get("type"), map.get("value")) else {
        return Ok(None);
    };
    let Some(code) = tag.as_u64().and_then(|c| u8::try_from(c).ok()) else {
        return Ok(None);
    };
    let Ok(kind) = ValueKind::from_code(code) else {
        return Ok(None);
    };
    match kind {
        ValueKind::DateTime => {
            let ms = payload
                .as_i64()
                .ok_or_else(|| ValueError::MalformedTaggedValue {
                    code,
                    reason: "datetime payload must be epoch milliseconds".to_string(),
                })?;
            Ok(Some(Value::DateTime(ms)))
        }
        ValueKind::Binary => {
            let text = payload
                .as_str()
                .ok_or_else(|| ValueError::MalformedTaggedValue {
                    code,
                    reason: "binary payload must be an ASCII85 string".to_string(),
                })?;
            Ok(Some(Value::Binary(ascii85::decode(text)?)))
        }
        ValueKind::Reference => {
            let text = payload
                .as_str()
                .ok_or_else(|| ValueError::MalformedTaggedValue {
                    code,
                    reason: "reference payload must be a path string".to_string(),
                })?;
            let path =
                PathBuf::parse(text).map_err(|source| ValueError::InvalidReference { source })?;
            Ok(Some(Value::Reference(path)))
        }
        // Other codes never appear tagged; treat as an ordinary object.
        _ => Ok(None),
    }
}

/// ASCII85 text codec for binary payloads, Adobe variant with `<~` `~>`
/// framing and the `z` shorthand for all-zero groups.
pub mod ascii85 {
    use crate::value::ValueError;

    /// Encodes bytes to framed ASCII85 text.
    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 5 / 4 + 4);
        out.push_str("<~");
        for chunk in bytes.chunks(4) {
            let mut group = [0u8; 4];
            group[..chunk.len()].copy_from_slice(chunk);
            let word = u32::from_be_bytes(group);
            if word == 0 && chunk.len() == 4 {
                out.push('z');
                continue;
            }
            let mut digits = [0u8; 5];
            let mut rest = word;
            for digit in digits.iter_mut().rev() {
                *digit = (rest % 85) as u8 + b'!';
                rest /= 85;
            }
            // Partial groups emit chunk_len + 1 digits.
            for digit in &digits[..chunk.len() + 1] {
                out.push(*digit as char);
            }
        }
        out.push_str("~>");
        out
    }

    /// Decodes framed ASCII85 text back to bytes.
    pub fn decode(text: &str) -> Result<Vec<u8>, ValueError> {
        let inner = text
            .strip_prefix("<~")
            .and_then(|t| t.strip_suffix("~>"))
            .ok_or_else(|| ValueError::InvalidAscii85 {
                reason: "missing <~ ~> framing".to_string(),
            })?;
        let mut out = Vec::with_capacity(inner.len() * 4 / 5);
        let mut digits: Vec<u8> = Vec::with_capacity(5);
        for ch in inner.chars() {
            if ch.is_ascii_whitespace() {
                continue;
            }
            if ch == 'z' {
                if !digits.is_empty() {
                    return Err(ValueError::InvalidAscii85 {
                        reason: "'z' inside a group".to_string(),
                    });
                }
                out.extend_from_slice(&[0, 0, 0, 0]);
                continue;
            }
            if !('!'..='u').contains(&ch) {
                return Err(ValueError::InvalidAscii85 {
                    reason: format!("invalid character '{}'", ch.escape_default()),
                });
            }
            digits.push(ch as u8 - b'!');
            if digits.len() == 5 {
                out.extend_from_slice(&decode_group(&digits)?);
                digits.clear();
            }
        }
        if !digits.is_empty() {
            if digits.len() == 1 {
                return Err(ValueError::InvalidAscii85 {
                    reason: "truncated final group".to_string(),
                });
            }
            let produced = digits.len() - 1;
            // Pad with the highest digit so truncation rounds correctly.
            while digits.len() < 5 {
                digits.push(84);
            }
            let bytes = decode_group(&digits)?;
            out.extend_from_slice(&bytes[..produced]);
        }
        Ok(out)
    }

    fn decode_group(digits: &[u8]) -> Result<[u8; 4], ValueError> {
        let mut word: u64 = 0;
        for &digit in digits {
            word = word * 85 + digit as u64;
        }
        if word > u32::MAX as u64 {
            return Err(ValueError::InvalidAscii85 {
                reason: "group overflows 32 bits".to_string(),
            });
        }
        Ok((word as u32).to_be_bytes())
    }
}
