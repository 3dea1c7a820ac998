//! Lenient field decoders for check request bodies.
//!
//! The dashboard posts form-derived JSON, so numbers and booleans often
//! arrive as strings and "no channel" arrives as `0`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

pub fn flexible_bool<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "off" | "no" => Ok(false),
            "1" | "true" | "on" | "yes" => Ok(true),
            other => Err(D::Error::custom(format!("invalid boolean {:?}", other))),
        },
        other => Err(D::Error::custom(format!("invalid boolean {}", other))),
    }
}

/// Integer that may be sent as a JSON number or a numeric string.
pub fn flexible_num<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw = match Value::deserialize(d)? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(D::Error::custom(format!("expected a number, got {}", other))),
    };
    raw.parse()
        .map_err(|_| D::Error::custom(format!("invalid number {:?}", raw)))
}

/// `null`, `""` and whitespace become `None`.
pub fn opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("expected a string, got {}", other))),
    }
}

/// Entity reference where `0`, `""` and `null` mean "none".
pub fn zero_as_none<'de, D>(d: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let id = match Value::deserialize(d)? {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("invalid id {}", n)))?,
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid id {:?}", s)))?,
        other => return Err(D::Error::custom(format!("invalid id {}", other))),
    };
    Ok(if id == 0 { None } else { Some(id) })
}

/// `accepted_status_codes`: a list, a bare integer, or a comma-separated string.
pub fn status_codes<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn one(v: Value) -> Option<String> {
        match v {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        }
    }

    let codes = match Value::deserialize(d)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().filter_map(one).collect(),
        Value::String(s) => s.split(',').map(|c| c.trim().to_string()).collect(),
        other => one(other).into_iter().collect(),
    };
    Ok(codes.into_iter().filter(|c| !c.is_empty()).collect())
}

/// A string map given either as an object or as a JSON-encoded string.
pub fn string_map<'de, D>(d: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let obj = match Value::deserialize(d)? {
        Value::Null => return Ok(BTreeMap::new()),
        Value::String(s) if s.trim().is_empty() => return Ok(BTreeMap::new()),
        Value::String(s) => serde_json::from_str::<Value>(&s).map_err(D::Error::custom)?,
        v => v,
    };
    let Value::Object(map) = obj else {
        return Err(D::Error::custom("expected an object of headers"));
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}
