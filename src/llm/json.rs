//! Defensive JSON extraction from model replies.
//!
//! JSON mode is requested, but replies still arrive wrapped in code fences or
//! with a sentence of preamble often enough that nothing here assumes the text
//! is a bare object. Field-level leniency lives in the serde helpers below so
//! reply types can be plain `#[derive(Deserialize)]` structs.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Locate and parse the outermost JSON object in `text`.
pub fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = strip_code_fence(text.trim());

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
        return Some(object);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

/// Extract the reply object and deserialize it into `T`. The error is a
/// human-readable reason for the caller's validation error.
pub fn decode_reply<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let object = extract_object(text).ok_or_else(|| "reply is not a JSON object".to_string())?;
    serde_json::from_value(Value::Object(object))
        .map_err(|error| format!("reply does not match the expected shape: {error}"))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop an optional language tag on the opening fence.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Numbers sometimes come back quoted, and sometimes as something else
/// entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberLike {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

impl NumberLike {
    pub fn value(&self) -> Option<f64> {
        match self {
            NumberLike::Number(number) => Some(*number),
            NumberLike::Text(text) => text.trim().parse().ok(),
            NumberLike::Other(_) => None,
        }
    }
}

/// Trimmed, non-empty string; any other JSON value reads as absent.
pub fn optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}

/// Array of strings, silently dropping non-string and blank members. A
/// non-array value reads as empty.
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Reply {
        #[serde(default, deserialize_with = "optional_string")]
        summary: Option<String>,
        #[serde(default)]
        score: Option<NumberLike>,
        #[serde(default, deserialize_with = "string_list")]
        items: Vec<String>,
    }

    #[test]
    fn parses_bare_object() {
        let reply: Reply = decode_reply(r#"{"summary": "ok"}"#).unwrap();
        assert_eq!(reply.summary.as_deref(), Some("ok"));
    }

    #[test]
    fn parses_fenced_object() {
        let text = "```json\n{\"summary\": \"ok\"}\n```";
        let reply: Reply = decode_reply(text).unwrap();
        assert_eq!(reply.summary.as_deref(), Some("ok"));
    }

    #[test]
    fn parses_object_with_preamble_and_quoted_number() {
        let text = "Here is the analysis:\n{\"score\": \"4\"}\nThanks";
        let reply: Reply = decode_reply(text).unwrap();
        assert_eq!(reply.score.and_then(|score| score.value()), Some(4.0));
    }

    #[test]
    fn odd_values_read_as_absent() {
        let reply: Reply =
            decode_reply(r#"{"summary": 12, "score": true, "items": "nope"}"#).unwrap();
        assert!(reply.summary.is_none());
        assert_eq!(reply.score.and_then(|score| score.value()), None);
        assert!(reply.items.is_empty());
    }

    #[test]
    fn rejects_non_objects() {
        assert!(extract_object("[1, 2, 3]").is_none());
        assert!(extract_object("no json here").is_none());
        assert!(extract_object("{ truncated").is_none());
        assert!(decode_reply::<Reply>("no json here").is_err());
    }

    #[test]
    fn string_list_skips_junk() {
        let reply: Reply = decode_reply(r#"{"items": ["a", 3, "", " b "]}"#).unwrap();
        assert_eq!(reply.items, vec!["a", "b"]);
    }
}
