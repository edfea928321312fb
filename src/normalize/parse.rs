//! Payload parsing: turns raw text into a flat key/value document.
//!
//! Accepted shapes, tried in order:
//! 1. JSON object (single-quoted JSON is retried with double quotes)
//! 2. `key=value` logfmt
//! 3. `<rfc3339> <LEVEL> [service] message` plain lines

use serde_json::{Map, Value};

use super::Level;

/// Envelope keys whose single object value is the real payload.
const ENVELOPE_KEYS: &[&str] = &["message", "body", "data"];

/// Parse a payload into a JSON object map, or `None` if it is unparseable.
pub(crate) fn parse_payload(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.starts_with('{') {
        return parse_json_object(text).map(unwrap_envelope);
    }

    parse_logfmt(text).or_else(|| parse_plain_line(text))
}

fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let value = serde_json::from_str::<Value>(text)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&text.replace('\'', "\"")).ok())?;
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn unwrap_envelope(map: Map<String, Value>) -> Map<String, Value> {
    if map.len() == 1 {
        let is_envelope = map
            .keys()
            .next()
            .is_some_and(|k| ENVELOPE_KEYS.contains(&k.to_lowercase().as_str()));
        if is_envelope {
            if let Some(Value::Object(inner)) = map.values().next() {
                return inner.clone();
            }
        }
    }
    map
}

/// Parse `key=value key2="quoted value"` pairs. Every token must be a pair.
fn parse_logfmt(text: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() || chars.next() != Some('=') {
            return None;
        }

        let mut value = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return None;
            }
            map.insert(key, Value::String(value));
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
            map.insert(key, logfmt_scalar(&value));
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn logfmt_scalar(raw: &str) -> Value {
    match super::FieldValue::infer(raw) {
        super::FieldValue::Bool(b) => Value::Bool(b),
        super::FieldValue::Int(i) => Value::from(i),
        super::FieldValue::Float(f) => Value::from(f),
        super::FieldValue::Str(s) => Value::String(s),
    }
}

/// Parse `2024-05-01T10:00:00Z ERROR [checkout] payment declined`.
fn parse_plain_line(text: &str) -> Option<Map<String, Value>> {
    let mut parts = text.splitn(3, char::is_whitespace);
    let timestamp = parts.next()?;
    let level = parts.next()?;
    let rest = parts.next()?.trim_start();

    chrono::DateTime::parse_from_rfc3339(timestamp).ok()?;
    Level::parse(level)?;

    let (service, message) = match rest.strip_prefix('[') {
        Some(after) => {
            let end = after.find(']')?;
            (Some(&after[..end]), after[end + 1..].trim())
        }
        None => (None, rest.trim()),
    };
    if message.is_empty() {
        return None;
    }

    let mut map = Map::new();
    map.insert("timestamp".into(), Value::String(timestamp.to_string()));
    map.insert("level".into(), Value::String(level.to_string()));
    if let Some(service) = service {
        map.insert("service".into(), Value::String(service.to_string()));
    }
    map.insert("message".into(), Value::String(message.to_string()));
    Some(map)
}
