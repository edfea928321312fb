//! Log normalization: raw queue payloads into canonical, hash-identified entries.
//!
//! The normalizer is pure. It never touches storage; de-duplication happens
//! downstream where entries are inserted keyed by their content-derived id.

mod fields;
mod parse;

pub use self::fields::{FieldValue, Fields, NumericLookup};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest message kept when a payload has no message key and the whole
/// document is used instead.
const FALLBACK_MESSAGE_LEN: usize = 500;

const SERVICE_KEYS: &[&str] = &["AppName", "app_name", "application", "service"];
const LEVEL_KEYS: &[&str] = &["Level", "level", "severity"];
const MESSAGE_KEYS: &[&str] = &["Message", "message", "msg", "log"];
const TIMESTAMP_KEYS: &[&str] = &["TimeGenerated", "timestamp", "time", "Time"];
const REQUEST_ID_KEYS: &[&str] = &["RequestId", "request_id"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("malformed payload: {reason}")]
    Malformed { reason: String },
}

impl NormalizationError {
    fn malformed(reason: impl Into<String>) -> Self {
        NormalizationError::Malformed {
            reason: reason.into(),
        }
    }
}

/// Opaque token identifying one delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryToken(pub String);

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as received from the source queue.
#[derive(Debug, Clone)]
pub struct RawLogRecord {
    pub payload: Vec<u8>,
    /// Identifier of the producer or queue the record came from.
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub token: DeliveryToken,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,
}

/// Content-derived identifier of a normalized entry (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Derive the id from service, message text, and the timestamp bucket.
    pub fn derive(service: &str, message: &str, bucket_start: i64) -> Self {
        let mut h = Sha256::new();
        h.update(service.as_bytes());
        h.update([0x1f]);
        h.update(message.as_bytes());
        h.update([0x1f]);
        h.update(bucket_start.to_be_bytes());
        let digest = h.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{:02x}", b);
        }
        EntryId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Parse a level name. Accepts common aliases (`Information`, `Warning`,
    /// `Critical`, `err`, ...) case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "verbose" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" | "information" | "informational" | "notice" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" | "err" => Some(Level::Error),
            "fatal" | "critical" | "crit" | "panic" | "emergency" | "alert" => Some(Level::Fatal),
            _ => None,
        }
    }

    /// Parse with a substring fallback for decorated names such as
    /// `"HTTP_ERROR"` or `"warn-high"`; anything unrecognized is `Info`.
    pub fn parse_lenient(s: &str) -> Self {
        if let Some(level) = Level::parse(s) {
            return level;
        }
        let lower = s.to_ascii_lowercase();
        if lower.contains("fatal") || lower.contains("crit") {
            Level::Fatal
        } else if lower.contains("err") {
            Level::Error
        } else if lower.contains("warn") {
            Level::Warn
        } else {
            Level::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A canonical log entry. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLogEntry {
    pub id: EntryId,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: Level,
    pub message: String,
    pub fields: Fields,
}

impl NormalizedLogEntry {
    /// Text used for embedding: message plus service and level context.
    pub fn embedding_text(&self) -> String {
        format!("{} | App: {} | Level: {}", self.message, self.service, self.level)
    }
}

/// Stateless normalizer. Holds only the dedup bucket width.
#[derive(Debug, Clone)]
pub struct Normalizer {
    bucket_secs: i64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self { bucket_secs: 60 }
    }
}

impl Normalizer {
    pub fn new(bucket_secs: u64) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1) as i64,
        }
    }

    /// Start of the dedup bucket containing `ts`, in unix seconds.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bucket_secs) * self.bucket_secs
    }

    pub fn normalize(&self, raw: &RawLogRecord) -> Result<NormalizedLogEntry, NormalizationError> {
        let text = std::str::from_utf8(&raw.payload)
            .map_err(|e| NormalizationError::malformed(format!("payload is not UTF-8: {}", e)))?;
        let doc = parse::parse_payload(text)
            .ok_or_else(|| NormalizationError::malformed("payload is not JSON, logfmt, or a log line"))?;

        let mut doc = Lowered::new(doc);

        let service = doc.take_string(SERVICE_KEYS);
        let level = doc.take_string(LEVEL_KEYS);
        let timestamp = doc.take(TIMESTAMP_KEYS);
        let request_id = doc.take_string(REQUEST_ID_KEYS);
        let message = doc.take_string(MESSAGE_KEYS);

        let recognized = service.is_some()
            || level.is_some()
            || timestamp.is_some()
            || request_id.is_some();

        let message = match message {
            Some(m) => m,
            None if recognized => {
                let whole = Value::Object(doc.original.clone()).to_string();
                whole.chars().take(FALLBACK_MESSAGE_LEN).collect()
            }
            None => return Err(NormalizationError::malformed("no message or known log keys")),
        };

        let mut fields = Fields::new();
        let timestamp = match timestamp.as_ref() {
            Some(value) => match parse_timestamp(value) {
                Some(ts) => ts,
                None => {
                    fields.insert("raw_timestamp", FieldValue::Str(value_to_string(value)));
                    raw.received_at
                }
            },
            None => raw.received_at,
        };
        if let Some(rid) = request_id {
            fields.insert("request_id", FieldValue::Str(rid));
        }
        for (key, value) in doc.remaining() {
            flatten_into(&mut fields, key, value);
        }

        let service = service.unwrap_or_else(|| "Unknown".to_string());
        let level = level.map(|l| Level::parse_lenient(&l)).unwrap_or(Level::Info);
        let id = EntryId::derive(&service, &message, self.bucket_start(timestamp));

        Ok(NormalizedLogEntry {
            id,
            timestamp,
            service,
            level,
            message,
            fields,
        })
    }
}

/// Normalize with the default one-minute dedup bucket.
pub fn normalize(raw: &RawLogRecord) -> Result<NormalizedLogEntry, NormalizationError> {
    Normalizer::default().normalize(raw)
}

/// Case-insensitive key extraction over a parsed document.
struct Lowered {
    original: Map<String, Value>,
    taken: Vec<String>,
}

impl Lowered {
    fn new(original: Map<String, Value>) -> Self {
        Self {
            original,
            taken: Vec::new(),
        }
    }

    /// First non-null value among `candidates`, matched case-insensitively.
    fn take(&mut self, candidates: &[&str]) -> Option<Value> {
        for candidate in candidates {
            let hit = self
                .original
                .iter()
                .find(|(k, v)| k.eq_ignore_ascii_case(candidate) && !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()));
            if let Some((key, value)) = hit {
                self.taken.push(key);
                return Some(value);
            }
        }
        None
    }

    fn take_string(&mut self, candidates: &[&str]) -> Option<String> {
        self.take(candidates)
            .map(|v| value_to_string(&v))
            .filter(|s| !s.trim().is_empty())
    }

    fn remaining(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.original
            .iter()
            .filter(|(k, _)| !self.taken.contains(k))
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_into(fields: &mut Fields, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(fields, &format!("{}.{}", key, k), v);
            }
        }
        other => {
            if let Some(scalar) = FieldValue::from_json(other) {
                fields.insert(key.to_string(), scalar);
            }
        }
    }
}

/// RFC 3339, naive ISO 8601 (assumed UTC), or unix seconds/milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<i64>().ok().and_then(epoch_to_utc)
        }
        Value::Number(n) => n.as_i64().and_then(epoch_to_utc),
        _ => None,
    }
}

fn epoch_to_utc(n: i64) -> Option<DateTime<Utc>> {
    // Values past year 2286 in seconds are treated as milliseconds.
    if n.abs() >= 10_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}
