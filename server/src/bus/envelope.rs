//! Message envelope and its at-rest field codec
//!
//! A stream entry carries the envelope as field/value pairs:
//! - `type`: event type wire name (utf-8)
//! - `ts`: publish time, decimal epoch milliseconds
//! - `key`: optional correlation key (utf-8)
//! - `headers`: MessagePack-encoded string map, omitted when empty
//! - `data`: opaque MessagePack payload bytes, omitted when absent
//!
//! Decoding is tolerant: anomalies are logged and patched with defaults so
//! a malformed entry is delivered rather than dropped. Handlers validate
//! `ty` before trusting `data`.

use std::collections::{BTreeMap, HashMap};

use super::error::BusError;
use crate::utils::time::now_ms;

pub(crate) const FIELD_TYPE: &str = "type";
pub(crate) const FIELD_TS: &str = "ts";
pub(crate) const FIELD_KEY: &str = "key";
pub(crate) const FIELD_HEADERS: &str = "headers";
pub(crate) const FIELD_DATA: &str = "data";

/// Header carrying the request correlation id
pub const HEADER_REQUEST_ID: &str = "request_id";
/// Header carrying the conversation/session id
pub const HEADER_SESSION_ID: &str = "session_id";
/// Header naming the originating surface ("github", "discord", ...)
pub const HEADER_REQUEST_CLIENT: &str = "request_client";

/// A decoded bus message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Logical topic the entry was read from
    pub topic: String,
    /// Stream entry id; unique within the topic, ordered by append time
    pub id: String,
    /// Event type wire name; empty when the entry had none
    pub ty: String,
    /// Publish time in epoch milliseconds
    pub ts: i64,
    /// Correlation/partition key
    pub key: Option<String>,
    /// Cross-cutting metadata (`request_id`, `session_id`, ...)
    pub headers: HashMap<String, String>,
    /// Opaque MessagePack payload, absent for data-less events
    pub data: Option<Vec<u8>>,
}

impl Envelope {
    /// Cursor that resumes reading immediately after this entry
    pub fn cursor(&self) -> String {
        self.id.clone()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// An entry as stored in the stream: id plus raw field pairs
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub id: String,
    pub fields: Vec<(String, Vec<u8>)>,
}

/// Encode headers deterministically (sorted keys) as a MessagePack map
pub(crate) fn encode_headers(headers: &HashMap<String, String>) -> Result<Vec<u8>, BusError> {
    let sorted: BTreeMap<&str, &str> = headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    rmp_serde::to_vec(&sorted).map_err(|e| BusError::Encode(e.to_string()))
}

pub(crate) fn decode_headers(bytes: &[u8]) -> Result<HashMap<String, String>, BusError> {
    rmp_serde::from_slice(bytes).map_err(|e| BusError::Decode(e.to_string()))
}

/// Build the at-rest field pairs for a publish
pub(crate) fn encode_fields(
    ty: &str,
    ts: i64,
    key: Option<&str>,
    headers: &HashMap<String, String>,
    data: Option<&[u8]>,
) -> Result<Vec<(&'static str, Vec<u8>)>, BusError> {
    let mut fields: Vec<(&'static str, Vec<u8>)> = vec![
        (FIELD_TYPE, ty.as_bytes().to_vec()),
        (FIELD_TS, ts.to_string().into_bytes()),
    ];
    if let Some(key) = key {
        fields.push((FIELD_KEY, key.as_bytes().to_vec()));
    }
    if !headers.is_empty() {
        fields.push((FIELD_HEADERS, encode_headers(headers)?));
    }
    if let Some(data) = data {
        fields.push((FIELD_DATA, data.to_vec()));
    }
    Ok(fields)
}

/// Decode a stored entry into an envelope, patching anomalies with defaults
pub(crate) fn decode_entry(topic: &str, entry: RawEntry) -> Envelope {
    let RawEntry { id, fields } = entry;

    let mut ty = None;
    let mut ts = None;
    let mut key = None;
    let mut headers = None;
    let mut data = None;

    for (name, value) in fields {
        match name.as_str() {
            FIELD_TYPE => match String::from_utf8(value) {
                Ok(s) => ty = Some(s),
                Err(_) => {
                    tracing::warn!(topic, id = %id, "Non-utf8 type field, treating as empty");
                }
            },
            FIELD_TS => {
                let parsed = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok());
                match parsed {
                    Some(ms) => ts = Some(ms),
                    None => {
                        tracing::warn!(topic, id = %id, "Malformed ts field, using current time");
                    }
                }
            }
            FIELD_KEY => match String::from_utf8(value) {
                Ok(s) => key = Some(s),
                Err(_) => {
                    tracing::warn!(topic, id = %id, "Non-utf8 key field, dropping key");
                }
            },
            FIELD_HEADERS => match decode_headers(&value) {
                Ok(map) => headers = Some(map),
                Err(e) => {
                    tracing::warn!(topic, id = %id, error = %e, "Undecodable headers, using empty map");
                }
            },
            FIELD_DATA => data = Some(value),
            other => {
                tracing::warn!(topic, id = %id, field = other, "Unknown envelope field, ignoring");
            }
        }
    }

    if ty.is_none() {
        tracing::warn!(topic, id = %id, "Entry missing type field");
    }

    Envelope {
        topic: topic.to_string(),
        id,
        ty: ty.unwrap_or_default(),
        ts: ts.unwrap_or_else(now_ms),
        key,
        headers: headers.unwrap_or_default(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn as_raw(id: &str, fields: Vec<(&'static str, Vec<u8>)>) -> RawEntry {
        RawEntry {
            id: id.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    #[test]
    fn roundtrip_all_fields() {
        let hdrs = headers(&[
            (HEADER_REQUEST_ID, "github:acme/app#42:100"),
            (HEADER_SESSION_ID, "acme/app#42"),
        ]);
        let data = rmp_serde::to_vec(&("hello", 7_i64, vec![1_u8, 2, 3])).unwrap();
        let fields =
            encode_fields("cmd.request.message", 1_704_067_200_000, Some("k1"), &hdrs, Some(&data))
                .unwrap();

        let env = decode_entry("cmd.request", as_raw("1-0", fields));
        assert_eq!(env.ty, "cmd.request.message");
        assert_eq!(env.ts, 1_704_067_200_000);
        assert_eq!(env.key.as_deref(), Some("k1"));
        assert_eq!(env.headers, hdrs);
        assert_eq!(env.data.as_deref(), Some(&data[..]));
        assert_eq!(env.cursor(), "1-0");
    }

    #[test]
    fn roundtrip_minimal() {
        let fields = encode_fields("evt.adapter.signal", 5, None, &HashMap::new(), None).unwrap();
        // key/headers/data omitted entirely when absent
        assert_eq!(fields.len(), 2);

        let env = decode_entry("evt.adapter", as_raw("2-0", fields));
        assert_eq!(env.ty, "evt.adapter.signal");
        assert_eq!(env.key, None);
        assert!(env.headers.is_empty());
        assert_eq!(env.data, None);
    }

    #[test]
    fn header_encoding_is_deterministic() {
        let a = headers(&[("b", "2"), ("a", "1"), ("c", "3")]);
        let b = headers(&[("c", "3"), ("a", "1"), ("b", "2")]);
        assert_eq!(encode_headers(&a).unwrap(), encode_headers(&b).unwrap());
    }

    #[test]
    fn missing_type_defaults_to_empty() {
        let entry = as_raw("3-0", vec![(FIELD_TS, b"123".to_vec())]);
        let env = decode_entry("cmd.request", entry);
        assert_eq!(env.ty, "");
        assert_eq!(env.ts, 123);
    }

    #[test]
    fn malformed_ts_defaults_to_now() {
        let before = now_ms();
        let entry = as_raw(
            "4-0",
            vec![
                (FIELD_TYPE, b"evt.request.lifecycle".to_vec()),
                (FIELD_TS, b"not-a-number".to_vec()),
            ],
        );
        let env = decode_entry("evt.request", entry);
        assert!(env.ts >= before);
    }

    #[test]
    fn garbage_headers_default_to_empty() {
        let entry = as_raw(
            "5-0",
            vec![
                (FIELD_TYPE, b"cmd.request.message".to_vec()),
                (FIELD_TS, b"1".to_vec()),
                (FIELD_HEADERS, vec![0xc1]), // never-used msgpack byte
            ],
        );
        let env = decode_entry("cmd.request", entry);
        assert!(env.headers.is_empty());
        // the message is still delivered
        assert_eq!(env.ty, "cmd.request.message");
    }
}
