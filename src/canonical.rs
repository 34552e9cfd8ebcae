//! Deterministic canonical serialization used as signing input.
//!
//! Two equivalent payloads must produce byte-identical signing bytes, so the
//! canonicalizer is explicitly recursive rather than leaning on serializer
//! internals: object keys are sorted lexicographically, arrays keep declared
//! order, primitives render exactly as compact JSON, and no insignificant
//! whitespace is emitted.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::identity::Npub;
use crate::timestamp::UnixMillis;

/// Render `value` as canonical JSON.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                // Key came from the map, so the value is present.
                if let Some(v) = map.get(key) {
                    write_value(out, v);
                }
            }
            out.push('}');
        }
    }
}

/// JSON string escaping compatible with compact `serde_json` output:
/// the short escapes, `\u00XX` for remaining control characters, and raw
/// UTF-8 for everything else.
fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Canonical signing bytes of an envelope: the `{payload, nonce, ts, keyId}`
/// document with sorted keys. The outer `sig` is structurally absent; nested
/// envelopes inside `payload` keep their own `sig` fields intact so receipts
/// embedded in a request sign themselves.
pub fn envelope_signing_bytes(
    payload: &Value,
    nonce: &str,
    ts: UnixMillis,
    key_id: &Npub,
) -> Vec<u8> {
    let doc = serde_json::json!({
        "payload": payload,
        "nonce": nonce,
        "ts": ts,
        "keyId": key_id,
    });
    canonical_json(&doc).into_bytes()
}

/// SHA-256 of the canonical signing bytes.
pub fn envelope_signing_digest(
    payload: &Value,
    nonce: &str,
    ts: UnixMillis,
    key_id: &Npub,
) -> [u8; 32] {
    sha256(&envelope_signing_bytes(payload, nonce, ts, key_id))
}

/// SHA-256 convenience wrapper.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hex-encoded SHA-256, the wire form used for `promptHash` and job hashes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}
