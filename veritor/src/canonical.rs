//! Canonical serialization and hashing.
//!
//! Every hash in the fabric is computed over the canonical byte form produced
//! here: object keys sorted, `,` and `:` separators, no extra whitespace.
//! Two semantically equal values always produce byte-identical output, so the
//! same plan hashed on two different nodes yields the same digest.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Render a JSON value in canonical form: sorted keys, compact separators.
///
/// Arrays keep their order (ordering of sequences is semantic); objects are
/// emitted key-sorted regardless of how the value was built.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical byte form of a value. The sole input to every fabric hash.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json performs the JSON string escaping
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of raw bytes as lowercase 64-char hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over the canonical form of a value.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(&canonical_bytes(value))
}

/// Short deterministic identifier: first 16 hex chars of SHA-256.
pub fn short_id(input: &str) -> String {
    sha256_hex(input.as_bytes())[..16].to_string()
}

/// First 16 hex chars of the hash of a canonical value.
pub fn short_hash_value(value: &Value) -> String {
    hash_value(value)[..16].to_string()
}

/// HMAC-SHA256 signature over a payload, hex-encoded.
pub fn hmac_sign(key: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time HMAC verification against a hex-encoded signature.
pub fn hmac_verify(key: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let expected = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    // Mac::verify_slice is a constant-time comparison
    mac.verify_slice(&expected).is_ok()
}

/// True iff the string is a lowercase 64-char hex SHA-256 digest.
pub fn is_valid_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
