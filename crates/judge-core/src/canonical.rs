//! Canonical JSON and SHA-256 helpers.
//!
//! Two byte forms share the same key ordering (recursive, by code point)
//! and keep non-ASCII as verbatim UTF-8:
//! - [`canonical_json`] is compact (`,` and `:`) and is the request HMAC input
//! - [`integrity_json`] uses `, ` and `: ` separators and Python-style float
//!   text; it is the evidence integrity digest input, byte-compatible with
//!   `json.dumps(obj, sort_keys=True, ensure_ascii=False)`

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild `value` with every object's keys in code-point order.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut sorted = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` in canonical form.
pub fn canonical_json(value: &Value) -> String {
    // `Display` for `Value` is the compact serializer
    sort_keys(value).to_string()
}

/// Canonical form as bytes, ready for hashing or MAC input.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

/// Serializer formatting for the integrity form.
struct IntegrityFormatter;

impl Formatter for IntegrityFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(python_float(value).as_bytes())
    }
}

/// Shortest round-trip float text in Python `repr` layout: fixed notation
/// for decimal exponents in `-4..16` (always with a fraction), otherwise
/// `<mantissa>e<sign><at least two digits>`.
fn python_float(value: f64) -> String {
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    if !value.is_finite() {
        return if value.is_nan() {
            "NaN"
        } else if value > 0.0 {
            "Infinity"
        } else {
            "-Infinity"
        }
        .to_string();
    }

    let sci = format!("{value:e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let Ok(exp) = exp.parse::<i32>() else {
        return sci;
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };

    if (-4..16).contains(&exp) {
        let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
        let body = if exp >= 0 {
            let int_len = exp as usize + 1;
            if digits.len() <= int_len {
                format!("{digits}{}.0", "0".repeat(int_len - digits.len()))
            } else {
                format!("{}.{}", &digits[..int_len], &digits[int_len..])
            }
        } else {
            format!("0.{}{digits}", "0".repeat((-exp - 1) as usize))
        };
        format!("{sign}{body}")
    } else {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{sign}{mantissa}e{exp_sign}{:02}", exp.abs())
    }
}

/// Serialize `value` in the integrity form.
pub fn integrity_json(value: &Value) -> String {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, IntegrityFormatter);
    // in-memory writes of a `Value` do not fail
    let _ = sort_keys(value).serialize(&mut ser);
    String::from_utf8_lossy(&out).into_owned()
}

/// Lowercase hex SHA-256 of the integrity form of `value`.
pub fn integrity_sha256(value: &Value) -> String {
    sha256_hex(integrity_json(value).as_bytes())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of the canonical form of `value`.
pub fn canonical_sha256(value: &Value) -> String {
    sha256_hex(&canonical_bytes(value))
}
