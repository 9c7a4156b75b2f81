//! Request authentication: signature headers and auth error codes.
//!
//! A signed request carries four headers. The signature is a hex HMAC-SHA256
//! over the canonical JSON of the request body, computed with the key named
//! by `X-Key-Id`; see [`crate::keys::KeyStore::verify`].
//!
//! Nonce and timestamp travel as headers, outside the MAC. A body that also
//! carries `nonce` and `ts` fields binds them: [`SignedHeaders::check_body_binding`]
//! refuses headers that disagree with the signed body, so a captured body
//! cannot be replayed under a fresh nonce.

use serde_json::Value;

/// Key id header.
pub const HEADER_KEY_ID: &str = "x-key-id";
/// Hex HMAC-SHA256 of the canonical body.
pub const HEADER_SIGNATURE: &str = "x-decisionos-signature";
/// Caller-chosen nonce, unique per key within the replay window.
pub const HEADER_NONCE: &str = "x-decisionos-nonce";
/// Epoch seconds, integer or fractional.
pub const HEADER_TIMESTAMP: &str = "x-decisionos-timestamp";

/// Authentication failures, each with a stable code and transport status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing signature headers")]
    MissingSignatureHeaders,

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("unknown key")]
    UnknownKey,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("key retired")]
    KeyRetired,

    #[error("signing keys unavailable")]
    KeysUnavailable,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSignatureHeaders => "missing_signature_headers",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::UnknownKey => "unknown_key",
            Self::SignatureMismatch => "signature_mismatch",
            Self::KeyRetired => "key_retired",
            Self::KeysUnavailable => "keys_unavailable",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingSignatureHeaders | Self::InvalidTimestamp => 400,
            Self::UnknownKey | Self::SignatureMismatch | Self::KeyRetired => 401,
            Self::KeysUnavailable => 503,
        }
    }
}

/// The four signature headers, extracted and parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedHeaders {
    pub key_id: String,
    pub signature: String,
    pub nonce: String,
    pub timestamp: f64,
}

impl SignedHeaders {
    /// Extract from any header map via a case-insensitive lookup closure.
    ///
    /// Blank values count as missing.
    pub fn extract<'a, F>(lookup: F) -> Result<Self, AuthError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::MissingSignatureHeaders)
        };
        let key_id = get(HEADER_KEY_ID)?;
        let signature = get(HEADER_SIGNATURE)?;
        let nonce = get(HEADER_NONCE)?;
        let raw_ts = get(HEADER_TIMESTAMP)?;

        let timestamp = raw_ts
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite())
            .ok_or(AuthError::InvalidTimestamp)?;

        Ok(Self {
            key_id: key_id.to_string(),
            signature: signature.to_string(),
            nonce: nonce.to_string(),
            timestamp,
        })
    }

    /// Whole-second timestamp used for replay bookkeeping.
    pub fn epoch(&self) -> i64 {
        self.timestamp.floor() as i64
    }

    /// Compare the signed body's `nonce` and `ts` with the headers.
    ///
    /// Absent fields are accepted unless `require_nonce` is set, in which
    /// case the body must carry `nonce`. Any disagreement is a
    /// [`AuthError::SignatureMismatch`].
    pub fn check_body_binding(&self, payload: &Value, require_nonce: bool) -> Result<(), AuthError> {
        match payload.get("nonce") {
            Some(Value::String(nonce)) if *nonce == self.nonce => {}
            None if !require_nonce => {}
            _ => return Err(AuthError::SignatureMismatch),
        }

        if let Some(ts) = payload.get("ts") {
            let body_ts = match ts {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match body_ts {
                Some(t) if (t - self.timestamp).abs() <= 1e-6 => {}
                _ => return Err(AuthError::SignatureMismatch),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_all_four() {
        let h = headers(&[
            (HEADER_KEY_ID, "k1"),
            (HEADER_SIGNATURE, "abcd"),
            (HEADER_NONCE, "n-1"),
            (HEADER_TIMESTAMP, "1700000000.5"),
        ]);
        let signed = SignedHeaders::extract(|n| h.get(n).map(String::as_str)).unwrap();
        assert_eq!(signed.key_id, "k1");
        assert_eq!(signed.timestamp, 1_700_000_000.5);
        assert_eq!(signed.epoch(), 1_700_000_000);
    }

    #[test]
    fn missing_or_blank_header() {
        let h = headers(&[
            (HEADER_KEY_ID, "k1"),
            (HEADER_SIGNATURE, "  "),
            (HEADER_NONCE, "n"),
            (HEADER_TIMESTAMP, "1"),
        ]);
        let err = SignedHeaders::extract(|n| h.get(n).map(String::as_str)).unwrap_err();
        assert_eq!(err, AuthError::MissingSignatureHeaders);
    }

    #[test]
    fn non_numeric_timestamp() {
        let h = headers(&[
            (HEADER_KEY_ID, "k1"),
            (HEADER_SIGNATURE, "ab"),
            (HEADER_NONCE, "n"),
            (HEADER_TIMESTAMP, "yesterday"),
        ]);
        let err = SignedHeaders::extract(|n| h.get(n).map(String::as_str)).unwrap_err();
        assert_eq!(err, AuthError::InvalidTimestamp);
        assert_eq!(err.status_code(), 400);
    }

    fn signed(nonce: &str, ts: &str) -> SignedHeaders {
        let h = headers(&[
            (HEADER_KEY_ID, "k1"),
            (HEADER_SIGNATURE, "ab"),
            (HEADER_NONCE, nonce),
            (HEADER_TIMESTAMP, ts),
        ]);
        SignedHeaders::extract(|n| h.get(n).map(String::as_str)).unwrap()
    }

    #[test]
    fn body_nonce_and_ts_must_match_headers() {
        let h = signed("n-1", "1700000000");
        assert!(h.check_body_binding(&json!({"nonce": "n-1", "ts": 1_700_000_000}), false).is_ok());
        assert!(h.check_body_binding(&json!({"nonce": "n-1", "ts": "1700000000.0"}), true).is_ok());

        let fresh = signed("n-2", "1700000000");
        assert_eq!(
            fresh.check_body_binding(&json!({"nonce": "n-1"}), false),
            Err(AuthError::SignatureMismatch)
        );
        let later = signed("n-1", "1700000030");
        assert_eq!(
            later.check_body_binding(&json!({"nonce": "n-1", "ts": 1_700_000_000}), false),
            Err(AuthError::SignatureMismatch)
        );
        assert_eq!(
            h.check_body_binding(&json!({"nonce": 7}), false),
            Err(AuthError::SignatureMismatch)
        );
    }

    #[test]
    fn unbound_body_only_passes_when_not_required() {
        let h = signed("n-1", "1700000000");
        assert!(h.check_body_binding(&json!({"evidence": {}}), false).is_ok());
        assert_eq!(
            h.check_body_binding(&json!({"evidence": {}}), true),
            Err(AuthError::SignatureMismatch)
        );
    }

    #[test]
    fn status_table() {
        assert_eq!(AuthError::UnknownKey.status_code(), 401);
        assert_eq!(AuthError::KeyRetired.code(), "key_retired");
        assert_eq!(AuthError::KeysUnavailable.status_code(), 503);
    }
}
