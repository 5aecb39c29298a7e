// =============================================================================
// HMAC-SHA256 request signing
// =============================================================================
//
// Grounded on the teacher's `binance/client.rs::sign` (HMAC-SHA256 over a
// canonical string) and `api/auth.rs::constant_time_eq` (constant-time
// comparison for verification). The canonical string and header names here
// are specified, not exchange-specific.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const SIGNATURE_WINDOW_SECONDS: i64 = 5 * 60;

#[derive(Clone)]
pub struct Signer {
    secret: String,
}

fn sha256_hex(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

fn canonical_string(method: &str, path: &str, timestamp_ms: i64, body: &[u8]) -> String {
    format!(
        "{method}\n{path}\n{timestamp_ms}\n{}",
        sha256_hex(body)
    )
}

impl Signer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Signs a request, returning the base64 signature and the timestamp
    /// (ms) it was computed against. Both must be sent as headers.
    pub fn sign(&self, method: &str, path: &str, body: &[u8]) -> (String, i64) {
        let timestamp_ms = Utc::now().timestamp_millis();
        let canonical = canonical_string(method, path, timestamp_ms, body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        (signature, timestamp_ms)
    }

    /// Verifies an inbound signature. Rejects timestamps outside the
    /// ±5-minute window even on an otherwise-valid signature, since a
    /// replayed-but-correctly-signed request is still a rejection per
    /// spec.md §6.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp_ms: i64,
        signature_b64: &str,
    ) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        if (now_ms - timestamp_ms).abs() > SIGNATURE_WINDOW_SECONDS * 1000 {
            return false;
        }
        let canonical = canonical_string(method, path, timestamp_ms, body);
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(canonical.as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        constant_time_eq(expected.as_bytes(), signature_b64.as_bytes())
    }
}

/// Constant-time byte comparison, identical in intent to the teacher's
/// `api/auth.rs::constant_time_eq`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
