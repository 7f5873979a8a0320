//! Webhook signature schemes. All comparisons go through `Mac::verify_slice`,
//! which is constant-time.

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Signed timestamps may run ahead of our clock by at most this much.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

pub trait SignatureScheme: Send + Sync {
    /// False on a missing header, bad encoding or mismatch.
    fn verify(&self, body: &[u8], headers: &HeaderMap) -> bool;
}

fn mac(secret: &[u8]) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret).ok()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

/// `t=<unix>,v1=<hex>` over `"{t}.{body}"`, with a replay window.
/// Several `v1` entries may be present during secret rotation.
pub struct TimestampedHmac {
    header: &'static str,
    secret: Vec<u8>,
    tolerance: Duration,
}

impl TimestampedHmac {
    pub fn new(header: &'static str, secret: impl Into<Vec<u8>>, tolerance: Duration) -> Self {
        Self {
            header,
            secret: secret.into(),
            tolerance,
        }
    }

    fn signed_mac(&self, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
        let mut mac = mac(&self.secret)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Some(mac)
    }

    /// Header value for `body` signed at `timestamp`.
    pub fn sign(&self, body: &[u8], timestamp: i64) -> String {
        let timestamp = timestamp.to_string();
        let signature = self
            .signed_mac(&timestamp, body)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!("t={timestamp},v1={signature}")
    }

    pub fn verify_at(&self, body: &[u8], headers: &HeaderMap, now: i64) -> bool {
        let Some(value) = header(headers, self.header) else {
            return false;
        };

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in value.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => timestamp = Some(t),
                Some(("v1", sig)) => signatures.push(sig),
                _ => {}
            }
        }
        let Some(timestamp) = timestamp else {
            return false;
        };
        let Ok(signed_at) = timestamp.parse::<i64>() else {
            return false;
        };
        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(signed_at) > tolerance || signed_at - now > MAX_CLOCK_SKEW_SECS {
            return false;
        }

        let Some(expected) = self.signed_mac(timestamp, body) else {
            return false;
        };
        signatures.into_iter().any(|sig| {
            hex::decode(sig).is_ok_and(|bytes| expected.clone().verify_slice(&bytes).is_ok())
        })
    }
}

impl SignatureScheme for TimestampedHmac {
    fn verify(&self, body: &[u8], headers: &HeaderMap) -> bool {
        self.verify_at(body, headers, Utc::now().timestamp())
    }
}

/// Hex HMAC-SHA256 of the raw body in a single header.
pub struct BodyHmac {
    header: &'static str,
    secret: Vec<u8>,
}

impl BodyHmac {
    pub fn new(header: &'static str, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            secret: secret.into(),
        }
    }

    pub fn sign(&self, body: &[u8]) -> String {
        mac(&self.secret)
            .map(|mut mac| {
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            })
            .unwrap_or_default()
    }
}

impl SignatureScheme for BodyHmac {
    fn verify(&self, body: &[u8], headers: &HeaderMap) -> bool {
        let Some(value) = header(headers, self.header) else {
            return false;
        };
        let Ok(signature) = hex::decode(value.trim()) else {
            return false;
        };
        let Some(mut mac) = mac(&self.secret) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn scheme() -> TimestampedHmac {
        TimestampedHmac::new("cardwallet-signature", "whsec_test", Duration::from_secs(300))
    }

    #[test]
    fn test_timestamped_signature() {
        let scheme = scheme();
        let body = br#"{"resource":{"id":"CW-1","status":"COMPLETED"}}"#;
        let now = 1_700_000_000;
        let signed = headers("cardwallet-signature", &scheme.sign(body, now));

        assert!(scheme.verify_at(body, &signed, now));
        assert!(scheme.verify_at(body, &signed, now + 299));
        assert!(!scheme.verify_at(body, &signed, now + 301), "replay window");
        assert!(!scheme.verify_at(body, &signed, now - 120), "future timestamp");
        assert!(!scheme.verify_at(b"{}", &signed, now), "tampered body");
    }

    #[test]
    fn test_timestamped_accepts_any_listed_signature() {
        let scheme = scheme();
        let body = b"payload";
        let now = 1_700_000_000;
        let valid = scheme.sign(body, now);
        let (_, good_sig) = valid.split_once(",v1=").unwrap();
        let value = format!("t={now},v1={},v1={good_sig}", "ab".repeat(32));

        assert!(scheme.verify_at(body, &headers("cardwallet-signature", &value), now));
    }

    #[test]
    fn test_timestamped_malformed_headers() {
        let scheme = scheme();
        let now = 1_700_000_000;
        for value in ["", "garbage", "t=1700000000", "v1=abcd", "t=soon,v1=abcd", "t=1700000000,v1=zz"] {
            assert!(
                !scheme.verify_at(b"x", &headers("cardwallet-signature", value), now),
                "{value:?}"
            );
        }
        assert!(!scheme.verify_at(b"x", &HeaderMap::new(), now));
    }

    #[test]
    fn test_body_hmac() {
        let scheme = BodyHmac::new("x-callback-signature", "momo_secret");
        let body = br#"{"referenceId":"r-1","status":"SUCCESSFUL"}"#;
        let signed = headers("x-callback-signature", &scheme.sign(body));

        assert!(scheme.verify(body, &signed));
        assert!(!scheme.verify(b"{}", &signed));
        assert!(!scheme.verify(body, &headers("x-callback-signature", "not-hex")));
        assert!(!BodyHmac::new("x-callback-signature", "other").verify(body, &signed));
    }
}
