//! Bearer-token verification for the admin console.
//!
//! Tokens are compact `header.payload.signature` triplets, base64url
//! encoded without padding and signed with HMAC-SHA256. The verifying key
//! is derived from the configured admin secret; issuer and audience are
//! pinned to the administrative identity. Signature comparison is
//! constant-time.
//!
//! Tokens arrive URL-encoded on the wire (`auth jwt=<token>`); callers
//! percent-decode before verification and treat decode failure as
//! verification failure.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// The fixed administrative identity used as issuer and audience.
const ADMIN_IDENTITY: &str = "admin";

/// Verifier (and, for tooling and tests, issuer) of admin bearer tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    /// Derive the verification key from the configured admin secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Verify a decoded token. Any structural defect, bad signature,
    /// wrong identity or expiry fails closed.
    #[must_use]
    pub fn verify(&self, token: &str) -> bool {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            debug!("token is not a three-part compact serialization");
            return false;
        };

        let Ok(header) = URL_SAFE_NO_PAD.decode(header_b64) else {
            return false;
        };
        let Ok(header) = serde_json::from_slice::<serde_json::Value>(&header) else {
            return false;
        };
        if header.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
            debug!("token algorithm is not HS256");
            return false;
        }

        let Ok(signature) = URL_SAFE_NO_PAD.decode(sig_b64) else {
            return false;
        };
        let expected = self.sign(header_b64, payload_b64);
        if expected.as_slice().ct_eq(signature.as_slice()).unwrap_u8() != 1 {
            debug!("token signature mismatch");
            return false;
        }

        let Ok(payload) = URL_SAFE_NO_PAD.decode(payload_b64) else {
            return false;
        };
        let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&payload) else {
            return false;
        };
        if claims.get("iss").and_then(|v| v.as_str()) != Some(ADMIN_IDENTITY)
            || claims.get("aud").and_then(|v| v.as_str()) != Some(ADMIN_IDENTITY)
        {
            debug!("token issuer/audience mismatch");
            return false;
        }
        let Some(exp) = claims.get("exp").and_then(serde_json::Value::as_i64) else {
            debug!("token has no expiry");
            return false;
        };
        exp > chrono::Utc::now().timestamp()
    }

    /// Percent-decode a wire token and verify it.
    #[must_use]
    pub fn verify_encoded(&self, encoded: &str) -> bool {
        match percent_decode_str(encoded).decode_utf8() {
            Ok(decoded) => self.verify(&decoded),
            Err(_) => {
                debug!("token is not URL-decodable");
                false
            },
        }
    }

    /// Issue a token valid for `ttl_secs` seconds.
    #[must_use]
    pub fn issue(&self, ttl_secs: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
        let payload = URL_SAFE_NO_PAD.encode(
            json!({
                "iss": ADMIN_IDENTITY,
                "sub": ADMIN_IDENTITY,
                "aud": ADMIN_IDENTITY,
                "exp": chrono::Utc::now().timestamp() + ttl_secs,
            })
            .to_string(),
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&header, &payload));
        format!("{header}.{payload}.{signature}")
    }

    fn sign(&self, header_b64: &str, payload_b64: &str) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(60);
        assert!(verifier.verify(&token));
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(-5);
        assert!(!verifier.verify(&token));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = TokenVerifier::new("secret-a").issue(60);
        assert!(!TokenVerifier::new("secret-b").verify(&token));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(60);
        let mut parts: Vec<String> = token.split('.').map(str::to_owned).collect();
        parts[1] = URL_SAFE_NO_PAD.encode(
            json!({"iss": "admin", "aud": "admin", "exp": i64::MAX}).to_string(),
        );
        assert!(!verifier.verify(&parts.join(".")));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let verifier = TokenVerifier::new("secret");
        assert!(!verifier.verify(""));
        assert!(!verifier.verify("only-one-part"));
        assert!(!verifier.verify("a.b"));
        assert!(!verifier.verify("a.b.c.d"));
        assert!(!verifier.verify("!!.!!.!!"));
    }

    #[test]
    fn url_encoded_token_roundtrips() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(60);
        // Base64url alphabet survives percent-encoding untouched, but an
        // encoded dot must decode back before verification.
        let encoded = token.replace('.', "%2E");
        assert!(verifier.verify_encoded(&encoded));
        assert!(verifier.verify_encoded(&token));
    }

    #[test]
    fn undecodable_token_fails_closed() {
        let verifier = TokenVerifier::new("secret");
        assert!(!verifier.verify_encoded("%zz"));
    }
}
