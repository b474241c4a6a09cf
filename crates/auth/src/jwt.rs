//! JWT claim decoding and ES256 verification.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Standard JWT claims plus `aud`, the API endpoint the token is valid for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Claims {
    pub aud: String,
    /// Expiry as a Unix timestamp; 0 never expires.
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub iss: String,
    pub sub: String,
    pub jti: String,
}

impl Claims {
    /// Returns `true` if the token expires before `now + window`.
    pub fn is_expired(&self, now: i64, window: Duration) -> bool {
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        self.exp != 0 && self.exp < now.saturating_add(window)
    }

    /// [`Claims::is_expired`] against the wall clock.
    pub fn is_expired_now(&self, window: Duration) -> bool {
        self.is_expired(chrono::Utc::now().timestamp(), window)
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    alg: String,
}

struct Parts<'a> {
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

fn split(token: &str) -> Result<Parts<'_>, AuthError> {
    let mut it = token.trim().split('.');
    match (it.next(), it.next(), it.next(), it.next()) {
        (Some(header), Some(payload), Some(signature), None) => Ok(Parts {
            header,
            payload,
            signature,
        }),
        _ => Err(AuthError::Malformed(
            "expected three dot-separated segments".into(),
        )),
    }
}

/// Decodes a base64url segment, with or without `=` padding.
fn decode_segment(segment: &str) -> Result<Vec<u8>, AuthError> {
    Ok(URL_SAFE_NO_PAD.decode(segment.trim_end_matches('='))?)
}

/// Decodes the claims of `token` without checking its signature.
pub fn decode_claims(token: &str) -> Result<Claims, AuthError> {
    let parts = split(token)?;
    let payload = decode_segment(parts.payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Verifies an ES256 signature with a PEM-encoded public key and returns the claims.
///
/// Any `alg` other than `ES256` is rejected before the key is used.
pub fn verify(token: &str, public_key_pem: &str) -> Result<Claims, AuthError> {
    let parts = split(token)?;
    let header: Header = serde_json::from_slice(&decode_segment(parts.header)?)?;
    if header.alg != "ES256" {
        return Err(AuthError::UnsupportedAlgorithm(header.alg));
    }

    let key = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_slice(&decode_segment(parts.signature)?)
        .map_err(|_| AuthError::InvalidSignature)?;

    let signing_input = format!("{}.{}", parts.header, parts.payload);
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| AuthError::InvalidSignature)?;

    decode_claims(token)
}
