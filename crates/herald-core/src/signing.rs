//! HMAC-SHA256 payload signing and verification.
//!
//! The dispatcher signs the exact bytes it sends and puts the lowercase hex
//! digest in the [`SIGNATURE_HEADER`] header. Receivers verify against the
//! raw bytes they received, never a re-serialized value, because JSON
//! serialization is not guaranteed to be byte-identical across encoders.

use std::fmt;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC of the request body.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Shared secret used by local development setups when `HMAC_SECRET` is not
/// configured. Never rely on it outside development.
pub const DEVELOPMENT_SECRET: &str =
    "b78943f3976a7bacbbc6de236063817691e6e441be5b14acc7ba25fc0b6dfca2";

/// Signing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The shared secret is empty.
    EmptySecret,
    /// The secret was rejected by the MAC implementation.
    InvalidSecret,
    /// The payload could not be serialized.
    Serialization(String),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySecret => write!(f, "signing secret is empty"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
            Self::Serialization(reason) => write!(f, "payload serialization failed: {reason}"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Serialized body together with its signature.
///
/// `body` holds the bytes that were signed. Send them unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    /// Exact bytes to transmit.
    pub body: Bytes,
    /// Lowercase hex HMAC-SHA256 of `body`.
    pub signature: String,
}

/// Signs and verifies payloads with a shared secret.
///
/// Construct once from configuration and share; signing holds no mutable
/// state.
#[derive(Clone)]
pub struct PayloadSigner {
    mac: HmacSha256,
}

impl fmt::Debug for PayloadSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSigner").field("secret", &"[REDACTED]").finish()
    }
}

impl PayloadSigner {
    /// Creates a signer for `secret`.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::EmptySecret` if the secret is empty, or
    /// `SignatureError::InvalidSecret` if the MAC rejects the key.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SignatureError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
        Ok(Self { mac })
    }

    /// Computes the lowercase hex HMAC-SHA256 of `body`.
    pub fn sign_bytes(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Serializes `payload` to JSON and signs the resulting bytes.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Serialization` if `payload` cannot be
    /// encoded as JSON.
    pub fn sign<T: Serialize + ?Sized>(&self, payload: &T) -> Result<SignedPayload, SignatureError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| SignatureError::Serialization(e.to_string()))?;
        let signature = self.sign_bytes(&body);
        Ok(SignedPayload { body: Bytes::from(body), signature })
    }

    /// Checks `signature` against the HMAC of the raw received bytes.
    ///
    /// Comparison is constant-time over equal-length inputs. Any length
    /// mismatch is rejected.
    pub fn verify(&self, raw_body: &[u8], signature: &str) -> bool {
        timing_safe_eq(signature, &self.sign_bytes(raw_body))
    }
}

fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }

    diff == 0
}
