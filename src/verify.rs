//! HMAC-SHA256 Signature Verification
//!
//! Verifies inbound webhook bodies against the signature header a provider
//! sends. One set of free functions serves every subscription; the header
//! name and encoding come from the subscription record.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How a provider encodes the digest in its signature header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    /// Bare hex digest.
    Hex,
    /// GitHub-style `sha256=<hex>`.
    #[default]
    Sha256Hex,
    /// Base64 of the raw digest.
    Base64,
}

/// Compute the HMAC-SHA256 digest of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.finalize().into_bytes().into()
}

/// Header value a provider using `encoding` would send for `body`.
pub fn header_value(secret: &str, body: &[u8], encoding: SignatureEncoding) -> String {
    let digest = sign(secret, body);
    match encoding {
        SignatureEncoding::Hex => hex::encode(digest),
        SignatureEncoding::Sha256Hex => format!("sha256={}", hex::encode(digest)),
        SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(digest),
    }
}

/// Check a presented signature header against the digest of the raw body.
///
/// Decodes per `encoding`, then compares via `Mac::verify_slice` so the
/// comparison is constant-time. Any malformed header is a mismatch, never
/// an error.
pub fn verify(secret: &str, body: &[u8], header: &str, encoding: SignatureEncoding) -> bool {
    let header = header.trim();
    let presented = match encoding {
        SignatureEncoding::Hex => match hex::decode(header) {
            Ok(b) => b,
            Err(_) => return false,
        },
        SignatureEncoding::Sha256Hex => {
            let Some(hex_part) = header.strip_prefix("sha256=") else {
                return false;
            };
            match hex::decode(hex_part) {
                Ok(b) => b,
                Err(_) => return false,
            }
        }
        SignatureEncoding::Base64 => {
            match base64::engine::general_purpose::STANDARD.decode(header) {
                Ok(b) => b,
                Err(_) => return false,
            }
        }
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&presented).is_ok()
}
