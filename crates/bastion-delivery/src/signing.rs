//! HMAC-SHA256 signatures for outbound webhook bodies.
//!
//! Receivers verify a delivery by computing the HMAC of the raw request body
//! with their endpoint secret and comparing it to the
//! [`SIGNATURE_HEADER`] value, `sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Bastion-Signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Signs `body` with `secret`, returning the full header value.
///
/// # Errors
///
/// Returns `DeliveryError::Payload` if the key cannot be used.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::payload(format!("invalid signing key: {e}")))?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks a header value against `body` in constant time.
///
/// Accepts the prefixed form only. Malformed values are rejected rather than
/// reported as errors.
pub fn verify(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
