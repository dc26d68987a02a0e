//! HMAC helpers for the X-Signal-Signature header

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha = Hmac<Sha256>;

fn mac_over(secret: &str, timestamp: &str, body: &[u8]) -> HmacSha {
    let mut mac = <HmacSha as Mac>::new_from_slice(secret.as_bytes()).expect("key length");
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac
}

/// Hex HMAC-SHA256 over `timestamp || body`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    hex::encode(mac_over(secret, timestamp, body).finalize().into_bytes())
}

/// Constant-time check of a hex signature produced by [`sign_payload`].
///
/// The receiving end of a webhook calls this with the `X-Signal-Timestamp`
/// header, the raw request body and the `X-Signal-Signature` header.
pub fn verify_payload(secret: &str, timestamp: &str, body: &[u8], sig_hex: &str) -> bool {
    if sig_hex.len() != 64 {
        return false;
    }
    match hex::decode(sig_hex) {
        Ok(given) => mac_over(secret, timestamp, body).verify_slice(&given).is_ok(),
        Err(_) => false,
    }
}
