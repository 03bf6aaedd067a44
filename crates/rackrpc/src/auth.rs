//! # Handshake Authentication
//!
//! Challenge/response math for the `Authenticate` command. The responder
//! answers `HMAC-SHA256(secret, message || salt)` with a fresh salt, so the
//! same challenge never produces the same digest twice.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of challenges and salts, in bytes.
pub const NONCE_LEN: usize = 16;

/// The responder's answer to one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub digest: Vec<u8>,
    pub salt: Vec<u8>,
}

/// A random challenge to send as the `message` argument.
pub fn challenge() -> Vec<u8> {
    rand::random::<[u8; NONCE_LEN]>().to_vec()
}

fn keyed(secret: &[u8], message: &[u8], salt: &[u8]) -> Option<HmacSha256> {
    // HMAC accepts keys of any length, so this only fails on a broken backend.
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(message);
    mac.update(salt);
    Some(mac)
}

/// Computes the digest for `message` with a given `salt`.
pub fn digest(secret: &[u8], message: &[u8], salt: &[u8]) -> Vec<u8> {
    keyed(secret, message, salt)
        .map(|mac| mac.finalize().into_bytes().to_vec())
        .unwrap_or_default()
}

/// Answers a challenge with a fresh salt.
pub fn respond(secret: &[u8], message: &[u8]) -> Proof {
    let salt = challenge();
    Proof { digest: digest(secret, message, &salt), salt }
}

/// Checks a proof in constant time.
pub fn verify(secret: &[u8], message: &[u8], proof: &Proof) -> bool {
    match keyed(secret, message, &proof.salt) {
        Some(mac) => mac.verify_slice(&proof.digest).is_ok(),
        None => false,
    }
}
