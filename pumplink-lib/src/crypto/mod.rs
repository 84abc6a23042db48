//! Keyed hashes and key derivation used by pairing.
//!
//! HMAC-SHA1 backs the legacy challenge/response pairing, HMAC-SHA256 the
//! JPAKE key confirmation. Session keys come out of HKDF-SHA256 with the
//! pump's nonce as salt and the JPAKE shared secret as input key material.

pub mod jpake;

use crate::constants::NONCE_SIZE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const SESSION_KEY_SIZE: usize = 32;

pub fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an HMAC-SHA256 tag.
pub fn verify_hmac_sha256(key: &[u8], message: &[u8], tag: &[u8]) -> bool {
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(message);
            mac.verify_slice(tag).is_ok()
        }
        Err(_) => false,
    }
}

/// Derive a confirmation key from a nonce and a shared secret.
pub fn derive_key(nonce: &[u8], secret: &[u8]) -> [u8; SESSION_KEY_SIZE] {
    let hk = Hkdf::<Sha256>::new(Some(nonce), secret);
    let mut okm = [0u8; SESSION_KEY_SIZE];
    // 32 bytes is far below the 255 * HashLen limit
    hk.expand(&[], &mut okm).unwrap_or_else(|_| unreachable!());
    okm
}

pub fn random_nonce() -> [u8; NONCE_SIZE] {
    rand::random()
}
