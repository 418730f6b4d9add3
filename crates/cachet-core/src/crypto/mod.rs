//! Cryptographic primitives for Cachet.
//!
//! All cryptography uses well-audited primitives:
//!
//! - **X25519**: Key exchange (Diffie-Hellman)
//! - **Ed25519**: Digital signatures (sender authenticity)
//! - **AES-256-GCM**: Authenticated encryption (AEAD)
//! - **HKDF-SHA256 / HMAC-SHA256**: Key derivation
//! - **Double Ratchet**: Conversation encryption with forward secrecy
//!
//! ## Security Properties
//!
//! - Forward secrecy and break-in recovery for ratcheted conversations
//! - Message authentication and integrity on every payload
//! - Key zeroization on drop
//!
//! ## Forbidden
//!
//! - Custom cryptography
//! - Unaudited primitives
//! - Rolling your own anything

mod aead;
mod keys;
mod ratchet;
mod service;

pub use aead::{
    decrypt, decrypt_with_prepended_nonce, encrypt, encrypt_with_random_nonce, Nonce, NONCE_SIZE,
    TAG_SIZE,
};
pub use keys::{
    derive_shared_secret, Ed25519PublicKey, EphemeralKeypair, SharedSecret, SigningKeypair,
    StaticKeypair, UserKeypairs, X25519PublicKey, X25519SecretKey, ED25519_KEY_SIZE,
    SIGNATURE_SIZE, X25519_KEY_SIZE,
};
pub use ratchet::{
    DoubleRatchet, RatchetEnvelope, RatchetHeader, RatchetStateRecord, SkippedKeyRecord,
};
pub use service::{EncryptedMessage, EncryptionService, GroupMessage};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key size for AES-256-GCM.
pub const KEY_SIZE: usize = 32;

/// Derive keys using HKDF-SHA256.
///
/// This is the standard key derivation function used throughout the engine.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Derive a 32-byte message key from a shared secret.
///
/// Distinct `context` strings yield independent keys from the same secret,
/// so one ECDH agreement can safely feed multiple purposes.
pub fn derive_message_key(secret: &[u8], context: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let derived = hkdf_derive(None, secret, context, KEY_SIZE)?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&derived);
    Ok(key)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
///
/// Prevents timing attacks when comparing secrets.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
