//! X25519 and Ed25519 key types.
//!
//! X25519 keypairs cover Diffie-Hellman key agreement (long-term identity
//! and per-ratchet ephemeral), Ed25519 keypairs cover sender signatures.
//! All secret key material is zeroized on drop and redacted in debug
//! output.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of X25519 keys in bytes.
pub const X25519_KEY_SIZE: usize = 32;

/// Size of Ed25519 keys in bytes.
pub const ED25519_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// An X25519 public key for key exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct X25519PublicKey(#[serde(with = "serde_bytes")] [u8; X25519_KEY_SIZE]);

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, validating the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; X25519_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::KeyAgreement("invalid X25519 public key length".into()))?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    /// Convert to x25519_dalek PublicKey.
    pub(crate) fn to_dalek(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only show first 8 bytes in debug output
        write!(f, "X25519PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl From<[u8; X25519_KEY_SIZE]> for X25519PublicKey {
    fn from(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// An X25519 secret key.
///
/// Zeroized on drop to prevent key material from persisting in memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct X25519SecretKey([u8; X25519_KEY_SIZE]);

impl X25519SecretKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for X25519SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519SecretKey([REDACTED])")
    }
}

/// A shared secret derived from X25519 key exchange.
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; X25519_KEY_SIZE]);

impl SharedSecret {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// A long-term (static) X25519 keypair.
///
/// Used for identity-based key exchange. The secret is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct StaticKeypair {
    #[zeroize(skip)]
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman key exchange.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_dalek());
        SharedSecret(*shared.as_bytes())
    }

    /// Export secret key bytes for storage.
    ///
    /// # Security
    /// These bytes must be encrypted before storage.
    pub fn secret_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// An ephemeral X25519 keypair used by the ratchet.
///
/// Regenerated on every DH ratchet step - compromising one ephemeral key
/// doesn't reveal past or future messages.
///
/// Note: Uses StaticSecret internally because x25519-dalek's EphemeralSecret
/// can only perform DH once, but the ratchet needs multiple DH operations
/// with the same keypair.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EphemeralKeypair {
    #[zeroize(skip)]
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeypair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman key exchange.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_dalek());
        SharedSecret(*shared.as_bytes())
    }

    /// Export secret key bytes for state persistence.
    ///
    /// # Security
    /// These bytes must be encrypted before storage.
    pub fn secret_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// An Ed25519 public key for signature verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519PublicKey(#[serde(with = "serde_bytes")] [u8; ED25519_KEY_SIZE]);

impl Ed25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; ED25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ED25519_KEY_SIZE] {
        &self.0
    }

    /// Verify a signature over a message.
    ///
    /// Any failure - malformed key, malformed signature, mismatch - is an
    /// authentication error; the payload must be rejected.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|_| Error::KeyAgreement("invalid Ed25519 public key".into()))?;
        let signature = Signature::from_bytes(signature);
        key.verify(message, &signature)
            .map_err(|_| Error::Authentication("signature verification failed".into()))
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

/// An Ed25519 keypair for signing messages.
///
/// The signing key is zeroized on drop.
pub struct SigningKeypair {
    signing: SigningKey,
    public: Ed25519PublicKey,
}

impl SigningKeypair {
    /// Generate a new random signing keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = Ed25519PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; ED25519_KEY_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&bytes);
        let public = Ed25519PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Get the public (verifying) key.
    pub fn public_key(&self) -> &Ed25519PublicKey {
        &self.public
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// Export secret key bytes for storage.
    ///
    /// # Security
    /// These bytes must be encrypted before storage.
    pub fn secret_bytes(&self) -> [u8; ED25519_KEY_SIZE] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The full set of keypairs a user identity carries.
#[derive(Debug)]
pub struct UserKeypairs {
    /// X25519 keypair for key agreement.
    pub encryption: StaticKeypair,
    /// Ed25519 keypair for signatures.
    pub signing: SigningKeypair,
}

impl UserKeypairs {
    /// Generate a fresh encryption + signing keypair set.
    pub fn generate() -> Self {
        Self {
            encryption: StaticKeypair::generate(),
            signing: SigningKeypair::generate(),
        }
    }
}

/// Perform X25519 Diffie-Hellman with raw key bytes.
///
/// Symmetric in its arguments: `dh(a_secret, b_public)` equals
/// `dh(b_secret, a_public)`. Low-order peer keys produce the RFC 7748
/// all-zero output rather than an error; callers relying on
/// contributory behavior must check for it.
pub fn derive_shared_secret(
    our_secret: &X25519SecretKey,
    their_public: &X25519PublicKey,
) -> SharedSecret {
    let secret = StaticSecret::from(our_secret.0);
    let shared = secret.diffie_hellman(&their_public.to_dalek());
    SharedSecret(*shared.as_bytes())
}

/// Serde helper for byte arrays.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        bytes.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec: Vec<u8> = Vec::deserialize(deserializer)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("invalid byte array length"))
    }
}
