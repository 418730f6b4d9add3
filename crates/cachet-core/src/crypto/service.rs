//! Single-shot message encryption service.
//!
//! Covers the non-ratcheted encryption surface: pairwise sign-then-encrypt
//! envelopes, group key distribution and group payloads, and bulk file
//! encryption. Construct one [`EncryptionService`] and inject it wherever
//! needed; it holds no mutable state.
//!
//! Pairwise construction: X25519 ECDH → HKDF-SHA256 → AES-256-GCM with a
//! fresh 96-bit nonce, plus an Ed25519 signature over
//! `nonce || ciphertext || associated_data`. The signature is verified
//! **before** any decryption work - a payload that cannot be attributed to
//! its claimed sender is never fed to the cipher.

use super::{
    aead::{self, Nonce, NONCE_SIZE},
    derive_message_key,
    keys::{
        Ed25519PublicKey, SharedSecret, SigningKeypair, StaticKeypair, UserKeypairs,
        X25519PublicKey, X25519SecretKey, SIGNATURE_SIZE,
    },
    random_bytes, KEY_SIZE,
};
use crate::error::{Error, Result};
use crate::ENCRYPTION_VERSION;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// KDF context for pairwise message keys.
const MESSAGE_KEY_INFO: &[u8] = b"Cachet Message Key v1";

/// KDF context for wrapping group keys per recipient.
const GROUP_KEY_WRAP_INFO: &[u8] = b"Cachet Group Key Wrap v1";

/// An encrypted, signed pairwise message.
///
/// Immutable once produced. Serializes to a field map with base64-encoded
/// binary fields for transport and storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// AES-256-GCM ciphertext with appended authentication tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// AEAD nonce (96 bits).
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Ed25519 signature over `nonce || ciphertext || associated_data`.
    #[serde(with = "base64_array")]
    pub signature: [u8; SIGNATURE_SIZE],
    /// Sender's X25519 public key.
    #[serde(with = "base64_array")]
    pub sender_public_key: [u8; 32],
    /// Envelope format version.
    pub encryption_version: u32,
}

/// An encrypted, signed group message.
///
/// Confidentiality comes from the shared group key; authenticity comes
/// solely from the Ed25519 signature. Any key holder can decrypt - group
/// membership enforcement is the caller's responsibility.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupMessage {
    /// AES-256-GCM ciphertext with appended authentication tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// AEAD nonce (96 bits).
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Ed25519 signature over `nonce || ciphertext`.
    #[serde(with = "base64_array")]
    pub signature: [u8; SIGNATURE_SIZE],
    /// Sender's Ed25519 verifying key.
    #[serde(with = "base64_array")]
    pub sender_signing_key: [u8; 32],
    /// Envelope format version.
    pub encryption_version: u32,
}

/// Stateless encryption service for pairwise, group, and file payloads.
#[derive(Debug, Default)]
pub struct EncryptionService;

impl EncryptionService {
    /// Create a new service instance.
    pub fn new() -> Self {
        Self
    }

    /// Generate a fresh X25519 keypair.
    pub fn generate_x25519_keypair(&self) -> StaticKeypair {
        StaticKeypair::generate()
    }

    /// Generate a fresh Ed25519 signing keypair.
    pub fn generate_ed25519_keypair(&self) -> SigningKeypair {
        SigningKeypair::generate()
    }

    /// Generate the full keypair set for a new user identity.
    pub fn generate_user_keypairs(&self) -> UserKeypairs {
        UserKeypairs::generate()
    }

    /// Perform X25519 key agreement with raw key material.
    pub fn derive_shared_secret(
        &self,
        our_secret: &X25519SecretKey,
        their_public: &X25519PublicKey,
    ) -> SharedSecret {
        super::keys::derive_shared_secret(our_secret, their_public)
    }

    /// Derive a purpose-bound 32-byte key from a shared secret.
    pub fn derive_message_key(
        &self,
        secret: &SharedSecret,
        context: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        derive_message_key(secret.as_bytes(), context)
    }

    /// Encrypt and sign a message for a single recipient.
    pub fn encrypt_message(
        &self,
        plaintext: &[u8],
        sender: &StaticKeypair,
        recipient_public: &X25519PublicKey,
        signing: &SigningKeypair,
        associated_data: &[u8],
    ) -> Result<EncryptedMessage> {
        let shared = sender.diffie_hellman(recipient_public);
        let key = derive_message_key(shared.as_bytes(), MESSAGE_KEY_INFO)?;

        let nonce = Nonce::random();
        let ciphertext = aead::encrypt(&key, &nonce, plaintext, associated_data)?;

        let signature = signing.sign(&signing_input(
            nonce.as_bytes(),
            &ciphertext,
            associated_data,
        ));

        Ok(EncryptedMessage {
            ciphertext,
            nonce: *nonce.as_bytes(),
            signature,
            sender_public_key: *sender.public_key().as_bytes(),
            encryption_version: ENCRYPTION_VERSION,
        })
    }

    /// Verify and decrypt a message from a known sender.
    ///
    /// The signature is checked against the expected sender's verifying
    /// key before decryption; any mismatch - wrong signer, tampered
    /// ciphertext, nonce, or associated data - fails with
    /// [`Error::Authentication`] and nothing is decrypted.
    pub fn decrypt_message(
        &self,
        message: &EncryptedMessage,
        recipient: &StaticKeypair,
        sender_public: &X25519PublicKey,
        sender_verifying: &Ed25519PublicKey,
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        sender_verifying.verify(
            &signing_input(&message.nonce, &message.ciphertext, associated_data),
            &message.signature,
        )?;

        let shared = recipient.diffie_hellman(sender_public);
        let key = derive_message_key(shared.as_bytes(), MESSAGE_KEY_INFO)?;

        let nonce = Nonce::from_bytes(message.nonce);
        let plaintext = aead::decrypt(&key, &nonce, &message.ciphertext, associated_data)?;
        Ok(plaintext.to_vec())
    }

    /// Generate a random 32-byte group key.
    pub fn generate_group_key(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(random_bytes())
    }

    /// Wrap a group key for one recipient.
    ///
    /// Output format: `nonce (12 bytes) || ciphertext || tag`. The nonce is
    /// fresh per wrap, so the same group key wraps to a distinct blob for
    /// every member.
    pub fn encrypt_group_key(
        &self,
        group_key: &[u8; KEY_SIZE],
        recipient_public: &X25519PublicKey,
        sender: &StaticKeypair,
    ) -> Result<Vec<u8>> {
        let shared = sender.diffie_hellman(recipient_public);
        let key = derive_message_key(shared.as_bytes(), GROUP_KEY_WRAP_INFO)?;
        aead::encrypt_with_random_nonce(&key, group_key, b"")
    }

    /// Unwrap a group key received from a sender.
    pub fn decrypt_group_key(
        &self,
        wrapped: &[u8],
        sender_public: &X25519PublicKey,
        recipient: &StaticKeypair,
    ) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let shared = recipient.diffie_hellman(sender_public);
        let key = derive_message_key(shared.as_bytes(), GROUP_KEY_WRAP_INFO)?;

        let plaintext = aead::decrypt_with_prepended_nonce(&key, wrapped, b"")?;
        if plaintext.len() != KEY_SIZE {
            return Err(Error::Crypto("unwrapped group key has wrong length".into()));
        }

        let mut group_key = Zeroizing::new([0u8; KEY_SIZE]);
        group_key.copy_from_slice(&plaintext);
        Ok(group_key)
    }

    /// Encrypt and sign a message under a shared group key.
    pub fn encrypt_with_group_key(
        &self,
        plaintext: &[u8],
        group_key: &[u8; KEY_SIZE],
        signing: &SigningKeypair,
    ) -> Result<GroupMessage> {
        let nonce = Nonce::random();
        let ciphertext = aead::encrypt(group_key, &nonce, plaintext, b"")?;

        let signature = signing.sign(&signing_input(nonce.as_bytes(), &ciphertext, b""));

        Ok(GroupMessage {
            ciphertext,
            nonce: *nonce.as_bytes(),
            signature,
            sender_signing_key: *signing.public_key().as_bytes(),
            encryption_version: ENCRYPTION_VERSION,
        })
    }

    /// Verify and decrypt a group message.
    ///
    /// The caller supplies the expected sender's verifying key; this
    /// service performs no membership checks.
    pub fn decrypt_with_group_key(
        &self,
        message: &GroupMessage,
        group_key: &[u8; KEY_SIZE],
        sender_verifying: &Ed25519PublicKey,
    ) -> Result<Vec<u8>> {
        sender_verifying.verify(
            &signing_input(&message.nonce, &message.ciphertext, b""),
            &message.signature,
        )?;

        let nonce = Nonce::from_bytes(message.nonce);
        let plaintext = aead::decrypt(group_key, &nonce, &message.ciphertext, b"")?;
        Ok(plaintext.to_vec())
    }

    /// Encrypt bulk file data.
    ///
    /// Generates a random key when none is supplied. No signature: this is
    /// local bulk data, integrity comes from the AEAD tag.
    pub fn encrypt_file(
        &self,
        data: &[u8],
        file_key: Option<[u8; KEY_SIZE]>,
    ) -> Result<(Vec<u8>, [u8; NONCE_SIZE], Zeroizing<[u8; KEY_SIZE]>)> {
        let key = Zeroizing::new(file_key.unwrap_or_else(random_bytes));
        let nonce = Nonce::random();
        let ciphertext = aead::encrypt(&key, &nonce, data, b"")?;
        Ok((ciphertext, *nonce.as_bytes(), key))
    }

    /// Decrypt bulk file data.
    pub fn decrypt_file(
        &self,
        data: &[u8],
        nonce: &[u8; NONCE_SIZE],
        key: &[u8; KEY_SIZE],
    ) -> Result<Vec<u8>> {
        let nonce = Nonce::from_bytes(*nonce);
        let plaintext = aead::decrypt(key, &nonce, data, b"")?;
        Ok(plaintext.to_vec())
    }

    /// SHA-256 hex digest of arbitrary content (attachment addressing).
    pub fn hash_content(&self, content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Convert an envelope to its wire/storage field map.
    pub fn serialize_encrypted_message(&self, message: &EncryptedMessage) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(message)?)
    }

    /// Parse an envelope from a wire/storage field map.
    ///
    /// Unknown fields are ignored; missing required fields and malformed
    /// base64 fail with [`Error::Serialization`].
    pub fn deserialize_encrypted_message(&self, value: &serde_json::Value) -> Result<EncryptedMessage> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Build the byte string covered by an envelope signature.
fn signing_input(nonce: &[u8], ciphertext: &[u8], associated_data: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(nonce.len() + ciphertext.len() + associated_data.len());
    input.extend_from_slice(nonce);
    input.extend_from_slice(ciphertext);
    input.extend_from_slice(associated_data);
    input
}

/// Serde helper: `Vec<u8>` as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(|_| serde::de::Error::custom("invalid base64"))
    }
}

/// Serde helper: fixed-size byte array as a base64 string.
mod base64_array {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| serde::de::Error::custom("invalid base64"))?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid field length"))
    }
}
