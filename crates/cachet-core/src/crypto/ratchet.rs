//! Double Ratchet conversation encryption.
//!
//! The Double Ratchet provides:
//!
//! - **Forward secrecy**: Past messages remain secure if keys are compromised
//! - **Break-in recovery**: Future messages become secure again after a
//!   compromise, once fresh DH material is mixed in
//! - **Out-of-order delivery**: Messages can arrive in any order
//! - **Replay resistance**: Every message key decrypts exactly once
//!
//! ## How It Works
//!
//! 1. **DH Ratchet**: Each party maintains a DH keypair. When a message
//!    arrives under a new remote public key, both the receiving and the
//!    sending chain are re-derived from fresh DH output.
//!
//! 2. **Symmetric Ratchet**: Each message advances a chain key one-way,
//!    deriving a unique message key. Consumed keys are deleted.
//!
//! 3. **Skipped Keys**: Keys for not-yet-arrived messages are cached (with
//!    a hard bound) so late arrivals still decrypt.
//!
//! Decryption stages all state changes on a working copy and commits only
//! after the ciphertext authenticates, so forged or replayed envelopes can
//! never corrupt a live session.

use super::{
    aead::{self, KEY_SIZE, NONCE_SIZE},
    hkdf_derive,
    keys::{EphemeralKeypair, SharedSecret, X25519PublicKey},
};
use crate::error::{Error, Result};
use crate::MAX_SKIP;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// KDF info string - domain separation for the root key derivation.
const ROOT_KDF_INFO: &[u8] = b"Cachet Root KDF v1";

/// HMAC label deriving the per-message key from a chain key.
const MESSAGE_KEY_LABEL: &[u8] = &[0x01];

/// HMAC label advancing the chain key.
const CHAIN_KEY_LABEL: &[u8] = &[0x02];

/// Header sent with each ratcheted message.
///
/// Contains the sender's current DH public key and chain position,
/// allowing the receiver to synchronize their ratchet state. It is
/// authenticated as associated data but not encrypted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    pub dh_public: X25519PublicKey,
    /// Number of messages in the previous sending chain.
    pub previous_chain_length: u32,
    /// Message number in the current sending chain.
    pub message_number: u32,
}

impl RatchetHeader {
    /// Size of serialized header: 32 (pubkey) + 4 + 4 = 40 bytes
    pub const SIZE: usize = 40;

    /// Serialize header to bytes (for use as associated data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        bytes.extend_from_slice(self.dh_public.as_bytes());
        bytes.extend_from_slice(&self.previous_chain_length.to_le_bytes());
        bytes.extend_from_slice(&self.message_number.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Serialization("header too short".into()));
        }

        let dh_public = X25519PublicKey::from_bytes(
            bytes[..32]
                .try_into()
                .map_err(|_| Error::Serialization("invalid DH key".into()))?,
        );

        let previous_chain_length = u32::from_le_bytes(
            bytes[32..36]
                .try_into()
                .map_err(|_| Error::Serialization("invalid chain length".into()))?,
        );

        let message_number = u32::from_le_bytes(
            bytes[36..40]
                .try_into()
                .map_err(|_| Error::Serialization("invalid message number".into()))?,
        );

        Ok(Self {
            dh_public,
            previous_chain_length,
            message_number,
        })
    }
}

/// An encrypted message produced by [`DoubleRatchet::encrypt`].
///
/// The header travels in the clear but is bound to the ciphertext as
/// associated data; modifying either fails authentication.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatchetEnvelope {
    /// Ratchet synchronization header.
    pub header: RatchetHeader,
    /// AEAD nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Cache of derived-but-unused message keys, bounded by [`MAX_SKIP`].
///
/// Tracks insertion order so eviction drops the oldest key first.
#[derive(Clone, Default)]
struct SkippedKeys {
    keys: HashMap<([u8; 32], u32), [u8; 32]>,
    order: VecDeque<([u8; 32], u32)>,
}

impl SkippedKeys {
    fn insert(&mut self, id: ([u8; 32], u32), key: [u8; 32]) {
        if self.keys.insert(id, key).is_none() {
            self.order.push_back(id);
        }
        while self.keys.len() > MAX_SKIP {
            match self.order.pop_front() {
                Some(oldest) => {
                    if let Some(mut evicted) = self.keys.remove(&oldest) {
                        evicted.zeroize();
                    }
                }
                None => break,
            }
        }
    }

    fn get(&self, id: &([u8; 32], u32)) -> Option<&[u8; 32]> {
        self.keys.get(id)
    }

    fn remove(&mut self, id: &([u8; 32], u32)) -> Option<[u8; 32]> {
        let removed = self.keys.remove(id);
        if removed.is_some() {
            self.order.retain(|entry| entry != id);
        }
        removed
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Iterate cached keys in insertion order.
    fn iter_ordered(&self) -> impl Iterator<Item = (&([u8; 32], u32), &[u8; 32])> {
        self.order.iter().filter_map(|id| self.keys.get(id).map(|k| (id, k)))
    }

    fn zeroize_all(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}

/// Internal ratchet session state.
///
/// Cloned as a staging copy during decryption; the live copy is replaced
/// only after authentication succeeds. All key material is zeroized on
/// drop.
#[derive(Clone)]
struct RatchetState {
    /// Our current ratchet keypair.
    dh_sending: EphemeralKeypair,
    /// Peer's current ratchet public key (absent until first inbound).
    dh_receiving_key: Option<X25519PublicKey>,
    /// Current root key (mixes in DH output at each ratchet step).
    root_key: [u8; 32],
    /// Current sending chain key (absent for a receiver before first send
    /// chain is derived).
    sending_chain_key: Option<[u8; 32]>,
    /// Current receiving chain key (absent until first inbound message).
    receiving_chain_key: Option<[u8; 32]>,
    /// Messages sent in current sending chain.
    send_message_number: u32,
    /// Messages received in current receiving chain.
    receive_message_number: u32,
    /// Length of the previous sending chain (for headers).
    previous_chain_length: u32,
    /// Cached keys for out-of-order arrivals.
    skipped: SkippedKeys,
    /// Session identifier.
    session_id: String,
    /// Peer identifier.
    peer_id: String,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut k) = self.sending_chain_key {
            k.zeroize();
        }
        if let Some(ref mut k) = self.receiving_chain_key {
            k.zeroize();
        }
        self.skipped.zeroize_all();
    }
}

/// A Double Ratchet session with a single peer.
///
/// Handles encryption and decryption with automatic key rotation. All
/// operations mutate session state and must be serialized per peer; see
/// [`crate::session::RatchetSessionManager`].
pub struct DoubleRatchet {
    state: RatchetState,
}

impl DoubleRatchet {
    /// Initialize as the session initiator.
    ///
    /// The initiator has the recipient's public key from the initial key
    /// exchange and can send immediately.
    pub fn init_sender(
        shared_secret: &SharedSecret,
        recipient_public: &X25519PublicKey,
        session_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Result<Self> {
        let dh_sending = EphemeralKeypair::generate();

        // Perform DH with the recipient's key and derive the first
        // sending chain
        let dh_output = dh_sending.diffie_hellman(recipient_public);
        let (root_key, sending_chain_key) =
            kdf_root_key(shared_secret.as_bytes(), dh_output.as_bytes())?;

        let state = RatchetState {
            dh_sending,
            dh_receiving_key: Some(recipient_public.clone()),
            root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            send_message_number: 0,
            receive_message_number: 0,
            previous_chain_length: 0,
            skipped: SkippedKeys::default(),
            session_id: session_id.into(),
            peer_id: peer_id.into(),
        };

        Ok(Self { state })
    }

    /// Initialize as the session receiver.
    ///
    /// The receiver waits for the initiator's first message, which carries
    /// their ratchet public key; no chains exist until then.
    pub fn init_receiver(
        shared_secret: &SharedSecret,
        keypair: EphemeralKeypair,
        session_id: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        let state = RatchetState {
            dh_sending: keypair,
            dh_receiving_key: None,
            root_key: *shared_secret.as_bytes(),
            sending_chain_key: None,
            receiving_chain_key: None,
            send_message_number: 0,
            receive_message_number: 0,
            previous_chain_length: 0,
            skipped: SkippedKeys::default(),
            session_id: session_id.into(),
            peer_id: peer_id.into(),
        };

        Self { state }
    }

    /// Encrypt a message.
    ///
    /// Advances the sending chain by one key. The returned envelope's
    /// header must reach the peer unmodified (it is authenticated as
    /// associated data).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetEnvelope> {
        let chain_key = self
            .state
            .sending_chain_key
            .ok_or_else(|| Error::Ratchet("no sending chain yet".into()))?;

        // Derive the message key and advance the chain
        let (new_chain_key, message_key) = kdf_chain_key(&chain_key)?;
        self.state.sending_chain_key = Some(new_chain_key);

        let header = RatchetHeader {
            dh_public: self.state.dh_sending.public_key().clone(),
            previous_chain_length: self.state.previous_chain_length,
            message_number: self.state.send_message_number,
        };

        let nonce = aead::Nonce::random();
        let ciphertext = aead::encrypt(&message_key, &nonce, plaintext, &header.to_bytes())?;

        self.state.send_message_number += 1;

        Ok(RatchetEnvelope {
            header,
            nonce: *nonce.as_bytes(),
            ciphertext,
        })
    }

    /// Decrypt a message.
    ///
    /// Handles DH ratchet steps and out-of-order delivery automatically.
    /// A replayed envelope fails: its message key was consumed and deleted
    /// on the first successful decryption. Failed calls leave the session
    /// state exactly as it was.
    pub fn decrypt(&mut self, envelope: &RatchetEnvelope) -> Result<Vec<u8>> {
        let header = &envelope.header;
        let cache_id = (*header.dh_public.as_bytes(), header.message_number);

        // Out-of-order arrival for which the key was already derived.
        // The key is deleted only after the ciphertext authenticates, so
        // a forged envelope cannot destroy a pending key.
        if let Some(key) = self.state.skipped.get(&cache_id) {
            let plaintext = decrypt_with_key(key, envelope)?;
            if let Some(mut consumed) = self.state.skipped.remove(&cache_id) {
                consumed.zeroize();
            }
            debug!(
                peer = %self.state.peer_id,
                message_number = header.message_number,
                "decrypted out-of-order message from skip cache"
            );
            return Ok(plaintext);
        }

        let same_chain = self.state.dh_receiving_key.as_ref() == Some(&header.dh_public);

        // A message number behind the receive counter on the current chain
        // with no cached key means its key was already consumed: either a
        // duplicate delivery or a deliberate replay. Drop before touching
        // any cryptographic state.
        if same_chain && header.message_number < self.state.receive_message_number {
            warn!(
                peer = %self.state.peer_id,
                message_number = header.message_number,
                "dropping replayed or stale message"
            );
            return Err(Error::ReplayOrStale(format!(
                "message number {} already consumed",
                header.message_number
            )));
        }

        // Stage every mutation on a working copy; commit only after the
        // ciphertext authenticates.
        let mut state = self.state.clone();

        if !same_chain {
            // Cache the remainder of the outgoing chain we are leaving,
            // then rotate both chains
            if state.receiving_chain_key.is_some() {
                skip_message_keys(&mut state, header.previous_chain_length)?;
            }
            dh_ratchet(&mut state, &header.dh_public)?;
        }

        // Walk the receiving chain to the target message, caching
        // intermediate keys for later out-of-order arrivals
        skip_message_keys(&mut state, header.message_number)?;

        let chain_key = state
            .receiving_chain_key
            .ok_or_else(|| Error::Ratchet("no receiving chain yet".into()))?;

        let (new_chain_key, message_key) = kdf_chain_key(&chain_key)?;
        state.receiving_chain_key = Some(new_chain_key);
        state.receive_message_number = header.message_number + 1;

        let plaintext = decrypt_with_key(&message_key, envelope)?;

        self.state = state;
        Ok(plaintext)
    }

    /// Get our current ratchet public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        self.state.dh_sending.public_key()
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Peer identifier.
    pub fn peer_id(&self) -> &str {
        &self.state.peer_id
    }

    /// Number of cached skipped message keys.
    pub fn skipped_key_count(&self) -> usize {
        self.state.skipped.len()
    }

    /// Export the full session state for persistence.
    ///
    /// The record contains raw key material (base64) and must be encrypted
    /// at rest by the caller.
    pub fn export_state(&self) -> RatchetStateRecord {
        let state = &self.state;
        RatchetStateRecord {
            dh_sending_private: BASE64.encode(state.dh_sending.secret_bytes()),
            dh_sending_public: BASE64.encode(state.dh_sending.public_key().as_bytes()),
            dh_receiving_key: state
                .dh_receiving_key
                .as_ref()
                .map(|k| BASE64.encode(k.as_bytes())),
            root_key: BASE64.encode(state.root_key),
            sending_chain_key: state.sending_chain_key.map(|k| BASE64.encode(k)),
            receiving_chain_key: state.receiving_chain_key.map(|k| BASE64.encode(k)),
            send_message_number: state.send_message_number,
            receive_message_number: state.receive_message_number,
            previous_chain_length: state.previous_chain_length,
            skipped_message_keys: state
                .skipped
                .iter_ordered()
                .map(|((remote, number), key)| SkippedKeyRecord {
                    remote_dh_public_key: BASE64.encode(remote),
                    message_number: *number,
                    key: BASE64.encode(key),
                })
                .collect(),
            session_id: state.session_id.clone(),
            peer_id: state.peer_id.clone(),
        }
    }

    /// Restore a session from a persisted state record.
    ///
    /// A restored session continues the conversation indistinguishably
    /// from the original. Malformed records fail with
    /// [`Error::Serialization`]; callers should renegotiate the session
    /// rather than guess at missing fields.
    pub fn from_state(record: &RatchetStateRecord) -> Result<Self> {
        let secret: [u8; 32] = decode_key(&record.dh_sending_private)?;
        let dh_sending = EphemeralKeypair::from_secret_bytes(secret);

        // The stored public key must match the one derived from the
        // secret; a mismatch means the record was corrupted or mixed up
        let stored_public: [u8; 32] = decode_key(&record.dh_sending_public)?;
        if dh_sending.public_key().as_bytes() != &stored_public {
            return Err(Error::Serialization(
                "ratchet keypair does not match stored public key".into(),
            ));
        }

        let mut skipped = SkippedKeys::default();
        for entry in &record.skipped_message_keys {
            let remote: [u8; 32] = decode_key(&entry.remote_dh_public_key)?;
            let key: [u8; 32] = decode_key(&entry.key)?;
            skipped.insert((remote, entry.message_number), key);
        }

        let state = RatchetState {
            dh_sending,
            dh_receiving_key: record
                .dh_receiving_key
                .as_deref()
                .map(|s| decode_key(s).map(X25519PublicKey::from_bytes))
                .transpose()?,
            root_key: decode_key(&record.root_key)?,
            sending_chain_key: record
                .sending_chain_key
                .as_deref()
                .map(decode_key)
                .transpose()?,
            receiving_chain_key: record
                .receiving_chain_key
                .as_deref()
                .map(decode_key)
                .transpose()?,
            send_message_number: record.send_message_number,
            receive_message_number: record.receive_message_number,
            previous_chain_length: record.previous_chain_length,
            skipped,
            session_id: record.session_id.clone(),
            peer_id: record.peer_id.clone(),
        };

        Ok(Self { state })
    }
}

/// Persisted form of a ratchet session.
///
/// All binary fields are base64. Contains live key material: encrypt at
/// rest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatchetStateRecord {
    /// Our ratchet secret key.
    pub dh_sending_private: String,
    /// Our ratchet public key (consistency-checked on restore).
    pub dh_sending_public: String,
    /// Peer's current ratchet public key, if any message was received.
    pub dh_receiving_key: Option<String>,
    /// Current root key.
    pub root_key: String,
    /// Current sending chain key, if a sending chain exists.
    pub sending_chain_key: Option<String>,
    /// Current receiving chain key, if a receiving chain exists.
    pub receiving_chain_key: Option<String>,
    /// Send counter in the current chain.
    pub send_message_number: u32,
    /// Receive counter in the current chain.
    pub receive_message_number: u32,
    /// Length of the previous sending chain.
    pub previous_chain_length: u32,
    /// Cached out-of-order message keys, oldest first.
    #[serde(default)]
    pub skipped_message_keys: Vec<SkippedKeyRecord>,
    /// Session identifier.
    #[serde(default)]
    pub session_id: String,
    /// Peer identifier.
    #[serde(default)]
    pub peer_id: String,
}

/// One cached skipped message key in a [`RatchetStateRecord`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedKeyRecord {
    /// Remote ratchet public key the chain belonged to.
    pub remote_dh_public_key: String,
    /// Message number within that chain.
    pub message_number: u32,
    /// The derived message key.
    pub key: String,
}

/// Decode a base64 field into a fixed-size key array.
fn decode_key<const N: usize>(value: &str) -> Result<[u8; N]> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| Error::Serialization("invalid base64 in state record".into()))?;
    bytes
        .try_into()
        .map_err(|_| Error::Serialization("wrong key length in state record".into()))
}

/// Perform a DH ratchet step: rotate the receiving chain to the peer's new
/// key, then generate a fresh keypair and rotate the sending chain.
fn dh_ratchet(state: &mut RatchetState, their_public: &X25519PublicKey) -> Result<()> {
    state.previous_chain_length = state.send_message_number;
    state.send_message_number = 0;
    state.receive_message_number = 0;
    state.dh_receiving_key = Some(their_public.clone());

    // New receiving chain from their new key
    let dh_output = state.dh_sending.diffie_hellman(their_public);
    let (root_key, receiving_chain_key) = kdf_root_key(&state.root_key, dh_output.as_bytes())?;
    state.root_key = root_key;
    state.receiving_chain_key = Some(receiving_chain_key);

    // Fresh keypair and new sending chain; both directions rotate on
    // every direction change
    let new_dh = EphemeralKeypair::generate();
    let dh_output = new_dh.diffie_hellman(their_public);
    let (root_key, sending_chain_key) = kdf_root_key(&state.root_key, dh_output.as_bytes())?;
    state.root_key = root_key;
    state.sending_chain_key = Some(sending_chain_key);
    state.dh_sending = new_dh;

    debug!(peer = %state.peer_id, "performed DH ratchet step");
    Ok(())
}

/// Advance the receiving chain to `until`, caching each intermediate
/// message key for out-of-order arrivals.
fn skip_message_keys(state: &mut RatchetState, until: u32) -> Result<()> {
    let Some(remote) = state.dh_receiving_key.as_ref().map(|k| *k.as_bytes()) else {
        return Ok(());
    };
    let Some(mut chain_key) = state.receiving_chain_key else {
        return Ok(());
    };

    if until.saturating_sub(state.receive_message_number) as usize > MAX_SKIP {
        return Err(Error::Ratchet("too many skipped messages".into()));
    }

    while state.receive_message_number < until {
        let (new_chain_key, message_key) = kdf_chain_key(&chain_key)?;
        state
            .skipped
            .insert((remote, state.receive_message_number), *message_key);
        chain_key = new_chain_key;
        state.receive_message_number += 1;
    }

    state.receiving_chain_key = Some(chain_key);
    Ok(())
}

/// Root key derivation: `(root_key, dh_output) -> (new_root_key, chain_key)`
fn kdf_root_key(root_key: &[u8], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let output = hkdf_derive(Some(root_key), dh_output, ROOT_KDF_INFO, 64)?;

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);

    Ok((new_root, chain_key))
}

/// Chain key derivation: `chain_key -> (new_chain_key, message_key)`
///
/// One-way: neither output can recover the input chain key.
fn kdf_chain_key(chain_key: &[u8; 32]) -> Result<([u8; 32], Zeroizing<[u8; KEY_SIZE]>)> {
    let message_key = hmac_sha256(chain_key, MESSAGE_KEY_LABEL)?;
    let new_chain_key = hmac_sha256(chain_key, CHAIN_KEY_LABEL)?;
    Ok((*new_chain_key, message_key))
}

/// HMAC-SHA256 with a fixed one-byte label.
fn hmac_sha256(key: &[u8; 32], label: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|_| Error::Crypto("HMAC initialization failed".into()))?;
    mac.update(label);
    let digest = mac.finalize().into_bytes();

    let mut output = Zeroizing::new([0u8; 32]);
    output.copy_from_slice(&digest);
    Ok(output)
}

/// Decrypt an envelope with a specific message key.
fn decrypt_with_key(key: &[u8; KEY_SIZE], envelope: &RatchetEnvelope) -> Result<Vec<u8>> {
    let nonce = aead::Nonce::from_bytes(envelope.nonce);
    let plaintext = aead::decrypt(key, &nonce, &envelope.ciphertext, &envelope.header.to_bytes())?;
    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::StaticKeypair;

    fn setup_session() -> (DoubleRatchet, DoubleRatchet) {
        // Simulate the initial key agreement
        let alice_identity = StaticKeypair::generate();
        let bob_prekey = EphemeralKeypair::generate();
        let shared_secret = alice_identity.diffie_hellman(bob_prekey.public_key());

        let alice = DoubleRatchet::init_sender(
            &shared_secret,
            bob_prekey.public_key(),
            "session-1",
            "bob",
        )
        .expect("init alice");
        let bob = DoubleRatchet::init_receiver(&shared_secret, bob_prekey, "session-1", "alice");

        (alice, bob)
    }

    #[test]
    fn test_basic_exchange() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"Hello, Bob!").expect("encrypt");
        let decrypted = bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(decrypted, b"Hello, Bob!");

        let reply = bob.encrypt(b"Hello, Alice!").expect("encrypt");
        let decrypted = alice.decrypt(&reply).expect("decrypt");
        assert_eq!(decrypted, b"Hello, Alice!");
    }

    #[test]
    fn test_multiple_messages() {
        let (mut alice, mut bob) = setup_session();

        for i in 0..10 {
            let msg = format!("Message {}", i);
            let envelope = alice.encrypt(msg.as_bytes()).expect("encrypt");
            let decrypted = bob.decrypt(&envelope).expect("decrypt");
            assert_eq!(decrypted, msg.as_bytes());
        }
    }

    #[test]
    fn test_alternating_messages() {
        let (mut alice, mut bob) = setup_session();

        for i in 0..10 {
            if i % 2 == 0 {
                let msg = format!("Alice: {}", i);
                let envelope = alice.encrypt(msg.as_bytes()).expect("encrypt");
                assert_eq!(bob.decrypt(&envelope).expect("decrypt"), msg.as_bytes());
            } else {
                let msg = format!("Bob: {}", i);
                let envelope = bob.encrypt(msg.as_bytes()).expect("encrypt");
                assert_eq!(alice.decrypt(&envelope).expect("decrypt"), msg.as_bytes());
            }
        }
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = setup_session();

        let e1 = alice.encrypt(b"Message 1").expect("encrypt");
        let e2 = alice.encrypt(b"Message 2").expect("encrypt");
        let e3 = alice.encrypt(b"Message 3").expect("encrypt");

        // Message 3 arrives first: keys for 1 and 2 get cached
        assert_eq!(bob.decrypt(&e3).expect("decrypt"), b"Message 3");
        assert_eq!(bob.skipped_key_count(), 2);

        assert_eq!(bob.decrypt(&e1).expect("decrypt"), b"Message 1");
        assert_eq!(bob.skipped_key_count(), 1);

        assert_eq!(bob.decrypt(&e2).expect("decrypt"), b"Message 2");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_interleaved_out_of_order() {
        let (mut alice, mut bob) = setup_session();

        let e1 = alice.encrypt(b"Message 1").expect("encrypt");
        let e2 = alice.encrypt(b"Message 2").expect("encrypt");
        let e3 = alice.encrypt(b"Message 3").expect("encrypt");

        assert_eq!(bob.decrypt(&e1).expect("decrypt"), b"Message 1");
        assert_eq!(bob.decrypt(&e3).expect("decrypt"), b"Message 3");
        assert_eq!(bob.skipped_key_count(), 1);
        assert_eq!(bob.decrypt(&e2).expect("decrypt"), b"Message 2");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"once only").expect("encrypt");
        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"once only");

        // The message key was consumed; a second delivery must fail
        let err = bob.decrypt(&envelope).expect_err("replay must fail");
        assert!(matches!(err, Error::ReplayOrStale(_)));
    }

    #[test]
    fn test_replay_after_later_messages() {
        let (mut alice, mut bob) = setup_session();

        let e1 = alice.encrypt(b"first").expect("encrypt");
        let e2 = alice.encrypt(b"second").expect("encrypt");

        bob.decrypt(&e1).expect("decrypt first");
        bob.decrypt(&e2).expect("decrypt second");

        let err = bob.decrypt(&e1).expect_err("stale replay must fail");
        assert!(matches!(err, Error::ReplayOrStale(_)));
    }

    #[test]
    fn test_forward_secrecy_key_rotation() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"ping").expect("encrypt");
        bob.decrypt(&envelope).expect("decrypt");

        // Capture Alice's sending key before the reply round-trips
        let before = alice.public_key().clone();

        let reply = bob.encrypt(b"pong").expect("encrypt");
        alice.decrypt(&reply).expect("decrypt");

        // The direction change rotated Alice's sending keypair
        assert_ne!(alice.public_key(), &before);
    }

    #[test]
    fn test_tampered_envelope_leaves_state_intact() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"intact").expect("encrypt");

        let mut tampered = envelope.clone();
        let last = tampered.ciphertext.len() - 1;
        tampered.ciphertext[last] ^= 0xFF;
        assert!(bob.decrypt(&tampered).is_err());

        // The original still decrypts: the failure committed nothing
        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"intact");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"bound header").expect("encrypt");

        let mut tampered = envelope.clone();
        tampered.header.previous_chain_length += 1;
        assert!(bob.decrypt(&tampered).is_err());

        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"bound header");
    }

    #[test]
    fn test_encrypt_before_first_receive_fails_for_receiver() {
        let (_alice, mut bob) = setup_session();
        assert!(matches!(bob.encrypt(b"too early"), Err(Error::Ratchet(_))));
    }

    #[test]
    fn test_skip_limit_enforced() {
        let (mut alice, mut bob) = setup_session();

        let mut last = None;
        for _ in 0..(MAX_SKIP as u32 + 2) {
            last = Some(alice.encrypt(b"flood").expect("encrypt"));
        }

        let err = bob
            .decrypt(&last.expect("envelope"))
            .expect_err("skip limit");
        assert!(matches!(err, Error::Ratchet(_)));
    }

    #[test]
    fn test_skip_cache_eviction_order() {
        let mut cache = SkippedKeys::default();
        for i in 0..(MAX_SKIP as u32 + 5) {
            cache.insert(([0u8; 32], i), [1u8; 32]);
        }

        assert_eq!(cache.len(), MAX_SKIP);
        // Oldest entries were evicted first
        assert!(cache.get(&([0u8; 32], 0)).is_none());
        assert!(cache.get(&([0u8; 32], 4)).is_none());
        assert!(cache.get(&([0u8; 32], 5)).is_some());
    }

    #[test]
    fn test_state_persistence_mid_conversation() {
        let (mut alice, mut bob) = setup_session();

        let envelope = alice.encrypt(b"Before save").expect("encrypt");
        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"Before save");

        // Persist and restore Alice
        let record = alice.export_state();
        let mut alice = DoubleRatchet::from_state(&record).expect("restore");

        let envelope = alice.encrypt(b"After restore").expect("encrypt");
        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"After restore");
    }

    #[test]
    fn test_state_persistence_preserves_skip_cache() {
        let (mut alice, mut bob) = setup_session();

        let e1 = alice.encrypt(b"one").expect("encrypt");
        let e2 = alice.encrypt(b"two").expect("encrypt");
        let e3 = alice.encrypt(b"three").expect("encrypt");

        assert_eq!(bob.decrypt(&e3).expect("decrypt"), b"three");
        assert_eq!(bob.skipped_key_count(), 2);

        let record = bob.export_state();
        let mut bob = DoubleRatchet::from_state(&record).expect("restore");

        assert_eq!(bob.skipped_key_count(), 2);
        assert_eq!(bob.decrypt(&e1).expect("decrypt"), b"one");
        assert_eq!(bob.decrypt(&e2).expect("decrypt"), b"two");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_state_record_round_trips_through_json() {
        let (mut alice, mut bob) = setup_session();
        let envelope = alice.encrypt(b"hello").expect("encrypt");
        bob.decrypt(&envelope).expect("decrypt");

        let record = bob.export_state();
        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: RatchetStateRecord = serde_json::from_str(&json).expect("deserialize");

        let mut bob = DoubleRatchet::from_state(&parsed).expect("restore");
        let envelope = alice.encrypt(b"again").expect("encrypt");
        assert_eq!(bob.decrypt(&envelope).expect("decrypt"), b"again");
    }

    #[test]
    fn test_corrupted_state_record_rejected() {
        let (alice, _bob) = setup_session();
        let mut record = alice.export_state();

        record.root_key = "not base64!!!".into();
        assert!(matches!(
            DoubleRatchet::from_state(&record),
            Err(Error::Serialization(_))
        ));

        let mut record = alice.export_state();
        record.dh_sending_public = BASE64.encode([7u8; 32]);
        assert!(matches!(
            DoubleRatchet::from_state(&record),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_header_serialization() {
        let header = RatchetHeader {
            dh_public: X25519PublicKey::from_bytes([42u8; 32]),
            previous_chain_length: 5,
            message_number: 10,
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), RatchetHeader::SIZE);
        let parsed = RatchetHeader::from_bytes(&bytes).expect("parse");

        assert_eq!(header, parsed);
    }

    #[test]
    fn test_chain_kdf_one_way_and_distinct() {
        let chain_key = [9u8; 32];
        let (next, message_key) = kdf_chain_key(&chain_key).expect("kdf");

        assert_ne!(&next, &chain_key);
        assert_ne!(&*message_key, &chain_key);
        assert_ne!(&next, &*message_key);

        // Deterministic
        let (next2, message_key2) = kdf_chain_key(&chain_key).expect("kdf");
        assert_eq!(next, next2);
        assert_eq!(*message_key, *message_key2);
    }
}
