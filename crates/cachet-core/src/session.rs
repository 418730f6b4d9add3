//! Ratchet session management.
//!
//! A [`RatchetSessionManager`] owns one [`DoubleRatchet`] per peer and
//! serializes all use of it. Ratchet correctness depends on strictly
//! sequential state transitions, so every encrypt/decrypt for a given peer
//! runs under that peer's session lock; the session map itself has its own
//! lightweight lock so unrelated peers never contend.

use crate::crypto::{
    DoubleRatchet, EphemeralKeypair, RatchetEnvelope, RatchetStateRecord, SharedSecret,
    X25519PublicKey,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Which side of the initial key exchange this session is.
pub enum SessionRole {
    /// We initiate and already hold the peer's ratchet public key.
    Initiator {
        /// The peer's public key from the initial key exchange.
        peer_public: X25519PublicKey,
    },
    /// We respond with our own keypair and wait for the first message.
    Responder {
        /// The keypair whose public half the initiator used.
        keypair: EphemeralKeypair,
    },
}

/// Owns and serializes the Double Ratchet sessions for all peers.
#[derive(Default)]
pub struct RatchetSessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<DoubleRatchet>>>>,
}

impl RatchetSessionManager {
    /// Create an empty session manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a peer, replacing any existing one.
    pub fn create_session(
        &self,
        peer_id: &str,
        shared_secret: &SharedSecret,
        role: SessionRole,
    ) -> Result<()> {
        let session_id = format!(
            "session-{}-{}",
            peer_id,
            chrono::Utc::now().timestamp_millis()
        );

        let ratchet = match role {
            SessionRole::Initiator { peer_public } => {
                DoubleRatchet::init_sender(shared_secret, &peer_public, session_id, peer_id)?
            }
            SessionRole::Responder { keypair } => {
                DoubleRatchet::init_receiver(shared_secret, keypair, session_id, peer_id)
            }
        };

        let mut sessions = self.write_map()?;
        if sessions
            .insert(peer_id.to_string(), Arc::new(Mutex::new(ratchet)))
            .is_some()
        {
            info!(peer = %peer_id, "replaced existing ratchet session");
        } else {
            debug!(peer = %peer_id, "created ratchet session");
        }
        Ok(())
    }

    /// Encrypt a message for a peer.
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<RatchetEnvelope> {
        let session = self.get_session(peer_id)?;
        let mut ratchet = session
            .lock()
            .map_err(|_| Error::Storage("session lock poisoned".into()))?;
        ratchet.encrypt(plaintext)
    }

    /// Decrypt a message from a peer.
    pub fn decrypt(&self, peer_id: &str, envelope: &RatchetEnvelope) -> Result<Vec<u8>> {
        let session = self.get_session(peer_id)?;
        let mut ratchet = session
            .lock()
            .map_err(|_| Error::Storage("session lock poisoned".into()))?;
        ratchet.decrypt(envelope)
    }

    /// Check whether a session exists for a peer.
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.read_map()
            .map(|sessions| sessions.contains_key(peer_id))
            .unwrap_or(false)
    }

    /// Remove the session for a peer. Returns whether one existed.
    pub fn remove_session(&self, peer_id: &str) -> bool {
        match self.write_map() {
            Ok(mut sessions) => sessions.remove(peer_id).is_some(),
            Err(_) => false,
        }
    }

    /// Peer ids with an active session.
    pub fn session_ids(&self) -> Vec<String> {
        self.read_map()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Export every session's state for at-rest persistence.
    ///
    /// The records contain live key material; encrypting them at rest is
    /// the caller's responsibility.
    pub fn export_sessions(&self) -> Result<HashMap<String, RatchetStateRecord>> {
        let sessions = self.read_map()?;
        let mut exported = HashMap::with_capacity(sessions.len());
        for (peer_id, session) in sessions.iter() {
            let ratchet = session
                .lock()
                .map_err(|_| Error::Storage("session lock poisoned".into()))?;
            exported.insert(peer_id.clone(), ratchet.export_state());
        }
        Ok(exported)
    }

    /// Import sessions from persisted state, replacing matching peers.
    pub fn import_sessions(&self, records: HashMap<String, RatchetStateRecord>) -> Result<()> {
        let mut restored = HashMap::with_capacity(records.len());
        for (peer_id, record) in &records {
            let ratchet = DoubleRatchet::from_state(record)?;
            restored.insert(peer_id.clone(), Arc::new(Mutex::new(ratchet)));
        }

        // All records parsed; only now touch the live map
        let mut sessions = self.write_map()?;
        let count = restored.len();
        sessions.extend(restored);
        info!(count, "imported ratchet sessions");
        Ok(())
    }

    fn get_session(&self, peer_id: &str) -> Result<Arc<Mutex<DoubleRatchet>>> {
        let sessions = self.read_map()?;
        sessions.get(peer_id).cloned().ok_or(Error::NoSession)
    }

    fn read_map(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<DoubleRatchet>>>>> {
        self.sessions
            .read()
            .map_err(|_| Error::Storage("session map lock poisoned".into()))
    }

    fn write_map(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<DoubleRatchet>>>>> {
        self.sessions
            .write()
            .map_err(|_| Error::Storage("session map lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticKeypair;

    /// Build two managers holding the opposite ends of one session.
    fn setup_managers() -> (RatchetSessionManager, RatchetSessionManager) {
        let alice_identity = StaticKeypair::generate();
        let bob_prekey = EphemeralKeypair::generate();
        let shared_alice = alice_identity.diffie_hellman(bob_prekey.public_key());
        let shared_bob = alice_identity.diffie_hellman(bob_prekey.public_key());

        let alice = RatchetSessionManager::new();
        alice
            .create_session(
                "bob",
                &shared_alice,
                SessionRole::Initiator {
                    peer_public: bob_prekey.public_key().clone(),
                },
            )
            .expect("alice session");

        let bob = RatchetSessionManager::new();
        bob.create_session(
            "alice",
            &shared_bob,
            SessionRole::Responder {
                keypair: bob_prekey,
            },
        )
        .expect("bob session");

        (alice, bob)
    }

    #[test]
    fn test_create_and_query_sessions() {
        let (alice, _bob) = setup_managers();

        assert!(alice.has_session("bob"));
        assert!(!alice.has_session("charlie"));
        assert_eq!(alice.session_ids(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_encrypt_decrypt_through_manager() {
        let (alice, bob) = setup_managers();

        let envelope = alice.encrypt("bob", b"Hello through the manager").expect("encrypt");
        let decrypted = bob.decrypt("alice", &envelope).expect("decrypt");
        assert_eq!(decrypted, b"Hello through the manager");

        let reply = bob.encrypt("alice", b"Reply").expect("encrypt");
        assert_eq!(alice.decrypt("bob", &reply).expect("decrypt"), b"Reply");
    }

    #[test]
    fn test_unknown_peer_errors() {
        let (alice, _bob) = setup_managers();

        assert!(matches!(
            alice.encrypt("charlie", b"hi"),
            Err(Error::NoSession)
        ));
    }

    #[test]
    fn test_remove_session() {
        let (alice, _bob) = setup_managers();

        assert!(alice.remove_session("bob"));
        assert!(!alice.has_session("bob"));
        assert!(!alice.remove_session("bob"));
        assert!(matches!(alice.encrypt("bob", b"hi"), Err(Error::NoSession)));
    }

    #[test]
    fn test_export_import_continues_conversation() {
        let (alice, bob) = setup_managers();

        let envelope = alice.encrypt("bob", b"Before save").expect("encrypt");
        assert_eq!(bob.decrypt("alice", &envelope).expect("decrypt"), b"Before save");

        // Persist Alice's sessions and restore them into a fresh manager
        let exported = alice.export_sessions().expect("export");
        let restored = RatchetSessionManager::new();
        restored.import_sessions(exported).expect("import");

        let envelope = restored.encrypt("bob", b"After restore").expect("encrypt");
        assert_eq!(
            bob.decrypt("alice", &envelope).expect("decrypt"),
            b"After restore"
        );
    }

    #[test]
    fn test_import_rejects_corrupt_record() {
        let (alice, _bob) = setup_managers();

        let mut exported = alice.export_sessions().expect("export");
        if let Some(record) = exported.get_mut("bob") {
            record.root_key = "corrupted".into();
        }

        let restored = RatchetSessionManager::new();
        assert!(matches!(
            restored.import_sessions(exported),
            Err(Error::Serialization(_))
        ));
        // Nothing was imported
        assert!(!restored.has_session("bob"));
    }
}
