//! Error types for the Cachet encryption engine.
//!
//! Error display strings are intentionally generic: they must never leak
//! key material, plaintext, or enough detail to act as a padding/signature
//! oracle. The attached `String` carries internal context for logs.

use thiserror::Error;

/// Core error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Signature verification or AEAD authentication failed.
    /// Fatal for the payload; must never be retried as-is.
    #[error("authentication failed")]
    Authentication(String),

    /// Peer key material is malformed or unusable.
    /// The caller must refresh keys rather than retry.
    #[error("key agreement failed")]
    KeyAgreement(String),

    /// The message key was already consumed or the message is older than
    /// the receive window. The message is dropped, never decrypted.
    #[error("replayed or stale message")]
    ReplayOrStale(String),

    /// Persisted state or a wire map could not be decoded.
    /// Callers should force session renegotiation, not guess fields.
    #[error("serialization error")]
    Serialization(String),

    /// Delivery retries or the entry's lifetime are exhausted.
    #[error("delivery attempts exhausted")]
    DeliveryExhausted(String),

    /// A cryptographic primitive failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Ratchet state error (missing chain, skip limit exceeded).
    #[error("ratchet error")]
    Ratchet(String),

    /// No session established for the requested peer.
    #[error("no active session")]
    NoSession,

    /// Peer session lifecycle violation.
    #[error("session error")]
    Session(String),

    /// Storage operation failed.
    #[error("storage error")]
    Storage(String),
}

/// Result type alias using the engine's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a delivery attempt that failed with this error may be
    /// retried. Security failures are final: retrying a forged or
    /// replayed payload can only succeed by weakening verification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Session(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_failures_not_retryable() {
        assert!(!Error::Authentication("bad signature".into()).is_retryable());
        assert!(!Error::ReplayOrStale("consumed".into()).is_retryable());
        assert!(!Error::KeyAgreement("bad key".into()).is_retryable());
        assert!(Error::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn test_display_leaks_no_context() {
        let err = Error::Authentication("secret detail".into());
        assert!(!err.to_string().contains("secret detail"));
    }
}
