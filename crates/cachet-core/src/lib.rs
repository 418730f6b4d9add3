//! # Cachet Core
//!
//! The end-to-end encryption engine for the Cachet messenger: key
//! management, pairwise and group message encryption, Double Ratchet
//! sessions, and the delivery-reliability layer.
//!
//! ## Security Model
//!
//! Cachet assumes the message store and the network are untrusted:
//!
//! - Every message is encrypted and signed before it leaves this crate
//! - Conversation keys rotate continuously via the Double Ratchet
//! - Compromise of current keys does not expose past messages, and fresh
//!   DH material restores confidentiality after a break-in
//! - Key material is zeroized on drop and never logged in full
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           Application / Transport           │
//! ├──────────────┬──────────────────────────────┤
//! │   delivery   │             p2p              │
//! ├──────────────┴──────────────────────────────┤
//! │           session (ratchet manager)         │
//! ├─────────────────────────────────────────────┤
//! │    crypto (keys │ aead │ ratchet │ service) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The engine is synchronous and call-driven: every operation completes on
//! the caller's thread. Retry sweeps and connection health checks are
//! periodic jobs owned by the embedding application, driven through the
//! query surfaces in [`delivery`] and [`p2p`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod crypto;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod p2p;
pub mod session;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version tag carried in every encrypted envelope for compatibility checks
pub const ENCRYPTION_VERSION: u32 = 1;

/// Maximum number of skipped message keys retained per ratchet session
pub const MAX_SKIP: usize = 1000;
