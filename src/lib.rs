//! # Duet Session
//!
//! Leaderless turn-order election and match session for two (or a few)
//! peers sharing a reliable broadcast channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DUET SESSION                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Network-free primitives                   │
//! │  ├── rng.rs      - Nonce sources (OS, Xorshift128+, script)  │
//! │  └── hash.rs     - Roster fingerprints                       │
//! │                                                              │
//! │  election/       - Turn-order election                       │
//! │  ├── roster.rs   - Peer ids and the nonce-ordered roster     │
//! │  └── engine.rs   - Collision re-roll and completion          │
//! │                                                              │
//! │  network/        - Session layer                             │
//! │  ├── protocol.rs - Binary wire codec                         │
//! │  ├── session.rs  - Session state machine                     │
//! │  ├── coordinator.rs - Routes frames, emits events            │
//! │  ├── actor.rs    - Tokio task + handle around a coordinator  │
//! │  └── transport.rs- Transport trait and in-process loopback   │
//! │                                                              │
//! │  config.rs       - Session tunables                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Agreement Guarantee
//!
//! Every peer that completes an election holds the same roster, so every
//! peer computes the same order:
//! - Largest nonce first, ties impossible (collisions are re-rolled)
//! - Roster is a Vec re-sorted on every upsert, so its order depends only
//!   on its contents, never on arrival order
//! - Turn index fixed only after receiving GameBegin

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod election;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, SessionConfig};
pub use crate::core::rng::{DeterministicRng, Nonce, NonceSource, OsNonceSource, ScriptedNonces};
pub use election::{Election, ElectionEngine, ElectionError, PeerId};
pub use network::{
    EndReason, LoopbackNetwork, Message, SendError, SessionActor, SessionCoordinator,
    SessionEvent, SessionHandle, SessionState, Transport, TransportError, TransportEvent,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Remote peers in a standard two-party session.
pub const TWO_PARTY_PEERS: usize = 1;
