//! Core primitives shared by the election and the session layer.
//!
//! Nothing in here touches the network.

pub mod hash;
pub mod rng;

pub use hash::{Fingerprint, RosterHasher};
pub use rng::{DeterministicRng, Nonce, NonceSource, OsNonceSource, ScriptedNonces};
