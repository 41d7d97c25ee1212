//! Leaderless turn-order election over broadcast nonces.

pub mod engine;
pub mod roster;

pub use engine::{Election, ElectionEngine, ElectionError, ElectionProgress, NonceOutcome};
pub use roster::{Candidate, OrderedRoster, PeerId};
