//! Peer identities and the nonce-ordered roster.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::hash::{Fingerprint, RosterHasher};
use crate::core::rng::Nonce;

// =============================================================================
// PEER ID
// =============================================================================

/// Stable peer identifier supplied by the transport.
///
/// Implements Ord for deterministic tie ordering and BTreeMap use.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a transport-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identifier from a random UUID.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// CANDIDATE
// =============================================================================

/// A peer's current bid in the election.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Who rolled.
    pub peer: PeerId,
    /// What they rolled.
    pub nonce: Nonce,
}

impl Candidate {
    /// Pair a peer with a nonce.
    pub fn new(peer: PeerId, nonce: Nonce) -> Self {
        Self { peer, nonce }
    }
}

// =============================================================================
// ORDERED ROSTER
// =============================================================================

/// At most one candidate per peer, sorted by nonce descending.
///
/// Equal nonces (only possible before a re-roll lands) fall back to PeerId
/// ascending, so the order is always a pure function of the contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderedRoster {
    candidates: Vec<Candidate>,
}

impl OrderedRoster {
    /// Empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the candidate for `candidate.peer`.
    ///
    /// Returns the replaced candidate, if any.
    pub fn upsert(&mut self, candidate: Candidate) -> Option<Candidate> {
        let previous = self.remove(&candidate.peer);
        self.candidates.push(candidate);
        self.sort();
        previous
    }

    /// Drop a peer's candidate.
    pub fn remove(&mut self, peer: &PeerId) -> Option<Candidate> {
        let idx = self.candidates.iter().position(|c| &c.peer == peer)?;
        Some(self.candidates.remove(idx))
    }

    /// Look up a peer's candidate.
    pub fn get(&self, peer: &PeerId) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.peer == peer)
    }

    /// Zero-based position of `peer` in descending nonce order.
    pub fn position(&self, peer: &PeerId) -> Option<usize> {
        self.candidates.iter().position(|c| &c.peer == peer)
    }

    /// Candidate with the largest nonce.
    pub fn first(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// True if no candidates are recorded.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates in order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Iterate candidates in order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Peer ids in order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.candidates.iter().map(|c| c.peer.clone()).collect()
    }

    /// True if no two candidates share a nonce.
    pub fn has_distinct_nonces(&self) -> bool {
        // Sorted by nonce, so duplicates are adjacent.
        self.candidates
            .windows(2)
            .all(|pair| pair[0].nonce != pair[1].nonce)
    }

    /// Digest of the (peer, nonce) sequence in order.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = RosterHasher::new();
        hasher.push_len(self.candidates.len());
        for candidate in &self.candidates {
            hasher.push_candidate(candidate.peer.as_str(), candidate.nonce);
        }
        hasher.finish()
    }

    fn sort(&mut self) {
        self.candidates.sort_by(|a, b| {
            b.nonce.cmp(&a.nonce).then_with(|| a.peer.cmp(&b.peer))
        });
    }
}

// =============================================================================
// TESTS
// =============================================================================
