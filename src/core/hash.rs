//! Roster Fingerprints
//!
//! SHA-256 digest over the final turn order. Both peers compute it
//! independently and log it, so a disagreement shows up as two different
//! fingerprints in the logs rather than as a silent divergence.

use sha2::{Digest, Sha256};

/// Roster digest (32 bytes)
pub type Fingerprint = [u8; 32];

const ROSTER_DOMAIN: &[u8] = b"DUET_ROSTER_V1";

/// Accumulates candidates in turn order.
///
/// Feed the count first, then every candidate in order; swapping two
/// candidates changes the digest.
pub struct RosterHasher {
    digest: Sha256,
}

impl Default for RosterHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl RosterHasher {
    /// Hasher under the roster domain tag.
    pub fn new() -> Self {
        Self::with_domain(ROSTER_DOMAIN)
    }

    /// Hasher under a custom domain tag.
    pub fn with_domain(domain: &[u8]) -> Self {
        let mut digest = Sha256::new();
        digest.update((domain.len() as u64).to_le_bytes());
        digest.update(domain);
        Self { digest }
    }

    /// Record how many candidates follow.
    pub fn push_len(&mut self, len: usize) {
        self.digest.update((len as u64).to_le_bytes());
    }

    /// Record one candidate. The id is length-prefixed so `("ab", "c")` and
    /// `("a", "bc")` never collide.
    pub fn push_candidate(&mut self, peer: &str, nonce: u32) {
        self.digest.update((peer.len() as u64).to_le_bytes());
        self.digest.update(peer.as_bytes());
        self.digest.update(nonce.to_le_bytes());
    }

    /// Consume and return the digest.
    pub fn finish(self) -> Fingerprint {
        self.digest.finalize().into()
    }
}

/// Short hex prefix of a fingerprint, for log lines.
pub fn short_hex(fingerprint: &Fingerprint) -> String {
    hex::encode(&fingerprint[..4])
}
