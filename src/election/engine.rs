//! Turn-Order Election
//!
//! Every peer rolls a nonce and broadcasts it. Once one candidate per peer is
//! known and all nonces differ, every peer sorts the same roster the same way
//! and reads off the same order: the largest nonce is primary.
//!
//! A remote nonce equal to our own is a collision. Both sides see it at the
//! same time, so both drop their own candidate, re-roll and rebroadcast; no
//! priority rule is needed to break the tie.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::hash::{short_hex, Fingerprint};
use crate::core::rng::{Nonce, NonceSource};
use crate::election::roster::{Candidate, OrderedRoster, PeerId};

/// Outcome of a completed election. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Election {
    /// Peers by descending nonce.
    pub order: Vec<PeerId>,
    /// Peer with the largest nonce.
    pub primary: PeerId,
    /// Local peer's position in `order`.
    pub local_index: usize,
    /// Digest of the final roster.
    pub fingerprint: Fingerprint,
}

impl Election {
    /// True if the local peer was elected primary.
    pub fn local_is_primary(&self) -> bool {
        self.local_index == 0
    }

    /// Turn index of an arbitrary peer.
    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.order.iter().position(|p| p == peer)
    }
}

/// Election failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ElectionError {
    /// A peer disconnected before the order was settled.
    #[error("Peer {0} left during election")]
    PeerLeftDuringElection(PeerId),

    /// Collisions kept recurring.
    #[error("Nonce collision persisted after {0} re-rolls")]
    RerollLimitExceeded(u32),

    /// The election deadline passed.
    #[error("Election timed out")]
    TimedOut,
}

/// What the caller must do after a remote nonce has been processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NonceOutcome {
    /// Still waiting on other peers.
    Pending,
    /// Collision: broadcast this fresh local nonce.
    Reroll(Nonce),
    /// The election just completed.
    Complete(Election),
    /// The nonce was not applied (election already settled, or our own id).
    Ignored,
}

/// Snapshot of election progress, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElectionProgress {
    /// Candidates currently held, local included.
    pub collected: usize,
    /// Candidates needed, local included.
    pub required: usize,
    /// True if all held nonces differ.
    pub distinct: bool,
}

/// Collects nonces and settles the turn order.
pub struct ElectionEngine {
    local: PeerId,
    local_nonce: Option<Nonce>,
    roster: OrderedRoster,
    expected_remote: usize,
    rerolls: u32,
    max_rerolls: Option<u32>,
    nonces: Box<dyn NonceSource>,
    result: Option<Election>,
}

impl ElectionEngine {
    /// Create an engine for `local` expecting `expected_remote` other peers.
    pub fn new(
        local: PeerId,
        expected_remote: usize,
        nonces: Box<dyn NonceSource>,
        max_rerolls: Option<u32>,
    ) -> Self {
        Self {
            local,
            local_nonce: None,
            roster: OrderedRoster::new(),
            expected_remote,
            rerolls: 0,
            max_rerolls,
            nonces,
            result: None,
        }
    }

    /// Roll (once) and record the local candidate. Returns the nonce to
    /// broadcast.
    ///
    /// Nonces may already have arrived from peers that started first; the
    /// local roll is redrawn until it differs from all of them, since those
    /// peers will never see a clash with a nonce they sent before ours.
    pub fn begin(&mut self) -> Result<Nonce, ElectionError> {
        let nonce = match self.local_nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = self.draw_distinct()?;
                self.local_nonce = Some(nonce);
                nonce
            }
        };
        self.roster.upsert(Candidate::new(self.local.clone(), nonce));
        debug!("Local nonce {} recorded for {}", hex::encode(nonce.to_le_bytes()), self.local);
        Ok(nonce)
    }

    /// Apply a nonce broadcast by `peer`.
    pub fn on_remote_nonce(
        &mut self,
        peer: &PeerId,
        nonce: Nonce,
    ) -> Result<NonceOutcome, ElectionError> {
        if self.result.is_some() {
            warn!("Ignoring nonce from {} after election completed", peer);
            return Ok(NonceOutcome::Ignored);
        }
        if peer == &self.local {
            debug!("Ignoring nonce echoed with local id");
            return Ok(NonceOutcome::Ignored);
        }

        if self.local_nonce == Some(nonce) {
            return self.reroll(peer, nonce).map(NonceOutcome::Reroll);
        }

        self.roster.upsert(Candidate::new(peer.clone(), nonce));
        debug!(
            "Nonce {} from {} ({}/{})",
            nonce,
            peer,
            self.roster.len(),
            self.required()
        );

        Ok(match self.try_complete() {
            Some(election) => NonceOutcome::Complete(election),
            None => NonceOutcome::Pending,
        })
    }

    /// Settle the election if the roster is complete. Returns the result only
    /// on the call that completes it.
    pub fn try_complete(&mut self) -> Option<Election> {
        if self.result.is_some() || !self.is_roster_complete() {
            return None;
        }

        let local_index = self.roster.position(&self.local)?;
        let primary = self.roster.first()?.peer.clone();
        let election = Election {
            order: self.roster.peers(),
            primary,
            local_index,
            fingerprint: self.roster.fingerprint(),
        };

        info!(
            "Election complete: primary={} local_index={} roster={}",
            election.primary,
            election.local_index,
            short_hex(&election.fingerprint)
        );
        self.result = Some(election.clone());
        Some(election)
    }

    /// A peer disconnected. Discards its candidate and shrinks the expected
    /// count; fails if the election had not completed yet.
    pub fn peer_left(&mut self, peer: &PeerId) -> Result<(), ElectionError> {
        if self.result.is_some() {
            return Ok(());
        }

        self.roster.remove(peer);
        self.expected_remote = self.expected_remote.saturating_sub(1);
        info!(
            "Peer {} left during election, {} remote peer(s) still expected",
            peer, self.expected_remote
        );
        Err(ElectionError::PeerLeftDuringElection(peer.clone()))
    }

    /// Settled result, if any.
    pub fn result(&self) -> Option<&Election> {
        self.result.as_ref()
    }

    /// Current local nonce, if rolled.
    pub fn local_nonce(&self) -> Option<Nonce> {
        self.local_nonce
    }

    /// Roster as currently known.
    pub fn roster(&self) -> &OrderedRoster {
        &self.roster
    }

    /// Number of collisions resolved so far.
    pub fn rerolls(&self) -> u32 {
        self.rerolls
    }

    /// Progress counters.
    pub fn progress(&self) -> ElectionProgress {
        ElectionProgress {
            collected: self.roster.len(),
            required: self.required(),
            distinct: self.roster.has_distinct_nonces(),
        }
    }

    fn required(&self) -> usize {
        self.expected_remote + 1
    }

    fn is_roster_complete(&self) -> bool {
        self.roster.get(&self.local).is_some()
            && self.roster.len() == self.required()
            && self.roster.has_distinct_nonces()
    }

    fn reroll(&mut self, peer: &PeerId, collided: Nonce) -> Result<Nonce, ElectionError> {
        self.charge_reroll(peer, collided)?;

        self.roster.remove(&self.local);
        // The peer is re-rolling too; whatever we held for it is stale.
        self.roster.remove(peer);

        let fresh = self.draw_distinct()?;
        self.local_nonce = Some(fresh);
        self.roster.upsert(Candidate::new(self.local.clone(), fresh));
        info!(
            "Tie with {} on {}, re-rolled to {} (re-roll #{})",
            peer, collided, fresh, self.rerolls
        );
        Ok(fresh)
    }

    /// Draw a nonce no remote candidate holds. Each redraw counts against
    /// the re-roll cap.
    fn draw_distinct(&mut self) -> Result<Nonce, ElectionError> {
        loop {
            let nonce = self.nonces.next_nonce();
            let holder = self
                .roster
                .iter()
                .find(|c| c.peer != self.local && c.nonce == nonce)
                .map(|c| c.peer.clone());
            match holder {
                None => return Ok(nonce),
                Some(peer) => {
                    self.charge_reroll(&peer, nonce)?;
                    debug!("Drew {} already held by {}, drawing again", nonce, peer);
                }
            }
        }
    }

    fn charge_reroll(&mut self, peer: &PeerId, collided: Nonce) -> Result<(), ElectionError> {
        if let Some(limit) = self.max_rerolls {
            if self.rerolls >= limit {
                warn!(
                    "Collision with {} on {} after {} re-rolls, giving up",
                    peer, collided, limit
                );
                return Err(ElectionError::RerollLimitExceeded(limit));
            }
        }
        self.rerolls += 1;
        Ok(())
    }
}

impl std::fmt::Debug for ElectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionEngine")
            .field("local", &self.local)
            .field("local_nonce", &self.local_nonce)
            .field("roster", &self.roster)
            .field("expected_remote", &self.expected_remote)
            .field("rerolls", &self.rerolls)
            .field("result", &self.result)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::{DeterministicRng, ScriptedNonces};

    fn engine(local: &str, script: &[Nonce]) -> ElectionEngine {
        ElectionEngine::new(
            PeerId::from(local),
            1,
            Box::new(ScriptedNonces::new(script.to_vec(), 99)),
            Some(8),
        )
    }

    #[test]
    fn test_two_peer_order() {
        let mut a = engine("a", &[50]);
        let mut b = engine("b", &[80]);

        let na = a.begin().unwrap();
        let nb = b.begin().unwrap();

        let outcome_a = a.on_remote_nonce(&PeerId::from("b"), nb).unwrap();
        let outcome_b = b.on_remote_nonce(&PeerId::from("a"), na).unwrap();

        let NonceOutcome::Complete(ea) = outcome_a else { panic!("a not complete") };
        let NonceOutcome::Complete(eb) = outcome_b else { panic!("b not complete") };

        assert_eq!(ea.order, vec![PeerId::from("b"), PeerId::from("a")]);
        assert_eq!(ea.order, eb.order);
        assert_eq!(ea.primary, PeerId::from("b"));
        assert_eq!(ea.local_index, 1);
        assert_eq!(eb.local_index, 0);
        assert!(eb.local_is_primary());
        assert_eq!(ea.fingerprint, eb.fingerprint);
    }

    #[test]
    fn test_collision_rerolls() {
        let mut a = engine("a", &[7, 3]);
        let mut b = engine("b", &[7, 11]);

        assert_eq!(a.begin(), Ok(7));
        assert_eq!(b.begin(), Ok(7));

        let ra = a.on_remote_nonce(&PeerId::from("b"), 7).unwrap();
        let rb = b.on_remote_nonce(&PeerId::from("a"), 7).unwrap();
        assert_eq!(ra, NonceOutcome::Reroll(3));
        assert_eq!(rb, NonceOutcome::Reroll(11));
        assert_eq!(a.rerolls(), 1);
        assert!(a.roster().get(&PeerId::from("b")).is_none());

        let NonceOutcome::Complete(ea) = a.on_remote_nonce(&PeerId::from("b"), 11).unwrap() else {
            panic!("a not complete")
        };
        let NonceOutcome::Complete(eb) = b.on_remote_nonce(&PeerId::from("a"), 3).unwrap() else {
            panic!("b not complete")
        };
        assert_eq!(ea.primary, PeerId::from("b"));
        assert_eq!(ea.order, eb.order);
    }

    #[test]
    fn test_reroll_limit() {
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            1,
            Box::new(ScriptedNonces::new([5, 5, 5], 0)),
            Some(1),
        );
        a.begin().unwrap();
        assert_eq!(a.on_remote_nonce(&PeerId::from("b"), 5).unwrap(), NonceOutcome::Reroll(5));
        assert_eq!(
            a.on_remote_nonce(&PeerId::from("b"), 5),
            Err(ElectionError::RerollLimitExceeded(1))
        );
    }

    #[test]
    fn test_nonce_before_begin_counts() {
        let mut a = engine("a", &[50]);
        assert_eq!(a.on_remote_nonce(&PeerId::from("b"), 80).unwrap(), NonceOutcome::Pending);
        assert!(a.try_complete().is_none());

        a.begin().unwrap();
        let election = a.try_complete().unwrap();
        assert_eq!(election.local_index, 1);
        // Completion is reported once.
        assert!(a.try_complete().is_none());
        assert!(a.result().is_some());
    }

    #[test]
    fn test_replacement_nonce() {
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            2,
            Box::new(ScriptedNonces::new([50], 0)),
            None,
        );
        a.begin().unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 10).unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 90).unwrap();
        assert_eq!(a.roster().len(), 2);
        assert_eq!(a.roster().first().unwrap().peer, PeerId::from("b"));
    }

    #[test]
    fn test_remote_duplicate_blocks_completion() {
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            2,
            Box::new(ScriptedNonces::new([50], 0)),
            None,
        );
        a.begin().unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 20).unwrap();
        assert_eq!(a.on_remote_nonce(&PeerId::from("c"), 20).unwrap(), NonceOutcome::Pending);
        assert!(!a.progress().distinct);

        let outcome = a.on_remote_nonce(&PeerId::from("c"), 21).unwrap();
        assert!(matches!(outcome, NonceOutcome::Complete(_)));
    }

    #[test]
    fn test_ignores_after_complete() {
        let mut a = engine("a", &[50]);
        a.begin().unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 80).unwrap();
        assert_eq!(a.on_remote_nonce(&PeerId::from("b"), 99).unwrap(), NonceOutcome::Ignored);
        assert_eq!(a.result().unwrap().primary, PeerId::from("b"));
    }

    #[test]
    fn test_own_id_ignored() {
        let mut a = engine("a", &[50]);
        a.begin().unwrap();
        assert_eq!(a.on_remote_nonce(&PeerId::from("a"), 50).unwrap(), NonceOutcome::Ignored);
        assert_eq!(a.rerolls(), 0);
    }

    #[test]
    fn test_peer_left_during_election() {
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            2,
            Box::new(ScriptedNonces::new([50], 0)),
            None,
        );
        a.begin().unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 80).unwrap();

        let err = a.peer_left(&PeerId::from("c")).unwrap_err();
        assert_eq!(err, ElectionError::PeerLeftDuringElection(PeerId::from("c")));

        // Re-evaluated against the reduced count.
        assert_eq!(a.progress().required, 2);
        let election = a.try_complete().unwrap();
        assert_eq!(election.order.len(), 2);
    }

    #[test]
    fn test_peer_left_after_complete_is_ok() {
        let mut a = engine("a", &[50]);
        a.begin().unwrap();
        a.on_remote_nonce(&PeerId::from("b"), 80).unwrap();
        assert!(a.peer_left(&PeerId::from("b")).is_ok());
        assert_eq!(a.result().unwrap().order.len(), 2);
    }

    #[test]
    fn test_begin_redraws_past_early_nonce() {
        let mut a = engine("a", &[7, 3]);
        a.on_remote_nonce(&PeerId::from("b"), 7).unwrap();

        assert_eq!(a.begin(), Ok(3));
        assert_eq!(a.rerolls(), 1);
        // The early nonce is kept, so the roster is already complete.
        assert_eq!(a.roster().get(&PeerId::from("b")).unwrap().nonce, 7);
        let election = a.try_complete().unwrap();
        assert_eq!(election.primary, PeerId::from("b"));
    }

    #[test]
    fn test_begin_redraw_respects_cap() {
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            1,
            Box::new(ScriptedNonces::new([7, 7], 0)),
            Some(1),
        );
        a.on_remote_nonce(&PeerId::from("b"), 7).unwrap();
        assert_eq!(a.begin(), Err(ElectionError::RerollLimitExceeded(1)));
        assert!(a.local_nonce().is_none());
    }

    #[test]
    fn test_seeded_collision_converges() {
        // Both peers share a seed, so their first rolls collide and both
        // re-roll from an identical stream. The second peer skips one value
        // to diverge.
        let mut a = ElectionEngine::new(
            PeerId::from("a"),
            1,
            Box::new(DeterministicRng::new(7)),
            Some(4),
        );
        let mut shifted = DeterministicRng::new(7);
        let first = shifted.next_u32();
        let _skip = shifted.next_u32();
        let mut b = ElectionEngine::new(
            PeerId::from("b"),
            1,
            Box::new(ScriptedNonces::new([first], 0)),
            Some(4),
        );
        let na = a.begin().unwrap();
        let nb = b.begin().unwrap();
        assert_eq!(na, nb);
        // Move b onto the shifted stream after its scripted opening roll.
        b.nonces = Box::new(shifted);

        let NonceOutcome::Reroll(na2) = a.on_remote_nonce(&PeerId::from("b"), nb).unwrap() else {
            panic!("expected re-roll")
        };
        let NonceOutcome::Reroll(nb2) = b.on_remote_nonce(&PeerId::from("a"), na).unwrap() else {
            panic!("expected re-roll")
        };
        assert_ne!(na2, nb2);

        let NonceOutcome::Complete(ea) = a.on_remote_nonce(&PeerId::from("b"), nb2).unwrap() else {
            panic!("a not complete")
        };
        let NonceOutcome::Complete(eb) = b.on_remote_nonce(&PeerId::from("a"), na2).unwrap() else {
            panic!("b not complete")
        };
        assert_eq!(ea.order, eb.order);
        assert_ne!(ea.local_index, eb.local_index);
    }
}
