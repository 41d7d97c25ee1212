//! Nonce Sources
//!
//! Election nonces come from a [`NonceSource`]. Production sessions draw from
//! the OS RNG; tests use the seeded Xorshift128+ generator or a scripted
//! sequence so collision scenarios replay exactly.

use std::collections::VecDeque;

/// Election nonce. Random, used only for ordering, never for security.
pub type Nonce = u32;

/// Supplies fresh nonces to the election engine.
pub trait NonceSource: Send {
    /// Draw the next nonce.
    fn next_nonce(&mut self) -> Nonce;
}

/// Uniform nonces from the thread-local OS-seeded RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn next_nonce(&mut self) -> Nonce {
        rand::random()
    }
}

/// Seeded Xorshift128+ nonce source.
///
/// Two sources built from the same seed roll the same nonces on any
/// platform, so an election under test replays exactly.
///
/// ```
/// use duet::core::rng::{DeterministicRng, NonceSource};
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_nonce(), b.next_nonce());
/// ```
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Seed via SplitMix64 so small or zero seeds still spread well.
    pub fn new(seed: u64) -> Self {
        let mut cursor = seed;
        let state = [splitmix64(&mut cursor), splitmix64(&mut cursor)];
        // Xorshift never leaves the all-zero state.
        if state == [0, 0] {
            return Self { state: [1, 1] };
        }
        Self { state }
    }

    /// Next raw 64-bit output.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let [s0, s1] = self.state;
        let out = s0.wrapping_add(s1);
        let mixed = s1 ^ s0;
        self.state = [s0.rotate_left(24) ^ mixed ^ (mixed << 16), mixed.rotate_left(37)];
        out
    }

    /// Upper half of the next output; the low bits of Xorshift128+ are weaker.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

impl NonceSource for DeterministicRng {
    fn next_nonce(&mut self) -> Nonce {
        self.next_u32()
    }
}

#[inline]
fn splitmix64(cursor: &mut u64) -> u64 {
    *cursor = cursor.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *cursor;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Plays back a fixed list of nonces, then falls through to a seeded RNG.
///
/// Lets a test force two peers onto the same opening nonce and watch the
/// re-roll resolve it.
#[derive(Clone, Debug)]
pub struct ScriptedNonces {
    script: VecDeque<Nonce>,
    fallback: DeterministicRng,
}

impl ScriptedNonces {
    /// Replay `script` in order, then draw from `DeterministicRng::new(seed)`.
    pub fn new(script: impl IntoIterator<Item = Nonce>, seed: u64) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: DeterministicRng::new(seed),
        }
    }

    /// Nonces left in the script.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl NonceSource for ScriptedNonces {
    fn next_nonce(&mut self) -> Nonce {
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.next_nonce())
    }
}

impl<S: NonceSource + ?Sized> NonceSource for Box<S> {
    fn next_nonce(&mut self) -> Nonce {
        (**self).next_nonce()
    }
}
