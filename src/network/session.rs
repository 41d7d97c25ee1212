//! Session State Machine
//!
//! ```text
//! WaitingForMatch --roster connected--> WaitingForNonce
//! WaitingForNonce --election complete--> WaitingForStart
//! WaitingForStart --GameBegin received--> Active
//! Active          --GameOver received--> Done
//! any             --disconnect / send failure / election failure--> Done
//! ```
//!
//! `Done` is terminal. Entering `Active` requires having *received*
//! `GameBegin`; local election completion alone never does it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the transport to connect every peer.
    WaitingForMatch,
    /// Nonce broadcast, collecting the others.
    WaitingForNonce,
    /// Order settled, waiting for GameBegin.
    WaitingForStart,
    /// Moves are being exchanged.
    Active,
    /// Session over.
    Done,
}

impl SessionState {
    /// True for `Done`.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Done
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// All expected peers are connected.
    RosterConnected,
    /// The election settled; the local peer holds `turn_index`.
    ElectionCompleted {
        /// Local position in the agreed order.
        turn_index: usize,
    },
    /// A GameBegin message arrived (including the primary's own copy).
    GameBeginReceived,
    /// A GameOver message arrived.
    GameOverReceived,
    /// A required peer disconnected.
    PeerDisconnected,
    /// A broadcast failed.
    SendFailed,
    /// The election could not complete.
    ElectionFailed,
    /// The host is tearing the session down.
    Shutdown,
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: SessionState,
    /// State after.
    pub to: SessionState,
}

/// The session FSM. Holds the turn index once it is fixed.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    elected_index: Option<usize>,
    turn_index: Option<usize>,
    begin_deferred: bool,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// Start in `WaitingForMatch`.
    pub fn new() -> Self {
        Self {
            state: SessionState::WaitingForMatch,
            elected_index: None,
            turn_index: None,
            begin_deferred: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Local turn index, fixed on entering `Active`.
    pub fn turn_index(&self) -> Option<usize> {
        self.turn_index
    }

    /// True if a GameBegin arrived before the election finished and is
    /// waiting to be applied. Clears the flag.
    pub fn take_deferred_begin(&mut self) -> bool {
        if self.state == SessionState::WaitingForStart && self.begin_deferred {
            self.begin_deferred = false;
            true
        } else {
            false
        }
    }

    /// Apply an input. Returns the transition, or `None` if the input does
    /// not change the state.
    pub fn apply(&mut self, input: SessionInput) -> Option<Transition> {
        use SessionState::*;

        if self.state == Done {
            debug!("Ignoring {:?} in terminal state", input);
            return None;
        }

        let next = match (self.state, input) {
            (WaitingForMatch, SessionInput::RosterConnected) => WaitingForNonce,

            (WaitingForNonce, SessionInput::ElectionCompleted { turn_index }) => {
                self.elected_index = Some(turn_index);
                WaitingForStart
            }

            (WaitingForStart, SessionInput::GameBeginReceived) => {
                self.turn_index = self.elected_index;
                Active
            }
            (WaitingForMatch | WaitingForNonce, SessionInput::GameBeginReceived) => {
                debug!("GameBegin arrived before election completed, deferring");
                self.begin_deferred = true;
                return None;
            }

            (Active, SessionInput::GameOverReceived) => Done,

            (
                _,
                SessionInput::PeerDisconnected
                | SessionInput::SendFailed
                | SessionInput::ElectionFailed
                | SessionInput::Shutdown,
            ) => Done,

            (state, input) => {
                warn!("Input {:?} has no effect in {:?}", input, state);
                return None;
            }
        };

        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        info!("Session {:?} -> {:?} on {:?}", transition.from, transition.to, input);
        Some(transition)
    }
}
