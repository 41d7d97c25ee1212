//! Session Coordinator
//!
//! Owns the election engine and the state machine for one match and routes
//! every inbound frame to the right one:
//!
//! - `RandomNumber` → election engine
//! - `GameBegin` / `GameOver` → state machine
//! - `Move` → straight to the application as [`SessionEvent::MoveReceived`]
//!
//! All methods take `&mut self`; the caller serializes access (see
//! [`crate::network::actor`]).

use std::collections::BTreeSet;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::core::hash::short_hex;
use crate::core::rng::{Nonce, NonceSource, OsNonceSource};
use crate::election::engine::{Election, ElectionEngine, ElectionError, NonceOutcome};
use crate::election::roster::PeerId;
use crate::network::protocol::{decode, encode, Message};
use crate::network::session::{SessionInput, SessionState, SessionStateMachine};
use crate::network::transport::{PeerConnection, Transport, TransportError, TransportEvent};

/// Why a session reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    /// A GameOver message was received.
    GameOver {
        /// True if the primary won.
        primary_won: bool,
    },
    /// A peer disconnected.
    PeerDisconnected(PeerId),
    /// A broadcast failed.
    TransportFailure(TransportError),
    /// The election could not complete.
    ElectionFailed(ElectionError),
    /// The host shut the session down.
    Shutdown,
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session entered `Active`.
    MatchStarted,
    /// The session entered `Done`.
    MatchEnded {
        /// Why it ended.
        reason: EndReason,
    },
    /// A peer sent a move.
    MoveReceived(String),
    /// The local turn index is fixed.
    TurnIndexAssigned(usize),
}

/// Application send failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The transport refused the send; the session has ended.
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// The session is not in `Active`.
    #[error("No active session")]
    NoActiveSession,
}

/// One match between connected peers.
pub struct SessionCoordinator<T: Transport> {
    transport: T,
    config: SessionConfig,
    engine: ElectionEngine,
    machine: SessionStateMachine,
    connected: BTreeSet<PeerId>,
    event_tx: broadcast::Sender<SessionEvent>,
    end_reason: Option<EndReason>,
}

impl<T: Transport> SessionCoordinator<T> {
    /// Create a session drawing nonces from the OS RNG.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_nonce_source(transport, config, Box::new(OsNonceSource))
    }

    /// Create a session with an explicit nonce source.
    pub fn with_nonce_source(
        transport: T,
        config: SessionConfig,
        nonces: Box<dyn NonceSource>,
    ) -> Self {
        let engine = ElectionEngine::new(
            transport.local_peer().clone(),
            transport.expected_peer_count(),
            nonces,
            config.max_rerolls,
        );
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            transport,
            config,
            engine,
            machine: SessionStateMachine::new(),
            connected: BTreeSet::new(),
            event_tx,
            end_reason: None,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Sender side of the event channel, for handles that outlive `self`.
    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.event_tx.clone()
    }

    /// Signal that every expected peer is connected: roll and broadcast the
    /// local nonce. No-op outside `WaitingForMatch`.
    pub fn start(&mut self) {
        if self.machine.state() != SessionState::WaitingForMatch {
            debug!("start() ignored in {:?}", self.machine.state());
            return;
        }

        self.machine.apply(SessionInput::RosterConnected);
        let nonce = match self.engine.begin() {
            Ok(nonce) => nonce,
            Err(e) => {
                error!("Election failed: {}", e);
                self.finish(SessionInput::ElectionFailed, EndReason::ElectionFailed(e));
                return;
            }
        };
        info!("{} broadcasting nonce {}", self.local_peer(), nonce);
        if self.broadcast_message(&Message::RandomNumber(nonce)).is_err() {
            return;
        }

        // Nonces received before we started may already complete the roster.
        if let Some(election) = self.engine.try_complete() {
            self.on_election_complete(election);
        }
    }

    /// Send a move to every peer. Requires `Active`.
    pub fn send_move(&mut self, text: impl Into<String>) -> Result<(), SendError> {
        if self.machine.state() != SessionState::Active {
            return Err(SendError::NoActiveSession);
        }
        self.broadcast_message(&Message::Move(text.into()))?;
        Ok(())
    }

    /// Broadcast GameOver and apply it locally, ending the session on every
    /// peer by receipt.
    pub fn end_match(&mut self, primary_won: bool) -> Result<(), SendError> {
        if self.machine.state() != SessionState::Active {
            return Err(SendError::NoActiveSession);
        }
        let bytes = encode(&Message::GameOver { primary_won });
        self.broadcast_bytes(&bytes)?;
        let local = self.local_peer().clone();
        self.on_data_received(&local, &bytes);
        Ok(())
    }

    /// Dispatch one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data { from, bytes } => self.on_data_received(&from, &bytes),
            TransportEvent::PeerConnection { peer, state } => {
                self.on_peer_connection_changed(&peer, state)
            }
        }
    }

    /// Process one inbound payload.
    pub fn on_data_received(&mut self, from: &PeerId, bytes: &[u8]) {
        if self.machine.state().is_terminal() {
            debug!("Dropping {} byte frame from {} after session ended", bytes.len(), from);
            return;
        }

        let message = match decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", from, e);
                return;
            }
        };
        debug!("Received {} from {}", message.kind(), from);

        match message {
            Message::RandomNumber(nonce) => self.handle_nonce(from, nonce),
            Message::GameBegin => self.handle_game_begin(),
            Message::Move(text) => self.handle_move(from, text),
            Message::GameOver { primary_won } => self.handle_game_over(primary_won),
        }
    }

    /// Process a connectivity change.
    pub fn on_peer_connection_changed(&mut self, peer: &PeerId, state: PeerConnection) {
        if peer == self.transport.local_peer() {
            return;
        }

        match state {
            PeerConnection::Connected => {
                self.connected.insert(peer.clone());
                info!(
                    "Peer {} connected ({}/{})",
                    peer,
                    self.connected.len(),
                    self.transport.expected_peer_count()
                );
                if self.config.auto_start
                    && self.machine.state() == SessionState::WaitingForMatch
                    && self.connected.len() >= self.transport.expected_peer_count()
                {
                    self.start();
                }
            }
            PeerConnection::Disconnected => {
                self.connected.remove(peer);
                if self.machine.state().is_terminal() {
                    return;
                }
                if let Err(e) = self.engine.peer_left(peer) {
                    warn!("{}", e);
                }
                warn!("Peer {} disconnected, quorum lost", peer);
                self.finish(
                    SessionInput::PeerDisconnected,
                    EndReason::PeerDisconnected(peer.clone()),
                );
            }
        }
    }

    /// End the session if the election has not settled. Returns true if it
    /// ended.
    pub fn election_timed_out(&mut self) -> bool {
        match self.machine.state() {
            SessionState::WaitingForMatch | SessionState::WaitingForNonce => {
                warn!("Election timed out with {:?}", self.engine.progress());
                self.finish(
                    SessionInput::ElectionFailed,
                    EndReason::ElectionFailed(ElectionError::TimedOut),
                )
            }
            _ => false,
        }
    }

    /// End the session unconditionally.
    pub fn shutdown(&mut self) {
        self.finish(SessionInput::Shutdown, EndReason::Shutdown);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Settled election, if any.
    pub fn election(&self) -> Option<&Election> {
        self.engine.result()
    }

    /// Turn index, fixed once `Active`.
    pub fn turn_index(&self) -> Option<usize> {
        self.machine.turn_index()
    }

    /// Current local nonce, if rolled.
    pub fn local_nonce(&self) -> Option<Nonce> {
        self.engine.local_nonce()
    }

    /// Local peer id.
    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer()
    }

    /// Why the session ended, once `Done`.
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn handle_nonce(&mut self, from: &PeerId, nonce: Nonce) {
        match self.engine.on_remote_nonce(from, nonce) {
            Ok(NonceOutcome::Pending) | Ok(NonceOutcome::Ignored) => {}
            Ok(NonceOutcome::Reroll(fresh)) => {
                let _ = self.broadcast_message(&Message::RandomNumber(fresh));
            }
            Ok(NonceOutcome::Complete(election)) => self.on_election_complete(election),
            Err(e) => {
                error!("Election failed: {}", e);
                self.finish(SessionInput::ElectionFailed, EndReason::ElectionFailed(e));
            }
        }
    }

    fn on_election_complete(&mut self, election: Election) {
        info!(
            "{} holds turn index {} of {} (roster {})",
            self.local_peer(),
            election.local_index,
            election.order.len(),
            short_hex(&election.fingerprint)
        );
        self.machine.apply(SessionInput::ElectionCompleted {
            turn_index: election.local_index,
        });

        if election.local_is_primary() {
            info!("{} is primary, broadcasting GameBegin", self.local_peer());
            let bytes = encode(&Message::GameBegin);
            if self.broadcast_bytes(&bytes).is_err() {
                return;
            }
            // The primary enters Active by receiving its own GameBegin.
            let local = self.local_peer().clone();
            self.on_data_received(&local, &bytes);
        } else if self.machine.take_deferred_begin() {
            self.handle_game_begin();
        }
    }

    fn handle_game_begin(&mut self) {
        let Some(transition) = self.machine.apply(SessionInput::GameBeginReceived) else {
            return;
        };
        if transition.to == SessionState::Active {
            if let Some(index) = self.machine.turn_index() {
                self.emit(SessionEvent::TurnIndexAssigned(index));
            }
            self.emit(SessionEvent::MatchStarted);
        }
    }

    fn handle_move(&mut self, from: &PeerId, text: String) {
        if self.config.strict_moves && self.machine.state() != SessionState::Active {
            warn!("Dropping move from {} received in {:?}", from, self.machine.state());
            return;
        }
        self.emit(SessionEvent::MoveReceived(text));
    }

    fn handle_game_over(&mut self, primary_won: bool) {
        if !self.finish(
            SessionInput::GameOverReceived,
            EndReason::GameOver { primary_won },
        ) {
            warn!("GameOver ignored in {:?}", self.machine.state());
        }
    }

    fn broadcast_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.broadcast_bytes(&encode(message))
    }

    fn broadcast_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self.transport.broadcast(bytes) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Broadcast from {} failed: {}", self.local_peer(), e);
                self.finish(SessionInput::SendFailed, EndReason::TransportFailure(e.clone()));
                Err(e)
            }
        }
    }

    /// Apply a terminal input; on entering `Done`, record the reason and
    /// emit `MatchEnded`. Returns true if the session just ended.
    fn finish(&mut self, input: SessionInput, reason: EndReason) -> bool {
        match self.machine.apply(input) {
            Some(t) if t.to == SessionState::Done => {
                info!("Session for {} ended: {:?}", self.local_peer(), reason);
                self.end_reason = Some(reason.clone());
                self.emit(SessionEvent::MatchEnded { reason });
                true
            }
            _ => false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        debug!("Event {:?}", event);
        // No subscribers is fine; events are advisory.
        let _ = self.event_tx.send(event);
    }
}
