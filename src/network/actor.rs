//! Session Actor
//!
//! Runs a [`SessionCoordinator`] on its own task so inbound transport
//! events and application calls never touch it concurrently. The
//! application talks to it through a cloneable [`SessionHandle`].

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::election::roster::PeerId;
use crate::network::coordinator::{EndReason, SendError, SessionCoordinator, SessionEvent};
use crate::network::session::SessionState;
use crate::network::transport::{Transport, TransportEvent};

/// Requests from a handle to the actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin the election.
    Start,
    /// Broadcast a move.
    SendMove {
        /// Move text.
        text: String,
        /// Send result.
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    /// Broadcast GameOver.
    EndMatch {
        /// True if the primary won.
        primary_won: bool,
        /// Send result.
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    /// Query the current state.
    State {
        /// Current state.
        reply: oneshot::Sender<SessionState>,
    },
    /// Tear the session down.
    Shutdown,
}

/// Application-side handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    local_peer: PeerId,
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Local peer id.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Begin the election (only needed with `auto_start` off).
    pub async fn start(&self) {
        self.command(SessionCommand::Start).await;
    }

    /// Broadcast a move. Fails with `NoActiveSession` once the actor has
    /// exited.
    pub async fn send_move(&self, text: impl Into<String>) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::SendMove {
            text: text.into(),
            reply,
        })
        .await;
        rx.await.unwrap_or(Err(SendError::NoActiveSession))
    }

    /// Broadcast GameOver and end the local session.
    pub async fn end_match(&self, primary_won: bool) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::EndMatch { primary_won, reply }).await;
        rx.await.unwrap_or(Err(SendError::NoActiveSession))
    }

    /// Current state. `Done` once the actor has exited.
    pub async fn state(&self) -> SessionState {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::State { reply }).await;
        rx.await.unwrap_or(SessionState::Done)
    }

    /// End the session.
    pub async fn shutdown(&self) {
        self.command(SessionCommand::Shutdown).await;
    }

    async fn command(&self, command: SessionCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("Session for {} already finished", self.local_peer);
        }
    }
}

/// Drives one coordinator until it reaches `Done`.
pub struct SessionActor<T: Transport> {
    coordinator: SessionCoordinator<T>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<SessionCommand>,
}

impl<T: Transport + 'static> SessionActor<T> {
    /// Spawn the actor. The join handle resolves to why the session ended.
    pub fn spawn(
        coordinator: SessionCoordinator<T>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (SessionHandle, JoinHandle<Option<EndReason>>) {
        let (command_tx, command_rx) = mpsc::channel(coordinator.config().command_capacity.max(1));
        let handle = SessionHandle {
            local_peer: coordinator.local_peer().clone(),
            commands: command_tx,
            events: coordinator.event_sender(),
        };

        let actor = Self {
            coordinator,
            inbound,
            commands: command_rx,
        };
        let task = tokio::spawn(actor.run());

        (handle, task)
    }

    #[instrument(skip(self), fields(peer = %self.coordinator.local_peer()))]
    async fn run(mut self) -> Option<EndReason> {
        let timeout = self.coordinator.config().election_timeout;
        let election_timer = tokio::time::sleep(timeout.unwrap_or_default());
        tokio::pin!(election_timer);
        let mut timer_armed = timeout.is_some();

        info!("Session actor started");

        while !self.coordinator.state().is_terminal() {
            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(event) => self.coordinator.handle_event(event),
                    None => {
                        warn!("Transport closed");
                        self.coordinator.shutdown();
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.coordinator.shutdown();
                    }
                },
                _ = &mut election_timer, if timer_armed => {
                    timer_armed = false;
                    self.coordinator.election_timed_out();
                }
            }
        }

        info!("Session actor finished");
        self.coordinator.end_reason().cloned()
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => self.coordinator.start(),
            SessionCommand::SendMove { text, reply } => {
                let _ = reply.send(self.coordinator.send_move(text));
            }
            SessionCommand::EndMatch { primary_won, reply } => {
                let _ = reply.send(self.coordinator.end_match(primary_won));
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.coordinator.state());
            }
            SessionCommand::Shutdown => self.coordinator.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::core::rng::ScriptedNonces;
    use crate::election::engine::ElectionError;
    use crate::network::transport::LoopbackNetwork;
    use std::time::Duration;

    fn spawn_peer(
        net: &LoopbackNetwork,
        id: &str,
        nonce: u32,
        config: SessionConfig,
    ) -> (SessionHandle, JoinHandle<Option<EndReason>>) {
        let (transport, inbound) = net.join(PeerId::from(id), 1);
        let coordinator = SessionCoordinator::with_nonce_source(
            transport,
            config,
            Box::new(ScriptedNonces::new([nonce], 0)),
        );
        SessionActor::spawn(coordinator, inbound)
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<SessionEvent>,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_actor_pair_plays_and_ends() {
        let net = LoopbackNetwork::new();
        let config = SessionConfig {
            auto_start: false,
            ..Default::default()
        };
        let (a, a_task) = spawn_peer(&net, "a", 50, config.clone());
        let (b, b_task) = spawn_peer(&net, "b", 80, config);
        let mut a_events = a.subscribe_events();
        let mut b_events = b.subscribe_events();

        a.start().await;
        b.start().await;

        wait_for(&mut a_events, |e| *e == SessionEvent::MatchStarted).await;
        wait_for(&mut b_events, |e| *e == SessionEvent::MatchStarted).await;
        assert_eq!(a.state().await, SessionState::Active);

        b.send_move("e4").await.unwrap();
        let event = wait_for(&mut a_events, |e| matches!(e, SessionEvent::MoveReceived(_))).await;
        assert_eq!(event, SessionEvent::MoveReceived("e4".to_string()));

        a.end_match(false).await.unwrap();
        assert_eq!(
            a_task.await.unwrap(),
            Some(EndReason::GameOver { primary_won: false })
        );
        assert_eq!(
            b_task.await.unwrap(),
            Some(EndReason::GameOver { primary_won: false })
        );

        assert_eq!(a.state().await, SessionState::Done);
        assert_eq!(a.send_move("late").await, Err(SendError::NoActiveSession));
    }

    #[tokio::test]
    async fn test_election_timeout_ends_session() {
        let net = LoopbackNetwork::new();
        let config = SessionConfig {
            election_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        // Alone on the network: no nonce ever arrives.
        let (a, task) = spawn_peer(&net, "a", 50, config);
        a.start().await;

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some(EndReason::ElectionFailed(ElectionError::TimedOut)));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let net = LoopbackNetwork::new();
        let (a, task) = spawn_peer(&net, "a", 50, SessionConfig::default());
        a.shutdown().await;
        assert_eq!(task.await.unwrap(), Some(EndReason::Shutdown));
        assert_eq!(a.state().await, SessionState::Done);
    }

    #[tokio::test]
    async fn test_dropping_handles_shuts_down() {
        let net = LoopbackNetwork::new();
        let (a, task) = spawn_peer(&net, "a", 50, SessionConfig::default());
        drop(a);
        assert_eq!(task.await.unwrap(), Some(EndReason::Shutdown));
    }
}
