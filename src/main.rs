//! Duet Session Demo
//!
//! Runs two peers over the in-process loopback network: they elect a turn
//! order, trade a few moves in turn and end the match.

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use duet::{
    LoopbackNetwork, PeerId, SessionActor, SessionConfig, SessionCoordinator, SessionEvent,
    SessionHandle, TWO_PARTY_PEERS, VERSION,
};

const MOVES_PER_PEER: usize = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Duet Session v{}", VERSION);

    let config = SessionConfig::from_env().context("Invalid DUET_* configuration")?;
    info!("Config: {}", config.to_json()?);

    demo_match(config).await
}

/// Demo: elect, play, finish.
async fn demo_match(config: SessionConfig) -> Result<()> {
    info!("=== Starting Demo Match ===");

    let net = LoopbackNetwork::new();
    let mut peers = Vec::new();
    let mut tasks = Vec::new();
    let mut coordinators = Vec::new();

    for _ in 0..=TWO_PARTY_PEERS {
        let id = PeerId::random();
        let (transport, inbound) = net.join(id.clone(), TWO_PARTY_PEERS);
        coordinators.push((SessionCoordinator::new(transport, config.clone()), inbound));
    }

    // Spawn only after both have joined so neither misses a connect event.
    for (coordinator, inbound) in coordinators {
        let events = coordinator.subscribe_events();
        let (handle, task) = SessionActor::spawn(coordinator, inbound);
        if !config.auto_start {
            handle.start().await;
        }
        info!("Spawned peer {}", handle.local_peer());
        peers.push((handle, events));
        tasks.push(task);
    }

    // Wait for both to go Active, collecting turn indices.
    let mut order: Vec<Option<SessionHandle>> = vec![None; peers.len()];
    for (handle, events) in peers.iter_mut() {
        let index = wait_for_start(events).await?;
        info!("{} plays at turn index {}", handle.local_peer(), index);
        match order.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(handle.clone()),
            _ => bail!("Turn index {} assigned twice", index),
        }
    }
    let order: Vec<SessionHandle> = order.into_iter().flatten().collect();

    // Take turns in elected order.
    for round in 0..MOVES_PER_PEER {
        for (turn, handle) in order.iter().enumerate() {
            let text = format!("round {} move by turn {}", round, turn);
            handle.send_move(text).await?;
        }
    }

    // Moves are already queued ahead of GameOver on the ordered channel.
    order[0].end_match(true).await?;

    for ((handle, mut events), task) in peers.into_iter().zip(tasks) {
        let reason = task.await.context("Session task panicked")?;
        while let Ok(event) = events.try_recv() {
            info!("{} event {}", handle.local_peer(), serde_json::to_string(&event)?);
        }
        info!("{} finished: {:?}", handle.local_peer(), reason);
    }

    info!("=== Demo Complete ===");
    Ok(())
}

async fn wait_for_start(events: &mut broadcast::Receiver<SessionEvent>) -> Result<usize> {
    let mut index = None;
    loop {
        match events.recv().await? {
            SessionEvent::TurnIndexAssigned(i) => index = Some(i),
            SessionEvent::MatchStarted => {
                return index.context("MatchStarted without a turn index");
            }
            SessionEvent::MatchEnded { reason } => bail!("Match ended early: {:?}", reason),
            SessionEvent::MoveReceived(text) => info!("Early move: {}", text),
        }
    }
}
