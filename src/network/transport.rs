//! Transport Boundary
//!
//! The session core sits on top of an already-reliable, ordered channel
//! supplied by the host platform. [`Transport`] is the send side of that
//! channel; [`TransportEvent`] is what the host feeds back in.
//!
//! [`LoopbackNetwork`] is an in-process implementation over tokio channels,
//! used by the demo binary and the tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::election::roster::PeerId;

/// Transport send failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    /// The local endpoint is gone.
    #[error("Transport closed")]
    Closed,

    /// The transport refused the send.
    #[error("Send rejected: {0}")]
    Rejected(String),
}

/// Peer connectivity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnection {
    /// Peer joined.
    Connected,
    /// Peer left.
    Disconnected,
}

/// Inbound events delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One opaque payload from a peer.
    Data {
        /// Sender.
        from: PeerId,
        /// Payload.
        bytes: Vec<u8>,
    },
    /// A peer connected or disconnected.
    PeerConnection {
        /// Affected peer.
        peer: PeerId,
        /// New state.
        state: PeerConnection,
    },
}

/// Reliable broadcast to every connected peer.
pub trait Transport: Send {
    /// Identifier of the local peer.
    fn local_peer(&self) -> &PeerId;

    /// Remote peers required for quorum (1 for a two-party session).
    fn expected_peer_count(&self) -> usize;

    /// Send `bytes` to every connected peer. Failures are reported
    /// synchronously.
    fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError>;
}

// =============================================================================
// LOOPBACK
// =============================================================================

struct Endpoint {
    tx: mpsc::UnboundedSender<TransportEvent>,
    fail_sends: bool,
    sent: usize,
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<BTreeMap<PeerId, Endpoint>>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer. Everyone already attached sees it connect, and it sees
    /// them.
    pub fn join(
        &self,
        peer: PeerId,
        expected_peer_count: usize,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut endpoints = self.endpoints();
        for (existing, endpoint) in endpoints.iter() {
            let _ = endpoint.tx.send(TransportEvent::PeerConnection {
                peer: peer.clone(),
                state: PeerConnection::Connected,
            });
            let _ = tx.send(TransportEvent::PeerConnection {
                peer: existing.clone(),
                state: PeerConnection::Connected,
            });
        }
        endpoints.insert(
            peer.clone(),
            Endpoint {
                tx,
                fail_sends: false,
                sent: 0,
            },
        );

        let transport = LoopbackTransport {
            local: peer,
            expected_peer_count,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Detach a peer; the rest see it disconnect.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut endpoints = self.endpoints();
        if endpoints.remove(peer).is_none() {
            return;
        }
        for endpoint in endpoints.values() {
            let _ = endpoint.tx.send(TransportEvent::PeerConnection {
                peer: peer.clone(),
                state: PeerConnection::Disconnected,
            });
        }
        debug!("Loopback peer {} disconnected", peer);
    }

    /// Make every later broadcast from `peer` fail (or succeed again).
    pub fn set_fail_sends(&self, peer: &PeerId, fail: bool) {
        if let Some(endpoint) = self.endpoints().get_mut(peer) {
            endpoint.fail_sends = fail;
        }
    }

    /// Deliver a raw event to `peer`, bypassing broadcast.
    pub fn inject(&self, peer: &PeerId, event: TransportEvent) -> bool {
        self.endpoints()
            .get(peer)
            .map(|e| e.tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Successful broadcasts made by `peer`.
    pub fn sent_count(&self, peer: &PeerId) -> usize {
        self.endpoints().get(peer).map(|e| e.sent).unwrap_or(0)
    }

    /// Every mutation is a single insert, remove or field store, so a
    /// poisoned map is still consistent.
    fn endpoints(&self) -> MutexGuard<'_, BTreeMap<PeerId, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast_from(&self, from: &PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        let mut endpoints = self.endpoints();

        match endpoints.get(from) {
            None => return Err(TransportError::Closed),
            Some(endpoint) if endpoint.fail_sends => {
                return Err(TransportError::Rejected("send failure injected".to_string()));
            }
            Some(_) => {}
        }

        for (peer, endpoint) in endpoints.iter() {
            if peer == from {
                continue;
            }
            let event = TransportEvent::Data {
                from: from.clone(),
                bytes: bytes.to_vec(),
            };
            if endpoint.tx.send(event).is_err() {
                debug!("Loopback peer {} no longer receiving", peer);
            }
        }

        if let Some(endpoint) = endpoints.get_mut(from) {
            endpoint.sent += 1;
        }
        Ok(())
    }
}

/// One peer's handle on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    local: PeerId,
    expected_peer_count: usize,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    /// Network this endpoint belongs to.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

impl Transport for LoopbackTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn expected_peer_count(&self) -> usize {
        self.expected_peer_count
    }

    fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.network.broadcast_from(&self.local, bytes)
    }
}
