//! Session Layer
//!
//! Wire codec, session state machine and the coordinator that ties them to
//! the election. The transport itself belongs to the host; this layer only
//! sees opaque payloads and connectivity changes.

pub mod actor;
pub mod coordinator;
pub mod protocol;
pub mod session;
pub mod transport;

pub use actor::{SessionActor, SessionCommand, SessionHandle};
pub use coordinator::{EndReason, SendError, SessionCoordinator, SessionEvent};
pub use protocol::{decode, encode, DecodeError, Message, MessageKind};
pub use session::{SessionInput, SessionState, SessionStateMachine, Transition};
pub use transport::{
    LoopbackNetwork, LoopbackTransport, PeerConnection, Transport, TransportError, TransportEvent,
};
