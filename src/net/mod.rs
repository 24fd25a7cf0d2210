//! Readiness-based socket I/O: one multiplexer per direction plus the
//! connection-establishing façade.

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

mod read_mux;
mod service;
mod write_mux;

pub use read_mux::ReadMultiplexer;
pub use service::PeerService;
pub use write_mux::WriteMultiplexer;

use crate::message::PeerMessage;
use crate::peer::PeerAddr;

/// Small fixed error-code vocabulary attached to I/O failures. The
/// orchestrator separates peer-scoped codes (drop that peer) from
/// `Multiplexer` (the readiness facility itself failed, which is fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    /// Dialing or handshaking the peer failed.
    ConnectFailed,
    /// The read side of an established connection failed.
    Read,
    /// The write side of an established connection failed.
    Write,
    /// A multiplexer itself is broken.
    Multiplexer,
}

impl IoErrorKind {
    pub fn is_peer_scoped(self) -> bool {
        !matches!(self, IoErrorKind::Multiplexer)
    }
}

/// Everything the I/O layer reports back to the orchestrator, in the order
/// it was observed per peer.
#[derive(Debug)]
pub enum PeerEvent {
    /// TCP established and our handshake sent; the peer's own handshake
    /// arrives as a regular `Message`.
    Connected(PeerAddr),
    Message(PeerAddr, PeerMessage),
    /// The peer closed the connection in an orderly way.
    Disconnected(PeerAddr),
    IoError(PeerAddr, IoErrorKind),
}

/// Control vocabulary of the read-side multiplexer.
#[derive(Debug)]
pub enum ReadCommand {
    Subscribe(PeerAddr, OwnedReadHalf),
    Unsubscribe(PeerAddr),
    Deactivate,
}

/// Control vocabulary of the write-side multiplexer.
#[derive(Debug)]
pub enum WriteCommand {
    Subscribe(PeerAddr, OwnedWriteHalf),
    Unsubscribe(PeerAddr),
    Send(PeerAddr, PeerMessage),
    Deactivate,
}

/// Multiplexer lifecycle. Deactivating stops accepting subscriptions and
/// drains in-flight work; Inactive means `run()` has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    Deactivating,
    Inactive,
}
