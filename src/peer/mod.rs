//! Per-peer protocol state and the admission controller.

use std::net::SocketAddrV4;

mod admission;
mod session;

pub use admission::{AdmissionCommand, ConnectionStatus, PeerTracker};
pub use session::{PeerSession, SessionOutput, SessionStatus};

/// Remote peer endpoint. `SocketAddrV4` is ordered and hashable, so it
/// doubles as the peer's identity in every map and set.
pub type PeerAddr = SocketAddrV4;
