//! A single-torrent BitTorrent download client built around a
//! message-passing core: bounded queues connect a readiness-driven I/O
//! layer, a tracker worker and a disk worker to one orchestrator task that
//! owns all protocol state.

pub mod client;
pub mod file;
pub mod message;
pub mod net;
pub mod peer;
pub mod persist;
pub mod piece;
pub mod queue;
pub mod torrent;
pub mod tracker;
