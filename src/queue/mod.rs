//! Bounded, typed event queues used for all cross-task communication.

mod bounded;
mod duplex;

pub use bounded::{BoundedQueue, PushPolicy};
pub use duplex::{DuplexChannel, LeftEndpoint, RightEndpoint};
