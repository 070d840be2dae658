//! Outbound queue manager for the halo realtime layer: buffers messages
//! that could not be confirmed sent, persists them across reloads, and
//! retries with bounded attempts.

pub mod queue;
pub mod store;

pub use queue::{OutboundQueue, QueueConfig, QueueSender};
pub use store::{QueueStore, QueuedMessage};
