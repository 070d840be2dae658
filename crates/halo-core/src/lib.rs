//! Shared types for the halo realtime layer: branded ids, the transport
//! wire vocabulary, subscriber-facing events, the failure taxonomy, and
//! connection-health primitives.

pub mod errors;
pub mod events;
pub mod health;
pub mod ids;
pub mod protocol;

pub use errors::{ErrorCategory, RealtimeError};
pub use events::{ConversationEvent, PanelEvent, Usage};
pub use health::{ConnectionHealth, LatencyWindow, QualityClass};
pub use ids::{
    CharacterId, ConversationId, MessageId, PanelId, QueuedMessageId, TrackingId,
};
pub use protocol::{ClientFrame, ServerFrame};
