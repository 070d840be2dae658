//! Stream correlators for the halo realtime layer: the conversation-keyed
//! router and the panel-keyed router for concurrent multi-surface UIs,
//! plus the outbound seam they share with the transport.

pub mod conversation;
pub mod panel;
pub mod sink;

pub use conversation::{ConversationRouter, ConversationSnapshot, RouterConfig};
pub use panel::{PanelRouter, PanelSnapshot};
pub use sink::{FrameSink, RecordingSink};
