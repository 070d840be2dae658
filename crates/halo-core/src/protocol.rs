use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CharacterId, ConversationId, MessageId, PanelId, TrackingId};

/// Frames this layer emits on the transport.
///
/// Closed vocabulary: the server silently drops anything else, so new
/// operations must be added here rather than sent as ad-hoc payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    StartConversation {
        character_id: CharacterId,
        feature: String,
        metadata: Value,
    },
    SendMessage {
        conversation_id: ConversationId,
        character_id: CharacterId,
        tracking_id: TrackingId,
        text: String,
    },
    InvokeTool {
        conversation_id: ConversationId,
        character_id: CharacterId,
        tracking_id: TrackingId,
        tool_name: String,
        args: Value,
    },
    CancelResponse {
        tracking_id: TrackingId,
    },
    JoinPanel {
        panel_id: PanelId,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    LeavePanel {
        panel_id: PanelId,
    },
    LivenessProbe {
        /// Sender-local epoch millis; echoed back verbatim for RTT math.
        timestamp: i64,
        tracking_id: TrackingId,
    },
}

impl ClientFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::StartConversation { .. } => "start_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::InvokeTool { .. } => "invoke_tool",
            Self::CancelResponse { .. } => "cancel_response",
            Self::JoinPanel { .. } => "join_panel",
            Self::LeavePanel { .. } => "leave_panel",
            Self::LivenessProbe { .. } => "liveness_probe",
        }
    }
}

/// Frames the server pushes down the transport.
///
/// Response-streaming frames carry an optional `tracking_id` echo of the
/// client token that started the request. The panel-keyed correlator routes
/// on it; the conversation-keyed one ignores it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConversationCreated {
        conversation_id: ConversationId,
    },
    ProcessingStarted {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<TrackingId>,
    },
    StreamingStarted {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<TrackingId>,
    },
    ResponseChunk {
        conversation_id: ConversationId,
        message_id: MessageId,
        chunk: String,
        chunk_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<TrackingId>,
    },
    StreamingComplete {
        conversation_id: ConversationId,
        message_id: MessageId,
        full_response: String,
        tokens: u32,
        cost_cents: f64,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured_analysis: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<TrackingId>,
    },
    ToolError {
        conversation_id: ConversationId,
        tool_name: String,
        message: String,
        #[serde(default)]
        validation_errors: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracking_id: Option<TrackingId>,
    },
    AiError {
        conversation_id: ConversationId,
        message: String,
    },
    /// Multi-turn character-session orchestration broadcast. Never carries
    /// a tracking echo; routed by conversation only.
    SessionEvent {
        conversation_id: ConversationId,
        name: String,
        payload: Value,
    },
    LivenessResponse {
        timestamp: i64,
    },
    PanelJoined {
        panel_id: PanelId,
    },
    AuthRejected,
}

impl ServerFrame {
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversation_created",
            Self::ProcessingStarted { .. } => "processing_started",
            Self::StreamingStarted { .. } => "streaming_started",
            Self::ResponseChunk { .. } => "response_chunk",
            Self::StreamingComplete { .. } => "streaming_complete",
            Self::ToolError { .. } => "tool_error",
            Self::AiError { .. } => "ai_error",
            Self::SessionEvent { .. } => "session_event",
            Self::LivenessResponse { .. } => "liveness_response",
            Self::PanelJoined { .. } => "panel_joined",
            Self::AuthRejected => "auth_rejected",
        }
    }

    /// Conversation the frame belongs to, when it carries one.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::ConversationCreated { conversation_id }
            | Self::ProcessingStarted { conversation_id, .. }
            | Self::StreamingStarted { conversation_id, .. }
            | Self::ResponseChunk { conversation_id, .. }
            | Self::StreamingComplete { conversation_id, .. }
            | Self::ToolError { conversation_id, .. }
            | Self::AiError { conversation_id, .. }
            | Self::SessionEvent { conversation_id, .. } => Some(conversation_id),
            Self::LivenessResponse { .. } | Self::PanelJoined { .. } | Self::AuthRejected => None,
        }
    }

    /// Tracking echo, when the server included one.
    pub fn tracking_id(&self) -> Option<&TrackingId> {
        match self {
            Self::ProcessingStarted { tracking_id, .. }
            | Self::StreamingStarted { tracking_id, .. }
            | Self::ResponseChunk { tracking_id, .. }
            | Self::StreamingComplete { tracking_id, .. }
            | Self::ToolError { tracking_id, .. } => tracking_id.as_ref(),
            _ => None,
        }
    }
}
