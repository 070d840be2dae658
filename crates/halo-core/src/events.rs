use serde_json::Value;

use crate::ids::MessageId;

/// Generation cost metrics delivered with a completed response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Usage {
    pub tokens: u32,
    pub cost_cents: f64,
    pub duration_ms: u64,
}

/// Lifecycle events fanned out to conversation subscribers.
///
/// `Chunk.text` is the full accumulated response so far, not the delta —
/// subscribers can render it directly without keeping their own buffer.
#[derive(Clone, Debug)]
pub enum ConversationEvent {
    ProcessingStarted {
        message_id: MessageId,
    },
    StreamingStarted {
        message_id: MessageId,
    },
    Chunk {
        text: String,
        chunk_index: u32,
        tool_name: Option<String>,
    },
    Completed {
        text: String,
        usage: Usage,
        analysis: Option<Value>,
    },
    ToolFailed {
        tool_name: String,
        message: String,
        validation_errors: Vec<String>,
    },
    Failed {
        message: String,
    },
}

impl ConversationEvent {
    /// Terminal events end the in-flight generation and clear busy flags.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::ToolFailed { .. } | Self::Failed { .. }
        )
    }
}

/// Events fanned out to panel subscribers: the same streaming lifecycle,
/// plus pass-through session orchestration notifications.
#[derive(Clone, Debug)]
pub enum PanelEvent {
    Stream(ConversationEvent),
    Session { name: String, payload: Value },
}

impl PanelEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Stream(ev) => ev.is_terminal(),
            Self::Session { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = ConversationEvent::Completed {
            text: "hi".into(),
            usage: Usage::default(),
            analysis: None,
        };
        assert!(done.is_terminal());

        let chunk = ConversationEvent::Chunk {
            text: "h".into(),
            chunk_index: 0,
            tool_name: None,
        };
        assert!(!chunk.is_terminal());

        let failed = ConversationEvent::Failed {
            message: "overloaded".into(),
        };
        assert!(failed.is_terminal());
    }

    #[test]
    fn session_events_never_terminate_a_stream() {
        let ev = PanelEvent::Session {
            name: "turn_handoff".into(),
            payload: serde_json::json!({"next": "char_2"}),
        };
        assert!(!ev.is_terminal());

        let wrapped = PanelEvent::Stream(ConversationEvent::Failed {
            message: "boom".into(),
        });
        assert!(wrapped.is_terminal());
    }
}
