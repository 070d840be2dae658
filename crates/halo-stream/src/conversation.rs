use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use halo_core::{
    CharacterId, ClientFrame, ConversationEvent, ConversationId, RealtimeError, ServerFrame,
    TrackingId, Usage,
};

use crate::sink::FrameSink;

/// Handshake and fan-out tuning shared by both correlators.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// How long a create/join handshake may wait for its acknowledgment.
    pub handshake_timeout: Duration,
    /// Capacity of each per-entity event channel.
    pub event_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 64,
        }
    }
}

/// Read-only copy of one conversation's correlation state.
#[derive(Clone, Debug, Default)]
pub struct ConversationSnapshot {
    pub character_id: Option<CharacterId>,
    pub is_processing: bool,
    pub is_streaming: bool,
    pub stream_content: String,
    pub last_chunk_index: Option<u32>,
    pub current_tool: Option<String>,
    pub last_error: Option<String>,
}

struct ConversationState {
    character_id: Option<CharacterId>,
    is_processing: bool,
    is_streaming: bool,
    stream_content: String,
    last_chunk_index: Option<u32>,
    current_tool: Option<String>,
    last_error: Option<String>,
    /// Most recently issued request token; the only one cancellation can
    /// target. A newer request silently supersedes it.
    active_tracking: Option<TrackingId>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationState {
    fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            character_id: None,
            is_processing: false,
            is_streaming: false,
            stream_content: String::new(),
            last_chunk_index: None,
            current_tool: None,
            last_error: None,
            active_tracking: None,
            events,
        }
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

type PendingCreate = oneshot::Sender<Result<ConversationId, RealtimeError>>;

/// Conversation-keyed stream correlator: maps inbound streaming frames to
/// the conversation that originated them, accumulates chunked content, and
/// fans typed lifecycle events out to subscribers.
///
/// Routing is strictly by the conversation id carried in the frame; the
/// tracking echo is ignored in this design, so concurrent requests against
/// one conversation are not distinguishable by the caller.
pub struct ConversationRouter {
    sink: Arc<dyn FrameSink>,
    config: RouterConfig,
    conversations: DashMap<ConversationId, ConversationState>,
    pending_create: Mutex<Option<PendingCreate>>,
    create_gate: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationRouter {
    pub fn new(sink: Arc<dyn FrameSink>, config: RouterConfig) -> Self {
        Self {
            sink,
            config,
            conversations: DashMap::new(),
            pending_create: Mutex::new(None),
            create_gate: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Start consuming the raw frame channel.
    pub fn start(self: Arc<Self>, mut frames: broadcast::Receiver<ServerFrame>) {
        let router = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => router.handle_frame(frame),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "conversation router lagged, dropped frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Ask the server to create a conversation and wait for the
    /// acknowledgment. One creation handshake runs at a time; concurrent
    /// callers queue on the gate.
    pub async fn create_conversation(
        &self,
        character_id: &CharacterId,
        feature: &str,
        metadata: Value,
    ) -> Result<ConversationId, RealtimeError> {
        let _gate = self.create_gate.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending_create.lock() = Some(tx);

        let frame = ClientFrame::StartConversation {
            character_id: character_id.clone(),
            feature: feature.to_string(),
            metadata,
        };
        if let Err(e) = self.sink.send(frame).await {
            self.pending_create.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(result)) => {
                let id = result?;
                self.conversations
                    .entry(id.clone())
                    .or_insert_with(|| ConversationState::new(self.config.event_buffer))
                    .character_id = Some(character_id.clone());
                debug!(conversation_id = %id, "conversation created");
                Ok(id)
            }
            Ok(Err(_)) => Err(RealtimeError::Timeout(self.config.handshake_timeout)),
            Err(_) => {
                self.pending_create.lock().take();
                warn!(feature, "conversation creation timed out");
                Err(RealtimeError::Timeout(self.config.handshake_timeout))
            }
        }
    }

    /// Send a chat message. The returned tracking id becomes the
    /// conversation's cancellation target.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        character_id: &CharacterId,
        text: &str,
    ) -> Result<TrackingId, RealtimeError> {
        let tracking_id = self.register_request(conversation_id, character_id)?;
        let frame = ClientFrame::SendMessage {
            conversation_id: conversation_id.clone(),
            character_id: character_id.clone(),
            tracking_id: tracking_id.clone(),
            text: text.to_string(),
        };
        self.sink.send(frame).await?;
        trace!(conversation_id = %conversation_id, tracking_id = %tracking_id, "message sent");
        Ok(tracking_id)
    }

    /// Invoke a server-side tool inside the conversation.
    pub async fn invoke_tool(
        &self,
        conversation_id: &ConversationId,
        character_id: &CharacterId,
        tool_name: &str,
        args: Value,
    ) -> Result<TrackingId, RealtimeError> {
        let tracking_id = self.register_request(conversation_id, character_id)?;
        let frame = ClientFrame::InvokeTool {
            conversation_id: conversation_id.clone(),
            character_id: character_id.clone(),
            tracking_id: tracking_id.clone(),
            tool_name: tool_name.to_string(),
            args,
        };
        self.sink.send(frame).await?;
        trace!(conversation_id = %conversation_id, tool_name, "tool invoked");
        Ok(tracking_id)
    }

    /// Cancel the in-flight generation, if any. A no-op without an active
    /// tracking id: nothing is emitted on the transport.
    pub async fn cancel_request(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<(), RealtimeError> {
        let target = self
            .conversations
            .get(conversation_id)
            .and_then(|state| state.active_tracking.clone());
        let Some(tracking_id) = target else {
            warn!(conversation_id = %conversation_id, "no active generation to cancel");
            return Ok(());
        };
        self.sink
            .send(ClientFrame::CancelResponse {
                tracking_id: tracking_id.clone(),
            })
            .await?;
        debug!(conversation_id = %conversation_id, tracking_id = %tracking_id, "cancellation sent");
        Ok(())
    }

    /// Subscribe to a conversation's lifecycle events. State is created
    /// lazily so a UI component may subscribe before creation is
    /// acknowledged. Dropping the receiver unsubscribes.
    pub fn subscribe(
        &self,
        conversation_id: &ConversationId,
    ) -> broadcast::Receiver<ConversationEvent> {
        self.conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationState::new(self.config.event_buffer))
            .events
            .subscribe()
    }

    /// Stream-combinator adapter over [`ConversationRouter::subscribe`].
    pub fn event_stream(
        &self,
        conversation_id: &ConversationId,
    ) -> BroadcastStream<ConversationEvent> {
        BroadcastStream::new(self.subscribe(conversation_id))
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> Option<ConversationSnapshot> {
        self.conversations.get(conversation_id).map(|state| {
            ConversationSnapshot {
                character_id: state.character_id.clone(),
                is_processing: state.is_processing,
                is_streaming: state.is_streaming,
                stream_content: state.stream_content.clone(),
                last_chunk_index: state.last_chunk_index,
                current_tool: state.current_tool.clone(),
                last_error: state.last_error.clone(),
            }
        })
    }

    /// Explicit teardown. Conversations are never collected implicitly.
    pub fn clear_conversation(&self, conversation_id: &ConversationId) {
        self.conversations.remove(conversation_id);
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    fn register_request(
        &self,
        conversation_id: &ConversationId,
        character_id: &CharacterId,
    ) -> Result<TrackingId, RealtimeError> {
        if !self.sink.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let tracking_id = TrackingId::new();
        let mut state = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationState::new(self.config.event_buffer));
        state.character_id = Some(character_id.clone());
        state.active_tracking = Some(tracking_id.clone());
        Ok(tracking_id)
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::ConversationCreated { conversation_id } => {
                self.conversations
                    .entry(conversation_id.clone())
                    .or_insert_with(|| ConversationState::new(self.config.event_buffer));
                if let Some(pending) = self.pending_create.lock().take() {
                    let _ = pending.send(Ok(conversation_id));
                }
            }
            ServerFrame::ProcessingStarted {
                conversation_id,
                message_id,
                ..
            } => {
                let Some(mut state) = self.conversations.get_mut(&conversation_id) else {
                    trace!(conversation_id = %conversation_id, "frame for unknown conversation dropped");
                    return;
                };
                state.is_processing = true;
                state.emit(ConversationEvent::ProcessingStarted { message_id });
            }
            ServerFrame::StreamingStarted {
                conversation_id,
                message_id,
                ..
            } => {
                let Some(mut state) = self.conversations.get_mut(&conversation_id) else {
                    trace!(conversation_id = %conversation_id, "frame for unknown conversation dropped");
                    return;
                };
                state.is_streaming = true;
                state.stream_content.clear();
                state.last_chunk_index = None;
                state.emit(ConversationEvent::StreamingStarted { message_id });
            }
            ServerFrame::ResponseChunk {
                conversation_id,
                chunk,
                chunk_index,
                tool_name,
                ..
            } => {
                let Some(mut state) = self.conversations.get_mut(&conversation_id) else {
                    trace!(conversation_id = %conversation_id, "chunk for unknown conversation dropped");
                    return;
                };
                // Append in arrival order; the index is recorded but never
                // used to re-sequence.
                state.stream_content.push_str(&chunk);
                state.last_chunk_index = Some(chunk_index);
                if tool_name.is_some() {
                    state.current_tool = tool_name.clone();
                }
                let event = ConversationEvent::Chunk {
                    text: state.stream_content.clone(),
                    chunk_index,
                    tool_name,
                };
                state.emit(event);
            }
            ServerFrame::StreamingComplete {
                conversation_id,
                full_response,
                tokens,
                cost_cents,
                duration_ms,
                structured_analysis,
                ..
            } => {
                let Some(mut state) = self.conversations.get_mut(&conversation_id) else {
                    trace!(conversation_id = %conversation_id, "completion for unknown conversation dropped");
                    return;
                };
                state.is_processing = false;
                state.is_streaming = false;
                state.stream_content.clear();
                state.current_tool = None;
                state.active_tracking = None;
                state.emit(ConversationEvent::Completed {
                    text: full_response,
                    usage: Usage {
                        tokens,
                        cost_cents,
                        duration_ms,
                    },
                    analysis: structured_analysis,
                });
            }
            ServerFrame::ToolError {
                conversation_id,
                tool_name,
                message,
                validation_errors,
                ..
            } => {
                let Some(mut state) = self.conversations.get_mut(&conversation_id) else {
                    trace!(conversation_id = %conversation_id, "tool error for unknown conversation dropped");
                    return;
                };
                state.is_processing = false;
                state.is_streaming = false;
                state.last_error = Some(message.clone());
                state.active_tracking = None;
                state.emit(ConversationEvent::ToolFailed {
                    tool_name,
                    message,
                    validation_errors,
                });
            }
            ServerFrame::AiError {
                conversation_id,
                message,
            } => {
                if let Some(mut state) = self.conversations.get_mut(&conversation_id) {
                    state.is_processing = false;
                    state.is_streaming = false;
                    state.last_error = Some(message.clone());
                    state.active_tracking = None;
                    state.emit(ConversationEvent::Failed { message });
                    return;
                }
                // An error for a conversation nobody knows while a creation
                // handshake is pending is the server rejecting the creation.
                if let Some(pending) = self.pending_create.lock().take() {
                    let _ = pending.send(Err(RealtimeError::Generation(message)));
                } else {
                    trace!(conversation_id = %conversation_id, "error for unknown conversation dropped");
                }
            }
            // Session broadcasts are a panel-keyed concern.
            ServerFrame::SessionEvent { .. }
            | ServerFrame::LivenessResponse { .. }
            | ServerFrame::PanelJoined { .. }
            | ServerFrame::AuthRejected => {}
        }
    }
}

impl Drop for ConversationRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use halo_core::MessageId;

    fn router_with_sink() -> (Arc<ConversationRouter>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::connected());
        let frame_sink: Arc<dyn FrameSink> = sink.clone();
        let router = Arc::new(ConversationRouter::new(frame_sink, RouterConfig::default()));
        (router, sink)
    }

    fn chunk(conv: &str, idx: u32, text: &str) -> ServerFrame {
        ServerFrame::ResponseChunk {
            conversation_id: ConversationId::from_raw(conv),
            message_id: MessageId::from_raw("msg_1"),
            chunk: text.to_string(),
            chunk_index: idx,
            tool_name: None,
            tracking_id: None,
        }
    }

    fn complete(conv: &str, full: &str) -> ServerFrame {
        ServerFrame::StreamingComplete {
            conversation_id: ConversationId::from_raw(conv),
            message_id: MessageId::from_raw("msg_1"),
            full_response: full.to_string(),
            tokens: 12,
            cost_cents: 0.4,
            duration_ms: 800,
            structured_analysis: None,
            tracking_id: None,
        }
    }

    #[tokio::test]
    async fn full_lifecycle_event_sequence() {
        let (router, _sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        let character = CharacterId::from_raw("char_tutor");
        let mut events = router.subscribe(&conv);

        let _t1 = router.send_message(&conv, &character, "hi").await.unwrap();

        router.handle_frame(ServerFrame::ProcessingStarted {
            conversation_id: conv.clone(),
            message_id: MessageId::from_raw("msg_1"),
            tracking_id: None,
        });
        router.handle_frame(ServerFrame::StreamingStarted {
            conversation_id: conv.clone(),
            message_id: MessageId::from_raw("msg_1"),
            tracking_id: None,
        });
        router.handle_frame(chunk("conv_1", 0, "A"));
        router.handle_frame(chunk("conv_1", 1, "B"));
        router.handle_frame(chunk("conv_1", 2, "C"));
        router.handle_frame(complete("conv_1", "ABC"));

        assert!(matches!(
            events.recv().await.unwrap(),
            ConversationEvent::ProcessingStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConversationEvent::StreamingStarted { .. }
        ));
        for expected in ["A", "AB", "ABC"] {
            match events.recv().await.unwrap() {
                ConversationEvent::Chunk { text, .. } => assert_eq!(text, expected),
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        match events.recv().await.unwrap() {
            ConversationEvent::Completed { text, usage, .. } => {
                assert_eq!(text, "ABC");
                assert_eq!(usage.tokens, 12);
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let snap = router.snapshot(&conv).unwrap();
        assert!(!snap.is_processing);
        assert!(!snap.is_streaming);
        assert!(snap.stream_content.is_empty());
    }

    #[tokio::test]
    async fn accumulator_resets_on_new_stream() {
        let (router, _sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        router.subscribe(&conv);

        router.handle_frame(ServerFrame::StreamingStarted {
            conversation_id: conv.clone(),
            message_id: MessageId::from_raw("msg_1"),
            tracking_id: None,
        });
        router.handle_frame(chunk("conv_1", 0, "old"));
        router.handle_frame(ServerFrame::StreamingStarted {
            conversation_id: conv.clone(),
            message_id: MessageId::from_raw("msg_2"),
            tracking_id: None,
        });

        assert_eq!(router.snapshot(&conv).unwrap().stream_content, "");
    }

    #[tokio::test]
    async fn cancel_without_active_request_is_a_noop() {
        let (router, sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        router.subscribe(&conv);

        router.cancel_request(&conv).await.unwrap();
        assert_eq!(sink.sent_count(), 0);
    }

    #[tokio::test]
    async fn cancel_targets_the_most_recent_request() {
        let (router, sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        let character = CharacterId::from_raw("char_tutor");

        let _t1 = router.send_message(&conv, &character, "one").await.unwrap();
        let t2 = router.send_message(&conv, &character, "two").await.unwrap();

        router.cancel_request(&conv).await.unwrap();

        let frames = sink.sent();
        match frames.last().unwrap() {
            ClientFrame::CancelResponse { tracking_id } => assert_eq!(tracking_id, &t2),
            other => panic!("expected cancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_clears_the_cancellation_target() {
        let (router, sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        let character = CharacterId::from_raw("char_tutor");

        router.send_message(&conv, &character, "hi").await.unwrap();
        router.handle_frame(complete("conv_1", "done"));

        let before = sink.sent_count();
        router.cancel_request(&conv).await.unwrap();
        assert_eq!(sink.sent_count(), before);
    }

    #[tokio::test]
    async fn send_requires_a_connection() {
        let (router, sink) = router_with_sink();
        sink.set_connected(false);
        let err = router
            .send_message(
                &ConversationId::from_raw("conv_1"),
                &CharacterId::from_raw("char_1"),
                "hi",
            )
            .await
            .err()
            .expect("expected error");
        assert!(matches!(err, RealtimeError::NotConnected));
    }

    #[tokio::test]
    async fn create_conversation_resolves_on_acknowledgment() {
        let (router, sink) = router_with_sink();
        let character = CharacterId::from_raw("char_tutor");

        let create = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .create_conversation(&character, "course_chat", serde_json::json!({}))
                    .await
            })
        };

        // wait for the start frame to appear, then acknowledge
        while sink.sent_count() == 0 {
            tokio::task::yield_now().await;
        }
        router.handle_frame(ServerFrame::ConversationCreated {
            conversation_id: ConversationId::from_raw("conv_77"),
        });

        let id = create.await.unwrap().unwrap();
        assert_eq!(id.as_str(), "conv_77");
        assert!(router.snapshot(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn create_conversation_times_out_without_acknowledgment() {
        let (router, _sink) = router_with_sink();
        let err = router
            .create_conversation(
                &CharacterId::from_raw("char_1"),
                "course_chat",
                serde_json::json!({}),
            )
            .await
            .err()
            .expect("expected timeout");
        assert!(matches!(err, RealtimeError::Timeout(_)));
    }

    #[tokio::test]
    async fn rejected_creation_surfaces_the_server_error() {
        let (router, sink) = router_with_sink();
        let character = CharacterId::from_raw("char_tutor");

        let create = {
            let router = Arc::clone(&router);
            tokio::spawn(async move {
                router
                    .create_conversation(&character, "course_chat", serde_json::json!({}))
                    .await
            })
        };

        while sink.sent_count() == 0 {
            tokio::task::yield_now().await;
        }
        router.handle_frame(ServerFrame::AiError {
            conversation_id: ConversationId::from_raw("conv_unknown"),
            message: "feature disabled".into(),
        });

        let err = create.await.unwrap().err().expect("expected rejection");
        assert!(matches!(err, RealtimeError::Generation(_)));
    }

    #[tokio::test]
    async fn errors_clear_flags_and_record_last_error() {
        let (router, _sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        let mut events = router.subscribe(&conv);

        router.handle_frame(ServerFrame::StreamingStarted {
            conversation_id: conv.clone(),
            message_id: MessageId::from_raw("msg_1"),
            tracking_id: None,
        });
        router.handle_frame(ServerFrame::ToolError {
            conversation_id: conv.clone(),
            tool_name: "quiz_grader".into(),
            message: "schema mismatch".into(),
            validation_errors: vec!["missing field".into()],
            tracking_id: None,
        });

        events.recv().await.unwrap(); // streaming started
        match events.recv().await.unwrap() {
            ConversationEvent::ToolFailed {
                tool_name, message, ..
            } => {
                assert_eq!(tool_name, "quiz_grader");
                assert_eq!(message, "schema mismatch");
            }
            other => panic!("expected tool failure, got {other:?}"),
        }

        let snap = router.snapshot(&conv).unwrap();
        assert!(!snap.is_streaming);
        assert_eq!(snap.last_error.as_deref(), Some("schema mismatch"));
    }

    #[tokio::test]
    async fn clear_conversation_drops_state() {
        let (router, _sink) = router_with_sink();
        let conv = ConversationId::from_raw("conv_1");
        router.subscribe(&conv);
        assert_eq!(router.conversation_count(), 1);

        router.clear_conversation(&conv);
        assert_eq!(router.conversation_count(), 0);
        assert!(router.snapshot(&conv).is_none());
    }

    #[tokio::test]
    async fn frames_route_through_the_raw_channel() {
        let (router, _sink) = router_with_sink();
        let (frames_tx, frames_rx) = broadcast::channel(16);
        Arc::clone(&router).start(frames_rx);

        let conv = ConversationId::from_raw("conv_1");
        let mut events = router.subscribe(&conv);

        frames_tx
            .send(ServerFrame::ProcessingStarted {
                conversation_id: conv.clone(),
                message_id: MessageId::from_raw("msg_1"),
                tracking_id: None,
            })
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConversationEvent::ProcessingStarted { .. }
        ));
    }
}
