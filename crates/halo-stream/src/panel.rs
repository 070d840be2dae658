use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use halo_core::{
    CharacterId, ClientFrame, ConversationEvent, ConversationId, PanelEvent, PanelId,
    RealtimeError, ServerFrame, TrackingId, Usage,
};

use crate::conversation::RouterConfig;
use crate::sink::FrameSink;

/// Read-only copy of one panel's correlation state.
#[derive(Clone, Debug, Default)]
pub struct PanelSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub is_streaming: bool,
    pub stream_content: String,
    pub tracking_ids: Vec<TrackingId>,
}

struct PanelState {
    conversation_id: Option<ConversationId>,
    is_streaming: bool,
    stream_content: String,
    /// In-flight request tokens, oldest first. Completed ones are
    /// collected individually; the newest is the cancellation target.
    tracking: Vec<TrackingId>,
    events: broadcast::Sender<PanelEvent>,
}

impl PanelState {
    fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            conversation_id: None,
            is_streaming: false,
            stream_content: String::new(),
            tracking: Vec::new(),
            events,
        }
    }

    fn emit(&self, event: PanelEvent) {
        let _ = self.events.send(event);
    }

    fn release_tracking(&mut self, tracking_id: Option<&TrackingId>) {
        if let Some(tid) = tracking_id {
            self.tracking.retain(|t| t != tid);
        }
    }
}

/// Panel-keyed stream correlator for concurrent multi-surface UIs. A
/// panel is a rebindable UI region: it may host different conversations
/// over its lifetime and track several in-flight requests at once.
///
/// Inbound frames are routed by tracking echo first, falling back to the
/// bound conversation for frames that carry none (session broadcasts).
pub struct PanelRouter {
    sink: Arc<dyn FrameSink>,
    config: RouterConfig,
    panels: DashMap<PanelId, PanelState>,
    pending_joins: Mutex<HashMap<PanelId, oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PanelRouter {
    pub fn new(sink: Arc<dyn FrameSink>, config: RouterConfig) -> Self {
        Self {
            sink,
            config,
            panels: DashMap::new(),
            pending_joins: Mutex::new(HashMap::new()),
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
                        warn!(skipped = n, "panel router lagged, dropped frames");
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

    /// Register a panel and complete the join handshake so the server
    /// routes subsequent events to it. Binding a conversation that another
    /// panel currently holds steals it: the old panel is unbound and stops
    /// receiving that conversation's events.
    pub async fn create_panel(
        &self,
        panel_id: &PanelId,
        conversation_id: Option<ConversationId>,
    ) -> Result<(), RealtimeError> {
        if let Some(conv) = &conversation_id {
            for mut entry in self.panels.iter_mut() {
                if entry.key() != panel_id && entry.conversation_id.as_ref() == Some(conv) {
                    debug!(
                        panel_id = %entry.key(),
                        conversation_id = %conv,
                        "conversation rebound away from panel"
                    );
                    entry.conversation_id = None;
                }
            }
        }

        self.panels
            .entry(panel_id.clone())
            .or_insert_with(|| PanelState::new(self.config.event_buffer))
            .conversation_id = conversation_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending_joins.lock().insert(panel_id.clone(), tx);

        let frame = ClientFrame::JoinPanel {
            panel_id: panel_id.clone(),
            conversation_id,
        };
        if let Err(e) = self.sink.send(frame).await {
            self.pending_joins.lock().remove(panel_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(())) => {
                debug!(panel_id = %panel_id, "panel joined");
                Ok(())
            }
            _ => {
                self.pending_joins.lock().remove(panel_id);
                warn!(panel_id = %panel_id, "panel join timed out");
                Err(RealtimeError::Timeout(self.config.handshake_timeout))
            }
        }
    }

    /// Unregister a panel. The leave notice is fire-and-forget (the server
    /// sends no acknowledgment); every tracking id still associated with
    /// the panel is released with it.
    pub async fn remove_panel(&self, panel_id: &PanelId) -> Result<(), RealtimeError> {
        if self.panels.remove(panel_id).is_none() {
            warn!(panel_id = %panel_id, "remove of unknown panel ignored");
            return Ok(());
        }
        self.pending_joins.lock().remove(panel_id);
        if let Err(e) = self
            .sink
            .send(ClientFrame::LeavePanel {
                panel_id: panel_id.clone(),
            })
            .await
        {
            debug!(panel_id = %panel_id, error = %e, "leave notice not delivered");
        }
        Ok(())
    }

    /// Send into the panel's bound conversation. The metadata shape picks
    /// the outbound operation — an explicit `tool_name` invokes that tool,
    /// a `proposal` runs the structured analysis flow, anything else is
    /// plain chat — but every branch lands in the same tracking
    /// bookkeeping.
    pub async fn send_to_panel(
        &self,
        panel_id: &PanelId,
        character_id: &CharacterId,
        content: &str,
        metadata: &Value,
    ) -> Result<TrackingId, RealtimeError> {
        if !self.sink.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let conversation_id = {
            let state = self
                .panels
                .get(panel_id)
                .ok_or_else(|| RealtimeError::UnknownTarget {
                    kind: "panel",
                    id: panel_id.to_string(),
                })?;
            state
                .conversation_id
                .clone()
                .ok_or_else(|| RealtimeError::PanelUnbound(panel_id.to_string()))?
        };

        let tracking_id = TrackingId::new();
        let frame = if let Some(tool_name) = metadata.get("tool_name").and_then(Value::as_str) {
            ClientFrame::InvokeTool {
                conversation_id,
                character_id: character_id.clone(),
                tracking_id: tracking_id.clone(),
                tool_name: tool_name.to_string(),
                args: metadata.get("args").cloned().unwrap_or(Value::Null),
            }
        } else if let Some(proposal) = metadata.get("proposal") {
            ClientFrame::InvokeTool {
                conversation_id,
                character_id: character_id.clone(),
                tracking_id: tracking_id.clone(),
                tool_name: "proposal_analysis".to_string(),
                args: proposal.clone(),
            }
        } else {
            ClientFrame::SendMessage {
                conversation_id,
                character_id: character_id.clone(),
                tracking_id: tracking_id.clone(),
                text: content.to_string(),
            }
        };

        if let Some(mut state) = self.panels.get_mut(panel_id) {
            state.tracking.push(tracking_id.clone());
        }
        if let Err(e) = self.sink.send(frame).await {
            if let Some(mut state) = self.panels.get_mut(panel_id) {
                state.release_tracking(Some(&tracking_id));
            }
            return Err(e);
        }
        trace!(panel_id = %panel_id, tracking_id = %tracking_id, "panel request sent");
        Ok(tracking_id)
    }

    /// Cancel the panel's most recently issued request. A no-op with a
    /// warning when nothing is in flight.
    pub async fn cancel_active(&self, panel_id: &PanelId) -> Result<(), RealtimeError> {
        let target = self
            .panels
            .get(panel_id)
            .and_then(|state| state.tracking.last().cloned());
        let Some(tracking_id) = target else {
            warn!(panel_id = %panel_id, "no active request to cancel");
            return Ok(());
        };
        self.sink
            .send(ClientFrame::CancelResponse {
                tracking_id: tracking_id.clone(),
            })
            .await?;
        debug!(panel_id = %panel_id, tracking_id = %tracking_id, "cancellation sent");
        Ok(())
    }

    /// Subscribe to a panel's events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, panel_id: &PanelId) -> broadcast::Receiver<PanelEvent> {
        self.panels
            .entry(panel_id.clone())
            .or_insert_with(|| PanelState::new(self.config.event_buffer))
            .events
            .subscribe()
    }

    /// Stream-combinator adapter over [`PanelRouter::subscribe`].
    pub fn event_stream(&self, panel_id: &PanelId) -> BroadcastStream<PanelEvent> {
        BroadcastStream::new(self.subscribe(panel_id))
    }

    pub fn snapshot(&self, panel_id: &PanelId) -> Option<PanelSnapshot> {
        self.panels.get(panel_id).map(|state| PanelSnapshot {
            conversation_id: state.conversation_id.clone(),
            is_streaming: state.is_streaming,
            stream_content: state.stream_content.clone(),
            tracking_ids: state.tracking.clone(),
        })
    }

    pub fn panel_count(&self) -> usize {
        self.panels.len()
    }

    /// Owner lookup: tracking echo first, bound conversation second.
    fn locate(
        &self,
        tracking_id: Option<&TrackingId>,
        conversation_id: Option<&ConversationId>,
    ) -> Option<PanelId> {
        if let Some(tid) = tracking_id {
            let by_tracking = self
                .panels
                .iter()
                .find(|entry| entry.tracking.iter().any(|t| t == tid))
                .map(|entry| entry.key().clone());
            if by_tracking.is_some() {
                return by_tracking;
            }
        }
        conversation_id.and_then(|conv| {
            self.panels
                .iter()
                .find(|entry| entry.conversation_id.as_ref() == Some(conv))
                .map(|entry| entry.key().clone())
        })
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::PanelJoined { panel_id } => {
                if let Some(pending) = self.pending_joins.lock().remove(&panel_id) {
                    let _ = pending.send(());
                } else {
                    trace!(panel_id = %panel_id, "unsolicited join acknowledgment");
                }
            }
            ServerFrame::SessionEvent {
                conversation_id,
                name,
                payload,
            } => {
                // Pass-through notification: no content accumulation.
                let Some(owner) = self.locate(None, Some(&conversation_id)) else {
                    trace!(conversation_id = %conversation_id, "session event without a panel dropped");
                    return;
                };
                if let Some(state) = self.panels.get(&owner) {
                    state.emit(PanelEvent::Session { name, payload });
                }
            }
            ServerFrame::ProcessingStarted {
                conversation_id,
                message_id,
                tracking_id,
            } => {
                let Some(owner) = self.locate(tracking_id.as_ref(), Some(&conversation_id)) else {
                    return;
                };
                if let Some(state) = self.panels.get(&owner) {
                    state.emit(PanelEvent::Stream(ConversationEvent::ProcessingStarted {
                        message_id,
                    }));
                }
            }
            ServerFrame::StreamingStarted {
                conversation_id,
                message_id,
                tracking_id,
            } => {
                let Some(owner) = self.locate(tracking_id.as_ref(), Some(&conversation_id)) else {
                    return;
                };
                if let Some(mut state) = self.panels.get_mut(&owner) {
                    state.is_streaming = true;
                    state.stream_content.clear();
                    state.emit(PanelEvent::Stream(ConversationEvent::StreamingStarted {
                        message_id,
                    }));
                }
            }
            ServerFrame::ResponseChunk {
                conversation_id,
                chunk,
                chunk_index,
                tool_name,
                tracking_id,
                ..
            } => {
                let Some(owner) = self.locate(tracking_id.as_ref(), Some(&conversation_id)) else {
                    trace!(conversation_id = %conversation_id, "chunk without a panel dropped");
                    return;
                };
                if let Some(mut state) = self.panels.get_mut(&owner) {
                    state.stream_content.push_str(&chunk);
                    let event = PanelEvent::Stream(ConversationEvent::Chunk {
                        text: state.stream_content.clone(),
                        chunk_index,
                        tool_name,
                    });
                    state.emit(event);
                }
            }
            ServerFrame::StreamingComplete {
                conversation_id,
                full_response,
                tokens,
                cost_cents,
                duration_ms,
                structured_analysis,
                tracking_id,
                ..
            } => {
                let Some(owner) = self.locate(tracking_id.as_ref(), Some(&conversation_id)) else {
                    return;
                };
                if let Some(mut state) = self.panels.get_mut(&owner) {
                    state.is_streaming = false;
                    state.stream_content.clear();
                    state.release_tracking(tracking_id.as_ref());
                    state.emit(PanelEvent::Stream(ConversationEvent::Completed {
                        text: full_response,
                        usage: Usage {
                            tokens,
                            cost_cents,
                            duration_ms,
                        },
                        analysis: structured_analysis,
                    }));
                }
            }
            ServerFrame::ToolError {
                conversation_id,
                tool_name,
                message,
                validation_errors,
                tracking_id,
            } => {
                let Some(owner) = self.locate(tracking_id.as_ref(), Some(&conversation_id)) else {
                    return;
                };
                if let Some(mut state) = self.panels.get_mut(&owner) {
                    state.is_streaming = false;
                    state.release_tracking(tracking_id.as_ref());
                    state.emit(PanelEvent::Stream(ConversationEvent::ToolFailed {
                        tool_name,
                        message,
                        validation_errors,
                    }));
                }
            }
            ServerFrame::AiError {
                conversation_id,
                message,
            } => {
                let Some(owner) = self.locate(None, Some(&conversation_id)) else {
                    return;
                };
                if let Some(mut state) = self.panels.get_mut(&owner) {
                    state.is_streaming = false;
                    state.emit(PanelEvent::Stream(ConversationEvent::Failed { message }));
                }
            }
            ServerFrame::ConversationCreated { .. }
            | ServerFrame::LivenessResponse { .. }
            | ServerFrame::AuthRejected => {}
        }
    }
}

impl Drop for PanelRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
