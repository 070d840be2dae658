//! halo — the realtime AI conversation streaming layer.
//!
//! One persistent transport connection shared by many conversational UI
//! surfaces: the connection service keeps it alive and re-authenticates
//! it, the health monitor probes it, the stream correlators map inbound
//! streaming events back to the conversation or panel that asked, the
//! outbound queue retries unconfirmed sends across reloads, and the
//! recovery coordinator remediates failures by category.
//!
//! This crate is a library facade with no process entry point of its
//! own; the host application constructs a [`RealtimeClient`] and owns
//! its lifetime. Tracing subscriber setup is likewise the host's
//! concern.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use halo_core::{
    CharacterId, ClientFrame, ConnectionHealth, ConversationEvent, ConversationId, ErrorCategory,
    LatencyWindow, MessageId, PanelEvent, PanelId, QualityClass, QueuedMessageId, RealtimeError,
    ServerFrame, TrackingId, Usage,
};
pub use halo_queue::{OutboundQueue, QueueConfig, QueueSender, QueueStore, QueuedMessage};
pub use halo_recovery::{
    with_default_strategies, RecoveryConfig, RecoveryCoordinator, RecoveryStrategy,
    StrategyOutcome,
};
pub use halo_stream::{
    ConversationRouter, ConversationSnapshot, FrameSink, PanelRouter, PanelSnapshot, RouterConfig,
};
pub use halo_transport::{
    ConnectionConfig, ConnectionService, ConnectionStatus, Connector, CredentialProvider,
    HealthCallbacks, HealthConfig, HealthMonitor, Link, MockConnector, MockLink,
    RefreshingCredentials, StaticCredentials, WsConnector,
};

/// Tuning for every subsystem, with the production defaults. Tests
/// compress the intervals through here.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub queue: QueueConfig,
    pub recovery: RecoveryConfig,
    /// Durable backing file for the outbound queue.
    pub queue_path: PathBuf,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            health: HealthConfig::default(),
            router: RouterConfig::default(),
            queue: QueueConfig::default(),
            recovery: RecoveryConfig::default(),
            queue_path: PathBuf::from("halo-queue.json"),
        }
    }
}

/// Delivery adapter: queued messages go out through the panel router.
/// The owning character travels in the message metadata.
struct PanelSender {
    panels: Arc<PanelRouter>,
}

#[async_trait]
impl QueueSender for PanelSender {
    async fn send_queued(
        &self,
        message: &QueuedMessage,
    ) -> Result<Option<TrackingId>, RealtimeError> {
        let character_id = message
            .metadata
            .get("character_id")
            .and_then(serde_json::Value::as_str)
            .map(CharacterId::from_raw)
            .ok_or(RealtimeError::UnknownTarget {
                kind: "character",
                id: message.id.to_string(),
            })?;
        let tracking_id = self
            .panels
            .send_to_panel(
                &message.panel_id,
                &character_id,
                &message.content,
                &message.metadata,
            )
            .await?;
        Ok(Some(tracking_id))
    }
}

/// Construction wiring for the whole realtime stack. All registries are
/// owned here and handed to the subsystems by reference; tearing the
/// client down tears everything down.
pub struct RealtimeClient {
    connection: Arc<ConnectionService>,
    health: Arc<HealthMonitor>,
    conversations: Arc<ConversationRouter>,
    panels: Arc<PanelRouter>,
    queue: Arc<OutboundQueue>,
    recovery: Arc<RecoveryCoordinator>,
}

impl RealtimeClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        config: RealtimeConfig,
    ) -> Self {
        let connection = Arc::new(ConnectionService::new(
            connector,
            Arc::clone(&credentials),
            config.connection,
        ));
        let health = Arc::new(HealthMonitor::new(Arc::clone(&connection), config.health));
        let sink: Arc<dyn FrameSink> = connection.clone();
        let conversations = Arc::new(ConversationRouter::new(
            Arc::clone(&sink),
            config.router.clone(),
        ));
        let panels = Arc::new(PanelRouter::new(Arc::clone(&sink), config.router));
        let queue = Arc::new(OutboundQueue::new(
            QueueStore::new(config.queue_path),
            Arc::new(PanelSender {
                panels: Arc::clone(&panels),
            }),
            config.queue,
        ));
        let recovery = Arc::new(with_default_strategies(
            config.recovery,
            credentials,
            Arc::clone(&connection),
            Arc::clone(&health),
        ));
        Self {
            connection,
            health,
            conversations,
            panels,
            queue,
            recovery,
        }
    }

    /// Connect and start every background loop.
    pub async fn start(&self) -> Result<(), RealtimeError> {
        Arc::clone(&self.connection).connect().await?;
        Arc::clone(&self.conversations).start(self.connection.subscribe());
        Arc::clone(&self.panels).start(self.connection.subscribe());
        Arc::clone(&self.health).start();
        Arc::clone(&self.queue).start();
        tracing::info!("realtime client started");
        Ok(())
    }

    /// Stop the background loops and drop the link. Queue contents stay
    /// on disk for the next session.
    pub fn shutdown(&self) {
        self.queue.stop();
        self.health.stop();
        self.conversations.stop();
        self.panels.stop();
        self.connection.disconnect();
        tracing::info!("realtime client shut down");
    }

    pub fn connection(&self) -> &Arc<ConnectionService> {
        &self.connection
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn conversations(&self) -> &Arc<ConversationRouter> {
        &self.conversations
    }

    pub fn panels(&self) -> &Arc<PanelRouter> {
        &self.panels
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }
}
