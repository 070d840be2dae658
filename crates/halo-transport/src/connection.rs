use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use halo_core::{ClientFrame, RealtimeError, ServerFrame};

use crate::connector::{Connector, Link};
use crate::credentials::CredentialProvider;

/// Reconnect and fan-out tuning for the connection service.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub jitter_factor: f64,
    pub frame_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 10,
            jitter_factor: 0.2,
            frame_buffer: 256,
        }
    }
}

/// Observable connection lifecycle, published on a watch channel so the
/// UI's "connection changed" surface is a typed subscription rather than
/// a callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal: the reconnect budget is spent. Only the UI can act.
    ReconnectFailed,
}

enum PumpExit {
    LinkLost,
    Restart,
}

/// Owns the single transport link: establishes it with a credential from
/// the injected provider, swaps credentials in place when the server
/// rejects one, reconnects with bounded exponential backoff on link loss,
/// and fans inbound frames out on a broadcast channel.
pub struct ConnectionService {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    config: ConnectionConfig,
    frames: broadcast::Sender<ServerFrame>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    reconnects: AtomicU32,
    restart: Notify,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionService {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        config: ConnectionConfig,
    ) -> Self {
        let (frames, _) = broadcast::channel(config.frame_buffer);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            connector,
            credentials,
            config,
            frames,
            status_tx,
            status_rx,
            outbound: Mutex::new(None),
            reconnects: AtomicU32::new(0),
            restart: Notify::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Establish the link and start supervising it. Errors from the first
    /// handshake surface directly; later link loss is handled by the
    /// supervision loop.
    pub async fn connect(self: Arc<Self>) -> Result<(), RealtimeError> {
        if self.is_connected() {
            return Ok(());
        }
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let link = match self.open_link().await {
            Ok(link) => link,
            Err(e) => {
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        self.outbound.lock().replace(link.outbound.clone());
        self.status_tx.send_replace(ConnectionStatus::Connected);
        info!("connected");

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move { service.supervise(link).await });
        if let Some(old) = self.supervisor.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Tear the link down and stop supervising. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.outbound.lock().take();
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        info!("disconnected");
    }

    /// Drop the live link and run the reconnect cycle immediately. Used by
    /// the health monitor when it declares the connection silently dead.
    pub fn force_reconnect(&self) {
        debug!("forced reconnect requested");
        self.restart.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// The raw inbound channel. Every subscriber sees every server frame.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Links re-established after loss. In-place credential swaps do not
    /// count.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        tx.send(frame)
            .await
            .map_err(|_| RealtimeError::Transport("link closed while sending".into()))
    }

    async fn open_link(&self) -> Result<Link, RealtimeError> {
        let token = self.credentials.access_token().await?;
        self.connector.open(&token).await
    }

    async fn supervise(self: Arc<Self>, mut link: Link) {
        loop {
            let exit = self.pump(&mut link).await;
            self.outbound.lock().take();
            match exit {
                PumpExit::LinkLost => debug!("link lost"),
                PumpExit::Restart => debug!("link restart requested"),
            }
            match self.reconnect().await {
                Some(new_link) => link = new_link,
                None => return,
            }
        }
    }

    /// Relay inbound frames until the link dies or a restart is requested.
    /// An auth rejection swaps the credential in place: the link is
    /// reopened with a freshly fetched token without touching the
    /// reconnect budget.
    async fn pump(&self, link: &mut Link) -> PumpExit {
        loop {
            tokio::select! {
                _ = self.restart.notified() => return PumpExit::Restart,
                frame = link.inbound.recv() => match frame {
                    None => return PumpExit::LinkLost,
                    Some(ServerFrame::AuthRejected) => {
                        warn!("credential rejected, refreshing in place");
                        match self.open_link().await {
                            Ok(new_link) => {
                                self.outbound.lock().replace(new_link.outbound.clone());
                                *link = new_link;
                                info!("credential swapped in place");
                            }
                            Err(e) => {
                                warn!(error = %e, "in-place credential swap failed");
                                return PumpExit::LinkLost;
                            }
                        }
                    }
                    Some(frame) => {
                        let _ = self.frames.send(frame);
                    }
                }
            }
        }
    }

    /// Bounded exponential backoff with jitter. Returns the new link, or
    /// `None` once the attempt budget is spent (terminal
    /// [`ConnectionStatus::ReconnectFailed`]).
    async fn reconnect(&self) -> Option<Link> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > self.config.max_attempts {
                warn!(
                    attempts = self.config.max_attempts,
                    "reconnect budget exhausted"
                );
                self.status_tx.send_replace(ConnectionStatus::ReconnectFailed);
                return None;
            }
            self.status_tx
                .send_replace(ConnectionStatus::Reconnecting { attempt });

            tokio::time::sleep(self.backoff_delay(attempt)).await;

            match self.open_link().await {
                Ok(link) => {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.outbound.lock().replace(link.outbound.clone());
                    self.status_tx.send_replace(ConnectionStatus::Connected);
                    info!(attempt, "reconnected");
                    return Some(link);
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.initial_backoff.as_millis() as f64
            * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.config.max_backoff.as_millis() as f64);
        let jitter = capped * self.config.jitter_factor * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::mock::MockConnector;
    use halo_core::{ConversationId, TrackingId};

    fn service(
        connector: Arc<MockConnector>,
        config: ConnectionConfig,
    ) -> Arc<ConnectionService> {
        Arc::new(ConnectionService::new(
            connector,
            Arc::new(StaticCredentials::new("tok-test")),
            config,
        ))
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            max_attempts: 3,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_and_send() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(connector, ConnectionConfig::default());

        Arc::clone(&svc).connect().await.unwrap();
        assert!(svc.is_connected());

        svc.send(ClientFrame::CancelResponse {
            tracking_id: TrackingId::new(),
        })
        .await
        .unwrap();

        let mut link = links.recv().await.unwrap();
        let frame = link.to_server.recv().await.unwrap();
        assert_eq!(frame.frame_type(), "cancel_response");
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let (connector, _links) = MockConnector::new();
        let svc = service(connector, ConnectionConfig::default());
        let err = svc
            .send(ClientFrame::CancelResponse {
                tracking_id: TrackingId::new(),
            })
            .await
            .err()
            .expect("expected error");
        assert!(matches!(err, RealtimeError::NotConnected));
    }

    #[tokio::test]
    async fn inbound_frames_are_broadcast() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(connector, ConnectionConfig::default());
        Arc::clone(&svc).connect().await.unwrap();

        let mut frames = svc.subscribe();
        let link = links.recv().await.unwrap();
        link.from_server
            .send(ServerFrame::ConversationCreated {
                conversation_id: ConversationId::from_raw("conv_1"),
            })
            .await
            .unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.frame_type(), "conversation_created");
    }

    #[tokio::test]
    async fn auth_rejection_swaps_credential_without_reconnect() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(Arc::clone(&connector), ConnectionConfig::default());
        Arc::clone(&svc).connect().await.unwrap();

        let first = links.recv().await.unwrap();
        first
            .from_server
            .send(ServerFrame::AuthRejected)
            .await
            .unwrap();

        // A second link is opened in place with a freshly fetched token.
        let _second = links.recv().await.unwrap();
        assert_eq!(connector.open_count(), 2);
        assert_eq!(connector.tokens_seen(), vec!["tok-test", "tok-test"]);
        assert_eq!(svc.reconnect_count(), 0);
        assert!(svc.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_triggers_reconnect() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(Arc::clone(&connector), fast_config());
        Arc::clone(&svc).connect().await.unwrap();

        let first = links.recv().await.unwrap();
        drop(first); // both halves gone: the service sees link loss

        let _second = links.recv().await.unwrap();
        assert_eq!(connector.open_count(), 2);
        assert_eq!(svc.reconnect_count(), 1);
        assert!(svc.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_are_terminal() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(Arc::clone(&connector), fast_config());
        Arc::clone(&svc).connect().await.unwrap();

        connector.fail_next(10);
        let mut status = svc.status();
        drop(links.recv().await.unwrap());

        loop {
            status.changed().await.unwrap();
            let current = status.borrow().clone();
            if current == ConnectionStatus::ReconnectFailed {
                break;
            }
        }
        // first open + 3 failed reconnect attempts
        assert_eq!(connector.open_count(), 4);
        assert!(!svc.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_cycles_the_link() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(Arc::clone(&connector), fast_config());
        Arc::clone(&svc).connect().await.unwrap();
        let _first = links.recv().await.unwrap();

        svc.force_reconnect();

        let _second = links.recv().await.unwrap();
        assert_eq!(connector.open_count(), 2);
        assert_eq!(svc.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_clears_the_link() {
        let (connector, mut links) = MockConnector::new();
        let svc = service(connector, ConnectionConfig::default());
        Arc::clone(&svc).connect().await.unwrap();
        let _link = links.recv().await.unwrap();

        svc.disconnect();
        assert!(!svc.is_connected());
        let err = svc
            .send(ClientFrame::CancelResponse {
                tracking_id: TrackingId::new(),
            })
            .await
            .err()
            .expect("expected error");
        assert!(matches!(err, RealtimeError::NotConnected));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let (connector, _links) = MockConnector::new();
        let svc = ConnectionService::new(
            connector,
            Arc::new(StaticCredentials::new("tok")),
            ConnectionConfig {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                jitter_factor: 0.0,
                ..Default::default()
            },
        );
        assert_eq!(svc.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(svc.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(svc.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(svc.backoff_delay(10), Duration::from_secs(30));
    }
}
