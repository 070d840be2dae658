use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use halo_core::{ClientFrame, ConnectionHealth, LatencyWindow, ServerFrame, TrackingId};

use crate::connection::{ConnectionService, ConnectionStatus};

/// Probe and evaluation cadence for the health monitor.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// How often a liveness probe is sent while connected.
    pub probe_interval: Duration,
    /// How long an unanswered probe may hang before the connection is
    /// reported degraded.
    pub probe_timeout: Duration,
    /// How often overall health is evaluated.
    pub eval_interval: Duration,
    /// Longest tolerated silence since the last successful probe response
    /// before the connection is declared dead and forcibly cycled.
    pub silence_ceiling: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(25),
            probe_timeout: Duration::from_secs(5),
            eval_interval: Duration::from_secs(30),
            silence_ceiling: Duration::from_secs(60),
        }
    }
}

type HealthCallback = Arc<dyn Fn() + Send + Sync>;

/// UI-facing notification hooks. `on_degraded` fires when a probe times
/// out (warning only, traffic keeps flowing); `on_reconnect_failed` fires
/// on the terminal reconnect-exhausted condition.
#[derive(Clone, Default)]
pub struct HealthCallbacks {
    pub on_degraded: Option<HealthCallback>,
    pub on_reconnect_failed: Option<HealthCallback>,
}

struct HealthState {
    window: LatencyWindow,
    last_probe_at: Option<chrono::DateTime<Utc>>,
    last_response: Option<Instant>,
    /// Timestamp of the probe currently awaiting a response. Cleared when
    /// the response arrives or the probe times out; a response that shows
    /// up for anything else is stale and ignored.
    outstanding_probe: Option<i64>,
    last_rtt_ms: u64,
    is_healthy: bool,
    degraded: bool,
}

impl HealthState {
    fn new() -> Self {
        Self {
            window: LatencyWindow::new(),
            last_probe_at: None,
            last_response: None,
            outstanding_probe: None,
            last_rtt_ms: 0,
            is_healthy: false,
            degraded: false,
        }
    }
}

/// Periodically probes the link, classifies its quality from a trailing
/// latency window, detects silent failure against a silence ceiling, and
/// forces reconnection when the ceiling is breached.
pub struct HealthMonitor {
    connection: Arc<ConnectionService>,
    config: HealthConfig,
    state: Mutex<HealthState>,
    callbacks: RwLock<HealthCallbacks>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(connection: Arc<ConnectionService>, config: HealthConfig) -> Self {
        Self {
            connection,
            config,
            state: Mutex::new(HealthState::new()),
            callbacks: RwLock::new(HealthCallbacks::default()),
            task: Mutex::new(None),
        }
    }

    pub fn set_callbacks(&self, callbacks: HealthCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    /// Start the probe/evaluate loops. The connect moment is the baseline
    /// for silence measurement.
    pub fn start(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.last_response = Some(Instant::now());
            state.is_healthy = self.connection.is_connected();
        }
        let monitor = Arc::clone(&self);
        let handle = tokio::spawn(async move { monitor.run().await });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn get_health(&self) -> ConnectionHealth {
        let state = self.state.lock();
        ConnectionHealth {
            is_healthy: state.is_healthy,
            last_probe_at: state.last_probe_at,
            latency_ms: state.last_rtt_ms,
            reconnect_count: self.connection.reconnect_count(),
            quality: state.window.quality(),
        }
    }

    /// True between a probe timeout and the next successful response.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    pub fn force_reconnect(&self) {
        self.state.lock().is_healthy = false;
        self.connection.force_reconnect();
    }

    async fn run(self: Arc<Self>) {
        let mut probe_ticker = tokio::time::interval(self.config.probe_interval);
        probe_ticker.tick().await; // consume first immediate tick
        let mut eval_ticker = tokio::time::interval(self.config.eval_interval);
        eval_ticker.tick().await;
        let mut frames = self.connection.subscribe();
        let mut status = self.connection.status();

        loop {
            tokio::select! {
                _ = probe_ticker.tick() => {
                    if let Some(timestamp) = self.send_probe().await {
                        // Watchdog: unanswered within the timeout marks the
                        // connection degraded without interrupting traffic.
                        let monitor = Arc::clone(&self);
                        tokio::spawn(async move {
                            monitor.probe_watchdog(timestamp).await;
                        });
                    }
                }
                _ = eval_ticker.tick() => self.evaluate(),
                frame = frames.recv() => match frame {
                    Ok(ServerFrame::LivenessResponse { timestamp }) => {
                        self.on_probe_response(timestamp);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "health monitor lagged behind the frame stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    self.on_status(current);
                }
            }
        }
    }

    /// Send one liveness probe; returns its timestamp so the caller can
    /// arm the timeout watchdog.
    async fn send_probe(&self) -> Option<i64> {
        if !self.connection.is_connected() {
            return None;
        }
        let timestamp = Utc::now().timestamp_millis();
        self.state.lock().outstanding_probe = Some(timestamp);

        let frame = ClientFrame::LivenessProbe {
            timestamp,
            tracking_id: TrackingId::new(),
        };
        if let Err(e) = self.connection.send(frame).await {
            warn!(error = %e, "liveness probe send failed");
            self.state.lock().outstanding_probe = None;
            return None;
        }
        trace!(timestamp, "liveness probe sent");
        Some(timestamp)
    }

    async fn probe_watchdog(&self, timestamp: i64) {
        tokio::time::sleep(self.config.probe_timeout).await;
        let fire = {
            let mut state = self.state.lock();
            if state.outstanding_probe == Some(timestamp) {
                state.outstanding_probe = None;
                state.degraded = true;
                true
            } else {
                false
            }
        };
        if fire {
            warn!(timestamp, "liveness probe timed out, connection degraded");
            let callback = self.callbacks.read().on_degraded.clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    fn on_probe_response(&self, timestamp: i64) {
        let mut state = self.state.lock();
        if state.outstanding_probe != Some(timestamp) {
            debug!(timestamp, "stale liveness response ignored");
            return;
        }
        state.outstanding_probe = None;
        let rtt = (Utc::now().timestamp_millis() - timestamp).max(0) as u64;
        state.window.record(rtt);
        state.last_rtt_ms = rtt;
        state.last_probe_at = Some(Utc::now());
        state.last_response = Some(Instant::now());
        state.is_healthy = true;
        state.degraded = false;
        trace!(rtt_ms = rtt, quality = ?state.window.quality(), "liveness response");
    }

    /// Silence-ceiling check: too long without a successful probe response
    /// means the link is silently dead, so cycle it.
    fn evaluate(&self) {
        if !self.connection.is_connected() {
            return;
        }
        let breached = {
            let mut state = self.state.lock();
            let silent = state
                .last_response
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if silent > self.config.silence_ceiling {
                state.is_healthy = false;
                // Reset the baseline so one breach forces one cycle.
                state.last_response = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if breached {
            warn!(
                ceiling_secs = self.config.silence_ceiling.as_secs(),
                "silence ceiling breached, forcing reconnect"
            );
            self.connection.force_reconnect();
        }
    }

    fn on_status(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::ReconnectFailed => {
                self.state.lock().is_healthy = false;
                let callback = self.callbacks.read().on_reconnect_failed.clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
            ConnectionStatus::Connected => {
                let mut state = self.state.lock();
                state.last_response = Some(Instant::now());
                state.degraded = false;
            }
            _ => {}
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
