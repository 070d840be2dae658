use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use halo_core::{ClientFrame, RealtimeError};
use halo_transport::ConnectionService;

/// Outbound seam between the correlators and the transport. Keeping the
/// routers behind this trait lets tests drive them against a recording
/// sink instead of a live connection.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    async fn send(&self, frame: ClientFrame) -> Result<(), RealtimeError>;
}

#[async_trait]
impl FrameSink for ConnectionService {
    fn is_connected(&self) -> bool {
        ConnectionService::is_connected(self)
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        ConnectionService::send(self, frame).await
    }
}

/// In-memory sink that records every frame, for router tests.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<ClientFrame>>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
}

impl RecordingSink {
    pub fn connected() -> Self {
        let sink = Self::default();
        sink.connected.store(true, Ordering::Relaxed);
        sink
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Make subsequent sends fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.frames.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().len()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(RealtimeError::Transport("scripted send failure".into()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}
