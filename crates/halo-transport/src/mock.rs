use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use halo_core::{ClientFrame, RealtimeError, ServerFrame};

use crate::connector::{Connector, Link};

const MOCK_LINK_BUFFER: usize = 64;

/// Test-side handle to one opened mock link: inject server frames, observe
/// what the service sent. Dropping the handle closes the link, which the
/// connection service sees as link loss.
pub struct MockLink {
    pub from_server: mpsc::Sender<ServerFrame>,
    pub to_server: mpsc::Receiver<ClientFrame>,
}

/// Scripted connector for deterministic tests without a socket. Each
/// successful `open` hands the test a [`MockLink`] through the receiver
/// returned by [`MockConnector::new`].
pub struct MockConnector {
    handle_tx: mpsc::UnboundedSender<MockLink>,
    opens: AtomicUsize,
    fail_next: AtomicU32,
    tokens: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (handle_tx, handle_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                handle_tx,
                opens: AtomicUsize::new(0),
                fail_next: AtomicU32::new(0),
                tokens: Mutex::new(Vec::new()),
            }),
            handle_rx,
        )
    }

    /// Make the next `n` open attempts fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Relaxed);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// Tokens presented across all open attempts, in order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, token: &SecretString) -> Result<Link, RealtimeError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().push(token.expose_secret().to_string());

        let pending_failures = self.fail_next.load(Ordering::Relaxed);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::Relaxed);
            return Err(RealtimeError::Transport("scripted open failure".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(MOCK_LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(MOCK_LINK_BUFFER);
        let _ = self.handle_tx.send(MockLink {
            from_server: in_tx,
            to_server: out_rx,
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
