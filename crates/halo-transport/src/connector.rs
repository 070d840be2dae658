use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

use halo_core::{ClientFrame, RealtimeError, ServerFrame};

const LINK_BUFFER: usize = 64;

/// One established, authenticated transport link. Dropping either half
/// tears the link down; the owning service detects that as link loss.
pub struct Link {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Opens authenticated links. The connection service re-invokes this on
/// every (re)connect, so implementations must be safe to call repeatedly.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, token: &SecretString) -> Result<Link, RealtimeError>;
}

/// WebSocket connector: JSON text frames over a single socket, split into
/// reader/writer pump tasks that die with the link.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, token: &SecretString) -> Result<Link, RealtimeError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (socket, _) = connect_async(request).await.map_err(|e| match &e {
            tokio_tungstenite::tungstenite::Error::Http(resp)
                if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 =>
            {
                RealtimeError::CredentialRejected(resp.status().to_string())
            }
            _ => RealtimeError::Transport(e.to_string()),
        })?;

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(LINK_BUFFER);

        // Writer: serialize frames from the service onto the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(frame = frame.frame_type(), error = %e, "unserializable frame dropped");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader: parse inbound text frames; anything unparseable is logged
        // and skipped so one bad frame cannot wedge the stream.
        tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unrecognized server frame");
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
