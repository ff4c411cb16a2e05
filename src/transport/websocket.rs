//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! Each successful `connect` spawns one session task. That task is the only
//! reader and writer of the socket: it runs the receive loop, writes outbound
//! frames handed to it over a channel, and sends keepalive pings. When the task
//! exits, for whatever reason, it reports `Disconnected` once.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{Transport, TransportError, TransportEvent, TransportListener};
use crate::config::DEFAULT_KEEPALIVE_INTERVAL;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on waiting for the close handshake during `disconnect`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Work handed to the session task.
enum Outbound {
    Frame {
        text: String,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

/// A live connection.
struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// Transport over a single WebSocket connection.
///
/// # Example
///
/// ```ignore
/// let transport = WebSocketTransport::new(Duration::from_secs(5));
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// transport.connect(Url::parse("ws://127.0.0.1:9000")?, Arc::new(tx)).await?;
/// transport.send(r#"{"jsonrpc":"2.0","method":"hello","params":{}}"#.into()).await?;
/// ```
pub struct WebSocketTransport {
    keepalive_interval: Duration,
    session: Mutex<Option<Session>>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_INTERVAL)
    }
}

impl WebSocketTransport {
    /// Create a transport that pings every `keepalive_interval` once connected.
    ///
    /// A zero interval disables keepalive pings.
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            keepalive_interval,
            session: Mutex::new(None),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    async fn open(
        &self,
        url: Url,
        listener: Arc<dyn TransportListener>,
    ) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                return Err(TransportError::AlreadyConnected);
            }
        }

        info!("Connecting WebSocket: {}", url);

        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!("WebSocket connected: {}", url);
        listener.on_event(TransportEvent::Connected);

        let (outbound, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            socket,
            inbox,
            listener,
            self.keepalive_interval,
        ));

        *session = Some(Session { outbound, task });
        Ok(())
    }

    async fn write(&self, frame: String) -> Result<(), TransportError> {
        let outbound = {
            let session = self.session.lock().await;
            session
                .as_ref()
                .map(|s| s.outbound.clone())
                .ok_or(TransportError::NotConnected)?
        };

        let (ack, done) = oneshot::channel();
        outbound
            .send(Outbound::Frame { text: frame, ack })
            .map_err(|_| TransportError::NotConnected)?;

        // Session ended before it got to our frame.
        done.await.map_err(|_| TransportError::NotConnected)?
    }

    async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            debug!("Disconnect requested with no live session");
            return;
        };

        // The task may already have exited after a read failure; then the
        // send fails and the join below returns immediately.
        let _ = session.outbound.send(Outbound::Close);

        if let Err(e) = session.task.await {
            error!("WebSocket session task failed: {}", e);
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.open(url, listener))
    }

    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.write(frame))
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Requested,
    RemoteClosed,
    ReadFailed(String),
    PingFailed(String),
    Abandoned,
}

/// Resolves at the next ping deadline; never, with keepalive disabled.
async fn keepalive_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive one connection until it ends, then report `Disconnected`.
async fn run_session(
    mut socket: Socket,
    mut inbox: mpsc::UnboundedReceiver<Outbound>,
    listener: Arc<dyn TransportListener>,
    keepalive_interval: Duration,
) {
    let next_ping_after = || {
        (!keepalive_interval.is_zero()).then(|| Instant::now() + keepalive_interval)
    };
    let mut next_ping = next_ping_after();

    let end = loop {
        tokio::select! {
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        listener.on_event(TransportEvent::Data(text.to_string()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            "Expected a text frame but received {} binary bytes; dropping it",
                            data.len()
                        );
                    }
                    Some(Ok(Message::Close(_))) => break SessionEnd::RemoteClosed,
                    // Pongs are answered by tungstenite; ping replies carry no data.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::ReadFailed(e.to_string()),
                    None => break SessionEnd::RemoteClosed,
                }
            }

            command = inbox.recv() => {
                match command {
                    Some(Outbound::Frame { text, ack }) => {
                        let result = socket
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| TransportError::Send(e.to_string()));
                        if let Err(e) = &result {
                            error!("Failed to send WebSocket frame: {}", e);
                        }
                        let _ = ack.send(result);
                    }
                    Some(Outbound::Close) => break SessionEnd::Requested,
                    None => break SessionEnd::Abandoned,
                }
            }

            _ = keepalive_due(next_ping) => {
                if let Err(e) = socket.send(Message::Ping(Vec::new().into())).await {
                    break SessionEnd::PingFailed(e.to_string());
                }
                trace!("Sent keepalive ping");
                next_ping = next_ping_after();
            }
        }
    };

    match &end {
        SessionEnd::Requested | SessionEnd::Abandoned => {
            if tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None))
                .await
                .is_err()
            {
                warn!("Timed out waiting for WebSocket close handshake");
            }
            info!("WebSocket disconnected");
        }
        SessionEnd::RemoteClosed => info!("WebSocket closed by server"),
        SessionEnd::ReadFailed(e) => error!("WebSocket read failed: {}", e),
        SessionEnd::PingFailed(e) => error!("Keepalive ping failed: {}", e),
    }

    listener.on_event(TransportEvent::Disconnected);
}
