//! Transport layer: one persistent connection carrying text frames.
//!
//! The engine only ever talks to the [`Transport`] trait. Two implementations
//! are provided:
//!
//! - [`WebSocketTransport`] - a real socket backed by `tokio-tungstenite`
//! - [`MemoryTransport`] - an in-process pipe driven by a [`MemoryPeer`], for tests
//!
//! # Events
//!
//! A transport reports its lifecycle to exactly one [`TransportListener`]:
//!
//! ```text
//! connect() ok ──► Connected
//! text frame   ──► Data(text)        (binary frames are logged and dropped)
//! read error / close frame / disconnect() ──► Disconnected   (once per session)
//! ```
//!
//! All transport failures are terminal for the session. Nothing reconnects.

mod memory;
mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Lifecycle and data events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed.
    Connected,
    /// Session ended. Emitted once per session.
    Disconnected,
    /// One inbound text frame.
    Data(String),
}

/// Transport-specific error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Handshake or socket setup failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Writing a frame failed. Not retried.
    #[error("Send failed: {0}")]
    Send(String),

    /// No live session.
    #[error("Not connected")]
    NotConnected,

    /// `connect` called while a session is still live.
    #[error("Already connected")]
    AlreadyConnected,
}

/// The single receiver of a transport's events.
pub trait TransportListener: Send + Sync + 'static {
    fn on_event(&self, event: TransportEvent);
}

impl TransportListener for mpsc::UnboundedSender<TransportEvent> {
    fn on_event(&self, event: TransportEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.send(event);
    }
}

/// A connection that carries JSON-RPC text frames.
///
/// Implementations own the socket exclusively and must:
/// - emit [`TransportEvent::Connected`] exactly once per successful `connect`
/// - deliver text frames in arrival order
/// - emit [`TransportEvent::Disconnected`] exactly once per session
pub trait Transport: Send + Sync + 'static {
    /// Open the connection and start delivering events to `listener`.
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Transmit one text frame.
    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close the connection. A no-op if there is no live session.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}
