//! JSON-RPC 2.0 client over a single WebSocket.
//!
//! This module provides `Client`, the public face of the crate. It wires one
//! [`Transport`] to the dispatcher task that owns the pending-call and
//! subscription registries, and exposes the protocol operations:
//!
//! - `connect` / `disconnect` - session lifecycle
//! - `call` - request/response, resolved by id
//! - `notify` - fire-and-forget request without an id
//! - `subscribe` / `on` / `unsubscribe` - server-pushed notifications by method

use std::any::type_name;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::engine::{
    typed_handler, CallResult, Command, Dispatcher, MailboxListener, ResponseSlot,
};
use crate::envelope::Request;
use crate::transport::{Transport, TransportError, TransportListener, WebSocketTransport};

/// Client-level error types.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Request could not be serialized. Nothing was registered or sent.
    #[error("Encoding failed: {0}")]
    Encoding(#[source] serde_json::Error),

    /// `subscribe` called twice for the same method.
    #[error("Already subscribed to {0}")]
    DuplicateSubscription(String),

    /// A call id collided with an outstanding call.
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// Transport failed to connect or send.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No matching response arrived in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Endpoint is not a `ws://` or `wss://` URL.
    #[error("Invalid endpoint: {0}")]
    InvalidUrl(String),

    /// The client's dispatcher has stopped.
    #[error("Client closed")]
    Closed,
}

/// State of the underlying connection, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Validate and parse a WebSocket endpoint.
fn parse_endpoint(endpoint: &str) -> Result<Url, ClientError> {
    let url = Url::parse(endpoint)
        .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", endpoint, e)))?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            endpoint, other
        ))),
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    mailbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    config: ClientConfig,
    next_claim: AtomicU64,
}

/// A `Connecting` claim, released unless the handshake succeeds.
///
/// Dropping it unkept, including when the `connect` future itself is dropped
/// mid-handshake, tells the dispatcher to give the claim back.
struct ConnectClaim<'a> {
    id: u64,
    mailbox: Option<&'a mpsc::UnboundedSender<Command>>,
}

impl<'a> ConnectClaim<'a> {
    fn new(id: u64, mailbox: &'a mpsc::UnboundedSender<Command>) -> Self {
        Self {
            id,
            mailbox: Some(mailbox),
        }
    }

    /// The transport is up; its own events drive the state from here.
    fn keep(mut self) {
        self.mailbox = None;
    }
}

impl Drop for ConnectClaim<'_> {
    fn drop(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            let _ = mailbox.send(Command::ConnectFailed { claim: self.id });
        }
    }
}

/// JSON-RPC client multiplexed over one connection.
///
/// Cheap to clone; clones share the connection and registries. The dispatcher
/// stops when the last clone is dropped.
///
/// # Example
///
/// ```ignore
/// use jsonrpc_websockets::{Client, ClientConfig};
/// use serde_json::json;
///
/// let client = Client::new(ClientConfig::default());
/// client.connect("ws://127.0.0.1:9000").await?;
///
/// let echoed: Option<String> = client.call("echo", json!({"text": "hi"})).await?;
/// client.notify("log", json!({"msg": "x"})).await?;
///
/// client.subscribe::<serde_json::Value>("tick").await?;
/// client.on("tick", |params: serde_json::Value| println!("tick {}", params)).await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client backed by a [`WebSocketTransport`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(WebSocketTransport::new(config.keepalive_interval), config)
    }

    /// Create a client over any transport.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn with_transport(transport: impl Transport, config: ClientConfig) -> Self {
        let (mailbox, state, _task) = Dispatcher::spawn();

        Self {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                mailbox,
                state,
                config,
                next_claim: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Open the connection and wait until it is established.
    ///
    /// # Errors
    ///
    /// - `ClientError::InvalidUrl` if `endpoint` is not a ws/wss URL
    /// - `ClientError::Transport(AlreadyConnected)` if a session is live or
    ///   another connect is in progress
    /// - `ClientError::Transport(Connect)` if the handshake fails
    pub async fn connect(&self, endpoint: &str) -> Result<(), ClientError> {
        let url = parse_endpoint(endpoint)?;

        let claim = ConnectClaim::new(
            self.inner.next_claim.fetch_add(1, Ordering::Relaxed),
            &self.inner.mailbox,
        );
        let (reply, claimed) = oneshot::channel();
        self.command(Command::Connecting {
            claim: claim.id,
            reply,
        })?;
        claimed.await.map_err(|_| ClientError::Closed)??;

        let listener: Arc<dyn TransportListener> =
            Arc::new(MailboxListener::new(&self.inner.mailbox));
        self.inner.transport.connect(url, listener).await?;
        claim.keep();

        let mut state = self.inner.state.clone();
        let settled = *state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| ClientError::Closed)?;

        match settled {
            ConnectionState::Connected => {
                info!("Connected to {}", endpoint);
                Ok(())
            }
            // Dropped again before we got to look.
            _ => Err(TransportError::NotConnected.into()),
        }
    }

    /// Close the connection and wait until the disconnect has been observed.
    ///
    /// Outstanding calls are not failed; they expire on their own timers.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let was_connected = self.state() == ConnectionState::Connected;

        self.inner.transport.disconnect().await;

        if was_connected {
            let mut state = self.inner.state.clone();
            state
                .wait_for(|s| *s == ConnectionState::Disconnected)
                .await
                .map_err(|_| ClientError::Closed)?;
        }
        Ok(())
    }

    /// Call `method` and wait for its result, using the configured timeout.
    ///
    /// Resolves to the decoded `result`, or `None` if the response carried no
    /// result (including server error responses).
    ///
    /// # Errors
    ///
    /// - `ClientError::Encoding` if `params` cannot be serialized
    /// - `ClientError::Transport` if the frame could not be sent; the call
    ///   stays registered until a response or its timeout removes it
    /// - `ClientError::Timeout` if no matching response arrived in time
    ///
    /// # Example
    ///
    /// ```ignore
    /// let echoed: Option<String> = client.call("echo", json!({"text": "hi"})).await?;
    /// ```
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<Option<R>, ClientError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_with_timeout(method, params, self.inner.config.call_timeout)
            .await
    }

    /// Call `method` with an explicit timeout.
    pub async fn call_with_timeout<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<Option<R>, ClientError>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let request = Request::call(id.clone(), method, params);
        let frame = serde_json::to_string(&request).map_err(ClientError::Encoding)?;

        let (reply, response) = oneshot::channel::<CallResult<R>>();
        self.command(Command::Register {
            id: id.clone(),
            timeout,
            completion: Box::new(ResponseSlot::new(id.clone(), reply)),
        })?;

        debug!("Calling {} (id {})", method, id);
        self.inner.transport.send(frame).await?;

        response.await.map_err(|_| ClientError::Closed)?
    }

    /// Send a notification. Only the send itself is reported.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), ClientError> {
        let request = Request::notification(method, params);
        let frame = serde_json::to_string(&request).map_err(ClientError::Encoding)?;

        debug!("Notifying {}", method);
        self.inner.transport.send(frame).await?;
        Ok(())
    }

    /// Register interest in notifications for `method` carrying `T`.
    ///
    /// # Errors
    ///
    /// `ClientError::DuplicateSubscription` if `method` is already subscribed.
    pub async fn subscribe<T: DeserializeOwned + 'static>(
        &self,
        method: &str,
    ) -> Result<(), ClientError> {
        self.ask(|reply| Command::Subscribe {
            method: method.to_string(),
            payload_type: type_name::<T>(),
            reply,
        })
        .await?
    }

    /// Install the handler for a subscribed `method`.
    ///
    /// Handlers run on the dispatcher task in frame order, so they should not
    /// block. Returns `false` without installing anything if `method` was not
    /// subscribed first.
    pub async fn on<T, F>(&self, method: &str, handler: F) -> Result<bool, ClientError>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.ask(|reply| Command::On {
            method: method.to_string(),
            payload_type: type_name::<T>(),
            handler: typed_handler(method, handler),
            reply,
        })
        .await
    }

    /// Remove the subscription for `method`. A no-op if there is none.
    pub async fn unsubscribe(&self, method: &str) -> Result<(), ClientError> {
        self.ask(|reply| Command::Unsubscribe {
            method: method.to_string(),
            reply,
        })
        .await?;
        Ok(())
    }

    pub async fn is_subscribed(&self, method: &str) -> Result<bool, ClientError> {
        self.ask(|reply| Command::IsSubscribed {
            method: method.to_string(),
            reply,
        })
        .await
    }

    /// Number of calls still waiting for a response or timeout.
    pub async fn pending_calls(&self) -> Result<usize, ClientError> {
        self.ask(|reply| Command::PendingCalls { reply }).await
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.inner
            .mailbox
            .send(command)
            .map_err(|_| ClientError::Closed)
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, answer) = oneshot::channel();
        self.command(command(reply))?;
        answer.await.map_err(|_| ClientError::Closed)
    }
}
