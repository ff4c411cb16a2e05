//! In-process transport for tests.
//!
//! [`MemoryTransport`] is handed to the client. Its [`MemoryPeer`] stays with
//! the test and plays the server: it reads what the client sent, pushes inbound
//! frames, closes the connection from the remote side, and can make sends fail.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use url::Url;

use super::{Transport, TransportError, TransportEvent, TransportListener};

#[derive(Default)]
struct State {
    /// Present while a session is live.
    listener: Option<Arc<dyn TransportListener>>,
    last_url: Option<Url>,
    fail_sends: bool,
    refuse_connections: bool,
}

struct Shared {
    state: Mutex<State>,
    sent: mpsc::UnboundedSender<String>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// End the session, if any, and report it.
    fn end_session(&self) -> bool {
        let listener = self.state().listener.take();
        match listener {
            Some(listener) => {
                listener.on_event(TransportEvent::Disconnected);
                true
            }
            None => false,
        }
    }
}

/// Client side of an in-memory connection.
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Test side of an in-memory connection.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair.
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            sent: sent_tx,
        });

        (
            MemoryTransport {
                shared: Arc::clone(&shared),
            },
            MemoryPeer {
                shared,
                sent: sent_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        url: Url,
        listener: Arc<dyn TransportListener>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.shared.state();
                if state.listener.is_some() {
                    return Err(TransportError::AlreadyConnected);
                }
                if state.refuse_connections {
                    return Err(TransportError::Connect(format!("{} refused", url)));
                }
                state.listener = Some(Arc::clone(&listener));
                state.last_url = Some(url);
            }

            listener.on_event(TransportEvent::Connected);
            Ok(())
        })
    }

    fn send(&self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let state = self.shared.state();
                if state.listener.is_none() {
                    return Err(TransportError::NotConnected);
                }
                if state.fail_sends {
                    return Err(TransportError::Send("memory peer rejected frame".to_string()));
                }
            }

            self.shared
                .sent
                .send(frame)
                .map_err(|_| TransportError::Send("memory peer dropped".to_string()))
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.end_session();
        })
    }
}

impl MemoryPeer {
    /// Wait for the next frame the client sent.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Take the next sent frame if one is already queued.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }

    /// Deliver an inbound text frame. Returns `false` when not connected.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        let listener = self.shared.state().listener.clone();
        match listener {
            Some(listener) => {
                listener.on_event(TransportEvent::Data(text.into()));
                true
            }
            None => false,
        }
    }

    /// Close the connection from the server side.
    pub fn close(&self) -> bool {
        self.shared.end_session()
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        self.shared.state().fail_sends = fail;
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state().refuse_connections = refuse;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().listener.is_some()
    }

    /// The endpoint of the most recent successful connect.
    pub fn last_url(&self) -> Option<Url> {
        self.shared.state().last_url.clone()
    }
}
