//! Correlation and dispatch engine.
//!
//! Both registries (pending calls and notification subscriptions) live inside
//! one dispatcher task. Everything that touches them arrives through a single
//! FIFO mailbox:
//!
//! ```text
//!   Client ──── Register / Subscribe / On / ... ───┐
//!   Transport ── Connected / Data / Disconnected ──┼──► mailbox ──► Dispatcher
//!   call timers ─ Expire ──────────────────────────┘        (owns both registries)
//! ```
//!
//! A call is registered before its frame is handed to the transport, and
//! inbound frames enter the same mailbox, so a response is never processed
//! ahead of the registration it answers.

mod correlation;
mod router;

pub(crate) use correlation::{CallResult, Completion, ResponseSlot};
pub(crate) use router::{typed_handler, Handler};

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientError, ConnectionState};
use crate::envelope::Frame;
use crate::transport::{TransportError, TransportEvent, TransportListener};
use correlation::{CorrelationEngine, PendingCall};
use router::NotificationRouter;

/// Messages processed by the dispatcher, in arrival order.
pub(crate) enum Command {
    /// Claim the connection for a `connect` in progress.
    Connecting {
        claim: u64,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    /// The `connect` holding `claim` failed or was abandoned before the
    /// handshake completed. Stale or refused claims are ignored.
    ConnectFailed { claim: u64 },
    Transport(TransportEvent),
    Register {
        id: String,
        timeout: Duration,
        completion: Box<dyn Completion>,
    },
    Expire {
        id: String,
    },
    Subscribe {
        method: String,
        payload_type: &'static str,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    On {
        method: String,
        payload_type: &'static str,
        handler: Handler,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        method: String,
        reply: oneshot::Sender<bool>,
    },
    IsSubscribed {
        method: String,
        reply: oneshot::Sender<bool>,
    },
    PendingCalls {
        reply: oneshot::Sender<usize>,
    },
}

/// Transport listener that feeds the dispatcher mailbox.
///
/// Holds a weak sender so a live socket does not keep a dropped client's
/// dispatcher running.
pub(crate) struct MailboxListener {
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl MailboxListener {
    pub(crate) fn new(mailbox: &mpsc::UnboundedSender<Command>) -> Self {
        Self {
            mailbox: mailbox.downgrade(),
        }
    }
}

impl TransportListener for MailboxListener {
    fn on_event(&self, event: TransportEvent) {
        if let Some(mailbox) = self.mailbox.upgrade() {
            let _ = mailbox.send(Command::Transport(event));
        }
    }
}

/// Owner of both registries and the connection state.
pub(crate) struct Dispatcher {
    calls: CorrelationEngine,
    router: NotificationRouter,
    state: watch::Sender<ConnectionState>,
    /// The `connect` currently holding the `Connecting` state.
    claim: Option<u64>,
    /// For call timers to post expiries back.
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl Dispatcher {
    /// Start the dispatcher task.
    ///
    /// The task runs until every strong mailbox sender is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub(crate) fn spawn() -> (
        mpsc::UnboundedSender<Command>,
        watch::Receiver<ConnectionState>,
        JoinHandle<()>,
    ) {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let dispatcher = Dispatcher {
            calls: CorrelationEngine::default(),
            router: NotificationRouter::default(),
            state,
            claim: None,
            mailbox: mailbox.downgrade(),
        };
        let task = tokio::spawn(dispatcher.run(inbox));

        (mailbox, state_rx, task)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        debug!(
            "Dispatcher stopped with {} call(s) still pending",
            self.calls.len()
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connecting { claim, reply } => {
                let current = *self.state.borrow();
                let result = if current == ConnectionState::Disconnected {
                    self.claim = Some(claim);
                    self.state.send_replace(ConnectionState::Connecting);
                    Ok(())
                } else {
                    Err(TransportError::AlreadyConnected.into())
                };
                let _ = reply.send(result);
            }
            Command::ConnectFailed { claim } => {
                if self.claim == Some(claim)
                    && *self.state.borrow() == ConnectionState::Connecting
                {
                    debug!("Connect {} did not complete, releasing its claim", claim);
                    self.claim = None;
                    self.state.send_replace(ConnectionState::Disconnected);
                }
            }
            Command::Transport(event) => self.handle_transport(event),
            Command::Register {
                id,
                timeout,
                completion,
            } => self.register(id, timeout, completion),
            Command::Expire { id } => {
                if !self.calls.expire(&id) {
                    trace!("Expiry for call {} arrived after its response", id);
                }
            }
            Command::Subscribe {
                method,
                payload_type,
                reply,
            } => {
                let _ = reply.send(self.router.subscribe(&method, payload_type));
            }
            Command::On {
                method,
                payload_type,
                handler,
                reply,
            } => {
                let _ = reply.send(self.router.on(&method, payload_type, handler));
            }
            Command::Unsubscribe { method, reply } => {
                let _ = reply.send(self.router.unsubscribe(&method));
            }
            Command::IsSubscribed { method, reply } => {
                let _ = reply.send(self.router.is_subscribed(&method));
            }
            Command::PendingCalls { reply } => {
                let _ = reply.send(self.calls.len());
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Connection established");
                self.claim = None;
                self.state.send_replace(ConnectionState::Connected);
            }
            TransportEvent::Disconnected => {
                info!(
                    "Connection closed ({} call(s) left to expire)",
                    self.calls.len()
                );
                self.state.send_replace(ConnectionState::Disconnected);
            }
            TransportEvent::Data(text) => self.handle_data(&text),
        }
    }

    fn handle_data(&mut self, text: &str) {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            debug!("Dropping frame received while {:?}", state);
            return;
        }

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame that is not JSON: {}", e);
                return;
            }
        };

        if self.calls.dispatch(&frame) {
            return;
        }
        if !self.router.dispatch(&frame) {
            trace!("Frame matched no pending call or subscription");
        }
    }

    fn register(&mut self, id: String, timeout: Duration, completion: Box<dyn Completion>) {
        let timer = {
            let mailbox = self.mailbox.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(mailbox) = mailbox.upgrade() {
                    let _ = mailbox.send(Command::Expire { id });
                }
            })
            .abort_handle()
        };

        let call = PendingCall::new(timeout, timer, completion);
        if let Err(rejected) = self.calls.register(id.clone(), call) {
            warn!("Rejecting call with duplicate id {}", id);
            rejected.reject(ClientError::DuplicateRequestId(id));
        }
    }
}
