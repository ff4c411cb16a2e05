//! Correlation of outgoing calls with their responses.
//!
//! Every outstanding call is a [`PendingCall`] keyed by its request id. An
//! entry leaves the registry exactly once: either a response with its id
//! decodes as the expected type, or its timer expires. Whichever the
//! dispatcher processes first removes the entry; the other finds nothing.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::client::ClientError;
use crate::envelope::{Frame, Response};

/// What a call ultimately resolves to.
pub(crate) type CallResult<R> = Result<Option<R>, ClientError>;

/// The decode-and-complete half of a pending call.
pub(crate) trait Completion: Send {
    /// Offer a frame carrying this call's id.
    ///
    /// Returns `true` if the frame decoded as this call's response and the
    /// caller has been answered. A frame that does not decode is not for us.
    fn try_complete(&mut self, frame: &Frame) -> bool;

    /// Answer the caller with an error instead of a result.
    fn fail(self: Box<Self>, error: ClientError);
}

/// Completion that decodes the response as `Response<R>`.
pub(crate) struct ResponseSlot<R> {
    id: String,
    reply: Option<oneshot::Sender<CallResult<R>>>,
}

impl<R> ResponseSlot<R> {
    pub(crate) fn new(id: impl Into<String>, reply: oneshot::Sender<CallResult<R>>) -> Self {
        Self {
            id: id.into(),
            reply: Some(reply),
        }
    }
}

impl<R> Completion for ResponseSlot<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn try_complete(&mut self, frame: &Frame) -> bool {
        let response = match Response::<R>::deserialize(frame.value()) {
            Ok(response) => response,
            Err(e) => {
                debug!("Frame for call {} did not decode: {}", self.id, e);
                return false;
            }
        };

        if response.id != self.id {
            return false;
        }

        if let Some(reply) = self.reply.take() {
            // Caller may have stopped waiting.
            let _ = reply.send(Ok(response.result));
        }
        true
    }

    fn fail(mut self: Box<Self>, error: ClientError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error));
        }
    }
}

/// An outstanding call.
pub(crate) struct PendingCall {
    timeout: Duration,
    timer: AbortHandle,
    completion: Box<dyn Completion>,
}

impl PendingCall {
    pub(crate) fn new(timeout: Duration, timer: AbortHandle, completion: Box<dyn Completion>) -> Self {
        Self {
            timeout,
            timer,
            completion,
        }
    }

    /// Fail a call that never made it into the registry.
    pub(crate) fn reject(self, error: ClientError) {
        self.timer.abort();
        self.completion.fail(error);
    }
}

/// Registry of outstanding calls.
#[derive(Default)]
pub(crate) struct CorrelationEngine {
    pending: HashMap<String, PendingCall>,
}

impl CorrelationEngine {
    /// Track a new call under `id`.
    ///
    /// An id already in use is rejected and the call handed back untouched.
    pub(crate) fn register(&mut self, id: String, call: PendingCall) -> Result<(), PendingCall> {
        if self.pending.contains_key(&id) {
            return Err(call);
        }

        debug!("Registered call {} (timeout {:?})", id, call.timeout);
        self.pending.insert(id, call);
        Ok(())
    }

    /// Offer an inbound frame to the call it names.
    ///
    /// Returns `true` if a pending call consumed it.
    pub(crate) fn dispatch(&mut self, frame: &Frame) -> bool {
        let Some(id) = frame.id() else {
            return false;
        };

        let Some(call) = self.pending.get_mut(id) else {
            debug!("No pending call for response {}", id);
            return false;
        };

        if !call.completion.try_complete(frame) {
            return false;
        }

        if let Some(call) = self.pending.remove(id) {
            call.timer.abort();
        }
        debug!("Completed call {}", id);
        true
    }

    /// Remove a call whose timer fired.
    ///
    /// Returns `false` if a response already consumed it.
    pub(crate) fn expire(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(call) => {
                debug!("Call {} expired after {:?}", id, call.timeout);
                call.completion.fail(ClientError::Timeout(call.timeout));
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}
