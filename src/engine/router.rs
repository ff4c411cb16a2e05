//! Routing of server-pushed notifications to subscribed handlers.
//!
//! At most one subscription exists per method. A subscription is created by
//! `subscribe` without a handler; `on` installs the handler afterwards.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::client::ClientError;
use crate::envelope::{Frame, Notification};

/// Decodes a notification frame and, if it is ours, runs the user handler.
pub(crate) type Handler = Box<dyn FnMut(&Frame) -> bool + Send>;

/// Wrap a typed user handler for `method`.
///
/// The frame must decode as `Notification<T>` and name `method`; two
/// subscriptions can share a payload type, so decoding alone is not enough.
pub(crate) fn typed_handler<T, F>(method: impl Into<String>, mut handler: F) -> Handler
where
    T: DeserializeOwned + 'static,
    F: FnMut(T) + Send + 'static,
{
    let method = method.into();
    Box::new(move |frame: &Frame| {
        match Notification::<T>::deserialize(frame.value()) {
            Ok(notification) if notification.method == method => {
                handler(notification.params);
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("Notification {} did not decode: {}", method, e);
                false
            }
        }
    })
}

struct Subscription {
    payload_type: &'static str,
    handler: Option<Handler>,
}

/// Registry of notification subscriptions.
#[derive(Default)]
pub(crate) struct NotificationRouter {
    subscriptions: HashMap<String, Subscription>,
}

impl NotificationRouter {
    /// Register interest in `method`.
    ///
    /// # Errors
    ///
    /// `ClientError::DuplicateSubscription` if `method` is already subscribed.
    /// The existing subscription is left as it was.
    pub(crate) fn subscribe(
        &mut self,
        method: &str,
        payload_type: &'static str,
    ) -> Result<(), ClientError> {
        if self.subscriptions.contains_key(method) {
            return Err(ClientError::DuplicateSubscription(method.to_string()));
        }

        debug!("Subscribed to {} ({})", method, payload_type);
        self.subscriptions.insert(
            method.to_string(),
            Subscription {
                payload_type,
                handler: None,
            },
        );
        Ok(())
    }

    /// Install the handler for an existing subscription.
    ///
    /// Without a prior `subscribe` the handler is dropped and `false` is
    /// returned. Installing again replaces the previous handler.
    pub(crate) fn on(&mut self, method: &str, payload_type: &'static str, handler: Handler) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(method) else {
            warn!("Ignoring handler for {}: not subscribed", method);
            return false;
        };

        if subscription.payload_type != payload_type {
            warn!(
                "Handler for {} decodes {} but the subscription declared {}",
                method, payload_type, subscription.payload_type
            );
        }

        subscription.handler = Some(handler);
        true
    }

    /// Remove the subscription for `method`, if any.
    pub(crate) fn unsubscribe(&mut self, method: &str) -> bool {
        let removed = self.subscriptions.remove(method).is_some();
        if removed {
            debug!("Unsubscribed from {}", method);
        }
        removed
    }

    pub(crate) fn is_subscribed(&self, method: &str) -> bool {
        self.subscriptions.contains_key(method)
    }

    /// Offer an inbound frame to the subscription for its method.
    ///
    /// Returns `true` if a handler ran. A panicking handler is contained here
    /// and stays installed for later notifications.
    pub(crate) fn dispatch(&mut self, frame: &Frame) -> bool {
        let Some(method) = frame.method() else {
            return false;
        };

        match self.subscriptions.get_mut(method) {
            Some(Subscription {
                handler: Some(handler),
                ..
            }) => match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(handled) => handled,
                Err(_) => {
                    error!("Handler for {} panicked; notification dropped", method);
                    true
                }
            },
            Some(_) => {
                debug!("Notification {} has no handler yet", method);
                false
            }
            None => false,
        }
    }
}
