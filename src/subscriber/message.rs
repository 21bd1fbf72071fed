use super::deletion::DeleteRequest;
use super::pipeline::Shared;
use super::{DeleteEntry, QueueBackend, RawMessage, SubscriberError};
use crate::BoxedError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Message delivered by a [`Subscriber`](super::Subscriber)
///
/// The message counts as in-flight until [`done`](Message::done) has been called. Until then the
/// backend will redeliver it once its visibility timeout expires, which can be postponed using
/// [`extend_done_deadline`](Message::extend_done_deadline).
pub struct Message<B> {
    raw: RawMessage,
    shared: Arc<Shared<B>>,
    acknowledged: AtomicBool,
}

impl<B: QueueBackend> Message<B> {
    pub(crate) fn new(raw: RawMessage, shared: Arc<Shared<B>>) -> Self {
        Self {
            raw,
            shared,
            acknowledged: AtomicBool::new(false),
        }
    }

    /// Payload of the message
    pub fn text(&self) -> &str {
        &self.raw.body
    }

    /// Identifier assigned by the backend
    pub fn id(&self) -> &str {
        &self.raw.id
    }

    /// Handle of this particular delivery
    pub fn receipt_handle(&self) -> &str {
        &self.raw.receipt_handle
    }

    /// Value of a string attribute attached by the publisher
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.raw.attributes.get(name).map(String::as_str)
    }

    /// All string attributes attached by the publisher
    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.raw.attributes
    }

    /// Attempts to parse the JSON payload into a given data structure
    pub fn parse_payload<'a, T>(&'a self) -> Result<T, BoxedError>
    where
        T: Deserialize<'a>,
    {
        serde_json::from_str(&self.raw.body).map_err(Into::into)
    }

    /// Postpones the redelivery of this message by the given duration, counted from now
    pub async fn extend_done_deadline(&self, timeout: Duration) -> Result<(), SubscriberError> {
        trace!(id = %self.raw.id, ?timeout, "Extending message deadline");

        self.shared
            .backend
            .change_visibility(&self.shared.queue_url, &self.raw.receipt_handle, timeout)
            .await
            .map_err(SubscriberError::visibility)
    }

    /// Acknowledges the message, removing it from the queue
    ///
    /// The request is handed to the deletion worker and this call returns once the worker replied.
    /// When deletes are buffered, the reply is sent before the entry of this message has necessarily been
    /// deleted and the returned result reflects the most recent bulk deletion, which may not contain this message.
    ///
    /// The message stops counting as in-flight once the first call completes, regardless of its outcome.
    /// Later calls resend the delete request (e.g. to retry after a failure) without touching the counter.
    pub async fn done(&self) -> Result<(), SubscriberError> {
        let (reply, response) = oneshot::channel();
        let request = DeleteRequest {
            entry: DeleteEntry {
                id: self.raw.id.clone(),
                receipt_handle: self.raw.receipt_handle.clone(),
            },
            reply,
        };

        trace!(id = %self.raw.id, "Acknowledging message");

        let result = match self.shared.deletes.send(request) {
            Ok(()) => response
                .await
                .unwrap_or(Err(SubscriberError::WorkerUnavailable)),
            Err(_) => Err(SubscriberError::WorkerUnavailable),
        };

        self.release();

        if let Err(e) = &result {
            warn!(id = %self.raw.id, error = %e, "Failed to acknowledge message");
        }

        result
    }

    fn release(&self) {
        if !self.acknowledged.swap(true, Ordering::SeqCst) {
            self.shared.state.release();
        }
    }
}

impl<B> fmt::Debug for Message<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.raw.id)
            .field("receipt_handle", &self.raw.receipt_handle)
            .field("body", &self.raw.body)
            .field("acknowledged", &self.acknowledged.load(Ordering::SeqCst))
            .finish()
    }
}
