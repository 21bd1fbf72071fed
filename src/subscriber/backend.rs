use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Message record as returned by a [`QueueBackend`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Identifier assigned by the backend
    pub id: String,
    /// Handle which identifies this particular delivery, required for deletion and visibility changes
    pub receipt_handle: String,
    /// Payload of the message
    pub body: String,
    /// String attributes attached by the publisher
    pub attributes: HashMap<String, String>,
}

/// Reference to a delivered message that should be removed from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    /// Identifier of the message
    pub id: String,
    /// Handle of the delivery to remove
    pub receipt_handle: String,
}

/// Queue which provides messages in batches and allows them to be removed once processed
///
/// Implementations have to be safe for concurrent use as the receiving task, the deletion worker and
/// any number of message handles will call into them at the same time.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Looks up the address of a queue by its name, optionally owned by another account
    async fn resolve_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, BoxedError>;

    /// Retrieves up to `max_messages`, waiting at most `wait_timeout` for any to arrive
    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<RawMessage>, BoxedError>;

    /// Removes all given deliveries from the queue
    async fn delete_batch(&self, queue_url: &str, entries: &[DeleteEntry]) -> EmptyResult;

    /// Hides a delivery from other consumers for the given duration, starting now
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> EmptyResult;
}

#[async_trait]
impl<B: QueueBackend + ?Sized> QueueBackend for Arc<B> {
    async fn resolve_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, BoxedError> {
        (**self).resolve_queue_url(name, owner_account_id).await
    }

    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<RawMessage>, BoxedError> {
        (**self)
            .receive_batch(queue_url, max_messages, wait_timeout)
            .await
    }

    async fn delete_batch(&self, queue_url: &str, entries: &[DeleteEntry]) -> EmptyResult {
        (**self).delete_batch(queue_url, entries).await
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> EmptyResult {
        (**self)
            .change_visibility(queue_url, receipt_handle, timeout)
            .await
    }
}
