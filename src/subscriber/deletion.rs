use super::state::PipelineState;
use super::{DeleteEntry, QueueBackend, SubscriberError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Acknowledgement of a single message on its way to the deletion worker
pub(crate) struct DeleteRequest {
    pub entry: DeleteEntry,
    pub reply: oneshot::Sender<Result<(), SubscriberError>>,
}

/// Background task accumulating acknowledgements and deleting them in bulk
///
/// The worker runs until every sender of the request channel has been dropped, i.e. the subscriber
/// and all messages it handed out are gone. Whatever is left in the buffer at that point is flushed.
/// Nobody is left to receive the outcome of that final flush, so a failure is only logged and the
/// affected messages reappear once their visibility timeout expires.
pub(crate) struct DeletionWorker<B> {
    backend: Arc<B>,
    queue_url: Arc<str>,
    state: Arc<PipelineState>,
    buffer_size: usize,
    requests: mpsc::UnboundedReceiver<DeleteRequest>,
}

impl<B: QueueBackend> DeletionWorker<B> {
    pub fn new(
        backend: Arc<B>,
        queue_url: Arc<str>,
        state: Arc<PipelineState>,
        buffer_size: usize,
        requests: mpsc::UnboundedReceiver<DeleteRequest>,
    ) -> Self {
        Self {
            backend,
            queue_url,
            state,
            buffer_size,
            requests,
        }
    }

    pub async fn run(mut self) {
        let mut buffer: Vec<DeleteEntry> = Vec::new();
        let mut last_flush: Result<(), SubscriberError> = Ok(());

        while let Some(request) = self.requests.recv().await {
            buffer.push(request.entry);

            // The last acknowledgement of a stopped subscriber would never fill the buffer again
            let draining = self.state.is_draining_last();

            if draining || buffer.len() > self.buffer_size {
                if draining {
                    debug!(pending = buffer.len(), "Draining delete buffer");
                }

                last_flush = self.flush(&mut buffer).await;
            }

            // Nobody waiting for the result is fine
            request.reply.send(last_flush.clone()).ok();
        }

        if !buffer.is_empty() {
            debug!(pending = buffer.len(), "Flushing remaining deletes");

            if let Err(e) = self.flush(&mut buffer).await {
                warn!(error = %e, "Failed to flush remaining deletes");
            }
        }

        debug!("Deletion worker terminated");
    }

    async fn flush(&self, buffer: &mut Vec<DeleteEntry>) -> Result<(), SubscriberError> {
        let result = self
            .backend
            .delete_batch(&self.queue_url, buffer.as_slice())
            .await
            .map_err(SubscriberError::delete);

        match &result {
            Ok(()) => debug!(count = buffer.len(), "Deleted messages"),
            Err(e) => warn!(count = buffer.len(), error = %e, "Failed to delete messages"),
        }

        buffer.clear();
        result
    }
}
