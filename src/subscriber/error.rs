use crate::BoxedError;
use std::error::Error;
use std::sync::Arc;
use thiserror::Error;

/// Backend error which may be handed to more than one caller
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Errors raised while constructing or operating a [`Subscriber`](super::Subscriber)
#[derive(Debug, Clone, Error)]
pub enum SubscriberError {
    /// Neither a queue name nor a queue url has been configured
    #[error("either a queue name or a queue url is required")]
    MissingQueue,
    /// The backend requires a region but none has been configured
    #[error("no region configured")]
    MissingRegion,
    /// The queue name could not be resolved to an url
    #[error("unable to resolve url of queue {name}: {source}")]
    Resolution {
        /// Name of the queue that was looked up
        name: String,
        /// Error reported by the backend
        source: SharedError,
    },
    /// Receiving a batch of messages failed
    #[error("failed to receive messages: {0}")]
    Receive(SharedError),
    /// Removing acknowledged messages from the queue failed
    #[error("failed to delete messages: {0}")]
    Delete(SharedError),
    /// Extending the visibility timeout of a message failed
    #[error("failed to extend message deadline: {0}")]
    Visibility(SharedError),
    /// [`start`](super::Subscriber::start) has been called before
    #[error("subscriber has already been started")]
    AlreadyStarted,
    /// [`stop`](super::Subscriber::stop) has been called before
    #[error("subscriber has already been stopped")]
    AlreadyStopped,
    /// The deletion worker terminated unexpectedly
    #[error("deletion worker is not running")]
    WorkerUnavailable,
}

impl SubscriberError {
    pub(crate) fn resolution(name: &str, source: BoxedError) -> Self {
        Self::Resolution {
            name: name.to_owned(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn receive(source: BoxedError) -> Self {
        Self::Receive(Arc::from(source))
    }

    pub(crate) fn delete(source: BoxedError) -> Self {
        Self::Delete(Arc::from(source))
    }

    pub(crate) fn visibility(source: BoxedError) -> Self {
        Self::Visibility(Arc::from(source))
    }
}
