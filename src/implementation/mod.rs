//! Trait implementations of the [`QueueBackend`](crate::subscriber::QueueBackend)

#[cfg(any(test, feature = "test"))]
pub mod mock;
pub mod sqs;
