//! This library crate contains a queue subscriber pipeline and the backends it can run on.
//!
//! Submodules have been introduced to split responsibilities. The [`subscriber`] module contains the
//! backend agnostic message lifecycle (receiving, in-flight tracking, batched acknowledgement and
//! graceful shutdown), [`implementation`] provides the concrete queue backends and [`backoff`]
//! holds the retry schedules used when a backend misbehaves.

#![deny(missing_docs)]

pub mod backoff;
pub mod implementation;
pub mod subscriber;

/// Generic error type
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result with no value and a [`BoxedError`]
pub type EmptyResult = Result<(), BoxedError>;
