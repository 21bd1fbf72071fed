//! Structures to consume a message queue with batched acknowledgements
//!
//! A [`Subscriber`] pulls messages from a [`QueueBackend`] in batches and hands them out one at a time
//! through a stream. Every message handed out is considered _in-flight_ until the application calls
//! [`Message::done`], at which point a delete request is passed to a background worker. The worker
//! accumulates these requests and removes them from the queue in bulk once more than
//! [`delete_buffer_size`](SubscriberSettings::delete_buffer_size) requests are pending. With the default
//! buffer size of zero, every acknowledgement is flushed immediately.
//!
//! Receiving is halted by calling [`Subscriber::stop`]. This does not wait for in-flight messages,
//! acknowledgements that arrive later are still processed. When the last in-flight message of a stopped
//! subscriber is acknowledged, the delete buffer is flushed right away. Any leftovers are flushed once
//! the subscriber and all of its messages have been dropped.
//!
//! ```ignore
//! let backend = SqsBackend::from_options(&options).await?;
//! let subscriber = Subscriber::new(backend, &options).await?;
//! let mut messages = subscriber.start()?;
//!
//! while let Some(message) = messages.next().await {
//!     println!("{}", message.text());
//!     message.done().await?;
//! }
//!
//! subscriber.err()?;
//! ```

mod backend;
mod deletion;
mod error;
mod message;
mod options;
mod pipeline;
mod receiver;
mod state;

pub use backend::*;
pub use error::*;
pub use message::*;
pub use options::*;
pub use pipeline::*;
