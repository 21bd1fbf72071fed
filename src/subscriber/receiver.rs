use super::pipeline::Shared;
use super::{Message, QueueBackend, RawMessage, SubscriberError, SubscriberSettings};
use crate::backoff::RetryPolicy;
use futures::channel::mpsc::Sender;
use futures::SinkExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

/// Request to halt receiving, answered once the receive loop terminated
pub(crate) type StopRequest = oneshot::Sender<()>;

/// Most recent receive error, shared with the [`Subscriber`](super::Subscriber)
pub(crate) type LastError = Arc<Mutex<Option<SubscriberError>>>;

type Schedule = Box<dyn Iterator<Item = Duration> + Send>;

/// Producer task pulling batches from the backend and feeding them into the message stream
pub(crate) struct ReceiveLoop<B> {
    shared: Arc<Shared<B>>,
    settings: SubscriberSettings,
    retry: Arc<dyn RetryPolicy>,
    stop: mpsc::Receiver<StopRequest>,
    output: Sender<Message<B>>,
    last_error: LastError,
}

impl<B: QueueBackend> ReceiveLoop<B> {
    pub fn new(
        shared: Arc<Shared<B>>,
        settings: SubscriberSettings,
        retry: Arc<dyn RetryPolicy>,
        stop: mpsc::Receiver<StopRequest>,
        output: Sender<Message<B>>,
        last_error: LastError,
    ) -> Self {
        Self {
            shared,
            settings,
            retry,
            stop,
            output,
            last_error,
        }
    }

    /// Runs receive cycles until a stop is requested, the retry policy gives up or the stream is dropped
    pub async fn run(mut self) {
        let mut schedule: Option<Schedule> = None;

        loop {
            match self.stop.try_recv() {
                Ok(reply) => {
                    reply.send(()).ok();
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let result = self
                .shared
                .backend
                .receive_batch(
                    &self.shared.queue_url,
                    self.settings.max_messages,
                    self.settings.receive_timeout,
                )
                .await;

            let proceed = match result {
                Err(e) => {
                    let error = SubscriberError::receive(e);
                    warn!(error = %error, "Failed to receive messages");
                    self.record(error);

                    let retry = &self.retry;
                    match schedule.get_or_insert_with(|| retry.schedule()).next() {
                        Some(delay) => self.pause(delay).await,
                        None => {
                            error!("Giving up after repeated receive failures");
                            false
                        }
                    }
                }
                Ok(batch) if batch.is_empty() => {
                    schedule = None;
                    trace!("Received empty batch");
                    self.pause(self.settings.sleep_interval).await
                }
                Ok(batch) => {
                    schedule = None;
                    debug!(count = batch.len(), "Received messages");
                    self.deliver(batch).await
                }
            };

            if !proceed {
                break;
            }
        }

        debug!("Receive loop terminated");
    }

    /// Hands out messages one by one, waiting for the consumer to pick each of them up
    async fn deliver(&mut self, batch: Vec<RawMessage>) -> bool {
        for raw in batch {
            let message = Message::new(raw, self.shared.clone());

            // Not counted as in-flight until the consumer takes it from the stream
            if self.output.feed(message).await.is_err() {
                debug!("Message stream has been dropped");
                return false;
            }

            tokio::select! {
                _ = self.output.flush() => {},
                request = self.stop.recv() => {
                    acknowledge(request);
                    return false;
                }
            }
        }

        true
    }

    /// Sleeps for the given duration unless a stop is requested in the meantime
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            request = self.stop.recv() => {
                acknowledge(request);
                false
            }
        }
    }

    fn record(&self, error: SubscriberError) {
        let mut last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        *last_error = Some(error);
    }
}

fn acknowledge(request: Option<StopRequest>) {
    if let Some(reply) = request {
        reply.send(()).ok();
    }
}
