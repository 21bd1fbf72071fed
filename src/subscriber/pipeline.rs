use super::deletion::{DeleteRequest, DeletionWorker};
use super::receiver::{LastError, ReceiveLoop, StopRequest};
use super::state::PipelineState;
use super::{
    Message, QueueBackend, QueueTarget, SubscriberError, SubscriberOptions, SubscriberSettings,
};
use crate::backoff::{ConstantBackoff, RetryPolicy};
use futures::channel::mpsc as stream_channel;
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

/// State shared between the subscriber, its background tasks and every message handed out
pub(crate) struct Shared<B> {
    pub backend: Arc<B>,
    pub queue_url: Arc<str>,
    pub state: Arc<PipelineState>,
    pub deletes: mpsc::UnboundedSender<DeleteRequest>,
}

/// Receiving ends of the internal channels, consumed by [`Subscriber::start`]
struct Dormant {
    stop: mpsc::Receiver<StopRequest>,
    deletes: mpsc::UnboundedReceiver<DeleteRequest>,
}

/// Consumes a queue, handing out messages through a stream and deleting them in bulk once acknowledged
///
/// Dropping the subscriber halts receiving just like [`stop`](Subscriber::stop) would, messages already
/// handed out can still be acknowledged.
pub struct Subscriber<B> {
    shared: Arc<Shared<B>>,
    settings: SubscriberSettings,
    retry: Arc<dyn RetryPolicy>,
    stop: mpsc::Sender<StopRequest>,
    dormant: Mutex<Option<Dormant>>,
    last_error: LastError,
}

impl<B: QueueBackend> Subscriber<B> {
    /// Validates the options and resolves the queue url using the backend if only a name is provided
    ///
    /// Receive failures are retried at the configured sleep interval indefinitely, use
    /// [`with_retry_policy`](Subscriber::with_retry_policy) to change that.
    pub async fn new(backend: B, options: &SubscriberOptions) -> Result<Self, SubscriberError> {
        let (target, settings) = options.resolve()?;

        let queue_url = match target {
            QueueTarget::Url(url) => url,
            QueueTarget::Name {
                name,
                owner_account_id,
            } => {
                debug!(%name, "Resolving queue url");
                backend
                    .resolve_queue_url(&name, owner_account_id.as_deref())
                    .await
                    .map_err(|e| SubscriberError::resolution(&name, e))?
            }
        };

        info!(%queue_url, ?settings, "Created subscriber");

        Ok(Self::with_settings(backend, queue_url, settings))
    }

    /// Creates a new instance from raw parts without validation or resolution
    pub fn with_settings(backend: B, queue_url: String, settings: SubscriberSettings) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();

        let shared = Shared {
            backend: Arc::new(backend),
            queue_url: Arc::from(queue_url),
            state: Arc::new(PipelineState::default()),
            deletes: delete_tx,
        };

        let retry = Arc::new(ConstantBackoff::new(settings.sleep_interval));

        Self {
            shared: Arc::new(shared),
            settings,
            retry,
            stop: stop_tx,
            dormant: Mutex::new(Some(Dormant {
                stop: stop_rx,
                deletes: delete_rx,
            })),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the policy applied to consecutive receive failures
    ///
    /// Once the policy gives up, the message stream is closed and [`err`](Subscriber::err) reports the last failure.
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// Url of the consumed queue
    pub fn queue_url(&self) -> &str {
        &self.shared.queue_url
    }

    /// Tunables in effect
    pub fn settings(&self) -> &SubscriberSettings {
        &self.settings
    }

    /// Number of messages handed out but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.shared.state.in_flight()
    }

    /// Spawns the receive loop and the deletion worker, returning the stream of received messages
    ///
    /// The stream is unbuffered: receiving pauses until the consumer picks up the current message.
    /// It ends once the subscriber has been stopped, a message still pending at that point is dropped
    /// and redelivered by the backend after its visibility timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<BoxStream<'static, Message<B>>, SubscriberError> {
        if self.shared.state.is_stopped() {
            return Err(SubscriberError::AlreadyStopped);
        }

        let dormant = self
            .dormant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(SubscriberError::AlreadyStarted)?;

        let (output, messages) = stream_channel::channel(0);

        let worker = DeletionWorker::new(
            self.shared.backend.clone(),
            self.shared.queue_url.clone(),
            self.shared.state.clone(),
            self.settings.delete_buffer_size,
            dormant.deletes,
        );

        let receiver = ReceiveLoop::new(
            self.shared.clone(),
            self.settings.clone(),
            self.retry.clone(),
            dormant.stop,
            output,
            self.last_error.clone(),
        );

        tokio::spawn(worker.run());
        tokio::spawn(receiver.run());

        info!(queue_url = %self.shared.queue_url, "Started subscriber");

        // Messages count as in-flight once accepted, whatever is still waiting once stopped is never handed out
        let state = self.shared.state.clone();
        let messages = messages.take_while(move |message| {
            let open = !state.is_stopped();

            if open {
                state.acquire();
            } else {
                trace!(id = message.id(), "Discarding undelivered message");
            }

            future::ready(open)
        });

        Ok(messages.boxed())
    }

    /// Halts receiving and waits for the receive loop to terminate
    ///
    /// Does not wait for in-flight messages, they may still be acknowledged afterwards.
    /// Calling this more than once returns [`SubscriberError::AlreadyStopped`].
    pub async fn stop(&self) -> Result<(), SubscriberError> {
        if !self.shared.state.mark_stopped() {
            return Err(SubscriberError::AlreadyStopped);
        }

        let never_started = self
            .dormant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some();

        if never_started {
            info!("Stopped subscriber before it was started");
            return Ok(());
        }

        let (reply, acknowledgement) = oneshot::channel();

        // Either channel closing means the receive loop has already terminated on its own
        if self.stop.send(reply).await.is_ok() {
            acknowledgement.await.ok();
        }

        info!(in_flight = self.in_flight(), "Stopped subscriber");

        Ok(())
    }

    /// Last receive error, to be checked once the message stream has ended
    pub fn err(&self) -> Result<(), SubscriberError> {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match &*last_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use crate::implementation::mock::{raw_message, MockQueueBackend};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;

    const QUEUE_URL: &str = "https://sqs.eu-central-1.amazonaws.com/123456789012/jobs";
    const PATIENCE: Duration = Duration::from_secs(5);

    fn options(delete_buffer_size: usize) -> SubscriberOptions {
        SubscriberOptions {
            receive_timeout: Some(Duration::from_millis(5)),
            sleep_interval: Some(Duration::from_millis(5)),
            delete_buffer_size: Some(delete_buffer_size),
            ..SubscriberOptions::with_queue_url(QUEUE_URL)
        }
    }

    async fn subscriber(
        backend: &Arc<MockQueueBackend>,
        delete_buffer_size: usize,
    ) -> Subscriber<Arc<MockQueueBackend>> {
        Subscriber::new(backend.clone(), &options(delete_buffer_size))
            .await
            .unwrap()
    }

    async fn next<S>(stream: &mut S) -> Option<S::Item>
    where
        S: futures::Stream + Unpin,
    {
        timeout(PATIENCE, stream.next())
            .await
            .expect("timed out waiting for the message stream")
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        timeout(PATIENCE, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition was not met in time")
    }

    #[tokio::test]
    async fn uses_explicit_url_without_resolving() {
        let backend = Arc::new(MockQueueBackend::default());
        let subscriber = subscriber(&backend, 0).await;

        assert_eq!(subscriber.queue_url(), QUEUE_URL);
        assert!(backend.resolutions().is_empty());
    }

    #[tokio::test]
    async fn resolves_queue_name() {
        let backend = Arc::new(MockQueueBackend::default());
        let options = SubscriberOptions {
            queue_owner_account_id: Some("123456789012".into()),
            ..SubscriberOptions::with_queue_name("jobs")
        };

        let subscriber = Subscriber::new(backend.clone(), &options).await.unwrap();

        assert_eq!(subscriber.queue_url(), "mock://123456789012/jobs");
        assert_eq!(
            backend.resolutions(),
            vec![("jobs".to_string(), Some("123456789012".to_string()))]
        );
    }

    #[tokio::test]
    async fn fails_on_resolution_error() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.fail_resolution("queue does not exist");

        let options = SubscriberOptions::with_queue_name("jobs");
        let result = Subscriber::new(backend.clone(), &options).await;

        match result {
            Err(SubscriberError::Resolution { name, .. }) => assert_eq!(name, "jobs"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn fails_without_queue() {
        let backend = Arc::new(MockQueueBackend::default());

        let result = Subscriber::new(backend, &SubscriberOptions::default()).await;

        assert!(matches!(result, Err(SubscriberError::MissingQueue)));
    }

    #[tokio::test]
    async fn delivers_batches_in_order_and_stops() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a"), raw_message("b")]);
        backend.push_batch(vec![raw_message("c"), raw_message("d")]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();
        let mut received = Vec::new();

        for _ in 0..4 {
            let message = next(&mut messages).await.unwrap();
            message.done().await.unwrap();
            received.push(message.text().to_owned());
        }

        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        assert!(next(&mut messages).await.is_none());
        assert_eq!(received, vec!["a", "b", "c", "d"]);
        backend.assert_deleted(&[&["a"], &["b"], &["c"], &["d"]]);
        assert_eq!(subscriber.in_flight(), 0);
        assert!(subscriber.err().is_ok());
    }

    #[tokio::test]
    async fn counts_delivered_messages_as_in_flight() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a"), raw_message("b"), raw_message("c")]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(next(&mut messages).await.unwrap());
        }

        assert_eq!(subscriber.in_flight(), 3);

        held[1].done().await.unwrap();
        assert_eq!(subscriber.in_flight(), 2);
    }

    #[tokio::test]
    async fn done_releases_message_even_if_delete_fails() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a")]);
        backend.fail_deletes("access denied");

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();
        let message = next(&mut messages).await.unwrap();

        assert_eq!(subscriber.in_flight(), 1);
        assert!(matches!(
            message.done().await,
            Err(SubscriberError::Delete(_))
        ));
        assert_eq!(subscriber.in_flight(), 0);

        // Retrying resends the delete but does not release twice
        backend.allow_deletes();
        message.done().await.unwrap();
        assert_eq!(subscriber.in_flight(), 0);
        assert_eq!(backend.deleted_batches().len(), 2);
    }

    #[tokio::test]
    async fn buffers_deletes_until_threshold_is_exceeded() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch((0..5).map(|i| raw_message(&i.to_string())).collect());

        let subscriber = subscriber(&backend, 2).await;
        let mut messages = subscriber.start().unwrap();

        for _ in 0..2 {
            next(&mut messages).await.unwrap().done().await.unwrap();
        }
        assert!(backend.deleted_batches().is_empty());

        next(&mut messages).await.unwrap().done().await.unwrap();
        assert_eq!(
            backend.deleted_batches(),
            vec![vec!["0".to_string(), "1".to_string(), "2".to_string()]]
        );

        next(&mut messages).await.unwrap().done().await.unwrap();
        assert_eq!(backend.deleted_batches().len(), 1);
    }

    #[tokio::test]
    async fn drains_buffer_when_last_message_is_acknowledged_after_stop() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a"), raw_message("b")]);

        let subscriber = subscriber(&backend, 10).await;
        let mut messages = subscriber.start().unwrap();

        let first = next(&mut messages).await.unwrap();
        let second = next(&mut messages).await.unwrap();

        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        first.done().await.unwrap();
        assert!(backend.deleted_batches().is_empty());

        second.done().await.unwrap();
        assert_eq!(
            backend.deleted_batches(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[tokio::test]
    async fn drains_buffer_while_a_message_is_still_pending_in_the_stream() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a"), raw_message("b"), raw_message("c")]);

        let subscriber = subscriber(&backend, 10).await;
        let mut messages = subscriber.start().unwrap();

        let first = next(&mut messages).await.unwrap();
        let second = next(&mut messages).await.unwrap();

        // The third message waits in the stream without being picked up
        assert_eq!(subscriber.in_flight(), 2);

        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        first.done().await.unwrap();
        second.done().await.unwrap();

        assert_eq!(subscriber.in_flight(), 0);
        backend.assert_deleted(&[&["a", "b"]]);
    }

    #[tokio::test]
    async fn flushes_remaining_deletes_once_everything_is_dropped() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a")]);

        let subscriber = subscriber(&backend, 10).await;
        let mut messages = subscriber.start().unwrap();

        let message = next(&mut messages).await.unwrap();
        message.done().await.unwrap();
        assert!(backend.deleted_batches().is_empty());

        drop(message);
        drop(messages);
        drop(subscriber);

        eventually(|| backend.deleted_batches() == vec![vec!["a".to_string()]]).await;
    }

    #[tokio::test]
    async fn attempts_final_flush_even_if_it_fails() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a")]);
        backend.fail_deletes("service unavailable");

        let subscriber = subscriber(&backend, 10).await;
        let mut messages = subscriber.start().unwrap();

        // Buffered, the reply reflects the previous (empty) flush
        let message = next(&mut messages).await.unwrap();
        message.done().await.unwrap();

        drop(message);
        drop(messages);
        drop(subscriber);

        eventually(|| backend.deleted_batches() == vec![vec!["a".to_string()]]).await;
    }

    #[tokio::test]
    async fn keeps_receiving_after_transient_errors() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_failure("throttled 1");
        backend.push_failure("throttled 2");
        backend.push_failure("throttled 3");
        backend.push_batch(vec![raw_message("a")]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();

        let message = next(&mut messages).await.unwrap();
        assert_eq!(message.text(), "a");
        assert!(backend.receive_count() >= 4);

        message.done().await.unwrap();
        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();
        assert!(next(&mut messages).await.is_none());

        match subscriber.err() {
            Err(SubscriberError::Receive(error)) => assert_eq!(error.to_string(), "throttled 3"),
            other => panic!("unexpected error state {:?}", other),
        }
    }

    #[tokio::test]
    async fn closes_stream_once_retry_policy_gives_up() {
        let backend = Arc::new(MockQueueBackend::default());
        for attempt in 0..3 {
            backend.push_failure(&format!("unreachable {}", attempt));
        }
        backend.push_batch(vec![raw_message("never delivered")]);

        let subscriber = subscriber(&backend, 0)
            .await
            .with_retry_policy(ConstantBackoff::new(Duration::from_millis(1)).with_limit(2));
        let mut messages = subscriber.start().unwrap();

        assert!(next(&mut messages).await.is_none());
        assert_eq!(backend.receive_count(), 3);
        assert!(matches!(subscriber.err(), Err(SubscriberError::Receive(_))));

        // The receive loop is gone already, stopping must not block
        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_stop_fails_without_blocking() {
        let backend = Arc::new(MockQueueBackend::default());
        let subscriber = subscriber(&backend, 0).await;
        let _messages = subscriber.start().unwrap();

        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        let second = timeout(PATIENCE, subscriber.stop()).await.unwrap();
        assert!(matches!(second, Err(SubscriberError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn stop_interrupts_a_blocked_delivery() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a"), raw_message("b")]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();

        let first = next(&mut messages).await.unwrap();
        assert_eq!(subscriber.in_flight(), 1);

        // Nobody picks up the second message, stopping must not wait for that
        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        // The pending message is discarded instead of being handed out after the stop
        assert!(next(&mut messages).await.is_none());
        assert_eq!(subscriber.in_flight(), 1);

        first.done().await.unwrap();
        assert_eq!(subscriber.in_flight(), 0);
        backend.assert_deleted(&[&["a"]]);
    }

    #[tokio::test]
    async fn can_only_be_started_once() {
        let backend = Arc::new(MockQueueBackend::default());
        let subscriber = subscriber(&backend, 0).await;

        let _messages = subscriber.start().unwrap();

        assert!(matches!(
            subscriber.start(),
            Err(SubscriberError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn stopping_before_start_returns_immediately() {
        let backend = Arc::new(MockQueueBackend::default());
        let subscriber = subscriber(&backend, 0).await;

        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        assert!(matches!(
            subscriber.start(),
            Err(SubscriberError::AlreadyStopped)
        ));
        assert_eq!(backend.receive_count(), 0);
    }

    #[tokio::test]
    async fn extends_deadline_without_touching_in_flight() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a")]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();
        let message = next(&mut messages).await.unwrap();

        message
            .extend_done_deadline(Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(
            backend.visibility_changes(),
            vec![(
                message.receipt_handle().to_owned(),
                Duration::from_secs(3600)
            )]
        );
        assert_eq!(subscriber.in_flight(), 1);
        assert!(backend.deleted_batches().is_empty());
    }

    #[tokio::test]
    async fn reports_visibility_errors() {
        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message("a")]);
        backend.fail_visibility_changes("receipt handle expired");

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();
        let message = next(&mut messages).await.unwrap();

        match message.extend_done_deadline(Duration::from_secs(30)).await {
            Err(SubscriberError::Visibility(error)) => {
                assert_eq!(error.to_string(), "receipt handle expired")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn passes_settings_to_backend() {
        let backend = Arc::new(MockQueueBackend::default());
        let options = SubscriberOptions {
            max_messages: Some(3),
            ..options(0)
        };

        let subscriber = Subscriber::new(backend.clone(), &options).await.unwrap();
        let _messages = subscriber.start().unwrap();

        eventually(|| backend.receive_count() > 0).await;
        timeout(PATIENCE, subscriber.stop()).await.unwrap().unwrap();

        let (queue_url, max_messages, wait_timeout) = backend.last_receive().unwrap();
        assert_eq!(queue_url, QUEUE_URL);
        assert_eq!(max_messages, 3);
        assert_eq!(wait_timeout, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn parses_json_payloads() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Job {
            id: u32,
        }

        let backend = Arc::new(MockQueueBackend::default());
        backend.push_batch(vec![raw_message(r#"{ "id": 42 }"#)]);

        let subscriber = subscriber(&backend, 0).await;
        let mut messages = subscriber.start().unwrap();
        let message = next(&mut messages).await.unwrap();

        assert_eq!(message.parse_payload::<Job>().unwrap(), Job { id: 42 });
        assert!(message.parse_payload::<Vec<u8>>().is_err());
    }
}
