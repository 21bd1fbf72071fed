//! Trait implementations using [Amazon SQS](https://aws.amazon.com/sqs/) through [`aws_sdk_sqs`]

use crate::subscriber::{
    DeleteEntry, QueueBackend, RawMessage, SubscriberError, SubscriberOptions,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::types::{BatchResultErrorEntry, DeleteMessageBatchRequestEntry, Message};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of entries SQS accepts in a single batch request
const MAX_BATCH_ENTRIES: usize = 10;
/// Maximum number of seconds a receive call may long-poll
const MAX_WAIT_SECONDS: u64 = 20;
/// Maximum visibility timeout of a message in seconds (12 hours)
const MAX_VISIBILITY_SECONDS: u64 = 43_200;
/// Requests all message attributes when receiving
const ALL_ATTRIBUTES: &str = "All";

#[derive(Debug, Error)]
enum SqsBackendError {
    #[error("queue url missing from response")]
    MissingQueueUrl,
    #[error("failed to delete {} of {total} messages: {}", .failures.len(), describe(.failures))]
    PartialDelete {
        total: usize,
        failures: Vec<DeleteFailure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeleteFailure {
    id: String,
    code: String,
    message: Option<String>,
}

fn describe(failures: &[DeleteFailure]) -> String {
    failures
        .iter()
        .map(|failure| match &failure.message {
            Some(message) => format!("{} ({}: {})", failure.id, failure.code, message),
            None => format!("{} ({})", failure.id, failure.code),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Queue backend for Amazon SQS and API compatible servers (e.g. ElasticMQ or LocalStack)
#[derive(Clone, Debug)]
pub struct SqsBackend {
    client: Client,
}

impl SqsBackend {
    /// Creates a new instance from a pre-configured client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a client for the configured region and endpoint using the default credential chain
    pub async fn from_options(options: &SubscriberOptions) -> Result<Self, SubscriberError> {
        let region = options
            .region
            .clone()
            .filter(|region| !region.is_empty())
            .ok_or(SubscriberError::MissingRegion)?;

        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(region));

        if let Some(endpoint) = &options.endpoint {
            debug!(%endpoint, "Using custom SQS endpoint");
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;

        Ok(Self::new(Client::new(&config)))
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn resolve_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, BoxedError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .set_queue_owner_aws_account_id(owner_account_id.map(str::to_owned))
            .send()
            .await?;

        output
            .queue_url()
            .map(str::to_owned)
            .ok_or_else(|| SqsBackendError::MissingQueueUrl.into())
    }

    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<RawMessage>, BoxedError> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(batch_size(max_messages))
            .wait_time_seconds(wait_seconds(wait_timeout))
            .message_attribute_names(ALL_ATTRIBUTES)
            .send()
            .await?;

        Ok(output.messages().iter().filter_map(to_raw_message).collect())
    }

    async fn delete_batch(&self, queue_url: &str, entries: &[DeleteEntry]) -> EmptyResult {
        let mut failures = Vec::new();

        for chunk in entries.chunks(MAX_BATCH_ENTRIES) {
            let request_entries = chunk
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(index.to_string())
                        .receipt_handle(&entry.receipt_handle)
                        .build()
                })
                .collect::<Result<Vec<_>, _>>()?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(queue_url)
                .set_entries(Some(request_entries))
                .send()
                .await?;

            failures.extend(map_failures(chunk, output.failed()));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SqsBackendError::PartialDelete {
                total: entries.len(),
                failures,
            }
            .into())
        }
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> EmptyResult {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_seconds(timeout))
            .send()
            .await?;

        Ok(())
    }
}

fn batch_size(max_messages: usize) -> i32 {
    max_messages.clamp(1, MAX_BATCH_ENTRIES) as i32
}

/// Rounds up so sub-second timeouts still long-poll instead of degrading to a short poll
fn wait_seconds(timeout: Duration) -> i32 {
    let seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    seconds.min(MAX_WAIT_SECONDS) as i32
}

fn visibility_seconds(timeout: Duration) -> i32 {
    timeout.as_secs().min(MAX_VISIBILITY_SECONDS) as i32
}

fn to_raw_message(message: &Message) -> Option<RawMessage> {
    let receipt_handle = match message.receipt_handle() {
        Some(handle) => handle.to_owned(),
        None => {
            warn!(id = ?message.message_id(), "Dropping message without receipt handle");
            return None;
        }
    };

    let attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .string_value()
                        .map(|value| (name.clone(), value.to_owned()))
                })
                .collect()
        })
        .unwrap_or_else(HashMap::new);

    Some(RawMessage {
        id: message.message_id().unwrap_or_default().to_owned(),
        receipt_handle,
        body: message.body().unwrap_or_default().to_owned(),
        attributes,
    })
}

/// Translates the index based batch entry ids back to message ids
fn map_failures(chunk: &[DeleteEntry], failed: &[BatchResultErrorEntry]) -> Vec<DeleteFailure> {
    failed
        .iter()
        .map(|failure| {
            let id = failure
                .id()
                .parse::<usize>()
                .ok()
                .and_then(|index| chunk.get(index))
                .map(|entry| entry.id.clone())
                .unwrap_or_else(|| failure.id().to_owned());

            DeleteFailure {
                id,
                code: failure.code().to_owned(),
                message: failure.message().map(str::to_owned),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::types::MessageAttributeValue;
    use pretty_assertions::assert_eq;

    fn entry(id: &str) -> DeleteEntry {
        DeleteEntry {
            id: id.to_owned(),
            receipt_handle: format!("receipt-{}", id),
        }
    }

    #[test]
    fn clamps_batch_size_to_sqs_limits() {
        assert_eq!(batch_size(0), 1);
        assert_eq!(batch_size(5), 5);
        assert_eq!(batch_size(25), 10);
    }

    #[test]
    fn clamps_wait_time_to_long_poll_maximum() {
        assert_eq!(wait_seconds(Duration::from_secs(2)), 2);
        assert_eq!(wait_seconds(Duration::from_secs(60)), 20);
    }

    #[test]
    fn rounds_sub_second_wait_time_up() {
        assert_eq!(wait_seconds(Duration::ZERO), 0);
        assert_eq!(wait_seconds(Duration::from_millis(500)), 1);
        assert_eq!(wait_seconds(Duration::from_millis(2500)), 3);
    }

    #[test]
    fn clamps_visibility_to_twelve_hours() {
        assert_eq!(visibility_seconds(Duration::from_secs(3600)), 3600);
        assert_eq!(visibility_seconds(Duration::from_secs(86_400)), 43_200);
    }

    #[test]
    fn converts_sdk_messages() {
        let message = Message::builder()
            .message_id("id-1")
            .receipt_handle("receipt-1")
            .body("hello")
            .message_attributes(
                "origin",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("billing")
                    .build()
                    .unwrap(),
            )
            .build();

        let raw = to_raw_message(&message).unwrap();

        assert_eq!(raw.id, "id-1");
        assert_eq!(raw.receipt_handle, "receipt-1");
        assert_eq!(raw.body, "hello");
        assert_eq!(raw.attributes.get("origin").map(String::as_str), Some("billing"));
    }

    #[test]
    fn skips_messages_without_receipt_handle() {
        let message = Message::builder().message_id("id-1").body("hello").build();

        assert!(to_raw_message(&message).is_none());
    }

    #[test]
    fn maps_failed_entries_back_to_message_ids() {
        let chunk = vec![entry("a"), entry("b"), entry("c")];
        let failed = vec![BatchResultErrorEntry::builder()
            .id("1")
            .code("ReceiptHandleIsInvalid")
            .sender_fault(true)
            .message("expired")
            .build()
            .unwrap()];

        assert_eq!(
            map_failures(&chunk, &failed),
            vec![DeleteFailure {
                id: "b".into(),
                code: "ReceiptHandleIsInvalid".into(),
                message: Some("expired".into()),
            }]
        );
    }

    #[test]
    fn describes_partial_failures() {
        let error = SqsBackendError::PartialDelete {
            total: 12,
            failures: vec![
                DeleteFailure {
                    id: "a".into(),
                    code: "InternalError".into(),
                    message: None,
                },
                DeleteFailure {
                    id: "b".into(),
                    code: "ReceiptHandleIsInvalid".into(),
                    message: Some("expired".into()),
                },
            ],
        };

        assert_eq!(
            error.to_string(),
            "failed to delete 2 of 12 messages: a (InternalError), b (ReceiptHandleIsInvalid: expired)"
        );
    }

    #[tokio::test]
    async fn requires_region() {
        let options = SubscriberOptions::with_queue_name("jobs");

        assert!(matches!(
            SqsBackend::from_options(&options).await,
            Err(SubscriberError::MissingRegion)
        ));
    }
}
