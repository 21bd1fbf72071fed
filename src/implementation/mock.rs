//! Scripted in-memory backend which records every interaction

use crate::subscriber::{DeleteEntry, QueueBackend, RawMessage};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Creates a message whose id and body equal the given value
pub fn raw_message(id: &str) -> RawMessage {
    RawMessage {
        id: id.to_owned(),
        receipt_handle: format!("receipt-{}", id),
        body: id.to_owned(),
        attributes: HashMap::new(),
    }
}

/// Queue backend replaying scripted receive results
///
/// Every receive call pops the next scripted batch or failure. Once the script is exhausted, receive
/// calls wait for the requested timeout and return an empty batch, like a long poll on an idle queue.
#[derive(Default)]
pub struct MockQueueBackend {
    script: Mutex<VecDeque<Result<Vec<RawMessage>, String>>>,
    receives: Mutex<Vec<(String, usize, Duration)>>,
    deletes: Mutex<Vec<Vec<DeleteEntry>>>,
    visibility_changes: Mutex<Vec<(String, Duration)>>,
    resolutions: Mutex<Vec<(String, Option<String>)>>,
    delete_failure: Mutex<Option<String>>,
    visibility_failure: Mutex<Option<String>>,
    resolution_failure: Mutex<Option<String>>,
}

impl MockQueueBackend {
    /// Queues a batch to be returned by a receive call
    pub fn push_batch(&self, batch: Vec<RawMessage>) -> &Self {
        self.script.lock().unwrap().push_back(Ok(batch));
        self
    }

    /// Queues a failure to be returned by a receive call
    pub fn push_failure(&self, message: &str) -> &Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
        self
    }

    /// Makes all following delete calls fail
    pub fn fail_deletes(&self, message: &str) -> &Self {
        *self.delete_failure.lock().unwrap() = Some(message.to_owned());
        self
    }

    /// Makes delete calls succeed again
    pub fn allow_deletes(&self) -> &Self {
        *self.delete_failure.lock().unwrap() = None;
        self
    }

    /// Makes all following visibility changes fail
    pub fn fail_visibility_changes(&self, message: &str) -> &Self {
        *self.visibility_failure.lock().unwrap() = Some(message.to_owned());
        self
    }

    /// Makes all following queue url lookups fail
    pub fn fail_resolution(&self, message: &str) -> &Self {
        *self.resolution_failure.lock().unwrap() = Some(message.to_owned());
        self
    }

    /// Number of receive calls so far
    pub fn receive_count(&self) -> usize {
        self.receives.lock().unwrap().len()
    }

    /// Parameters of the most recent receive call
    pub fn last_receive(&self) -> Option<(String, usize, Duration)> {
        self.receives.lock().unwrap().last().cloned()
    }

    /// Message ids of every delete call, including failed ones
    pub fn deleted_batches(&self) -> Vec<Vec<String>> {
        self.deletes
            .lock()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(|entry| entry.id.clone()).collect())
            .collect()
    }

    /// Receipt handles and durations of every visibility change
    pub fn visibility_changes(&self) -> Vec<(String, Duration)> {
        self.visibility_changes.lock().unwrap().clone()
    }

    /// Names and owners of every queue url lookup
    pub fn resolutions(&self) -> Vec<(String, Option<String>)> {
        self.resolutions.lock().unwrap().clone()
    }

    /// Asserts that exactly the given batches of message ids have been deleted
    pub fn assert_deleted(&self, expected: &[&[&str]]) {
        let expected: Vec<Vec<String>> = expected
            .iter()
            .map(|batch| batch.iter().map(|id| id.to_string()).collect())
            .collect();

        assert_eq!(self.deleted_batches(), expected);
    }

    fn failure(slot: &Mutex<Option<String>>) -> EmptyResult {
        match &*slot.lock().unwrap() {
            Some(message) => Err(message.clone().into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl QueueBackend for MockQueueBackend {
    async fn resolve_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, BoxedError> {
        self.resolutions
            .lock()
            .unwrap()
            .push((name.to_owned(), owner_account_id.map(str::to_owned)));

        Self::failure(&self.resolution_failure)?;

        Ok(format!(
            "mock://{}/{}",
            owner_account_id.unwrap_or("000000000000"),
            name
        ))
    }

    async fn receive_batch(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<RawMessage>, BoxedError> {
        self.receives
            .lock()
            .unwrap()
            .push((queue_url.to_owned(), max_messages, wait_timeout));

        let next = self.script.lock().unwrap().pop_front();

        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(message.into()),
            None => {
                tokio::time::sleep(wait_timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_batch(&self, _queue_url: &str, entries: &[DeleteEntry]) -> EmptyResult {
        self.deletes.lock().unwrap().push(entries.to_vec());
        Self::failure(&self.delete_failure)
    }

    async fn change_visibility(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> EmptyResult {
        self.visibility_changes
            .lock()
            .unwrap()
            .push((receipt_handle.to_owned(), timeout));

        Self::failure(&self.visibility_failure)
    }
}
