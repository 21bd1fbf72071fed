use super::SubscriberError;
use serde::{Deserialize, Deserializer};
use std::num::ParseIntError;
use std::time::Duration;
use structopt::StructOpt;

/// Number of messages requested per receive call if nothing else is configured
pub const DEFAULT_MAX_MESSAGES: usize = 10;
/// Time a receive call may wait for messages to arrive if nothing else is configured
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause after an empty receive if nothing else is configured
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(2);
/// Number of acknowledgements kept back before deleting in bulk, zero deletes immediately
pub const DEFAULT_DELETE_BUFFER_SIZE: usize = 0;

/// Options to locate a queue and tune the consumption of it
///
/// Every tunable is optional, unset values (or zeroes) are replaced with the `DEFAULT_*` constants
/// when the options are [resolved](SubscriberOptions::resolve). The options can be parsed from the
/// command line (with environment fallbacks) or deserialized from a configuration file where
/// durations are given in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, StructOpt, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriberOptions {
    /// Region in which the queue is hosted
    #[structopt(long, env = "AWS_REGION", value_name = "region")]
    pub region: Option<String>,

    /// Custom endpoint of the queue service, useful for local emulators
    #[structopt(long, env = "SQS_ENDPOINT", value_name = "url")]
    pub endpoint: Option<String>,

    /// Name of the queue, resolved to an url on startup
    #[structopt(long, env = "SQS_QUEUE_NAME", value_name = "name")]
    pub queue_name: Option<String>,

    /// Url of the queue, takes precedence over the name
    #[structopt(long, env = "SQS_QUEUE_URL", value_name = "url")]
    pub queue_url: Option<String>,

    /// Account which owns the queue if it differs from the current one
    #[structopt(long, env = "SQS_QUEUE_OWNER", value_name = "account")]
    pub queue_owner_account_id: Option<String>,

    /// Maximum number of messages retrieved per receive call
    #[structopt(long, env = "SQS_MAX_MESSAGES", value_name = "count")]
    pub max_messages: Option<usize>,

    /// Seconds a receive call may wait for messages to arrive
    #[structopt(long, env = "SQS_RECEIVE_TIMEOUT", parse(try_from_str = parse_seconds), value_name = "seconds")]
    #[serde(deserialize_with = "optional_seconds")]
    pub receive_timeout: Option<Duration>,

    /// Seconds to pause after an empty or failed receive call
    #[structopt(long, env = "SQS_SLEEP_INTERVAL", parse(try_from_str = parse_seconds), value_name = "seconds")]
    #[serde(deserialize_with = "optional_seconds")]
    pub sleep_interval: Option<Duration>,

    /// Number of acknowledgements to hold back before deleting them in bulk
    #[structopt(long, env = "SQS_DELETE_BUFFER_SIZE", value_name = "count")]
    pub delete_buffer_size: Option<usize>,
}

/// Location of a queue as given by the [`SubscriberOptions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueTarget {
    /// Fully qualified url, used as-is
    Url(String),
    /// Name which has to be resolved by the backend
    Name {
        /// Name of the queue
        name: String,
        /// Account owning the queue
        owner_account_id: Option<String>,
    },
}

/// Validated tunables of a [`Subscriber`](super::Subscriber), immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSettings {
    /// Maximum number of messages retrieved per receive call
    pub max_messages: usize,
    /// Time a receive call may wait for messages to arrive
    pub receive_timeout: Duration,
    /// Pause after an empty receive call
    pub sleep_interval: Duration,
    /// Number of acknowledgements to hold back before deleting them in bulk
    pub delete_buffer_size: usize,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            delete_buffer_size: DEFAULT_DELETE_BUFFER_SIZE,
        }
    }
}

impl SubscriberOptions {
    /// Creates options pointing to a queue by its url
    pub fn with_queue_url(url: impl Into<String>) -> Self {
        Self {
            queue_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Creates options pointing to a queue by its name
    pub fn with_queue_name(name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Validates the options and applies the defaults for unset values
    pub fn resolve(&self) -> Result<(QueueTarget, SubscriberSettings), SubscriberError> {
        let target = self.target()?;
        let defaults = SubscriberSettings::default();

        let settings = SubscriberSettings {
            max_messages: self
                .max_messages
                .filter(|count| *count > 0)
                .unwrap_or(defaults.max_messages),
            receive_timeout: self
                .receive_timeout
                .filter(|timeout| !timeout.is_zero())
                .unwrap_or(defaults.receive_timeout),
            sleep_interval: self
                .sleep_interval
                .filter(|interval| !interval.is_zero())
                .unwrap_or(defaults.sleep_interval),
            delete_buffer_size: self
                .delete_buffer_size
                .unwrap_or(defaults.delete_buffer_size),
        };

        Ok((target, settings))
    }

    fn target(&self) -> Result<QueueTarget, SubscriberError> {
        let non_empty = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());

        if let Some(url) = non_empty(&self.queue_url) {
            return Ok(QueueTarget::Url(url));
        }

        match non_empty(&self.queue_name) {
            Some(name) => Ok(QueueTarget::Name {
                name,
                owner_account_id: non_empty(&self.queue_owner_account_id),
            }),
            None => Err(SubscriberError::MissingQueue),
        }
    }
}

/// Parses a Duration from a string containing seconds.
/// Useful for command line parsing
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}

fn optional_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds: Option<f64> = Option::deserialize(deserializer)?;

    match seconds {
        Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
            Ok(Some(Duration::from_secs_f64(seconds)))
        }
        Some(seconds) => Err(serde::de::Error::custom(format!(
            "invalid number of seconds: {}",
            seconds
        ))),
        None => Ok(None),
    }
}
