use ranger_pubsub::subscriber::{parse_seconds, SubscriberOptions};
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Tails an SQS queue, printing and acknowledging every message.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        default_value = "info,aws_config=warn,aws_smithy_runtime=warn,hyper=warn",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Output format of log messages
    #[structopt(
        long,
        default_value = "text",
        possible_values = &["text", "compact", "json"],
        value_name = "format"
    )]
    pub log_format: LogFormat,

    /// Leave messages in the queue instead of acknowledging them
    #[structopt(long)]
    pub no_ack: bool,

    /// Seconds by which the deadline of every message is extended before it is printed
    #[structopt(long, parse(try_from_str = parse_seconds), value_name = "seconds")]
    pub extend: Option<Duration>,

    /// Exit after the given number of messages
    #[structopt(short = "n", long, value_name = "count")]
    pub limit: Option<usize>,

    #[structopt(flatten)]
    pub subscriber: SubscriberOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {}", other)),
        }
    }
}
