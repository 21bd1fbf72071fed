use anyhow::Result;
use futures::StreamExt;
use options::{LogFormat, MainOptions};
use ranger_pubsub::implementation::sqs::SqsBackend;
use ranger_pubsub::subscriber::{Message, Subscriber};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

mod options;

#[tokio::main]
async fn main() -> Result<()> {
    let options = init();

    let backend = SqsBackend::from_options(&options.subscriber).await?;
    let subscriber = Subscriber::new(backend, &options.subscriber).await?;
    let mut messages = subscriber.start()?;

    let termination = termination_signal();
    tokio::pin!(termination);

    let mut received = 0;

    loop {
        tokio::select! {
            message = messages.next() => match message {
                Some(message) => {
                    handle(&options, message).await;
                    received += 1;

                    if options.limit.map_or(false, |limit| received >= limit) {
                        info!(received, "Message limit reached");
                        break;
                    }
                }
                None => break,
            },
            result = &mut termination => {
                result?;
                info!("Received termination signal");
                break;
            }
        }
    }

    if let Err(e) = subscriber.stop().await {
        warn!(error = %e, "Failed to stop subscriber");
    }

    subscriber.err()?;

    Ok(())
}

fn init() -> MainOptions {
    let options = MainOptions::from_args();

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(options.log.clone())
        .with_writer(std::io::stderr);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    info!("ranger-sqs {}", env!("CARGO_PKG_VERSION"));

    options
}

async fn handle(options: &MainOptions, message: Message<SqsBackend>) {
    if let Some(deadline) = options.extend {
        if let Err(e) = message.extend_done_deadline(deadline).await {
            warn!(id = message.id(), error = %e, "Failed to extend message deadline");
        }
    }

    println!("{}", message.text());

    if !options.no_ack {
        // Failures are logged by the message itself
        message.done().await.ok();
    }
}

async fn termination_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => Ok(()),
        result = tokio::signal::ctrl_c() => result,
    }
}
