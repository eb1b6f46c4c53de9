// Pub/sub demo: an in-process hub, one consumer and one producer exchanging
// log events and channel messages.
use anyhow::{Context, Result};
use clap::Parser;
use logbus_client::{Appender, ChannelSubscriber, ClientConfig, InProcessHub, SocketClient};
use logbus_common::LoggingParameters;
use logbus_wire::{ChannelMessage, Channels, DefaultLogEvent, Level, LoggingMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pubsub-demo")]
#[command(about = "Publish log events and channel messages through an in-process logbus hub")]
struct Args {
    /// Number of log events the producer publishes
    #[arg(long, default_value = "5")]
    events: usize,

    /// Lowest level the consumer asks the hub to forward
    #[arg(long, default_value = "INFO")]
    level: Level,

    /// Channel the consumer subscribes to
    #[arg(long, default_value = Channels::TELEMETRY_UPDATES)]
    channel: String,

    /// Application name stamped on published events
    #[arg(long, default_value = "pubsub-demo")]
    application: String,
}

async fn run_demo(args: Args) -> Result<()> {
    info!("booting in-process hub");
    let hub = InProcessHub::new().context("create hub")?;

    let consumer_config = ClientConfig {
        level_filter: args.level,
        ..ClientConfig::from_env_or_yaml(None)?
    };
    let consumer =
        SocketClient::new(hub.connector(), consumer_config).context("create consumer")?;
    let producer_config = ClientConfig {
        auto_subscribe: false,
        ..ClientConfig::from_env_or_yaml(None)?
    };
    let producer =
        SocketClient::new(hub.connector(), producer_config).context("create producer")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<DefaultLogEvent>();
    consumer.add_message_listener(move |message| {
        if let LoggingMessage::LogEvent(event) = message {
            let _ = events_tx.send(event.clone());
        }
    });
    consumer.connect().await.context("connect consumer")?;
    producer.connect().await.context("connect producer")?;

    let (subscriber, mut channel_rx) = ChannelSubscriber::channel(16);
    if !consumer.add_subscription(&args.channel, subscriber).await {
        warn!(channel = %args.channel, "hub did not acknowledge channel subscription");
    }
    info!(channel = %args.channel, "consumer subscribed");

    let appender = Appender::new(
        Arc::new(producer.clone()),
        LoggingParameters::new(&args.application),
        producer.config().dispatch.clone(),
        None,
    );
    let levels = [Level::FINE, Level::INFO, Level::WARNING, Level::SEVERE];
    for index in 0..args.events {
        let level = levels[index % levels.len()];
        let snapshot = appender.snapshot(level, "demo.orders", format!("order {index} processed"));
        appender.append(snapshot).await?;
    }
    appender.wait_until_all_published().await;

    let payload = Arc::new(DefaultLogEvent::new(Level::INFO, "demo.telemetry", "cpu 42%"));
    let topic = format!("{}/host-1", args.channel);
    producer
        .send_blocking(&LoggingMessage::Channel(ChannelMessage::new(&topic, payload)))
        .await
        .context("publish channel message")?;

    let expected = (0..args.events)
        .filter(|index| levels[index % levels.len()].passes(args.level))
        .count();
    for _ in 0..expected {
        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
            Ok(Some(event)) => println!(
                "[{}] {} #{}: {}",
                event.level(),
                event.source_application,
                event.sequence_number,
                event.message
            ),
            Ok(None) => break,
            Err(_) => {
                warn!("timed out waiting for log event");
                break;
            }
        }
    }
    match tokio::time::timeout(Duration::from_secs(1), channel_rx.recv()).await {
        Ok(Some(message)) => {
            let text = message
                .payload_as::<DefaultLogEvent>()
                .map(|event| event.message.clone())
                .unwrap_or_default();
            println!("channel {}: {text}", message.channel_path());
        }
        _ => warn!("no channel message received"),
    }

    appender.close().await;
    consumer.close().await;
    info!("demo complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run_demo(Args::parse()).await
}
