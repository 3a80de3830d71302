use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use phx_events::{
    load_config, ChannelMessage, ClientConfig, EventHandler, HandlerResult, PhxChannelsClient,
    PhxEvent,
};
use serde_json::Value;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Socket endpoint, e.g. ws://localhost:4000/socket/websocket
    url: String,

    #[arg(short, long)]
    token: Option<String>,

    /// Topic to join, may be repeated
    #[arg(short, long = "join")]
    topics: Vec<String>,

    /// Application event to log, may be repeated
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Join payload as JSON
    #[arg(long, default_value = "{}")]
    payload: String,

    /// TOML client config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Heartbeat interval in milliseconds, overrides the config file
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    #[arg(short, long)]
    debug: bool,
}

/// Logs every envelope it receives
struct LogHandler;

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, message: &ChannelMessage) -> HandlerResult {
        info!(
            topic = %message.topic(),
            event = %message.event(),
            ref_ = ?message.ref_(),
            payload = %message.payload(),
            "Received event"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(ms) = cli.heartbeat_ms {
        config.heartbeat_interval_ms = ms;
    }
    debug!("Config: {:?}", config);

    let payload: Value =
        serde_json::from_str(&cli.payload).context("--payload is not valid JSON")?;

    let client = PhxChannelsClient::connect(&cli.url, cli.token.as_deref(), config)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;

    for event in [PhxEvent::Reply, PhxEvent::Error, PhxEvent::Close] {
        client.register(event, LogHandler, None);
    }
    for event in &cli.events {
        client.register(event.as_str(), LogHandler, None);
    }

    for topic in &cli.topics {
        client
            .join(topic.as_str(), payload.clone())
            .await
            .with_context(|| format!("Failed to join {topic}"))?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            client.shutdown("interrupted").await;
            info!("Stopped");
        }
        reason = client.wait_closed() => {
            error!("Client stopped: {}", reason);
            std::process::exit(1);
        }
    }

    Ok(())
}
