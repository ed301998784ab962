//! # Queue Transport CLI
//!
//! Command-line interface for the queue transport.
//!
//! This module provides CLI commands for:
//! - Sending a message to a queue
//! - Receiving messages from the configured input queue
//! - Provisioning queues
//! - Showing the resolved configuration
//! - A send-then-receive round trip through the input queue

use bytes::Bytes;
use clap::{Parser, Subcommand};
use queue_transport::config::BrokerConfig;
use queue_transport::{
    ConfigurationError, Envelope, QueueName, QueueTransport, TransportConfig, TransportError,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue transport CLI - reliable send and receive over leased queues
#[derive(Parser, Debug)]
#[command(name = "queue-transport")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reliable send and receive over leased-queue brokers")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message
    Send {
        /// Destination queue
        #[arg(short, long)]
        queue: String,

        /// Message body (UTF-8)
        #[arg(short, long)]
        body: String,

        /// Correlation id; the assigned message id is used when omitted
        #[arg(long)]
        correlation_id: Option<String>,

        /// Return address for replies
        #[arg(long)]
        reply_to: Option<String>,

        /// Header as KEY=VALUE (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Receive messages from the input queue
    Receive {
        /// Stop after this many messages
        #[arg(short = 'n', long, default_value = "1")]
        max_messages: usize,

        /// Override the receive wait in seconds
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Create queues with the configured queue settings
    Provision {
        /// Queues to create
        #[arg(required = true)]
        queues: Vec<String>,
    },

    /// Validate and print the resolved configuration
    Config,

    /// Send a message to the input queue and receive it back
    Roundtrip {
        /// Message body (UTF-8)
        #[arg(short, long, default_value = "hello")]
        body: String,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("No message arrived on '{queue}' within the receive wait")]
    NothingReceived { queue: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Transport(TransportError::Configuration(_))
            | Self::Transport(TransportError::Validation(_)) => 1,
            Self::Transport(_) | Self::NothingReceived { .. } => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
            Self::Output(_) => 5,
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

#[derive(Debug, Serialize)]
struct SendReport<'a> {
    queue: &'a str,
    message_id: &'a str,
}

/// Received envelope as printed on stdout
#[derive(Debug, Serialize)]
pub struct EnvelopeReport {
    pub id: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl From<&Envelope> for EnvelopeReport {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id.as_str().to_string(),
            correlation_id: envelope.correlation_id.clone(),
            reply_to: envelope.reply_to.clone(),
            headers: envelope
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: String::from_utf8_lossy(&envelope.body).into_owned(),
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(cli, &mut out).await
}

/// Run a parsed command, writing results to `out`
pub async fn execute(cli: Cli, out: &mut dyn Write) -> Result<(), CliError> {
    let config = TransportConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Send {
            queue,
            body,
            correlation_id,
            reply_to,
            headers,
        } => {
            let destination = parse_queue("queue", &queue)?;
            let mut envelope = Envelope::new(Bytes::from(body));
            if let Some(correlation_id) = correlation_id {
                envelope = envelope.with_correlation_id(correlation_id);
            }
            if let Some(reply_to) = reply_to {
                envelope = envelope.with_reply_to(reply_to);
            }
            for header in &headers {
                let (key, value) = parse_header(header)?;
                envelope = envelope.with_header(key, value);
            }

            let transport = start_transport(config).await?;
            let id = transport.send(&mut envelope, &destination, None).await?;
            write_json(
                out,
                &SendReport {
                    queue: destination.as_str(),
                    message_id: id.as_str(),
                },
            )
        }
        Commands::Receive { max_messages, wait } => {
            let mut config = config;
            if let Some(wait) = wait {
                config.receive.wait_secs = wait;
            }

            let transport = start_transport(config).await?;
            let mut received = 0;
            while received < max_messages {
                match transport.receive(None).await? {
                    Some(envelope) => {
                        write_json(out, &EnvelopeReport::from(&envelope))?;
                        received += 1;
                    }
                    None => break,
                }
            }
            debug!(received, "Receive finished");
            Ok(())
        }
        Commands::Provision { queues } => {
            let names = queues
                .iter()
                .map(|queue| parse_queue("queues", queue))
                .collect::<Result<Vec<_>, _>>()?;

            let transport = start_transport(config).await?;
            for name in &names {
                transport.ensure_queue(name).await?;
                writeln!(out, "{}", name)?;
            }
            Ok(())
        }
        Commands::Config => {
            config.validate()?;
            let rendered = serde_json::to_string_pretty(&redacted(config))?;
            writeln!(out, "{}", rendered)?;
            Ok(())
        }
        Commands::Roundtrip { body } => {
            let transport = start_transport(config).await?;
            let input = transport.input_queue().clone();

            let mut envelope = Envelope::new(Bytes::from(body));
            transport.send(&mut envelope, &input, None).await?;

            match transport.receive(None).await? {
                Some(received) => write_json(out, &EnvelopeReport::from(&received)),
                None => Err(CliError::NothingReceived {
                    queue: input.to_string(),
                }),
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Initialize logging based on CLI arguments
fn initialize_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "queue_transport={level},queue_transport_cli={level}",
            level = cli.log_level
        )
        .into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.json_logs).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn start_transport(config: TransportConfig) -> Result<QueueTransport, CliError> {
    let broker = config.broker.connect()?;
    info!(input_queue = %config.input_queue, "Starting transport");
    Ok(QueueTransport::start(broker, config).await?)
}

fn parse_queue(arg: &str, value: &str) -> Result<QueueName, CliError> {
    QueueName::new(value.to_string()).map_err(|e| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: e.to_string(),
    })
}

/// Split a `KEY=VALUE` header argument
pub fn parse_header(value: &str) -> Result<(String, String), CliError> {
    match value.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(CliError::InvalidArgument {
            arg: "header".to_string(),
            message: format!("expected KEY=VALUE, got '{}'", value),
        }),
    }
}

/// Hide credentials before printing a configuration
pub fn redacted(mut config: TransportConfig) -> TransportConfig {
    if let BrokerConfig::AzureServiceBus(azure) = &mut config.broker {
        const HIDDEN: &str = "<redacted>";
        if azure.connection_string.is_some() {
            azure.connection_string = Some(HIDDEN.to_string());
        }
        if azure.shared_access_key.is_some() {
            azure.shared_access_key = Some(HIDDEN.to_string());
        }
    }
    config
}

fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<(), CliError> {
    let line = serde_json::to_string(value)?;
    writeln!(out, "{}", line)?;
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
