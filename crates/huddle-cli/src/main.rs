//! # Huddle CLI
//!
//! Joins a team through the signaling service and shows presence and
//! messages as they arrive.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a config file from the search paths
//! huddle
//!
//! # Run with a custom config
//! huddle --config /path/to/huddle.toml
//!
//! # Run with environment variables
//! HUDDLE_SERVER=http://localhost:7071 HUDDLE_TEAM_NAME=eng huddle
//! ```
//!
//! Lines typed on stdin:
//!
//! - `TYPE payload` - send to the whole team
//! - `@user-id TYPE payload` - send to one peer through the elastic queue
//! - `status Busy` - change the local status
//! - `peers` - list known peers
//! - `q` - disconnect and exit

mod config;
mod metrics;

use anyhow::{Context, Result};
use huddle_core::{ClientEvent, OutboundMessage, PeerStatus, SignalClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_core=debug,huddle_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_path(std::env::args().skip(1))?;
    let config = config::Config::load(config_path.as_deref())?;

    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let client = SignalClient::new(config.client_config());
    info!("Connecting to {}", client.server_address());

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    client
        .connect(&config.credentials())
        .await
        .context("Failed to connect")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "q" | "quit" => break,
            command => {
                if let Err(e) = run_command(&client, command).await {
                    warn!("{e:#}");
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn config_path(mut args: impl Iterator<Item = String>) -> Result<Option<String>> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args
                .next()
                .map(Some)
                .context("--config requires a path");
        }
    }
    Ok(None)
}

async fn run_command(client: &SignalClient, command: &str) -> Result<()> {
    if command == "peers" {
        for peer in client.peers() {
            println!("{:<40} {}", peer.user_id, peer.status);
        }
        return Ok(());
    }

    if let Some(status) = command.strip_prefix("status ") {
        let status: PeerStatus = status.parse()?;
        client.set_my_status(status).await?;
        return Ok(());
    }

    if let Some(rest) = command.strip_prefix('@') {
        let (recipient, rest) = rest.split_once(' ').context("Expected '@user TYPE payload'")?;
        let (message_type, payload) = rest.split_once(' ').unwrap_or((rest, ""));
        let action =
            client.send_elastic_message(OutboundMessage::to_user(recipient, message_type, payload))?;
        tokio::spawn(async move {
            let state = action.wait().await;
            info!(state = ?state, succeeded = action.succeeded(), "Message finished");
        });
        return Ok(());
    }

    let (message_type, payload) = command.split_once(' ').unwrap_or((command, ""));
    client.send_message_to_all(message_type, payload).await?;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => println!("* connected"),
        ClientEvent::Disconnected { abnormal, reason } => {
            if *abnormal {
                println!(
                    "* connection lost: {}",
                    reason.as_deref().unwrap_or("link closed")
                );
            } else {
                println!("* disconnected");
            }
        }
        ClientEvent::NewPeer(peer) => println!("+ {} ({})", peer.user_id, peer.status),
        ClientEvent::PeerStatusChanged(peer) => println!("~ {} is {}", peer.user_id, peer.status),
        ClientEvent::Message {
            sender_id,
            message_type,
            payload,
        } => println!("{sender_id} [{message_type}] {payload}"),
        ClientEvent::RequestFailed(e) => error!("{e}"),
    }
}
