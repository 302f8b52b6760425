//! AgentMail CLI
//!
//! Thin wrapper around agentmail-core: runs the node or relay daemons and
//! offers client commands against a running node's HTTP surface.
//!
//! ## Usage
//!
//! ```bash
//! # Run a node on the LAN
//! agentmail node --name alice --port 7443
//!
//! # Run a node with a relay for cross-network delivery
//! agentmail node --name alice --port 7443 --relay http://relay.example:7445
//!
//! # Run a relay
//! agentmail relay --port 7445
//!
//! # Talk to a running node
//! agentmail send bob@bob.local --subject hi --body "ping"
//! agentmail inbox
//! agentmail identity
//! agentmail peers
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use agentmail_core::relay::{serve_relay, RelayConfig, RelayState};
use agentmail_core::{MessageKind, Node, NodeConfig, SystemClock};

/// AgentMail - encrypted peer-to-peer mail for software agents
#[derive(Parser)]
#[command(name = "agentmail")]
#[command(version)]
#[command(about = "AgentMail - encrypted peer-to-peer mail for software agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node daemon
    Node {
        /// Node name, also the mDNS instance and relay registry key
        #[arg(long)]
        name: String,

        /// Port of the node HTTP surface
        #[arg(long, default_value_t = 7443)]
        port: u16,

        /// Relay base URL, e.g. http://relay.example:7445
        #[arg(long)]
        relay: Option<String>,

        /// Data directory for keys and the mailbox
        #[arg(long, default_value = "./agentmail_data")]
        data_dir: PathBuf,

        /// Disable mDNS advertisement and browsing
        #[arg(long)]
        no_mdns: bool,
    },

    /// Run the relay daemon (registry + store-and-forward inbox)
    Relay {
        /// Port of the relay HTTP surface
        #[arg(long, default_value_t = 7445)]
        port: u16,

        /// Maximum envelopes held per recipient
        #[arg(long, default_value_t = 1000)]
        max_envelopes: usize,

        /// Maximum bytes held per recipient
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        max_bytes: usize,
    },

    /// Send a message through a running node
    Send {
        /// Recipient address, e.g. bob@bob.local
        to: String,

        #[arg(long, default_value = "")]
        subject: String,

        #[arg(long, default_value = "")]
        body: String,

        /// message, task, or ack
        #[arg(long, default_value = "message")]
        kind: String,

        /// Base URL of the local node
        #[arg(long, default_value = "http://127.0.0.1:7443")]
        node_url: String,
    },

    /// List inbound messages of a running node
    Inbox {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value = "http://127.0.0.1:7443")]
        node_url: String,
    },

    /// Show the identity of a running node
    Identity {
        #[arg(long, default_value = "http://127.0.0.1:7443")]
        node_url: String,
    },

    /// List peers known to a running node
    Peers {
        #[arg(long, default_value = "http://127.0.0.1:7443")]
        node_url: String,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            name,
            port,
            relay,
            data_dir,
            no_mdns,
        } => {
            init_tracing();
            let mut config = NodeConfig::new(name, port, data_dir);
            if let Some(relay) = relay {
                config = config.with_relay(relay);
            }
            config.enable_mdns = !no_mdns;

            let node = Node::start(config)
                .await
                .context("node failed to start")?;
            println!("AgentMail node running");
            println!("  Address:  {}", node.context().config.address());
            println!("  Surface:  http://{}", node.local_addr());
            if let Some(relay) = &node.context().config.relay_url {
                println!("  Relay:    {}", relay);
            }

            tokio::signal::ctrl_c().await?;
            node.shutdown().await;
        }

        Commands::Relay {
            port,
            max_envelopes,
            max_bytes,
        } => {
            init_tracing();
            let state = std::sync::Arc::new(RelayState::new(
                RelayConfig {
                    max_envelopes,
                    max_bytes,
                },
                std::sync::Arc::new(SystemClock),
            ));
            println!("AgentMail relay running on port {}", port);
            serve_relay(([0, 0, 0, 0], port).into(), state)
                .await
                .context("relay failed")?;
        }

        Commands::Send {
            to,
            subject,
            body,
            kind,
            node_url,
        } => {
            let kind = MessageKind::from_str(&kind)?;
            let response = reqwest::Client::new()
                .post(format!("{}/v0/send", node_url.trim_end_matches('/')))
                .json(&serde_json::json!({
                    "to": to,
                    "subject": subject,
                    "body": body,
                    "kind": kind,
                }))
                .send()
                .await
                .context("is the node running?")?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            if !status.is_success() {
                bail!("send failed ({}): {}", status, body);
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Inbox { limit, node_url } => {
            let body: serde_json::Value = reqwest::Client::new()
                .get(format!(
                    "{}/v0/inbox?limit={}",
                    node_url.trim_end_matches('/'),
                    limit
                ))
                .send()
                .await
                .context("is the node running?")?
                .json()
                .await?;
            let empty = Vec::new();
            let messages = body["messages"].as_array().unwrap_or(&empty);
            for msg in messages {
                println!(
                    "{}  {}  {}",
                    msg["from_addr"].as_str().unwrap_or("?"),
                    msg["subject"].as_str().unwrap_or(""),
                    msg["body"].as_str().unwrap_or("")
                );
            }
            if messages.is_empty() {
                println!("(inbox empty)");
            }
        }

        Commands::Identity { node_url } => {
            let body: serde_json::Value = reqwest::Client::new()
                .get(format!("{}/v0/identity", node_url.trim_end_matches('/')))
                .send()
                .await
                .context("is the node running?")?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Commands::Peers { node_url } => {
            let body: serde_json::Value = reqwest::Client::new()
                .get(format!("{}/v0/peers", node_url.trim_end_matches('/')))
                .send()
                .await
                .context("is the node running?")?
                .json()
                .await?;
            let empty = Vec::new();
            let peers = body["peers"].as_array().unwrap_or(&empty);
            for peer in peers {
                println!(
                    "{}  {}  {}",
                    peer["address"].as_str().unwrap_or("?"),
                    peer["fp"].as_str().unwrap_or("?"),
                    peer["endpoint"].as_str().unwrap_or("(relay only)")
                );
            }
            if peers.is_empty() {
                println!("(no peers known)");
            }
        }
    }

    Ok(())
}
