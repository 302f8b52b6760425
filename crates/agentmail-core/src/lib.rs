//! AgentMail Core Library
//!
//! Local-first, peer-to-peer encrypted messaging for software agents.
//!
//! ## Overview
//!
//! Each participant runs a node that owns a long-lived cryptographic
//! identity, discovers other nodes on the local network over mDNS, and
//! exchanges signed + sealed envelopes directly over HTTP when possible. A
//! neutral relay provides a name registry and an opaque store-and-forward
//! inbox for cross-network or offline delivery.
//!
//! ## Delivery tiers
//!
//! Outbound messages walk three tiers with durable state at every step:
//!
//! 1. **Direct P2P**: POST the envelope straight to the resolved peer
//! 2. **Relay deposit**: hand the (still sealed) envelope to the relay
//! 3. **Outbox**: queue on disk and retry with exponential backoff
//!
//! Inbound deduplication on `(sender_fp, payload nonce)` keeps observable
//! delivery at-most-once even when a message arrives over several tiers.
//!
//! ## Quick start
//!
//! ```ignore
//! use agentmail_core::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("alice", 7443, "./agentmail_data")
//!         .with_relay("http://relay.example:7445");
//!     let node = Node::start(config).await?;
//!
//!     // Send through the router...
//!     // node.context().router.send("bob@bob.local", "hi", "ping", MessageKind::Message).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod node;
pub mod peer;
pub mod relay;
pub mod relay_client;
pub mod router;

// Re-exports
pub use address::Address;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::NodeConfig;
pub use crypto::Identity;
pub use envelope::{MessageEnvelope, MessageKind, MessagePayload, ENVELOPE_VERSION};
pub use error::{MailError, MailResult};
pub use mailbox::{DeliveryStatus, DeliveryTier, Direction, Mailbox, OutboxEntry, StoredMessage};
pub use node::{Node, NodeContext};
pub use peer::{Endpoint, PeerInfo, PeerSource};
pub use relay::{RelayConfig, RelayState, RelayStats};
pub use relay_client::RelayClient;
pub use router::{Router, RouterConfig, SendOutcome};
