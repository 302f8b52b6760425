//! Node configuration.
//!
//! Every timing knob of the delivery pipeline lives here so tests can
//! tighten them and operators can loosen them. Defaults match the values
//! the daemon ships with.

use std::path::PathBuf;
use std::time::Duration;

use crate::address::Address;
use crate::error::MailResult;

/// Configuration for one node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name, also the mDNS instance and relay registry key
    pub name: String,
    /// TCP port for the node HTTP surface (0 = ephemeral)
    pub port: u16,
    /// Root of all persisted state
    pub data_dir: PathBuf,
    /// Relay base URL, e.g. `http://relay.example:7445`; `None` disables
    /// relay lookup, deposit, registration and pickup
    pub relay_url: Option<String>,
    /// Advertise and browse on mDNS
    pub enable_mdns: bool,

    /// Timeout for a direct `POST /v0/receive` to a peer
    pub direct_timeout: Duration,
    /// Timeout for any relay HTTP call
    pub relay_timeout: Duration,
    /// How often the outbox drain loop wakes
    pub outbox_tick: Duration,
    /// Maximum outbox entries processed per drain pass
    pub outbox_batch: usize,
    /// How often the node re-registers with the relay
    pub registration_interval: Duration,
    /// How often the node polls the relay for queued envelopes
    pub pickup_interval: Duration,

    /// First retry delay; doubles each failed attempt
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_cap: Duration,
    /// Attempts before an outbound message is marked FAILED
    pub max_attempts: u32,
}

impl NodeConfig {
    /// Configuration with default timings for the given name, port and
    /// data directory.
    pub fn new(name: impl Into<String>, port: u16, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            port,
            data_dir: data_dir.into(),
            relay_url: None,
            enable_mdns: true,
            direct_timeout: Duration::from_secs(3),
            relay_timeout: Duration::from_secs(5),
            outbox_tick: Duration::from_secs(2),
            outbox_batch: 16,
            registration_interval: Duration::from_secs(60),
            pickup_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            max_attempts: 20,
        }
    }

    /// Set the relay base URL (trailing slashes trimmed; empty disables).
    pub fn with_relay(mut self, url: impl AsRef<str>) -> Self {
        let trimmed = url.as_ref().trim_end_matches('/');
        self.relay_url = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// This node's human-facing address: `name@name.local`.
    pub fn address(&self) -> Address {
        Address::local(&self.name)
    }

    /// Directory holding key material.
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    /// Path of the persisted identity file.
    pub fn identity_path(&self) -> PathBuf {
        self.keys_dir().join("identity.json")
    }

    /// Path of the mailbox database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mailbox.db")
    }

    /// Create the data and key directories.
    pub fn ensure_dirs(&self) -> MailResult<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.keys_dir())?;
        Ok(())
    }
}
