//! Structured peer addresses.
//!
//! Addresses are parsed once at the boundary; the router and mailbox only
//! ever see [`Address`] values, never raw strings. The display form is
//! `name@host`, e.g. `alice@alice.local` for a LAN peer or
//! `alice@3KJv9p2qXceFg0aD.relay` when only the relay knows the peer.

use serde::{Deserialize, Serialize};

use crate::error::{MailError, MailResult};

/// Suffix of the synthetic host used for relay-only peers.
const RELAY_PSEUDO_SUFFIX: &str = ".relay";

/// A parsed `name@host` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    name: String,
    host: String,
}

impl Address {
    /// Parse `name@host` into a structured address.
    pub fn parse(s: &str) -> MailResult<Self> {
        let mut parts = s.splitn(2, '@');
        let name = parts.next().unwrap_or_default();
        let host = parts.next().unwrap_or_default();

        if name.is_empty() || host.is_empty() {
            return Err(MailError::InvalidAddress(format!(
                "expected name@host, got {:?}",
                s
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MailError::InvalidAddress(format!(
                "name contains invalid characters: {:?}",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
        })
    }

    /// The default address of a node on the LAN: `name@name.local`.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: format!("{}.local", name),
        }
    }

    /// Synthetic address for a peer only reachable through the relay.
    ///
    /// Uses the fingerprint as a pseudo-host so the address stays unique
    /// even when names collide across networks.
    pub fn relay_pseudo(name: &str, fp: &str) -> Self {
        Self {
            name: name.to_string(),
            host: format!("{}{}", fp, RELAY_PSEUDO_SUFFIX),
        }
    }

    /// The node-name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host component.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

impl std::str::FromStr for Address {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
