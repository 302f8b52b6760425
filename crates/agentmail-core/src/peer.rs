//! Peer records.
//!
//! A [`PeerInfo`] pins a fingerprint to a signing key the first time it is
//! seen (trust-on-first-use). The pinning itself is enforced by the mailbox
//! on upsert; this module only defines the record and its merge rules.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::encoding::base64_key;

/// How a peer record entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSource {
    /// Discovered on the local network via mDNS
    Lan,
    /// Resolved through the relay registry
    Relay,
    /// Entered by an operator or a test harness
    Manual,
}

/// A directly reachable host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything known about a remote node, keyed by fingerprint.
///
/// `(fp, sign_pk)` is immutable once written; the mailbox rejects any
/// update that would change the signing key for a known fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Stable identifier: fingerprint of `sign_pk`
    pub fp: String,
    /// Node name as advertised or registered
    pub name: String,
    /// Ed25519 verifying key
    #[serde(with = "base64_key")]
    pub sign_pk: [u8; 32],
    /// X25519 encryption key
    #[serde(with = "base64_key")]
    pub enc_pk: [u8; 32],
    /// Direct endpoint, when the peer is reachable without the relay
    pub endpoint: Option<Endpoint>,
    /// Unix milliseconds of the last sighting
    pub last_seen: i64,
    /// How the record entered the store
    pub source: PeerSource,
}

impl PeerInfo {
    /// The human-facing address for this peer.
    ///
    /// LAN peers use the mDNS convention `name@name.local`; peers known only
    /// through the relay get a fingerprint pseudo-host.
    pub fn address(&self) -> Address {
        if self.endpoint.is_some() {
            Address::local(&self.name)
        } else {
            Address::relay_pseudo(&self.name, &self.fp)
        }
    }

    /// Merge a newer sighting into this record.
    ///
    /// Keeps a known endpoint when the incoming record has none, takes the
    /// incoming name and source, and bumps `last_seen` monotonically.
    /// The caller must already have checked that `sign_pk` matches.
    pub fn merge_from(&mut self, incoming: PeerInfo) {
        if incoming.endpoint.is_some() {
            self.endpoint = incoming.endpoint;
        }
        self.name = incoming.name;
        self.enc_pk = incoming.enc_pk;
        self.source = incoming.source;
        self.last_seen = self.last_seen.max(incoming.last_seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(endpoint: Option<Endpoint>) -> PeerInfo {
        PeerInfo {
            fp: "3KJv9p2qXceFg0aD".to_string(),
            name: "bob".to_string(),
            sign_pk: [1u8; 32],
            enc_pk: [2u8; 32],
            endpoint,
            last_seen: 1_000,
            source: PeerSource::Lan,
        }
    }

    #[test]
    fn test_address_with_endpoint() {
        let p = peer(Some(Endpoint {
            host: "192.168.1.20".to_string(),
            port: 7444,
        }));
        assert_eq!(p.address().to_string(), "bob@bob.local");
    }

    #[test]
    fn test_address_relay_only() {
        let p = peer(None);
        assert_eq!(p.address().to_string(), "bob@3KJv9p2qXceFg0aD.relay");
    }

    #[test]
    fn test_merge_keeps_endpoint_when_incoming_has_none() {
        let mut known = peer(Some(Endpoint {
            host: "192.168.1.20".to_string(),
            port: 7444,
        }));
        let mut incoming = peer(None);
        incoming.last_seen = 2_000;
        incoming.source = PeerSource::Relay;

        known.merge_from(incoming);
        assert!(known.endpoint.is_some());
        assert_eq!(known.last_seen, 2_000);
        assert_eq!(known.source, PeerSource::Relay);
    }

    #[test]
    fn test_merge_last_seen_is_monotonic() {
        let mut known = peer(None);
        known.last_seen = 5_000;
        let incoming = peer(None); // last_seen 1_000
        known.merge_from(incoming);
        assert_eq!(known.last_seen, 5_000);
    }
}
