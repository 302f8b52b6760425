//! LAN peer discovery over mDNS.
//!
//! Each node advertises a service instance `<name>._agentmail._tcp.local.`
//! carrying its fingerprint and public keys as TXT records, and browses the
//! same service type. Resolved peers are upserted into the mailbox with
//! source LAN; a removed service only clears the endpoint; the keys stay
//! pinned, since the peer may still be reachable through the relay.
//!
//! Discovery is best-effort: the absence of a record never implies the
//! absence of the peer.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::clock::SharedClock;
use crate::crypto::Identity;
use crate::encoding::{b64, b64_decode_key};
use crate::error::{MailError, MailResult};
use crate::mailbox::Mailbox;
use crate::peer::{Endpoint, PeerInfo, PeerSource};

/// Service type advertised and browsed on the LAN.
pub const SERVICE_TYPE: &str = "_agentmail._tcp.local.";

/// TXT keys carried by every advertisement.
const TXT_FP: &str = "fp";
const TXT_SIGN_PK: &str = "sign_pk";
const TXT_ENC_PK: &str = "enc_pk";
const TXT_VERSION: &str = "v";

/// Handle over the running advertisement and browser.
pub struct Discovery {
    daemon: ServiceDaemon,
    fullname: String,
    browser: tokio::task::JoinHandle<()>,
}

impl Discovery {
    /// Start advertising this node and browsing for peers.
    ///
    /// Returns once the registration and browse requests are submitted;
    /// resolution happens on a background task that feeds the mailbox.
    pub fn start(
        identity: &Identity,
        name: &str,
        port: u16,
        mailbox: Mailbox,
        clock: SharedClock,
    ) -> MailResult<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| MailError::Discovery(format!("daemon: {}", e)))?;

        let fp = identity.fingerprint();
        let sign_pk = b64(&identity.sign_public());
        let enc_pk = b64(&identity.enc_public());
        let properties = [
            (TXT_FP, fp.as_str()),
            (TXT_SIGN_PK, sign_pk.as_str()),
            (TXT_ENC_PK, enc_pk.as_str()),
            (TXT_VERSION, "0"),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            name,
            &format!("{}.local.", name),
            "",
            port,
            &properties[..],
        )
        .map_err(|e| MailError::Discovery(format!("service info: {}", e)))?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        daemon
            .register(info)
            .map_err(|e| MailError::Discovery(format!("register: {}", e)))?;
        tracing::info!(instance = %fullname, port, "Advertising on mDNS");

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| MailError::Discovery(format!("browse: {}", e)))?;

        let own_fp = fp;
        let browser = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        handle_resolved(&info, &own_fp, &mailbox, &clock);
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        handle_removed(&fullname, &mailbox);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            daemon,
            fullname,
            browser,
        })
    }

    /// Stop browsing and withdraw the advertisement.
    pub fn shutdown(self) {
        self.browser.abort();
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!(error = %e, "mDNS unregister failed");
        }
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!(error = %e, "mDNS daemon shutdown failed");
        }
        tracing::info!("Discovery stopped");
    }
}

/// A resolved advertisement: validate the TXT records and upsert the peer.
fn handle_resolved(info: &ServiceInfo, own_fp: &str, mailbox: &Mailbox, clock: &SharedClock) {
    let Some(peer) = peer_from_service(info, clock.now_millis()) else {
        tracing::warn!(instance = %info.get_fullname(), "Ignoring advertisement with bad TXT records");
        return;
    };
    if peer.fp == own_fp {
        return; // our own advertisement echoed back
    }

    match mailbox.upsert_peer(peer) {
        Ok(peer) => {
            tracing::info!(
                name = %peer.name,
                fp = %peer.fp,
                endpoint = ?peer.endpoint,
                "Peer discovered on LAN"
            );
        }
        Err(MailError::PeerConflict { fp }) => {
            tracing::warn!(%fp, "LAN advertisement conflicts with pinned peer key, ignored");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to store discovered peer");
        }
    }
}

/// A withdrawn advertisement: clear the endpoint, keep the record.
fn handle_removed(fullname: &str, mailbox: &Mailbox) {
    let Some(name) = fullname.strip_suffix(&format!(".{}", SERVICE_TYPE)) else {
        return;
    };
    if let Err(e) = mailbox.clear_peer_endpoint(name) {
        tracing::warn!(name, error = %e, "Failed to clear endpoint of removed peer");
    } else {
        tracing::info!(name, "Peer left the LAN");
    }
}

/// Build a [`PeerInfo`] from a resolved service, or `None` when required
/// TXT records are missing or malformed.
fn peer_from_service(info: &ServiceInfo, now: i64) -> Option<PeerInfo> {
    let fp = info.get_property_val_str(TXT_FP)?.to_string();
    let sign_pk = b64_decode_key(info.get_property_val_str(TXT_SIGN_PK)?).ok()?;
    let enc_pk = b64_decode_key(info.get_property_val_str(TXT_ENC_PK)?).ok()?;

    let name = info
        .get_fullname()
        .strip_suffix(&format!(".{}", SERVICE_TYPE))?
        .to_string();
    let host = info.get_addresses().iter().next()?.to_string();

    Some(PeerInfo {
        fp,
        name,
        sign_pk,
        enc_pk,
        endpoint: Some(Endpoint {
            host,
            port: info.get_port(),
        }),
        last_seen: now,
        source: PeerSource::Lan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_peer_from_service_requires_keys() {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "bob",
            "bob.local.",
            "192.168.1.20",
            7444,
            &[("fp", "abc")][..], // keys missing
        )
        .unwrap();
        assert!(peer_from_service(&info, 0).is_none());
    }

    #[test]
    fn test_peer_from_service_parses_txt() {
        let identity = Identity::generate();
        let sign_pk = b64(&identity.sign_public());
        let enc_pk = b64(&identity.enc_public());
        let fp = identity.fingerprint();
        let properties = [
            ("fp", fp.as_str()),
            ("sign_pk", sign_pk.as_str()),
            ("enc_pk", enc_pk.as_str()),
            ("v", "0"),
        ];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "bob",
            "bob.local.",
            "192.168.1.20",
            7444,
            &properties[..],
        )
        .unwrap();

        let peer = peer_from_service(&info, 123).unwrap();
        assert_eq!(peer.fp, fp);
        assert_eq!(peer.name, "bob");
        assert_eq!(peer.sign_pk, identity.sign_public());
        assert_eq!(peer.source, PeerSource::Lan);
        let endpoint = peer.endpoint.unwrap();
        assert_eq!(endpoint.port, 7444);
        assert_eq!(peer.last_seen, 123);
    }

    /// Requires a multicast-capable network interface.
    #[ignore]
    #[tokio::test]
    async fn test_two_daemons_find_each_other() {
        let temp_a = TempDir::new().unwrap();
        let temp_b = TempDir::new().unwrap();
        let mailbox_a = Mailbox::open(temp_a.path().join("a.db")).unwrap();
        let mailbox_b = Mailbox::open(temp_b.path().join("b.db")).unwrap();
        let clock: SharedClock = Arc::new(SystemClock);

        let alice = Identity::generate();
        let bob = Identity::generate();
        let disc_a =
            Discovery::start(&alice, "alice", 7443, mailbox_a.clone(), clock.clone()).unwrap();
        let disc_b = Discovery::start(&bob, "bob", 7444, mailbox_b.clone(), clock).unwrap();

        let mut found = false;
        for _ in 0..40 {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            if mailbox_a.get_peer("bob").unwrap().is_some()
                && mailbox_b.get_peer("alice").unwrap().is_some()
            {
                found = true;
                break;
            }
        }
        disc_a.shutdown();
        disc_b.shutdown();
        assert!(found, "peers did not discover each other within 10s");
    }
}
