//! Persistent mailbox store using redb.
//!
//! Durable tables:
//! - `messages`: every message this node has sent or received, keyed by ULID
//! - `inbound_dedup`: `(sender_fp, payload nonce)` → message id
//! - `peers`: peer records keyed by fingerprint
//! - `peer_names`: name → fingerprint index
//! - `outbox`: retry state for undelivered outbound messages
//!
//! All state changes are single write transactions, so the store's
//! invariants hold across crashes: an outbound message and its outbox entry
//! appear and disappear together, and a peer's signing key can never change
//! under a pinned fingerprint.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::envelope::{MessageEnvelope, MessageKind, MessagePayload};
use crate::error::{MailError, MailResult};
use crate::peer::PeerInfo;

// Table definitions
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const INBOUND_DEDUP_TABLE: TableDefinition<&str, &str> = TableDefinition::new("inbound_dedup");
const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");
const PEER_NAME_INDEX: TableDefinition<&str, &str> = TableDefinition::new("peer_names");
const OUTBOX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

/// Whether a stored message was received or sent by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// Which delivery path carried (or will next carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTier {
    Direct,
    Relay,
}

impl std::fmt::Display for DeliveryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryTier::Direct => write!(f, "direct"),
            DeliveryTier::Relay => write!(f, "relay"),
        }
    }
}

/// A row in the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// ULID; lexicographic order is chronological
    pub id: String,
    pub direction: Direction,
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: i64,
    /// Set iff `status == Delivered`
    pub delivered_at: Option<i64>,
    pub status: DeliveryStatus,
    /// Mirrors the outbox attempt counter; monotonic
    pub attempts: u32,
    /// The tier that completed delivery
    pub delivered_via: Option<DeliveryTier>,
    /// The wire form, kept for audit and redelivery
    pub envelope: MessageEnvelope,
}

impl StoredMessage {
    /// Build the IN row for a verified, decrypted envelope.
    ///
    /// Inbound messages are only constructed after signature verification
    /// and decryption succeed, so they are born `Delivered`.
    pub fn inbound(payload: &MessagePayload, envelope: MessageEnvelope, now: i64) -> Self {
        Self {
            id: Ulid::new().to_string(),
            direction: Direction::In,
            from_addr: payload.from_addr.clone(),
            to_addr: payload.to_addr.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            kind: payload.kind,
            created_at: payload.created_at,
            delivered_at: Some(now),
            status: DeliveryStatus::Delivered,
            attempts: 0,
            delivered_via: None,
            envelope,
        }
    }

    /// Build the OUT row plus its outbox entry for a freshly sealed payload.
    pub fn outbound(
        payload: &MessagePayload,
        envelope: MessageEnvelope,
        now: i64,
    ) -> (Self, OutboxEntry) {
        let id = Ulid::new().to_string();
        let message = Self {
            id: id.clone(),
            direction: Direction::Out,
            from_addr: payload.from_addr.clone(),
            to_addr: payload.to_addr.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            kind: payload.kind,
            created_at: payload.created_at,
            delivered_at: None,
            status: DeliveryStatus::Pending,
            attempts: 0,
            delivered_via: None,
            envelope: envelope.clone(),
        };
        let entry = OutboxEntry {
            id,
            target_fp: envelope.recipient_fp.clone(),
            envelope,
            next_try_at: now,
            attempts: 0,
            last_error: None,
            tier: DeliveryTier::Direct,
        };
        (message, entry)
    }
}

/// Retry state for one undelivered outbound message.
///
/// Exactly one entry exists per PENDING OUT message; terminal transitions
/// delete it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Same ULID as the parent message
    pub id: String,
    pub target_fp: String,
    pub envelope: MessageEnvelope,
    /// Unix milliseconds; the drain loop skips entries not yet due
    pub next_try_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Tier of the most recent attempt
    pub tier: DeliveryTier,
}

/// The mailbox store. Cheap to clone; all clones share one database.
#[derive(Clone)]
pub struct Mailbox {
    db: Arc<RwLock<Database>>,
}

impl Mailbox {
    /// Open (or create) the mailbox at the given path and initialize all
    /// tables.
    pub fn open(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(INBOUND_DEDUP_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
            let _ = write_txn.open_table(PEER_NAME_INDEX)?;
            let _ = write_txn.open_table(OUTBOX_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or merge a peer record, enforcing identity pinning.
    ///
    /// Returns [`MailError::PeerConflict`] and leaves state unchanged when
    /// the update would change `sign_pk` for a known fingerprint. Otherwise
    /// merges per [`PeerInfo::merge_from`] and returns the stored record.
    pub fn upsert_peer(&self, peer: PeerInfo) -> MailResult<PeerInfo> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let merged = {
            let mut peers = write_txn.open_table(PEERS_TABLE)?;
            let mut names = write_txn.open_table(PEER_NAME_INDEX)?;

            let existing = match peers.get(peer.fp.as_str())? {
                Some(v) => Some(decode::<PeerInfo>(v.value())?),
                None => None,
            };

            let merged = match existing {
                Some(mut known) => {
                    if known.sign_pk != peer.sign_pk {
                        return Err(MailError::PeerConflict { fp: peer.fp });
                    }
                    if known.name != peer.name {
                        names.remove(known.name.as_str())?;
                    }
                    known.merge_from(peer);
                    known
                }
                None => peer,
            };

            let data = encode(&merged)?;
            peers.insert(merged.fp.as_str(), data.as_slice())?;
            names.insert(merged.name.as_str(), merged.fp.as_str())?;
            merged
        };
        write_txn.commit()?;
        Ok(merged)
    }

    /// Look up a peer by fingerprint or by name.
    pub fn get_peer(&self, key: &str) -> MailResult<Option<PeerInfo>> {
        if let Some(peer) = self.get_peer_by_fp(key)? {
            return Ok(Some(peer));
        }
        self.get_peer_by_name(key)
    }

    /// Look up a peer by fingerprint.
    pub fn get_peer_by_fp(&self, fp: &str) -> MailResult<Option<PeerInfo>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let peers = read_txn.open_table(PEERS_TABLE)?;
        match peers.get(fp)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Look up a peer through the name index.
    pub fn get_peer_by_name(&self, name: &str) -> MailResult<Option<PeerInfo>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let names = read_txn.open_table(PEER_NAME_INDEX)?;
        let fp = match names.get(name)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let peers = read_txn.open_table(PEERS_TABLE)?;
        match peers.get(fp.as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// All known peers, most recently seen first.
    pub fn list_peers(&self) -> MailResult<Vec<PeerInfo>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let peers = read_txn.open_table(PEERS_TABLE)?;

        let mut out = Vec::new();
        for entry in peers.iter()? {
            let (_, value) = entry?;
            out.push(decode::<PeerInfo>(value.value())?);
        }
        out.sort_by_key(|p| std::cmp::Reverse(p.last_seen));
        Ok(out)
    }

    /// Clear the endpoint of the peer advertising under `name`, keeping the
    /// record and its keys (the peer may still be reachable via relay).
    pub fn clear_peer_endpoint(&self, name: &str) -> MailResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let fp = {
                let names = write_txn.open_table(PEER_NAME_INDEX)?;
                let x = names.get(name)?.map(|v| v.value().to_string());
                x
            };
            if let Some(fp) = fp {
                let mut peers = write_txn.open_table(PEERS_TABLE)?;
                let existing = peers.get(fp.as_str())?.map(|v| v.value().to_vec());
                if let Some(data) = existing {
                    let mut peer = decode::<PeerInfo>(&data)?;
                    peer.endpoint = None;
                    let data = encode(&peer)?;
                    peers.insert(fp.as_str(), data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a peer record entirely (operator action after a conflict).
    pub fn purge_peer(&self, fp: &str) -> MailResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut peers = write_txn.open_table(PEERS_TABLE)?;
            let mut names = write_txn.open_table(PEER_NAME_INDEX)?;
            let x = match peers.remove(fp)? {
                Some(v) => {
                    let peer = decode::<PeerInfo>(v.value())?;
                    names.remove(peer.name.as_str())?;
                    true
                }
                None => false,
            };
            x
        };
        write_txn.commit()?;
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a verified inbound message, idempotently.
    ///
    /// The dedup boundary is `(sender_fp, payload nonce)`: a second insert
    /// with the same key is a no-op returning the existing id.
    pub fn insert_inbound(&self, message: StoredMessage, payload_nonce: &str) -> MailResult<String> {
        let dedup_key = format!("{}:{}", message.envelope.sender_fp, payload_nonce);

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existing = {
            let dedup = write_txn.open_table(INBOUND_DEDUP_TABLE)?;
            let x = dedup.get(dedup_key.as_str())?.map(|v| v.value().to_string());
            x
        };
        if let Some(id) = existing {
            tracing::debug!(%id, key = %dedup_key, "Duplicate inbound envelope absorbed");
            write_txn.abort()?;
            return Ok(id);
        }

        let id = message.id.clone();
        {
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let data = encode(&message)?;
            messages.insert(message.id.as_str(), data.as_slice())?;

            let mut dedup = write_txn.open_table(INBOUND_DEDUP_TABLE)?;
            dedup.insert(dedup_key.as_str(), message.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(id)
    }

    /// Insert an outbound message together with its outbox entry, in one
    /// transaction.
    pub fn insert_outbound(&self, message: StoredMessage, entry: OutboxEntry) -> MailResult<()> {
        if message.id != entry.id {
            return Err(MailError::Mailbox(
                "outbox entry id does not match message id".to_string(),
            ));
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let data = encode(&message)?;
            messages.insert(message.id.as_str(), data.as_slice())?;

            let mut outbox = write_txn.open_table(OUTBOX_TABLE)?;
            let data = encode(&entry)?;
            outbox.insert(entry.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Transition PENDING → DELIVERED and delete the outbox entry.
    ///
    /// Idempotent for an already-delivered message, so a retried attempt
    /// that raced a crash cannot corrupt state.
    pub fn mark_delivered(&self, id: &str, tier: DeliveryTier, now: i64) -> MailResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let mut message = match messages.get(id)? {
                Some(v) => decode::<StoredMessage>(v.value())?,
                None => return Err(MailError::Mailbox(format!("unknown message {}", id))),
            };

            match message.status {
                DeliveryStatus::Pending => {
                    message.status = DeliveryStatus::Delivered;
                    message.delivered_at = Some(now);
                    message.delivered_via = Some(tier);
                    let data = encode(&message)?;
                    messages.insert(id, data.as_slice())?;
                }
                DeliveryStatus::Delivered => {}
                DeliveryStatus::Failed => {
                    return Err(MailError::Mailbox(format!(
                        "message {} already failed",
                        id
                    )));
                }
            }

            let mut outbox = write_txn.open_table(OUTBOX_TABLE)?;
            outbox.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Transition PENDING → FAILED and delete the outbox entry.
    pub fn mark_failed(&self, id: &str, reason: &str) -> MailResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let mut message = match messages.get(id)? {
                Some(v) => decode::<StoredMessage>(v.value())?,
                None => return Err(MailError::Mailbox(format!("unknown message {}", id))),
            };

            if message.status == DeliveryStatus::Pending {
                message.status = DeliveryStatus::Failed;
                let data = encode(&message)?;
                messages.insert(id, data.as_slice())?;
                tracing::warn!(%id, reason, "Outbound message marked failed");
            }

            let mut outbox = write_txn.open_table(OUTBOX_TABLE)?;
            outbox.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Reschedule an outbox entry after a failed attempt.
    ///
    /// The attempt counter is monotonic; a lower value than the stored one
    /// is rejected. The parent message's counter is kept in step.
    pub fn reschedule_outbox(
        &self,
        id: &str,
        next_try_at: i64,
        attempts: u32,
        last_error: Option<String>,
        tier: DeliveryTier,
    ) -> MailResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut outbox = write_txn.open_table(OUTBOX_TABLE)?;
            let mut entry = match outbox.get(id)? {
                Some(v) => decode::<OutboxEntry>(v.value())?,
                None => return Err(MailError::Mailbox(format!("no outbox entry for {}", id))),
            };
            if attempts < entry.attempts {
                return Err(MailError::Mailbox(format!(
                    "attempt counter would regress: {} < {}",
                    attempts, entry.attempts
                )));
            }
            entry.next_try_at = next_try_at;
            entry.attempts = attempts;
            entry.last_error = last_error;
            entry.tier = tier;
            let data = encode(&entry)?;
            outbox.insert(id, data.as_slice())?;

            let mut messages = write_txn.open_table(MESSAGES_TABLE)?;
            let existing = messages.get(id)?.map(|v| v.value().to_vec());
            if let Some(data) = existing {
                let mut message = decode::<StoredMessage>(&data)?;
                message.attempts = message.attempts.max(attempts);
                let data = encode(&message)?;
                messages.insert(id, data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Outbox entries due at `now`, ordered by `(target_fp, next_try_at)`
    /// so the drain loop processes each recipient's backlog in order.
    pub fn list_outbox_due(&self, now: i64, limit: usize) -> MailResult<Vec<OutboxEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let outbox = read_txn.open_table(OUTBOX_TABLE)?;

        let mut due = Vec::new();
        for entry in outbox.iter()? {
            let (_, value) = entry?;
            let entry = decode::<OutboxEntry>(value.value())?;
            if entry.next_try_at <= now {
                due.push(entry);
            }
        }
        due.sort_by(|a, b| {
            (a.target_fp.as_str(), a.next_try_at).cmp(&(b.target_fp.as_str(), b.next_try_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    /// Look up one outbox entry (`None` after a terminal transition).
    pub fn outbox_entry(&self, id: &str) -> MailResult<Option<OutboxEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let outbox = read_txn.open_table(OUTBOX_TABLE)?;
        match outbox.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Number of entries currently queued in the outbox.
    pub fn outbox_len(&self) -> MailResult<usize> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let outbox = read_txn.open_table(OUTBOX_TABLE)?;
        let mut count = 0;
        for entry in outbox.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Inbound messages in chronological (ULID) order, starting after
    /// `cursor` when given.
    pub fn inbox(&self, cursor: Option<&str>, limit: usize) -> MailResult<Vec<StoredMessage>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES_TABLE)?;

        let mut out = Vec::new();
        let range = match cursor {
            Some(cursor) => messages.range::<&str>((
                std::ops::Bound::Excluded(cursor),
                std::ops::Bound::Unbounded,
            ))?,
            None => messages.range::<&str>(..)?,
        };
        for entry in range {
            let (_, value) = entry?;
            let message = decode::<StoredMessage>(value.value())?;
            if message.direction == Direction::In {
                out.push(message);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Look up one message by id.
    pub fn get_message(&self, id: &str) -> MailResult<Option<StoredMessage>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let messages = read_txn.open_table(MESSAGES_TABLE)?;
        match messages.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> MailResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| MailError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> MailResult<T> {
    postcard::from_bytes(bytes).map_err(|e| MailError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::clock::{SharedClock, SystemClock};
    use crate::crypto::Identity;
    use crate::peer::{Endpoint, PeerSource};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_mailbox() -> (Mailbox, TempDir) {
        let temp = TempDir::new().unwrap();
        let mailbox = Mailbox::open(temp.path().join("mailbox.db")).unwrap();
        (mailbox, temp)
    }

    fn sample_peer(identity: &Identity, name: &str) -> PeerInfo {
        PeerInfo {
            fp: identity.fingerprint(),
            name: name.to_string(),
            sign_pk: identity.sign_public(),
            enc_pk: identity.enc_public(),
            endpoint: None,
            last_seen: 1_000,
            source: PeerSource::Manual,
        }
    }

    fn sealed_message(
        sender: &Identity,
        recipient: &Identity,
        body: &str,
    ) -> (MessagePayload, MessageEnvelope) {
        let clock: SharedClock = Arc::new(SystemClock);
        let payload = MessagePayload::new(
            &Address::local("alice"),
            &Address::local("bob"),
            "subject",
            body,
            MessageKind::Message,
            &clock,
        );
        let envelope =
            MessageEnvelope::build(&payload, sender, &sample_peer(recipient, "bob"), 42).unwrap();
        (payload, envelope)
    }

    #[test]
    fn test_upsert_and_lookup_peer() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();
        let peer = sample_peer(&identity, "bob");

        mailbox.upsert_peer(peer.clone()).unwrap();

        let by_fp = mailbox.get_peer(&peer.fp).unwrap().unwrap();
        assert_eq!(by_fp.name, "bob");
        let by_name = mailbox.get_peer("bob").unwrap().unwrap();
        assert_eq!(by_name.fp, peer.fp);
    }

    #[test]
    fn test_identity_pinning_rejects_new_key() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();
        let peer = sample_peer(&identity, "bob");
        mailbox.upsert_peer(peer.clone()).unwrap();

        // Same fingerprint, different signing key
        let mut imposter = peer.clone();
        imposter.sign_pk = [9u8; 32];
        let result = mailbox.upsert_peer(imposter);
        assert!(matches!(result, Err(MailError::PeerConflict { .. })));

        // State unchanged
        let stored = mailbox.get_peer(&peer.fp).unwrap().unwrap();
        assert_eq!(stored.sign_pk, peer.sign_pk);
    }

    #[test]
    fn test_upsert_merges_endpoint() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();

        let mut with_endpoint = sample_peer(&identity, "bob");
        with_endpoint.endpoint = Some(Endpoint {
            host: "192.168.1.20".to_string(),
            port: 7444,
        });
        mailbox.upsert_peer(with_endpoint).unwrap();

        // A relay sighting without an endpoint must not erase the known one
        let mut relay_sighting = sample_peer(&identity, "bob");
        relay_sighting.source = PeerSource::Relay;
        relay_sighting.last_seen = 2_000;
        let merged = mailbox.upsert_peer(relay_sighting).unwrap();
        assert!(merged.endpoint.is_some());
        assert_eq!(merged.last_seen, 2_000);
    }

    #[test]
    fn test_rename_updates_name_index() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();
        mailbox.upsert_peer(sample_peer(&identity, "bob")).unwrap();
        mailbox
            .upsert_peer(sample_peer(&identity, "robert"))
            .unwrap();

        assert!(mailbox.get_peer("bob").unwrap().is_none());
        assert_eq!(
            mailbox.get_peer("robert").unwrap().unwrap().fp,
            identity.fingerprint()
        );
    }

    #[test]
    fn test_clear_endpoint_keeps_keys() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();
        let mut peer = sample_peer(&identity, "bob");
        peer.endpoint = Some(Endpoint {
            host: "192.168.1.20".to_string(),
            port: 7444,
        });
        mailbox.upsert_peer(peer).unwrap();

        mailbox.clear_peer_endpoint("bob").unwrap();
        let stored = mailbox.get_peer("bob").unwrap().unwrap();
        assert!(stored.endpoint.is_none());
        assert_eq!(stored.sign_pk, identity.sign_public());
    }

    #[test]
    fn test_purge_peer() {
        let (mailbox, _temp) = create_test_mailbox();
        let identity = Identity::generate();
        let peer = sample_peer(&identity, "bob");
        mailbox.upsert_peer(peer.clone()).unwrap();

        assert!(mailbox.purge_peer(&peer.fp).unwrap());
        assert!(mailbox.get_peer(&peer.fp).unwrap().is_none());
        assert!(mailbox.get_peer("bob").unwrap().is_none());
        assert!(!mailbox.purge_peer(&peer.fp).unwrap());
    }

    #[test]
    fn test_insert_inbound_is_idempotent() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (payload, envelope) = sealed_message(&alice, &bob, "ping");

        let first = StoredMessage::inbound(&payload, envelope.clone(), 100);
        let id1 = mailbox.insert_inbound(first, &payload.nonce).unwrap();

        // Same envelope arriving again (e.g. direct + relay pickup)
        let second = StoredMessage::inbound(&payload, envelope, 200);
        let id2 = mailbox.insert_inbound(second, &payload.nonce).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(mailbox.inbox(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_dedup_is_scoped_per_sender() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let carol = Identity::generate();
        let bob = Identity::generate();

        let (payload_a, envelope_a) = sealed_message(&alice, &bob, "ping");
        let mut payload_c = payload_a.clone();
        let (_, envelope_c) = sealed_message(&carol, &bob, "ping");
        payload_c.nonce = payload_a.nonce.clone(); // same nonce, different sender

        mailbox
            .insert_inbound(
                StoredMessage::inbound(&payload_a, envelope_a, 1),
                &payload_a.nonce,
            )
            .unwrap();
        mailbox
            .insert_inbound(
                StoredMessage::inbound(&payload_c, envelope_c, 2),
                &payload_c.nonce,
            )
            .unwrap();

        assert_eq!(mailbox.inbox(None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_outbox_closure_across_transitions() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (payload, envelope) = sealed_message(&alice, &bob, "queued");

        let (message, entry) = StoredMessage::outbound(&payload, envelope, 100);
        let id = message.id.clone();
        mailbox.insert_outbound(message, entry).unwrap();

        // PENDING → exactly one outbox entry
        assert!(mailbox.outbox_entry(&id).unwrap().is_some());
        assert_eq!(mailbox.outbox_len().unwrap(), 1);

        // DELIVERED → entry gone, delivered_at set
        mailbox.mark_delivered(&id, DeliveryTier::Direct, 150).unwrap();
        assert!(mailbox.outbox_entry(&id).unwrap().is_none());
        let stored = mailbox.get_message(&id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
        assert_eq!(stored.delivered_at, Some(150));
        assert_eq!(stored.delivered_via, Some(DeliveryTier::Direct));

        // Second mark_delivered is a no-op
        mailbox.mark_delivered(&id, DeliveryTier::Relay, 160).unwrap();
        assert_eq!(
            mailbox.get_message(&id).unwrap().unwrap().delivered_via,
            Some(DeliveryTier::Direct)
        );
    }

    #[test]
    fn test_mark_failed_removes_entry() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (payload, envelope) = sealed_message(&alice, &bob, "doomed");

        let (message, entry) = StoredMessage::outbound(&payload, envelope, 100);
        let id = message.id.clone();
        mailbox.insert_outbound(message, entry).unwrap();

        mailbox.mark_failed(&id, "attempt ceiling reached").unwrap();
        assert!(mailbox.outbox_entry(&id).unwrap().is_none());
        let stored = mailbox.get_message(&id).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert!(stored.delivered_at.is_none());
    }

    #[test]
    fn test_reschedule_updates_entry_and_message() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (payload, envelope) = sealed_message(&alice, &bob, "retry me");

        let (message, entry) = StoredMessage::outbound(&payload, envelope, 100);
        let id = message.id.clone();
        mailbox.insert_outbound(message, entry).unwrap();

        mailbox
            .reschedule_outbox(
                &id,
                5_100,
                1,
                Some("connection refused".to_string()),
                DeliveryTier::Direct,
            )
            .unwrap();

        let entry = mailbox.outbox_entry(&id).unwrap().unwrap();
        assert_eq!(entry.next_try_at, 5_100);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
        assert_eq!(mailbox.get_message(&id).unwrap().unwrap().attempts, 1);

        // Counter must not regress
        assert!(mailbox
            .reschedule_outbox(&id, 6_000, 0, None, DeliveryTier::Direct)
            .is_err());
    }

    #[test]
    fn test_list_outbox_due_orders_by_target_then_time() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let carol = Identity::generate();

        for (recipient, at) in [(&carol, 300i64), (&bob, 200), (&bob, 100)] {
            let (payload, envelope) = sealed_message(&alice, recipient, "x");
            let (message, mut entry) = StoredMessage::outbound(&payload, envelope, at);
            entry.next_try_at = at;
            mailbox.insert_outbound(message, entry).unwrap();
        }

        let due = mailbox.list_outbox_due(1_000, 10).unwrap();
        assert_eq!(due.len(), 3);
        let keys: Vec<_> = due.iter().map(|e| (e.target_fp.clone(), e.next_try_at)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        // Not-yet-due entries are excluded
        let due = mailbox.list_outbox_due(150, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].next_try_at, 100);
    }

    #[test]
    fn test_inbox_cursor_pagination() {
        let (mailbox, _temp) = create_test_mailbox();
        let alice = Identity::generate();
        let bob = Identity::generate();

        for i in 0..5 {
            let (payload, envelope) = sealed_message(&alice, &bob, &format!("msg {}", i));
            mailbox
                .insert_inbound(StoredMessage::inbound(&payload, envelope, i), &payload.nonce)
                .unwrap();
        }

        let first_page = mailbox.inbox(None, 3).unwrap();
        assert_eq!(first_page.len(), 3);
        let cursor = first_page.last().unwrap().id.clone();
        let second_page = mailbox.inbox(Some(&cursor), 3).unwrap();
        assert_eq!(second_page.len(), 2);
        assert!(second_page[0].id > cursor);
    }

    #[test]
    fn test_mailbox_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mailbox.db");
        let alice = Identity::generate();
        let bob = Identity::generate();
        let (payload, envelope) = sealed_message(&alice, &bob, "durable");
        let (message, entry) = StoredMessage::outbound(&payload, envelope, 100);
        let id = message.id.clone();

        {
            let mailbox = Mailbox::open(&path).unwrap();
            mailbox.insert_outbound(message, entry).unwrap();
        }
        {
            // In-flight outbox entries survive a restart
            let mailbox = Mailbox::open(&path).unwrap();
            assert!(mailbox.outbox_entry(&id).unwrap().is_some());
            assert_eq!(
                mailbox.get_message(&id).unwrap().unwrap().status,
                DeliveryStatus::Pending
            );
        }
    }
}
