//! Outbound delivery state machine.
//!
//! A send walks the tiers in order, with durable state at every step:
//!
//! ```text
//! RESOLVING → ATTEMPT_DIRECT → ATTEMPT_RELAY → QUEUED_OUTBOX
//!                    │               │               │
//!                    └── 2xx ────────┴── 2xx ──→ DELIVERED
//!                                                    │ ceiling / fatal error
//!                                                    └──────→ FAILED
//! ```
//!
//! The outbound message and its outbox entry are written in one transaction
//! before the first network attempt, so a crash at any point leaves a
//! retryable entry rather than a lost message. The background drain loop
//! re-runs the direct → relay sequence for due entries with exponential
//! backoff, processing each recipient serially to keep per-recipient order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::clock::SharedClock;
use crate::crypto::Identity;
use crate::encoding::b64_decode_key;
use crate::envelope::{MessageEnvelope, MessageKind, MessagePayload};
use crate::error::{MailError, MailResult};
use crate::mailbox::{DeliveryStatus, DeliveryTier, Mailbox, OutboxEntry, StoredMessage};
use crate::peer::{Endpoint, PeerInfo, PeerSource};
use crate::relay_client::RelayClient;

/// Timing and limit knobs for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Timeout for a direct `POST /v0/receive`
    pub direct_timeout: Duration,
    /// First retry delay; doubles per failed attempt
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_cap: Duration,
    /// Attempts before a message is marked FAILED
    pub max_attempts: u32,
    /// Entries processed per drain pass
    pub outbox_batch: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            direct_timeout: Duration::from_secs(3),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            max_attempts: 20,
            outbox_batch: 16,
        }
    }
}

/// What a `send` call tells its caller.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Id of the stored OUT message
    pub id: String,
    pub status: DeliveryStatus,
    /// Set when the first attempt already delivered
    pub tier: Option<DeliveryTier>,
}

/// Routes outbound messages to peers directly or through the relay.
pub struct Router {
    identity: Arc<Identity>,
    mailbox: Mailbox,
    relay: Option<RelayClient>,
    clock: SharedClock,
    local_address: Address,
    http: reqwest::Client,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        identity: Arc<Identity>,
        mailbox: Mailbox,
        relay: Option<RelayClient>,
        clock: SharedClock,
        local_address: Address,
        config: RouterConfig,
    ) -> MailResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("agentmail/", env!("CARGO_PKG_VERSION")))
            .timeout(config.direct_timeout)
            .build()
            .map_err(|e| MailError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            identity,
            mailbox,
            relay,
            clock,
            local_address,
            http,
            config,
        })
    }

    /// Compose, seal, persist and attempt delivery of one message.
    ///
    /// Resolution and crypto failures surface immediately; transport
    /// failures leave the message PENDING in the outbox for the drain loop.
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        kind: MessageKind,
    ) -> MailResult<SendOutcome> {
        let to_addr = Address::parse(to)?;
        let peer = self.resolve(&to_addr).await?;

        let payload = MessagePayload::new(
            &self.local_address,
            &peer.address(),
            subject,
            body,
            kind,
            &self.clock,
        );
        let now = self.clock.now_millis();
        let envelope = MessageEnvelope::build(&payload, &self.identity, &peer, now)?;
        let (message, entry) = StoredMessage::outbound(&payload, envelope, now);
        let id = message.id.clone();
        self.mailbox.insert_outbound(message, entry.clone())?;

        match self.attempt(&entry).await {
            Ok(tier) => {
                self.mailbox
                    .mark_delivered(&id, tier, self.clock.now_millis())?;
                tracing::info!(%id, to = %to_addr, %tier, "Delivered");
                Ok(SendOutcome {
                    id,
                    status: DeliveryStatus::Delivered,
                    tier: Some(tier),
                })
            }
            Err((error, tier)) => {
                let status = self.handle_failure(&entry, &error, tier)?;
                Ok(SendOutcome {
                    id,
                    status,
                    tier: None,
                })
            }
        }
    }

    /// Resolve a recipient address to a peer record.
    ///
    /// Local store first; the relay registry when the local store has no
    /// directly reachable record. A relay answer that disagrees with a
    /// pinned fingerprint fails the send; new keys are never trusted
    /// silently.
    async fn resolve(&self, addr: &Address) -> MailResult<PeerInfo> {
        let local = self.mailbox.get_peer(addr.name())?;
        if let Some(peer) = &local {
            if peer.endpoint.is_some() {
                return Ok(peer.clone());
            }
        }

        if let Some(relay) = &self.relay {
            match relay.lookup(addr.name()).await {
                Ok(Some(entry)) => {
                    if let Some(pinned) = &local {
                        if pinned.fp != entry.fp {
                            return Err(MailError::IdentityConflict {
                                name: addr.name().to_string(),
                                pinned: pinned.fp.clone(),
                                resolved: entry.fp,
                            });
                        }
                    }
                    let peer = PeerInfo {
                        fp: entry.fp,
                        name: entry.name,
                        sign_pk: b64_decode_key(&entry.sign_pk)?,
                        enc_pk: b64_decode_key(&entry.enc_pk)?,
                        endpoint: None,
                        last_seen: self.clock.now_millis(),
                        source: PeerSource::Relay,
                    };
                    // upsert re-checks key pinning and keeps a known endpoint
                    return self.mailbox.upsert_peer(peer);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(name = addr.name(), error = %e, "Relay lookup failed");
                }
            }
        }

        local.ok_or_else(|| MailError::UnknownRecipient(addr.to_string()))
    }

    /// Run one direct → relay attempt sequence for an outbox entry.
    ///
    /// On failure returns the decisive error together with the tier that
    /// produced it.
    async fn attempt(&self, entry: &OutboxEntry) -> Result<DeliveryTier, (MailError, DeliveryTier)> {
        let endpoint = self
            .mailbox
            .get_peer_by_fp(&entry.target_fp)
            .ok()
            .flatten()
            .and_then(|p| p.endpoint);

        let mut last: Option<(MailError, DeliveryTier)> = None;

        if let Some(endpoint) = endpoint {
            match self.post_direct(&endpoint, &entry.envelope).await {
                Ok(()) => return Ok(DeliveryTier::Direct),
                Err(e) => {
                    tracing::debug!(id = %entry.id, %endpoint, error = %e, "Direct delivery failed");
                    last = Some((e, DeliveryTier::Direct));
                }
            }
        }

        if let Some(relay) = &self.relay {
            match relay.deposit(&entry.envelope).await {
                Ok(()) => return Ok(DeliveryTier::Relay),
                Err(e) => {
                    tracing::debug!(id = %entry.id, error = %e, "Relay deposit failed");
                    last = Some((e, DeliveryTier::Relay));
                }
            }
        }

        Err(last.unwrap_or((
            MailError::Transport("no direct endpoint known and no relay configured".to_string()),
            DeliveryTier::Direct,
        )))
    }

    /// POST an envelope straight to a peer's `/v0/receive`.
    ///
    /// Any non-2xx answer counts as a transport failure: the attempt falls
    /// through to the relay tier or the outbox, and FAILED is only reached
    /// at the attempt ceiling. A refusal can be transient (the peer may not
    /// have pinned our keys yet), so it is never terminal by itself.
    async fn post_direct(&self, endpoint: &Endpoint, envelope: &MessageEnvelope) -> MailResult<()> {
        let url = format!("http://{}/v0/receive", endpoint);
        let response = self
            .http
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| MailError::Transport(format!("direct: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(MailError::Transport(format!("peer returned {}", status)))
        }
    }

    /// Record a failed attempt: reschedule with backoff, or mark FAILED at
    /// the ceiling or on a fatal (non-retryable) error.
    fn handle_failure(
        &self,
        entry: &OutboxEntry,
        error: &MailError,
        tier: DeliveryTier,
    ) -> MailResult<DeliveryStatus> {
        let attempts = entry.attempts + 1;
        if !error.is_retryable() || attempts >= self.config.max_attempts {
            self.mailbox.mark_failed(&entry.id, &error.to_string())?;
            return Ok(DeliveryStatus::Failed);
        }

        let now = self.clock.now_millis();
        let delay = backoff_delay_ms(self.config.backoff_base, self.config.backoff_cap, entry.attempts);
        self.mailbox.reschedule_outbox(
            &entry.id,
            now + delay,
            attempts,
            Some(error.to_string()),
            tier,
        )?;
        tracing::debug!(
            id = %entry.id,
            attempts,
            retry_in_ms = delay,
            error = %error,
            "Delivery rescheduled"
        );
        Ok(DeliveryStatus::Pending)
    }

    /// One drain pass: attempt every due outbox entry, serially per target.
    ///
    /// A failed target is skipped for the rest of the pass so a later
    /// message can never overtake an earlier one to the same recipient.
    /// Returns the number of messages delivered.
    pub async fn drain_due(&self) -> MailResult<usize> {
        let now = self.clock.now_millis();
        let due = self.mailbox.list_outbox_due(now, self.config.outbox_batch)?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut failed_targets: HashSet<String> = HashSet::new();
        let mut delivered = 0;
        for entry in due {
            if failed_targets.contains(&entry.target_fp) {
                tracing::debug!(id = %entry.id, target = %entry.target_fp, "Skipped behind a failed attempt");
                continue;
            }
            match self.attempt(&entry).await {
                Ok(tier) => {
                    self.mailbox
                        .mark_delivered(&entry.id, tier, self.clock.now_millis())?;
                    tracing::info!(id = %entry.id, %tier, attempts = entry.attempts, "Delivered from outbox");
                    delivered += 1;
                }
                Err((error, tier)) => {
                    failed_targets.insert(entry.target_fp.clone());
                    self.handle_failure(&entry, &error, tier)?;
                }
            }
        }
        Ok(delivered)
    }
}

/// Exponential backoff: `min(cap, base * 2^attempts)` in milliseconds.
fn backoff_delay_ms(base: Duration, cap: Duration, attempts: u32) -> i64 {
    let base_ms = base.as_millis() as i64;
    let cap_ms = cap.as_millis() as i64;
    let factor = 1i64.checked_shl(attempts.min(32)).unwrap_or(i64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}
