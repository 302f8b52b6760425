//! Relay service: name registry + opaque store-and-forward inbox.
//!
//! The relay is cryptographically blind. It parses a deposited envelope
//! just far enough to read `recipient_fp`, then holds the raw JSON until
//! the recipient picks it up. It never verifies signatures (it lacks the
//! sender keys to do so meaningfully) and it never sees plaintext.
//!
//! State is in-memory only and authoritative only while the process lives;
//! senders re-deposit from their outboxes after a relay restart.
//!
//! ## Queue limits
//!
//! Each recipient queue is capped by envelope count and total bytes.
//! Overflow drops the oldest envelopes; only an envelope bigger than the
//! whole byte budget is refused outright (HTTP 413).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::clock::SharedClock;
use crate::error::{MailError, MailResult};

/// Per-recipient queue limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum envelopes held per recipient
    pub max_envelopes: usize,
    /// Maximum total bytes held per recipient
    pub max_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_envelopes: 1000,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Registry entry: what a node told us about itself via `register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub fp: String,
    pub sign_pk: String,
    pub enc_pk: String,
    pub version: u32,
    pub registered_at: i64,
}

/// Body of `POST /v0/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub fp: String,
    pub sign_pk: String,
    pub enc_pk: String,
    pub version: u32,
}

/// Body of `GET /v0/pickup/{fp}` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct PickupResponse {
    pub envelopes: Vec<serde_json::Value>,
}

/// Body of `GET /v0/stats` responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelayStats {
    pub messages_held: u64,
    pub total_bytes: u64,
}

/// One envelope awaiting pickup.
struct HeldEnvelope {
    body: serde_json::Value,
    size: usize,
    sender_fp: String,
    deposited_at: i64,
}

/// The minimal envelope shape the relay needs: just the routing key.
#[derive(Deserialize)]
struct RoutingView {
    sender_fp: String,
    recipient_fp: String,
}

/// Shared relay state behind the HTTP surface.
pub struct RelayState {
    config: RelayConfig,
    clock: SharedClock,
    registry: Mutex<HashMap<String, RegistryEntry>>,
    queues: Mutex<HashMap<String, VecDeque<HeldEnvelope>>>,
}

/// Outcome of a `register` call, for logging and the HTTP layer.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    Refreshed,
    /// Same name re-registered under a different fingerprint. Accepted
    /// (last-writer-wins, the v0 default policy) but logged loudly.
    FingerprintChanged { previous: String },
}

impl RelayState {
    pub fn new(config: RelayConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            registry: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a registry entry keyed by (lowercased) name.
    pub fn register(&self, req: RegisterRequest) -> RegisterOutcome {
        let name = req.name.to_lowercase();
        let entry = RegistryEntry {
            name: name.clone(),
            fp: req.fp,
            sign_pk: req.sign_pk,
            enc_pk: req.enc_pk,
            version: req.version,
            registered_at: self.clock.now_millis(),
        };

        let mut registry = self.registry.lock();
        let outcome = match registry.get(&name) {
            None => RegisterOutcome::New,
            Some(previous) if previous.fp == entry.fp => RegisterOutcome::Refreshed,
            Some(previous) => RegisterOutcome::FingerprintChanged {
                previous: previous.fp.clone(),
            },
        };
        if let RegisterOutcome::FingerprintChanged { ref previous } = outcome {
            tracing::warn!(
                %name,
                old_fp = %previous,
                new_fp = %entry.fp,
                "Registration replaced the fingerprint for a name"
            );
        }
        registry.insert(name, entry);
        outcome
    }

    /// Look up a registry entry by name.
    pub fn lookup(&self, name: &str) -> Option<RegistryEntry> {
        self.registry.lock().get(&name.to_lowercase()).cloned()
    }

    /// Queue an envelope for its recipient.
    ///
    /// The raw bytes are parsed once to extract `recipient_fp` and to make
    /// sure the stored value is well-formed JSON; nothing else is inspected.
    pub fn deposit(&self, raw: &[u8]) -> MailResult<()> {
        let body: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| MailError::MalformedEnvelope(format!("deposit body: {}", e)))?;
        let routing: RoutingView = serde_json::from_value(body.clone())
            .map_err(|e| MailError::MalformedEnvelope(format!("routing fields: {}", e)))?;

        let size = raw.len();
        if size > self.config.max_bytes {
            return Err(MailError::Mailbox(format!(
                "envelope of {} bytes exceeds the per-recipient budget",
                size
            )));
        }

        let mut queues = self.queues.lock();
        let queue = queues.entry(routing.recipient_fp.clone()).or_default();

        // Make room: oldest out first
        let mut queued_bytes: usize = queue.iter().map(|h| h.size).sum();
        while queue.len() >= self.config.max_envelopes
            || queued_bytes + size > self.config.max_bytes
        {
            match queue.pop_front() {
                Some(dropped) => {
                    queued_bytes -= dropped.size;
                    tracing::warn!(
                        recipient = %routing.recipient_fp,
                        sender = %dropped.sender_fp,
                        age_ms = self.clock.now_millis() - dropped.deposited_at,
                        "Recipient queue full, dropped oldest envelope"
                    );
                }
                None => break,
            }
        }

        queue.push_back(HeldEnvelope {
            body,
            size,
            sender_fp: routing.sender_fp.clone(),
            deposited_at: self.clock.now_millis(),
        });
        tracing::info!(
            recipient = %routing.recipient_fp,
            sender = %routing.sender_fp,
            size,
            "Envelope deposited"
        );
        Ok(())
    }

    /// Return and drain everything queued for `fp`.
    pub fn pickup(&self, fp: &str) -> Vec<serde_json::Value> {
        let drained = self.queues.lock().remove(fp).unwrap_or_default();
        if !drained.is_empty() {
            tracing::info!(recipient = %fp, count = drained.len(), "Queue drained on pickup");
        }
        drained.into_iter().map(|h| h.body).collect()
    }

    /// Totals across all queues.
    pub fn stats(&self) -> RelayStats {
        let queues = self.queues.lock();
        let mut stats = RelayStats {
            messages_held: 0,
            total_bytes: 0,
        };
        for queue in queues.values() {
            stats.messages_held += queue.len() as u64;
            stats.total_bytes += queue.iter().map(|h| h.size as u64).sum::<u64>();
        }
        stats
    }
}

/// Build the relay HTTP surface over shared state.
pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/v0/register", post(handle_register))
        .route("/v0/lookup/{name}", get(handle_lookup))
        .route("/v0/deposit", post(handle_deposit))
        .route("/v0/pickup/{fp}", get(handle_pickup))
        .route("/v0/stats", get(handle_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the relay until the process exits.
pub async fn serve_relay(
    addr: std::net::SocketAddr,
    state: Arc<RelayState>,
) -> MailResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let stats = state.stats();
    tracing::info!(
        %addr,
        messages_held = stats.messages_held,
        "Relay listening"
    );
    axum::serve(listener, relay_router(state))
        .await
        .map_err(MailError::Io)
}

async fn handle_register(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<RegisterRequest>,
) -> Json<serde_json::Value> {
    let name = req.name.to_lowercase();
    state.register(req);
    Json(serde_json::json!({ "status": "ok", "name": name }))
}

async fn handle_lookup(
    State(state): State<Arc<RelayState>>,
    Path(name): Path<String>,
) -> Response {
    match state.lookup(&name) {
        Some(entry) => Json(entry).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("name {:?} not registered", name) })),
        )
            .into_response(),
    }
}

async fn handle_deposit(
    State(state): State<Arc<RelayState>>,
    body: axum::body::Bytes,
) -> Response {
    match state.deposit(&body) {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(MailError::MalformedEnvelope(e)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e })),
        )
            .into_response(),
        Err(MailError::Mailbox(e)) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({ "error": e })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_pickup(
    State(state): State<Arc<RelayState>>,
    Path(fp): Path<String>,
) -> Json<PickupResponse> {
    Json(PickupResponse {
        envelopes: state.pickup(&fp),
    })
}

async fn handle_stats(State(state): State<Arc<RelayState>>) -> Json<RelayStats> {
    Json(state.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::Arc;

    fn test_state(config: RelayConfig) -> RelayState {
        RelayState::new(config, Arc::new(SystemClock))
    }

    fn envelope_json(sender: &str, recipient: &str, padding: usize) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "version": 0,
            "sender_fp": sender,
            "recipient_fp": recipient,
            "ciphertext": "x".repeat(padding),
            "signature": "sig",
            "sent_at": 1,
        }))
        .unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let state = test_state(RelayConfig::default());
        let outcome = state.register(RegisterRequest {
            name: "Alice".to_string(),
            fp: "fp1".to_string(),
            sign_pk: "spk".to_string(),
            enc_pk: "epk".to_string(),
            version: 0,
        });
        assert_eq!(outcome, RegisterOutcome::New);

        // Lookup is case-insensitive on the registered name
        let entry = state.lookup("alice").unwrap();
        assert_eq!(entry.fp, "fp1");
        assert!(state.lookup("bob").is_none());
    }

    #[test]
    fn test_reregister_same_fp_refreshes() {
        let state = test_state(RelayConfig::default());
        let req = RegisterRequest {
            name: "alice".to_string(),
            fp: "fp1".to_string(),
            sign_pk: "spk".to_string(),
            enc_pk: "epk".to_string(),
            version: 0,
        };
        state.register(req.clone());
        assert_eq!(state.register(req), RegisterOutcome::Refreshed);
    }

    #[test]
    fn test_reregister_new_fp_is_last_writer_wins() {
        let state = test_state(RelayConfig::default());
        state.register(RegisterRequest {
            name: "alice".to_string(),
            fp: "fp1".to_string(),
            sign_pk: "spk1".to_string(),
            enc_pk: "epk1".to_string(),
            version: 0,
        });
        let outcome = state.register(RegisterRequest {
            name: "alice".to_string(),
            fp: "fp2".to_string(),
            sign_pk: "spk2".to_string(),
            enc_pk: "epk2".to_string(),
            version: 0,
        });
        assert_eq!(
            outcome,
            RegisterOutcome::FingerprintChanged {
                previous: "fp1".to_string()
            }
        );
        assert_eq!(state.lookup("alice").unwrap().fp, "fp2");
    }

    #[test]
    fn test_deposit_pickup_drains() {
        let state = test_state(RelayConfig::default());
        state.deposit(&envelope_json("a", "bob-fp", 10)).unwrap();
        state.deposit(&envelope_json("a", "bob-fp", 10)).unwrap();
        assert_eq!(state.stats().messages_held, 2);

        let picked = state.pickup("bob-fp");
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0]["sender_fp"], "a");

        // Drained in one step
        assert!(state.pickup("bob-fp").is_empty());
        assert_eq!(state.stats().messages_held, 0);
    }

    #[test]
    fn test_deposit_rejects_garbage() {
        let state = test_state(RelayConfig::default());
        assert!(matches!(
            state.deposit(b"not json"),
            Err(MailError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            state.deposit(b"{\"version\": 0}"),
            Err(MailError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_queue_cap_drops_oldest() {
        let state = RelayState::new(
            RelayConfig {
                max_envelopes: 3,
                max_bytes: 1 << 20,
            },
            Arc::new(ManualClock::at(0)),
        );
        for sender in ["s1", "s2", "s3", "s4"] {
            state.deposit(&envelope_json(sender, "bob-fp", 10)).unwrap();
        }

        let picked = state.pickup("bob-fp");
        assert_eq!(picked.len(), 3);
        // s1 was dropped on overflow
        let senders: Vec<_> = picked.iter().map(|e| e["sender_fp"].as_str().unwrap()).collect();
        assert_eq!(senders, vec!["s2", "s3", "s4"]);
    }

    #[test]
    fn test_byte_budget_drops_oldest() {
        let state = RelayState::new(
            RelayConfig {
                max_envelopes: 100,
                max_bytes: 1000,
            },
            Arc::new(ManualClock::at(0)),
        );
        state.deposit(&envelope_json("s1", "bob-fp", 400)).unwrap();
        state.deposit(&envelope_json("s2", "bob-fp", 400)).unwrap();
        // Pushes the total over 1000 bytes; s1 must go
        state.deposit(&envelope_json("s3", "bob-fp", 400)).unwrap();

        let senders: Vec<_> = state
            .pickup("bob-fp")
            .iter()
            .map(|e| e["sender_fp"].as_str().unwrap().to_string())
            .collect();
        assert!(!senders.contains(&"s1".to_string()));
        assert!(senders.contains(&"s3".to_string()));
    }

    #[test]
    fn test_oversized_envelope_refused() {
        let state = RelayState::new(
            RelayConfig {
                max_envelopes: 100,
                max_bytes: 200,
            },
            Arc::new(ManualClock::at(0)),
        );
        assert!(matches!(
            state.deposit(&envelope_json("s1", "bob-fp", 500)),
            Err(MailError::Mailbox(_))
        ));
        assert_eq!(state.stats().messages_held, 0);
    }

    #[test]
    fn test_queues_are_per_recipient() {
        let state = test_state(RelayConfig::default());
        state.deposit(&envelope_json("a", "bob-fp", 10)).unwrap();
        state.deposit(&envelope_json("a", "carol-fp", 10)).unwrap();

        assert_eq!(state.pickup("bob-fp").len(), 1);
        assert_eq!(state.pickup("carol-fp").len(), 1);
    }

    #[test]
    fn test_stats_counts_bytes() {
        let state = test_state(RelayConfig::default());
        let raw = envelope_json("a", "bob-fp", 10);
        state.deposit(&raw).unwrap();
        let stats = state.stats();
        assert_eq!(stats.messages_held, 1);
        assert_eq!(stats.total_bytes, raw.len() as u64);
    }
}
