//! Node assembly: HTTP surface + background loops.
//!
//! [`Node::start`] wires the whole daemon together: identity, mailbox,
//! discovery, router, the axum surface, and the three background loops
//! (relay registration, relay pickup, outbox drain). Everything shares one
//! [`NodeContext`]; there are no process-global singletons, so tests run
//! several nodes in one process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as HttpRouter};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::clock::{SharedClock, SystemClock};
use crate::config::NodeConfig;
use crate::crypto::Identity;
use crate::discovery::Discovery;
use crate::encoding::b64;
use crate::envelope::{MessageEnvelope, MessageKind, ENVELOPE_VERSION};
use crate::error::{MailError, MailResult};
use crate::mailbox::{DeliveryStatus, DeliveryTier, Mailbox, StoredMessage};
use crate::peer::PeerInfo;
use crate::relay::RegisterRequest;
use crate::relay_client::RelayClient;
use crate::router::{Router, RouterConfig, SendOutcome};

/// Everything a node operation needs, passed explicitly.
pub struct NodeContext {
    pub config: NodeConfig,
    pub identity: Arc<Identity>,
    pub mailbox: Mailbox,
    pub router: Router,
    pub relay: Option<RelayClient>,
    pub clock: SharedClock,
}

/// A running node: HTTP server, discovery, and background loops.
pub struct Node {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    discovery: Option<Discovery>,
    server: JoinHandle<()>,
    loops: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bring a node up from configuration.
    ///
    /// Creates the data directories, loads (or generates) the identity,
    /// opens the mailbox, binds the HTTP surface, starts mDNS when enabled,
    /// and spawns the background loops.
    pub async fn start(config: NodeConfig) -> MailResult<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        config.ensure_dirs()?;

        let identity = Arc::new(Identity::load_or_create(&config.identity_path())?);
        tracing::info!(
            fp = %identity.fingerprint(),
            address = %config.address(),
            "Node identity loaded"
        );

        let mailbox = Mailbox::open(config.db_path())?;
        let relay = match &config.relay_url {
            Some(url) => Some(RelayClient::new(url, config.relay_timeout)?),
            None => None,
        };

        let router = Router::new(
            identity.clone(),
            mailbox.clone(),
            relay.clone(),
            clock.clone(),
            config.address(),
            RouterConfig {
                direct_timeout: config.direct_timeout,
                backoff_base: config.backoff_base,
                backoff_cap: config.backoff_cap,
                max_attempts: config.max_attempts,
                outbox_batch: config.outbox_batch,
            },
        )?;

        let ctx = Arc::new(NodeContext {
            identity,
            mailbox,
            router,
            relay,
            clock,
            config,
        });

        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", ctx.config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "Node HTTP surface listening");

        let app = node_router(ctx.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Node HTTP server exited");
            }
        });

        let discovery = if ctx.config.enable_mdns {
            match Discovery::start(
                &ctx.identity,
                &ctx.config.name,
                local_addr.port(),
                ctx.mailbox.clone(),
                ctx.clock.clone(),
            ) {
                Ok(discovery) => Some(discovery),
                Err(e) => {
                    // Best-effort: a node without multicast still works via relay
                    tracing::warn!(error = %e, "mDNS unavailable, continuing without discovery");
                    None
                }
            }
        } else {
            None
        };

        let mut loops = vec![spawn_outbox_drain_loop(ctx.clone())];
        if ctx.relay.is_some() {
            loops.push(spawn_registration_loop(ctx.clone()));
            loops.push(spawn_pickup_loop(ctx.clone()));
        }

        Ok(Self {
            ctx,
            local_addr,
            discovery,
            server,
            loops,
        })
    }

    /// The bound address of the HTTP surface (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared context, for embedding and tests.
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Stop the node: no new inbound requests, loops cancelled, mDNS
    /// withdrawn. In-flight outbox entries stay on disk and resume on the
    /// next start.
    pub async fn shutdown(self) {
        self.server.abort();
        for task in self.loops {
            task.abort();
        }
        if let Some(discovery) = self.discovery {
            discovery.shutdown();
        }
        tracing::info!("Node stopped");
    }
}

/// Verify, decrypt and persist one inbound envelope.
///
/// The sender must already be known: signature verification needs a pinned
/// key, and the name-keyed relay registry cannot resolve a bare fingerprint.
/// Returns the stored message id (the existing one for a duplicate).
pub fn handle_inbound(ctx: &NodeContext, envelope: MessageEnvelope) -> MailResult<String> {
    let sender = match ctx.mailbox.get_peer_by_fp(&envelope.sender_fp)? {
        Some(peer) => peer,
        None => {
            tracing::warn!(sender_fp = %envelope.sender_fp, "Refusing envelope from unknown sender");
            return Err(MailError::BadSignature);
        }
    };

    let payload = envelope.verify_and_open(&ctx.identity, &sender.sign_pk)?;
    let now = ctx.clock.now_millis();
    let message = StoredMessage::inbound(&payload, envelope, now);
    let id = ctx.mailbox.insert_inbound(message, &payload.nonce)?;
    tracing::info!(%id, from = %payload.from_addr, "Inbound message stored");
    Ok(id)
}

/// Build the node HTTP surface.
pub fn node_router(ctx: Arc<NodeContext>) -> HttpRouter {
    HttpRouter::new()
        .route("/v0/receive", post(receive))
        .route("/v0/inbox", get(inbox))
        .route("/v0/send", post(send))
        .route("/v0/identity", get(identity))
        .route("/v0/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn receive(State(ctx): State<Arc<NodeContext>>, body: axum::body::Bytes) -> Response {
    let envelope: MessageEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("malformed envelope: {}", e) })),
            )
                .into_response();
        }
    };

    match handle_inbound(&ctx, envelope) {
        Ok(id) => Json(serde_json::json!({ "status": "ok", "id": id })).into_response(),
        Err(e) => {
            let status = match &e {
                MailError::BadSignature | MailError::BadKey(_) => StatusCode::UNAUTHORIZED,
                MailError::DecryptFailed | MailError::MalformedEnvelope(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                MailError::VersionUnsupported(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            // Log with sender detail; answer with the bare status only
            tracing::warn!(error = %e, %status, "Inbound envelope refused");
            (status, Json(serde_json::json!({ "error": "refused" }))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct InboxQuery {
    cursor: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct InboxResponse {
    messages: Vec<StoredMessage>,
}

async fn inbox(
    State(ctx): State<Arc<NodeContext>>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<InboxResponse>, StatusCode> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let messages = ctx
        .mailbox
        .inbox(query.cursor.as_deref(), limit)
        .map_err(|e| {
            tracing::error!(error = %e, "Inbox read failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(InboxResponse { messages }))
}

/// Body of `POST /v0/send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub kind: Option<MessageKind>,
}

#[derive(Serialize)]
struct SendResponse {
    id: String,
    status: DeliveryStatus,
    tier: Option<DeliveryTier>,
}

async fn send(State(ctx): State<Arc<NodeContext>>, Json(req): Json<SendRequest>) -> Response {
    let kind = req.kind.unwrap_or(MessageKind::Message);
    match ctx.router.send(&req.to, &req.subject, &req.body, kind).await {
        Ok(SendOutcome { id, status, tier }) => {
            Json(SendResponse { id, status, tier }).into_response()
        }
        Err(e) => {
            let status = match &e {
                MailError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
                MailError::UnknownRecipient(_) => StatusCode::NOT_FOUND,
                MailError::IdentityConflict { .. } | MailError::PeerConflict { .. } => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

#[derive(Serialize)]
struct IdentityResponse {
    name: String,
    address: String,
    fp: String,
    sign_pk: String,
    enc_pk: String,
    version: u32,
}

async fn identity(State(ctx): State<Arc<NodeContext>>) -> Json<IdentityResponse> {
    Json(IdentityResponse {
        name: ctx.config.name.clone(),
        address: ctx.config.address().to_string(),
        fp: ctx.identity.fingerprint(),
        sign_pk: b64(&ctx.identity.sign_public()),
        enc_pk: b64(&ctx.identity.enc_public()),
        version: ENVELOPE_VERSION,
    })
}

#[derive(Serialize)]
struct PeersResponse {
    peers: Vec<PeerView>,
}

#[derive(Serialize)]
struct PeerView {
    fp: String,
    name: String,
    address: String,
    endpoint: Option<String>,
    last_seen: i64,
    source: crate::peer::PeerSource,
}

async fn peers(
    State(ctx): State<Arc<NodeContext>>,
) -> Result<Json<PeersResponse>, StatusCode> {
    let peers = ctx.mailbox.list_peers().map_err(|e| {
        tracing::error!(error = %e, "Peer listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(PeersResponse {
        peers: peers.into_iter().map(peer_view).collect(),
    }))
}

fn peer_view(peer: PeerInfo) -> PeerView {
    PeerView {
        address: peer.address().to_string(),
        endpoint: peer.endpoint.as_ref().map(|e| e.to_string()),
        fp: peer.fp,
        name: peer.name,
        last_seen: peer.last_seen,
        source: peer.source,
    }
}

/// Run a named background loop, restarting it if it ever panics.
///
/// Aborting the returned handle cancels the loop at its next suspension
/// point, which is the cooperative shutdown path.
fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    use futures::FutureExt;
    tokio::spawn(async move {
        loop {
            match std::panic::AssertUnwindSafe(factory()).catch_unwind().await {
                Ok(()) => break,
                Err(_) => {
                    tracing::error!(task = name, "Background task panicked, restarting");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    })
}

/// Periodically re-register this node with the relay registry.
fn spawn_registration_loop(ctx: Arc<NodeContext>) -> JoinHandle<()> {
    spawn_supervised("registration", move || registration_loop(ctx.clone()))
}

async fn registration_loop(ctx: Arc<NodeContext>) {
    let Some(relay) = ctx.relay.clone() else { return };
    let request = RegisterRequest {
        name: ctx.config.name.clone(),
        fp: ctx.identity.fingerprint(),
        sign_pk: b64(&ctx.identity.sign_public()),
        enc_pk: b64(&ctx.identity.enc_public()),
        version: ENVELOPE_VERSION,
    };
    let mut ticker = tokio::time::interval(ctx.config.registration_interval);
    loop {
        ticker.tick().await;
        match relay.register(&request).await {
            Ok(()) => tracing::debug!(name = %request.name, "Registered with relay"),
            Err(e) => tracing::warn!(error = %e, "Relay registration failed"),
        }
    }
}

/// Periodically drain this node's relay queue into the mailbox.
fn spawn_pickup_loop(ctx: Arc<NodeContext>) -> JoinHandle<()> {
    spawn_supervised("pickup", move || pickup_loop(ctx.clone()))
}

async fn pickup_loop(ctx: Arc<NodeContext>) {
    let Some(relay) = ctx.relay.clone() else { return };
    let fp = ctx.identity.fingerprint();
    let mut ticker = tokio::time::interval(ctx.config.pickup_interval);
    loop {
        ticker.tick().await;
        match relay.pickup(&fp).await {
            Ok(envelopes) => {
                for envelope in envelopes {
                    let sender_fp = envelope.sender_fp.clone();
                    if let Err(e) = handle_inbound(&ctx, envelope) {
                        tracing::warn!(
                            sender_fp = %sender_fp,
                            error = %e,
                            "Dropped envelope from relay pickup"
                        );
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "Relay pickup failed"),
        }
    }
}

/// Periodically retry due outbox entries.
fn spawn_outbox_drain_loop(ctx: Arc<NodeContext>) -> JoinHandle<()> {
    spawn_supervised("outbox-drain", move || outbox_drain_loop(ctx.clone()))
}

async fn outbox_drain_loop(ctx: Arc<NodeContext>) {
    let mut ticker = tokio::time::interval(ctx.config.outbox_tick);
    loop {
        ticker.tick().await;
        match ctx.router.drain_due().await {
            Ok(0) => {}
            Ok(delivered) => tracing::info!(delivered, "Outbox drain pass complete"),
            Err(e) => tracing::error!(error = %e, "Outbox drain pass failed"),
        }
    }
}
