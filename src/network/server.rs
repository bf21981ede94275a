//! WebSocket Round Server
//!
//! Async WebSocket front end for the round runtime. Every connection
//! observes the shared event stream; authenticated connections can also
//! bet, cash out, read their balance and chat.
//!
//! ```text
//!  client ──ws──▶ reader loop ──▶ handle_client_message ──▶ RoundHandle / Wallet
//!     ▲                │
//!     │                ├── Observer (BroadcastChannel) ──┐
//!     │                └── chat (broadcast) ─────────────┤
//!     └──── sender task ◀──── mpsc<ServerMessage> ◀──────┘
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::money::Usd;
use crate::network::auth::{authenticate, AuthConfig, Identity};
use crate::network::broadcast::{BroadcastChannel, Observed};
use crate::network::protocol::{
    AuthResult, BalanceView, BetView, CashoutView, ChatMessage, ClientMessage, ErrorCode, PlaceBetRequest,
    ServerError, ServerMessage, StateView, MAX_CHAT_LEN,
};
use crate::round::error::RoundError;
use crate::round::ledger::BetRequest;
use crate::round::runtime::RoundHandle;
use crate::round::state::Currency;
use crate::services::oracle::{snapshot_price, OracleConfig, PriceOracle};
use crate::services::wallet::Wallet;

/// Chat lines buffered per connection before older ones are skipped.
const CHAT_BUFFER: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue.
    pub outbound_buffer: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_buffer: 256,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from `CRASH_BIND_ADDR`, `CRASH_MAX_CONNECTIONS` and
    /// `CRASH_OUTBOUND_BUFFER`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("CRASH_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("CRASH_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            outbound_buffer: std::env::var("CRASH_OUTBOUND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.outbound_buffer),
            version: defaults.version,
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum CrashServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Everything a connection needs, shared across connection tasks.
struct ServerContext {
    config: ServerConfig,
    auth: AuthConfig,
    rounds: RoundHandle,
    wallet: Arc<dyn Wallet>,
    events: Arc<BroadcastChannel>,
    chat: broadcast::Sender<ChatMessage>,
    oracle: Arc<dyn PriceOracle>,
    oracle_config: OracleConfig,
    connections: AtomicUsize,
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    identity: Option<Identity>,
}

/// The WebSocket server.
pub struct CrashServer {
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CrashServer {
    /// Create a server in front of a running round runtime.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        rounds: RoundHandle,
        wallet: Arc<dyn Wallet>,
        events: Arc<BroadcastChannel>,
        oracle: Arc<dyn PriceOracle>,
        oracle_config: OracleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (chat, _) = broadcast::channel(CHAT_BUFFER);
        if !auth.is_configured() {
            warn!("authentication not configured, connections get guest identities");
        }
        Self {
            ctx: Arc::new(ServerContext {
                config,
                auth,
                rounds,
                wallet,
                events,
                chat,
                oracle,
                oracle_config,
                connections: AtomicUsize::new(0),
            }),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), CrashServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CrashServerError> {
        info!("crash server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.ctx.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        ctx.connections.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed for {}: {}", addr, e);
                    ctx.connections.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(ctx.config.outbound_buffer);
            let mut observer = ctx.events.subscribe();
            let mut chat_rx = ctx.chat.subscribe();

            let mut conn = Connection {
                addr,
                identity: (!ctx.auth.is_configured()).then(Identity::guest),
            };

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    let closing = matches!(msg, ServerMessage::Shutdown { .. });
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                    if closing {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let reply = match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => handle_client_message(&ctx, &mut conn, client_msg).await,
                                    Err(e) => {
                                        debug!("invalid message from {}: {}", addr, e);
                                        Some(ServerMessage::Error(ServerError::new(
                                            ErrorCode::InvalidMessage,
                                            "invalid message format",
                                        )))
                                    }
                                };
                                if let Some(reply) = reply {
                                    if msg_tx.send(reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                    ErrorCode::InvalidMessage,
                                    "binary frames are not supported",
                                ))).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("websocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    observed = observer.next() => {
                        let msg = match observed {
                            Some(Observed::Event(envelope)) => ServerMessage::Event {
                                seq: envelope.seq,
                                event: envelope.event,
                            },
                            Some(Observed::Lagged(missed)) => ServerMessage::ResyncRequired { missed },
                            None => ServerMessage::Shutdown { reason: "event stream closed".to_string() },
                        };
                        let closing = matches!(msg, ServerMessage::Shutdown { .. });
                        if msg_tx.send(msg).await.is_err() || closing {
                            break;
                        }
                    }
                    chat = chat_rx.recv() => {
                        match chat {
                            Ok(line) => {
                                if msg_tx.send(ServerMessage::Chat(line)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!("client {} skipped {} chat lines", addr, skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued replies drain before the socket goes away.
            drop(msg_tx);
            let _ = sender_task.await;
            ctx.connections.fetch_sub(1, Ordering::SeqCst);
            debug!("client {} cleaned up", addr);
        });
    }

    /// Signal the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub fn connection_count(&self) -> usize {
        self.ctx.connections.load(Ordering::SeqCst)
    }
}

/// Dispatch one client message and produce the direct reply, if any.
async fn handle_client_message(
    ctx: &ServerContext,
    conn: &mut Connection,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let reply = match msg {
        ClientMessage::Auth { token } => handle_auth(ctx, conn, &token),
        ClientMessage::GetState => match ctx.rounds.get_state().await {
            Ok(snapshot) => ServerMessage::State(StateView::new(&snapshot, current_prices(ctx).await)),
            Err(e) => ServerMessage::round_error(&e),
        },
        ClientMessage::PlaceBet(req) => {
            let Some(identity) = conn.identity.clone() else {
                return Some(not_authenticated());
            };
            match place_bet(ctx, identity, req).await {
                Ok(view) => ServerMessage::BetAccepted(view),
                Err(e) => {
                    debug!(addr = %conn.addr, error = %e, "bet rejected");
                    ServerMessage::round_error(&e)
                }
            }
        }
        ClientMessage::CashOut => {
            let Some(identity) = conn.identity.as_ref() else {
                return Some(not_authenticated());
            };
            match ctx.rounds.cash_out(identity.user_id).await {
                Ok(settlement) => ServerMessage::CashoutSuccess(CashoutView::from(&settlement)),
                Err(e) => {
                    debug!(addr = %conn.addr, error = %e, "cash-out rejected");
                    ServerMessage::round_error(&e)
                }
            }
        }
        ClientMessage::GetBalance => {
            let Some(identity) = conn.identity.as_ref() else {
                return Some(not_authenticated());
            };
            match balance(ctx, identity).await {
                Ok(view) => ServerMessage::Balance(view),
                Err(e) => {
                    warn!(addr = %conn.addr, error = %e, "balance lookup failed");
                    ServerMessage::round_error(&e)
                }
            }
        }
        ClientMessage::Chat { message } => {
            let Some(identity) = conn.identity.as_ref() else {
                return Some(not_authenticated());
            };
            let message = message.trim();
            if message.is_empty() || message.chars().count() > MAX_CHAT_LEN {
                return Some(ServerMessage::Error(ServerError::new(
                    ErrorCode::InvalidChatMessage,
                    format!("chat messages must be 1 to {MAX_CHAT_LEN} characters"),
                )));
            }
            // Delivered back to the sender through its own chat subscription.
            let _ = ctx.chat.send(ChatMessage {
                user_id: identity.user_id.to_uuid_string(),
                username: identity.username.clone(),
                message: message.to_string(),
                timestamp: now_millis(),
            });
            return None;
        }
        ClientMessage::Ping { timestamp } => ServerMessage::Pong { timestamp, server_time: now_millis() },
    };
    Some(reply)
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Prices for every currency that currently has a usable quote.
async fn current_prices(ctx: &ServerContext) -> BTreeMap<Currency, f64> {
    let mut prices = BTreeMap::new();
    for currency in Currency::ALL {
        match snapshot_price(ctx.oracle.as_ref(), currency, &ctx.oracle_config).await {
            Ok(price) => {
                prices.insert(currency, price);
            }
            Err(e) => debug!(%currency, error = %e, "no price for state snapshot"),
        }
    }
    prices
}

async fn balance(ctx: &ServerContext, identity: &Identity) -> Result<BalanceView, RoundError> {
    let prices = current_prices(ctx).await;
    let mut rows = Vec::with_capacity(Currency::ALL.len());
    for currency in Currency::ALL {
        let held = ctx.wallet.balance(&identity.user_id, currency).await?;
        rows.push((currency, held.to_f64(), prices.get(&currency).copied()));
    }
    Ok(BalanceView::new(rows))
}

fn handle_auth(ctx: &ServerContext, conn: &mut Connection, token: &str) -> ServerMessage {
    let version = ctx.config.version.clone();

    if !ctx.auth.is_configured() {
        // Guest mode: keep the identity assigned at connect.
        let identity = conn.identity.get_or_insert_with(Identity::guest);
        return ServerMessage::AuthResult(AuthResult {
            success: true,
            user_id: Some(identity.user_id.to_uuid_string()),
            username: Some(identity.username.clone()),
            error: None,
            server_version: version,
        });
    }

    match authenticate(token, &ctx.auth) {
        Ok(identity) => {
            info!(addr = %conn.addr, user = %identity.user_id, "client authenticated");
            let result = AuthResult {
                success: true,
                user_id: Some(identity.user_id.to_uuid_string()),
                username: Some(identity.username.clone()),
                error: None,
                server_version: version,
            };
            conn.identity = Some(identity);
            ServerMessage::AuthResult(result)
        }
        Err(e) => {
            warn!(addr = %conn.addr, error = %e, "authentication failed");
            ServerMessage::AuthResult(AuthResult {
                success: false,
                user_id: None,
                username: None,
                error: Some(e.to_string()),
                server_version: version,
            })
        }
    }
}

/// Parse the request, take the price snapshot and hand the bet to the runtime.
async fn place_bet(
    ctx: &ServerContext,
    identity: Identity,
    req: PlaceBetRequest,
) -> Result<BetView, RoundError> {
    let currency: Currency = req
        .currency
        .parse()
        .map_err(|_| RoundError::UnsupportedCurrency(req.currency.clone()))?;
    let usd_amount = Usd::from_f64_cents(req.amount).ok_or(RoundError::InvalidBetAmount)?;
    let price = snapshot_price(ctx.oracle.as_ref(), currency, &ctx.oracle_config)
        .await
        .map_err(|e| RoundError::InvalidPrice(e.to_string()))?;

    let bet = ctx
        .rounds
        .place_bet(BetRequest {
            user_id: identity.user_id,
            username: identity.username,
            usd_amount,
            currency,
            price,
        })
        .await?;
    Ok(BetView::from(&bet))
}

fn not_authenticated() -> ServerMessage {
    ServerMessage::Error(ServerError::new(ErrorCode::NotAuthenticated, "authenticate first"))
}
