//! Network Layer
//!
//! WebSocket front end and event fan-out. Nothing here touches round state
//! directly; every request goes through the runtime's `RoundHandle`.

pub mod auth;
pub mod broadcast;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, Identity, TokenClaims};
pub use broadcast::{BroadcastChannel, EventEnvelope, Observed, Observer};
pub use protocol::{
    AuthResult, BalanceView, BetView, CashoutView, ChatMessage, ClientMessage, CurrencyBalance, ErrorCode,
    PlaceBetRequest, ServerError, ServerMessage, StateView, MAX_CHAT_LEN,
};
pub use server::{CrashServer, CrashServerError, ServerConfig};
