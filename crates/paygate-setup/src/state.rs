use std::sync::Arc;

use serde::{Deserialize, Serialize};

use paygate_core::WalletCapability;
use paygate_stream::{SessionStore, StreamConfig};

use super::events::ConsoleEmitter;

// ---------------------------------------------------------------------------
// Axum app state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub wallet: Arc<dyn WalletCapability>,
    /// The embedded node, when running over real Lightning. `None` under
    /// test wallets.
    pub node: Option<Arc<ldk_node::Node>>,
    pub node_alias: String,
    pub emitter: Arc<ConsoleEmitter>,
    pub sessions: SessionStore,
    pub stream_config: StreamConfig,
}

// ---------------------------------------------------------------------------
// API request/response types
// ---------------------------------------------------------------------------

/// Body of POST /api/stream. Knobs override the service defaults for this
/// session only.
#[derive(Deserialize)]
pub struct StreamRequest {
    /// Text to stream back, token by token.
    pub text: String,
    #[serde(default)]
    pub sats_per_batch: Option<u64>,
    #[serde(default)]
    pub tokens_per_batch: Option<usize>,
    #[serde(default)]
    pub max_batches: Option<u32>,
    #[serde(default)]
    pub payment_timeout_ms: Option<u64>,
    #[serde(default)]
    pub first_batch_free: Option<bool>,
}

#[derive(Serialize)]
pub struct NodeInfo {
    pub node_id: Option<String>,
    pub node_alias: String,
    pub addresses: Vec<String>,
    pub lightning_balance_sats: u64,
    pub active_sessions: usize,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub balance_sats: u64,
}

#[derive(Deserialize)]
pub struct EventsHistoryQuery {
    #[serde(default)]
    pub since_id: Option<u64>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
}
