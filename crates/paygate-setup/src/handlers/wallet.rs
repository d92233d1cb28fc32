use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use paygate_core::ldk;

use crate::state::{AppState, BalanceResponse, NodeInfo};

/// GET /api/info -- node identity and service counters.
pub async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    let balance = match state.wallet.balance_sats().await {
        Ok(sats) => sats,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let (node_id, addresses) = match &state.node {
        Some(node) => (Some(ldk::node_id(node)), ldk::listening_addresses(node)),
        None => (None, Vec::new()),
    };

    Json(NodeInfo {
        node_id,
        node_alias: state.node_alias.clone(),
        addresses,
        lightning_balance_sats: balance,
        active_sessions: state.sessions.len(),
    })
    .into_response()
}

/// GET /api/balance -- spendable balance only.
pub async fn balance_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.wallet.balance_sats().await {
        Ok(balance_sats) => Json(BalanceResponse { balance_sats }).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
