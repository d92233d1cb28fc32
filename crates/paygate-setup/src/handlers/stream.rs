//! Metered stream endpoints: open a session over SSE, accept payment
//! proofs back over POST.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use paygate_stream::{ProofError, ProofResponse, ProofSubmission, StreamProvider};

use crate::state::{AppState, StreamRequest};

/// Split the request text into whitespace tokens, each re-carrying its
/// trailing space so concatenating batches reconstructs the text.
fn tokenize(text: &str) -> Vec<Result<String, anyhow::Error>> {
    text.split_whitespace()
        .map(|word| Ok(format!("{word} ")))
        .collect()
}

/// POST /api/stream -- open a metered session. Events arrive as SSE frames.
pub async fn stream_handler(
    State(state): State<AppState>,
    Json(req): Json<StreamRequest>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let mut config = state.stream_config.clone();
    if let Some(sats) = req.sats_per_batch {
        config.sats_per_batch = sats;
    }
    if let Some(tokens) = req.tokens_per_batch {
        config.tokens_per_batch = tokens;
    }
    if let Some(max) = req.max_batches {
        config.max_batches = max;
    }
    if let Some(ms) = req.payment_timeout_ms {
        config.payment_timeout = Duration::from_millis(ms);
    }
    if let Some(free) = req.first_batch_free {
        config.first_batch_free = free;
    }

    state.emitter.emit(
        "stream",
        "STREAM_OPEN",
        serde_json::json!({
            "tokens": req.text.split_whitespace().count(),
            "sats_per_batch": config.sats_per_batch,
            "tokens_per_batch": config.tokens_per_batch,
        }),
    );

    let provider = StreamProvider::new(
        state.wallet.clone(),
        state.sessions.clone(),
        state.stream_config.clone(),
    );
    let rx = provider.open_with(tokio_stream::iter(tokenize(&req.text)), config);

    let stream = ReceiverStream::new(rx).map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().data(json))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// POST /api/stream/proof -- submit a payment preimage to unlock the
/// pending batch.
pub async fn proof_handler(
    State(state): State<AppState>,
    Json(proof): Json<ProofSubmission>,
) -> impl IntoResponse {
    match state.sessions.submit_proof(&proof.session_id, &proof.preimage) {
        Ok(batch_index) => {
            state.emitter.emit(
                "stream",
                "PROOF_ACCEPTED",
                serde_json::json!({
                    "session_id": proof.session_id,
                    "batch_index": batch_index,
                }),
            );
            (
                StatusCode::OK,
                Json(serde_json::json!(ProofResponse {
                    batch_unlocked: true,
                    batch_index,
                })),
            )
        }
        Err(e) => {
            let status = match e {
                ProofError::UnknownSession(_) => StatusCode::NOT_FOUND,
                ProofError::NoPendingPayment => StatusCode::CONFLICT,
                ProofError::InvalidPreimage => StatusCode::BAD_REQUEST,
            };
            state.emitter.emit(
                "stream",
                "PROOF_REJECTED",
                serde_json::json!({
                    "session_id": proof.session_id,
                    "error": e.to_string(),
                }),
            );
            (status, Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}
