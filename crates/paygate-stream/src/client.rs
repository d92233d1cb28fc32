//! The consuming side: subscribe to a provider session over HTTP/SSE and
//! auto-pay invoices up to a budget.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use paygate_core::WalletCapability;

use crate::wire::{ProofSubmission, StreamEvent};

#[derive(Error, Debug)]
pub enum StreamClientError {
    #[error("transport error: {0}")]
    Transport(String),
    /// The server sent something that is not a stream event.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server reported a terminal stream failure.
    #[error("stream failed: {0}")]
    Stream(String),
}

pub struct StreamClient {
    wallet: Arc<dyn WalletCapability>,
    http: reqwest::Client,
}

impl StreamClient {
    pub fn new(wallet: Arc<dyn WalletCapability>) -> Self {
        Self {
            wallet,
            http: reqwest::Client::new(),
        }
    }

    /// Open a stream against `endpoint` and yield content chunks as they
    /// unlock. Spend is capped at `max_sats`; an invoice that would push
    /// past the cap is skipped, letting the provider pause on its own
    /// timeout. The sequence is forward-only; re-calling opens a fresh
    /// session.
    pub fn stream(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        max_sats: u64,
    ) -> ReceiverStream<Result<String, StreamClientError>> {
        let (tx, rx) = mpsc::channel(32);
        let wallet = self.wallet.clone();
        let http = self.http.clone();
        let endpoint = endpoint.to_string();

        tokio::spawn(async move {
            if let Err(e) = run(wallet, http, &endpoint, body, max_sats, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        ReceiverStream::new(rx)
    }
}

async fn run(
    wallet: Arc<dyn WalletCapability>,
    http: reqwest::Client,
    endpoint: &str,
    body: serde_json::Value,
    max_sats: u64,
    tx: &mpsc::Sender<Result<String, StreamClientError>>,
) -> Result<(), StreamClientError> {
    let response = http
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| StreamClientError::Transport(e.to_string()))?;
    if !response.status().is_success() {
        return Err(StreamClientError::Transport(format!(
            "stream endpoint returned {}",
            response.status()
        )));
    }

    let mut session_id = String::new();
    let mut spent: u64 = 0;
    let mut buffer = String::new();
    let mut frames = response.bytes_stream();

    while let Some(chunk) = frames.next().await {
        let chunk = chunk.map_err(|e| StreamClientError::Transport(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        for payload in drain_sse_events(&mut buffer) {
            // Keep-alive comments and empty frames carry no payload.
            if payload.is_empty() {
                continue;
            }
            let event: StreamEvent = serde_json::from_str(&payload)
                .map_err(|e| StreamClientError::Protocol(format!("{e}: {payload}")))?;

            match event {
                StreamEvent::Session { session_id: id } => {
                    debug!(session_id = %id, "stream session opened");
                    session_id = id;
                }
                StreamEvent::Content { tokens, .. } => {
                    if tx.send(Ok(tokens)).await.is_err() {
                        return Ok(());
                    }
                }
                StreamEvent::Invoice {
                    invoice,
                    batch_index,
                    sats,
                    ..
                } => {
                    if !within_budget(spent, sats, max_sats) {
                        info!(
                            batch_index,
                            sats,
                            spent,
                            max_sats,
                            "budget exhausted, skipping invoice"
                        );
                        continue;
                    }
                    let preimage = match wallet.pay_invoice(&invoice).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(batch_index, error = %e, "payment failed, not submitting proof");
                            continue;
                        }
                    };
                    spent += sats;

                    let proof = ProofSubmission {
                        session_id: session_id.clone(),
                        preimage: hex::encode(preimage),
                    };
                    // Best effort. The provider's wallet poll is the backup
                    // confirmation channel if this never arrives.
                    if let Err(e) = http
                        .post(format!("{endpoint}/proof"))
                        .json(&proof)
                        .send()
                        .await
                    {
                        warn!(batch_index, error = %e, "proof submission failed");
                    }
                }
                StreamEvent::Paused {
                    reason, batch_index, ..
                } => {
                    // Informational. Resuming means opening a new session.
                    debug!(batch_index, reason = %reason, "stream paused");
                }
                StreamEvent::Done {
                    total_batches,
                    total_sats,
                    ..
                } => {
                    debug!(total_batches, total_sats, "stream complete");
                    return Ok(());
                }
                StreamEvent::Error { message } => {
                    return Err(StreamClientError::Stream(message));
                }
            }
        }
    }

    Ok(())
}

/// Would paying `sats` more keep cumulative spend within `max_sats`?
/// The amount is server-supplied, so the addition must not be trusted to
/// fit in a `u64`; an overflowing total is over budget by definition.
fn within_budget(spent: u64, sats: u64, max_sats: u64) -> bool {
    spent
        .checked_add(sats)
        .map_or(false, |total| total <= max_sats)
}

/// Pull complete SSE frames out of `buffer`, leaving any partial frame in
/// place. Each returned string is the concatenated `data:` payload of one
/// frame.
fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(boundary) = buffer.find("\n\n") {
        let frame: String = buffer.drain(..boundary + 2).collect();
        let payload: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        events.push(payload.join("\n"));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_budget_bounds() {
        assert!(within_budget(0, 10, 10));
        assert!(!within_budget(1, 10, 10));
        assert!(within_budget(90, 10, 100));
    }

    #[test]
    fn test_within_budget_rejects_overflowing_amounts() {
        // A hostile provider can claim any price; the sum must not wrap
        // around and sneak under the cap.
        assert!(!within_budget(6, u64::MAX, 100));
        assert!(!within_budget(u64::MAX, 1, u64::MAX));
        assert!(!within_budget(0, u64::MAX, 100));
    }

    #[test]
    fn test_drain_complete_frames() {
        let mut buffer = "data: {\"a\":1}\n\ndata: {\"b\":2}\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut buffer = "data: {\"a\":1}\n\ndata: {\"b\"".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"a\":1}"]);
        assert_eq!(buffer, "data: {\"b\"");
    }

    #[test]
    fn test_keepalive_comment_yields_empty_payload() {
        let mut buffer = ": ping\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec![""]);
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut buffer = "data: line1\ndata: line2\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["line1\nline2"]);
    }
}
