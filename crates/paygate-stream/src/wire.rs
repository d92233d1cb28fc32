//! Wire types for the streaming protocol.
//!
//! Events flow server to client over an SSE-style stream; proofs flow back
//! as a JSON POST. Everything serializes with an `event` tag so a consumer
//! can dispatch without peeking at optional fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The producer ran out of content.
    Complete,
    /// The configured batch cap was hit.
    MaxBatches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stream opened.
    Session { session_id: String },
    /// A flushed batch of content.
    Content {
        tokens: String,
        batch_index: u32,
        token_count: u32,
    },
    /// Payment required to unlock the next batch.
    Invoice {
        invoice: String,
        /// Hex-encoded payment hash, for out-of-band settlement checks.
        payment_hash: String,
        batch_index: u32,
        sats: u64,
    },
    /// Payment timed out; the stream is idle awaiting a late proof.
    Paused {
        reason: String,
        batch_index: u32,
        total_sats: u64,
        resume: String,
    },
    /// Terminal success.
    Done {
        reason: DoneReason,
        total_batches: u32,
        total_sats: u64,
        total_tokens: u64,
    },
    /// Terminal failure.
    Error { message: String },
}

/// Client to server: proof that the pending invoice was paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub session_id: String,
    /// Hex-encoded 32-byte preimage.
    pub preimage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofResponse {
    pub batch_unlocked: bool,
    pub batch_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_and_field_names() {
        let event = StreamEvent::Invoice {
            invoice: "lnbc1...".into(),
            payment_hash: "ab".repeat(32),
            batch_index: 3,
            sats: 10,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "invoice");
        assert_eq!(value["batch_index"], 3);
        assert_eq!(value["sats"], 10);
    }

    #[test]
    fn test_done_reason_snake_case() {
        let event = StreamEvent::Done {
            reason: DoneReason::MaxBatches,
            total_batches: 1,
            total_sats: 0,
            total_tokens: 50,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "done");
        assert_eq!(value["reason"], "max_batches");
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = StreamEvent::Paused {
            reason: "payment_timeout".into(),
            batch_index: 2,
            total_sats: 10,
            resume: "POST the preimage to resume".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
