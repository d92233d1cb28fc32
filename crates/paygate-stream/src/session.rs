//! Stream session records and their store.
//!
//! Sessions use std mutexes held only for short, non-awaiting critical
//! sections. The proof-submission path runs concurrently with the provider
//! loop, so all `paid`/`pending` updates go through the session lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use paygate_core::hashes::{parse_hash32, proves_payment};

/// How a pending payment got confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentSignal {
    /// The consumer POSTed the preimage.
    Proof,
    /// The wallet observed settlement directly.
    Wallet,
}

/// The single outstanding payment gate of a session.
#[derive(Clone)]
pub struct PendingPayment {
    pub payment_hash: [u8; 32],
    pub batch_index: u32,
    pub invoice: String,
    /// Confirmation channel. Two producers (proof handler, wallet poll)
    /// race to send; the provider loop consumes one signal. Capacity 2 so
    /// neither producer ever blocks.
    pub unlock: mpsc::Sender<PaymentSignal>,
}

pub struct StreamSession {
    pub id: String,
    pub batch_index: u32,
    pub total_tokens: u64,
    pub total_sats: u64,
    pub pending: Option<PendingPayment>,
    /// Batch indices whose payment has confirmed, by either channel.
    pub paid: HashSet<u32>,
    /// Settled payment hashes to batch index, for idempotent re-submission.
    pub resolved: HashMap<[u8; 32], u32>,
    pub closed: bool,
}

impl StreamSession {
    fn new(id: String) -> Self {
        Self {
            id,
            batch_index: 0,
            total_tokens: 0,
            total_sats: 0,
            pending: None,
            paid: HashSet::new(),
            resolved: HashMap::new(),
            closed: false,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProofError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("no pending payment to unlock")]
    NoPendingPayment,
    #[error("preimage does not match the pending payment hash")]
    InvalidPreimage,
}

/// All live sessions, plus the grace window that keeps a session around
/// after close so a late proof can still land.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<StdMutex<HashMap<String, Arc<StdMutex<StreamSession>>>>>,
    grace: Duration,
}

impl SessionStore {
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: Arc::new(StdMutex::new(HashMap::new())),
            grace,
        }
    }

    pub fn create(&self) -> Arc<StdMutex<StreamSession>> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(StdMutex::new(StreamSession::new(id.clone())));
        self.sessions.lock().unwrap().insert(id, session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<StdMutex<StreamSession>>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }

    /// Keep the session queryable for the grace window, then drop it. Runs
    /// detached so no foreground path waits on it.
    pub fn schedule_removal(&self, id: &str) {
        let sessions = self.sessions.clone();
        let grace = self.grace;
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!(session_id = %id, "removing session after grace window");
            sessions.lock().unwrap().remove(&id);
        });
    }

    /// Validate and apply a proof-of-payment submission.
    ///
    /// Accepted only when the preimage hashes to the *current* pending
    /// payment's hash. Re-submitting a proof for an already-settled hash is
    /// an idempotent success. Everything else is rejected without touching
    /// session state.
    pub fn submit_proof(&self, session_id: &str, preimage_hex: &str) -> Result<u32, ProofError> {
        let preimage = parse_hash32(preimage_hex).ok_or(ProofError::InvalidPreimage)?;
        let session = self
            .get(session_id)
            .ok_or_else(|| ProofError::UnknownSession(session_id.to_string()))?;

        let unlock;
        let batch_index;
        {
            let mut session = session.lock().unwrap();
            let Some(pending) = session.pending.as_ref() else {
                // No gate outstanding. A replay of an already-accepted
                // proof still succeeds so clients can retry safely.
                for (hash, batch) in &session.resolved {
                    if proves_payment(&preimage, hash) {
                        return Ok(*batch);
                    }
                }
                return Err(ProofError::NoPendingPayment);
            };

            if !proves_payment(&preimage, &pending.payment_hash) {
                // Could still be a replay against an older, settled hash.
                for (hash, batch) in &session.resolved {
                    if proves_payment(&preimage, hash) {
                        return Ok(*batch);
                    }
                }
                return Err(ProofError::InvalidPreimage);
            }

            batch_index = pending.batch_index;
            unlock = pending.unlock.clone();
            session.paid.insert(batch_index);
        }

        // Outside the lock. The loop may have timed out and dropped its
        // receiver; that is fine, `paid` already records the payment.
        let _ = unlock.try_send(PaymentSignal::Proof);
        debug!(session_id, batch_index, "payment proof accepted");
        Ok(batch_index)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
