//! The escrow engine: creates escrows, drives their state machine, and
//! arms one cancellable deadline timer per escrow.
//!
//! Every state-changing operation locks the escrow's entry for its whole
//! duration, wallet awaits included. That gives at most one in-flight
//! transition per id; competing calls against the same escrow queue up and
//! the loser sees a state conflict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use paygate_core::WalletCapability;

use crate::record::{now_ms, new_escrow_id, Destination, Escrow, EscrowState};
use crate::store::EscrowStore;
use crate::EscrowError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Deadline applied when `create` does not specify one.
    pub default_deadline: Duration,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(3600),
        }
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowEvent {
    pub id: String,
    pub from: Option<EscrowState>,
    pub to: EscrowState,
}

/// Inputs to [`EscrowEngine::create`]. Exactly one of `worker_address` or
/// `worker_invoice` must be set.
#[derive(Debug, Clone, Default)]
pub struct CreateEscrow {
    pub amount_sats: u64,
    pub worker_address: Option<String>,
    pub worker_invoice: Option<String>,
    pub description: Option<String>,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeParty {
    Client,
    Worker,
}

pub struct EscrowEngine {
    wallet: Arc<dyn WalletCapability>,
    store: Arc<EscrowStore>,
    events: broadcast::Sender<EscrowEvent>,
    timers: Arc<StdMutex<HashMap<String, JoinHandle<()>>>>,
    config: EscrowConfig,
}

impl EscrowEngine {
    pub fn new(wallet: Arc<dyn WalletCapability>, config: EscrowConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            wallet,
            store: Arc::new(EscrowStore::new()),
            events,
            timers: Arc::new(StdMutex::new(HashMap::new())),
            config,
        }
    }

    pub fn store(&self) -> &Arc<EscrowStore> {
        &self.store
    }

    /// Observe every state transition. Lagging receivers drop old events.
    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }

    fn emit(&self, id: &str, from: Option<EscrowState>, to: EscrowState) {
        // No subscribers is fine.
        let _ = self.events.send(EscrowEvent {
            id: id.to_string(),
            from,
            to,
        });
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create a new escrow: request a funding invoice for the amount, store
    /// the record in `Created`, and arm its deadline timer.
    pub async fn create(&self, req: CreateEscrow) -> Result<Escrow, EscrowError> {
        if req.amount_sats == 0 {
            return Err(EscrowError::Validation(
                "amount_sats must be positive".into(),
            ));
        }
        let destination = match (&req.worker_address, &req.worker_invoice) {
            (Some(addr), None) => Destination::Address(addr.clone()),
            (None, Some(inv)) => Destination::Invoice(inv.clone()),
            (None, None) => {
                return Err(EscrowError::Validation(
                    "a worker address or invoice is required".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(EscrowError::Validation(
                    "give either a worker address or an invoice, not both".into(),
                ))
            }
        };

        let deadline = req.deadline.unwrap_or(self.config.default_deadline);
        let description = req
            .description
            .clone()
            .unwrap_or_else(|| "escrow funding".into());

        let funding = self
            .wallet
            .create_invoice(req.amount_sats, &description, deadline.as_secs() as u32)
            .await?;

        let id = new_escrow_id();
        let escrow = Escrow::new(
            id.clone(),
            req.amount_sats,
            destination,
            req.description,
            funding.bolt11,
            funding.payment_hash,
            now_ms() + deadline.as_millis() as u64,
        );
        let snapshot = escrow.clone();
        self.store.insert(escrow);
        self.arm_deadline(&id, deadline);
        self.emit(&id, None, EscrowState::Created);

        info!(id, amount_sats = req.amount_sats, "escrow created");
        Ok(snapshot)
    }

    /// Confirm funding. With `auto_detect`, blocks until the wallet reports
    /// the funding invoice settled or `timeout` elapses; without it, trusts
    /// the caller and transitions immediately.
    pub async fn fund(
        &self,
        id: &str,
        auto_detect: bool,
        timeout: Duration,
    ) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        if escrow.state != EscrowState::Created {
            return Err(EscrowError::StateConflict {
                id: escrow.id.clone(),
                state: escrow.state,
                op: "fund",
            });
        }

        let mut funded_at_ms = now_ms();
        if auto_detect {
            let confirmation = self
                .wallet
                .wait_for_payment(&escrow.payment_hash, timeout)
                .await?;
            if !confirmation.paid {
                return Err(EscrowError::PaymentNotReceived(timeout));
            }
            if let Some(secs) = confirmation.settled_at {
                funded_at_ms = secs * 1000;
            }
        }

        let from = escrow.apply(EscrowState::Funded, "fund")?;
        escrow.funded_at_ms = Some(funded_at_ms);
        self.emit(id, Some(from), EscrowState::Funded);
        info!(id, "escrow funded");
        Ok(escrow.clone())
    }

    /// Record delivery evidence. No wallet interaction.
    pub async fn deliver(
        &self,
        id: &str,
        proof: serde_json::Value,
    ) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        if escrow.state != EscrowState::Funded {
            return Err(EscrowError::StateConflict {
                id: escrow.id.clone(),
                state: escrow.state,
                op: "deliver",
            });
        }

        let from = escrow.apply(EscrowState::Delivered, "deliver")?;
        escrow.delivery_proof = Some(proof);
        self.emit(id, Some(from), EscrowState::Delivered);
        Ok(escrow.clone())
    }

    /// Pay the worker and transition to `Released`. On payment failure the
    /// escrow keeps its prior state.
    pub async fn release(&self, id: &str) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        if !matches!(escrow.state, EscrowState::Funded | EscrowState::Delivered) {
            return Err(EscrowError::StateConflict {
                id: escrow.id.clone(),
                state: escrow.state,
                op: "release",
            });
        }

        let preimage = match &escrow.destination {
            Destination::Invoice(bolt11) => self
                .wallet
                .pay_invoice(bolt11)
                .await
                .map_err(|e| EscrowError::PaymentFailed(e.to_string()))?,
            Destination::Address(address) => {
                let payment = self
                    .wallet
                    .pay_address(address, escrow.amount_sats, escrow.description.as_deref())
                    .await
                    .map_err(|e| EscrowError::PaymentFailed(e.to_string()))?;
                payment.preimage
            }
        };

        let from = escrow.apply(EscrowState::Released, "release")?;
        escrow.release_preimage = Some(preimage);
        self.cancel_deadline(id);
        self.emit(id, Some(from), EscrowState::Released);
        info!(id, amount_sats = escrow.amount_sats, "escrow released");
        Ok(escrow.clone())
    }

    /// Pay the amount back to `refund_address` and transition to `Refunded`.
    pub async fn refund(
        &self,
        id: &str,
        refund_address: &str,
        reason: Option<&str>,
    ) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        if !matches!(escrow.state, EscrowState::Funded | EscrowState::Delivered) {
            return Err(EscrowError::StateConflict {
                id: escrow.id.clone(),
                state: escrow.state,
                op: "refund",
            });
        }

        self.wallet
            .pay_address(refund_address, escrow.amount_sats, reason)
            .await
            .map_err(|e| EscrowError::PaymentFailed(e.to_string()))?;

        let from = escrow.apply(EscrowState::Refunded, "refund")?;
        escrow.refund_address = Some(refund_address.to_string());
        if let Some(reason) = reason {
            escrow
                .metadata
                .insert("refund_reason".into(), serde_json::json!(reason));
        }
        self.cancel_deadline(id);
        self.emit(id, Some(from), EscrowState::Refunded);
        info!(id, refund_address, "escrow refunded");
        Ok(escrow.clone())
    }

    /// Administrative refund that moves no funds. For cases where the money
    /// was returned out of band or was never going to be paid out.
    pub async fn refund_without_payout(
        &self,
        id: &str,
        reason: Option<&str>,
    ) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        if !matches!(escrow.state, EscrowState::Funded | EscrowState::Delivered) {
            return Err(EscrowError::StateConflict {
                id: escrow.id.clone(),
                state: escrow.state,
                op: "refund",
            });
        }

        let from = escrow.apply(EscrowState::Refunded, "refund")?;
        escrow
            .metadata
            .insert("refund_without_payout".into(), serde_json::json!(true));
        if let Some(reason) = reason {
            escrow
                .metadata
                .insert("refund_reason".into(), serde_json::json!(reason));
        }
        self.cancel_deadline(id);
        self.emit(id, Some(from), EscrowState::Refunded);
        warn!(id, "escrow refunded without payout");
        Ok(escrow.clone())
    }

    /// Record a dispute. Funds stay where they are; resolution happens out
    /// of band.
    pub async fn dispute(
        &self,
        id: &str,
        reason: &str,
        raised_by: DisputeParty,
    ) -> Result<Escrow, EscrowError> {
        let entry = self.store.entry(id)?;
        let mut escrow = entry.lock().await;

        let from = escrow.apply(EscrowState::Disputed, "dispute")?;
        escrow.metadata.insert(
            "dispute".into(),
            serde_json::json!({
                "reason": reason,
                "raised_by": raised_by,
                "at_ms": now_ms(),
            }),
        );
        self.emit(id, Some(from), EscrowState::Disputed);
        warn!(id, reason, "escrow disputed");
        Ok(escrow.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Escrow, EscrowError> {
        self.store.snapshot(id).await
    }

    pub async fn list(&self, state: Option<EscrowState>) -> Vec<Escrow> {
        self.store.list(state).await
    }

    // -----------------------------------------------------------------------
    // Deadline timers
    // -----------------------------------------------------------------------

    fn arm_deadline(&self, id: &str, after: Duration) {
        let store = self.store.clone();
        let timers = self.timers.clone();
        let events = self.events.clone();
        let id = id.to_string();

        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                tokio::time::sleep(after).await;
                // Once the sleep is over this handle has nothing left to
                // cancel; drop the entry on every exit path or finished
                // handles pile up in the map.
                timers.lock().unwrap().remove(&id);

                let Ok(entry) = store.entry(&id) else {
                    return;
                };
                let mut escrow = entry.lock().await;
                // The state may have changed while this timer sat queued
                // behind an in-flight operation's lock. Re-check before
                // expiring; a stale fire is a no-op.
                if !matches!(escrow.state, EscrowState::Created | EscrowState::Funded) {
                    debug!(id = %id, state = ?escrow.state, "deadline fired after transition, ignoring");
                    return;
                }
                if let Ok(from) = escrow.apply(EscrowState::Expired, "expire") {
                    warn!(id = %id, "escrow expired at deadline");
                    let _ = events.send(EscrowEvent {
                        id: id.clone(),
                        from: Some(from),
                        to: EscrowState::Expired,
                    });
                }
            }
        });

        self.timers.lock().unwrap().insert(id, handle);
    }

    fn cancel_deadline(&self, id: &str) {
        if let Some(handle) = self.timers.lock().unwrap().remove(id) {
            handle.abort();
        }
    }

    /// Number of armed deadline timers. Fired and cancelled timers remove
    /// themselves, so this tracks escrows still awaiting a deadline.
    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}
