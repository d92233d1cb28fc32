//! The provider side: one producer loop per session, gating each content
//! batch behind a micro-payment.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use paygate_core::WalletCapability;

use crate::session::{PaymentSignal, PendingPayment, SessionStore, StreamSession};
use crate::wire::{DoneReason, StreamEvent};

/// How often the wallet poll re-checks settlement within the overall
/// payment timeout.
const POLL_STEP: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sats_per_batch: u64,
    pub tokens_per_batch: usize,
    /// Hard cap on batches per session.
    pub max_batches: u32,
    pub payment_timeout: Duration,
    pub invoice_expiry_secs: u32,
    pub first_batch_free: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sats_per_batch: 10,
            tokens_per_batch: 50,
            max_batches: 100,
            payment_timeout: Duration::from_secs(60),
            invoice_expiry_secs: 300,
            first_batch_free: false,
        }
    }
}

pub struct StreamProvider {
    wallet: Arc<dyn WalletCapability>,
    store: SessionStore,
    config: StreamConfig,
}

enum Gate {
    Paid,
    TimedOut,
    /// Invoice creation failed; the error event was already sent.
    Failed,
    ConsumerGone,
}

impl StreamProvider {
    pub fn new(wallet: Arc<dyn WalletCapability>, store: SessionStore, config: StreamConfig) -> Self {
        Self {
            wallet,
            store,
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open a session over `tokens` with the provider's default knobs.
    pub fn open<S>(&self, tokens: S) -> mpsc::Receiver<StreamEvent>
    where
        S: Stream<Item = Result<String, anyhow::Error>> + Send + Unpin + 'static,
    {
        self.open_with(tokens, self.config.clone())
    }

    /// Open a session with per-call configuration.
    pub fn open_with<S>(&self, tokens: S, config: StreamConfig) -> mpsc::Receiver<StreamEvent>
    where
        S: Stream<Item = Result<String, anyhow::Error>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = self.store.create();
        let wallet = self.wallet.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            run_session(wallet, store, config, session, tokens, tx).await;
        });

        rx
    }
}

async fn run_session<S>(
    wallet: Arc<dyn WalletCapability>,
    store: SessionStore,
    config: StreamConfig,
    session: Arc<StdMutex<StreamSession>>,
    mut tokens: S,
    tx: mpsc::Sender<StreamEvent>,
) where
    S: Stream<Item = Result<String, anyhow::Error>> + Send + Unpin + 'static,
{
    let session_id = session.lock().unwrap().id.clone();
    info!(session_id = %session_id, "stream session opened");

    if tx
        .send(StreamEvent::Session {
            session_id: session_id.clone(),
        })
        .await
        .is_err()
    {
        close_session(&store, &session);
        return;
    }

    let mut buffer = String::new();
    let mut buffered_count: u32 = 0;

    loop {
        match tokens.next().await {
            Some(Ok(token)) => {
                buffer.push_str(&token);
                buffered_count += 1;
                {
                    let mut s = session.lock().unwrap();
                    s.total_tokens += 1;
                }
                if (buffered_count as usize) < config.tokens_per_batch {
                    continue;
                }

                let batch_index = {
                    let mut s = session.lock().unwrap();
                    s.batch_index += 1;
                    s.batch_index
                };
                let event = StreamEvent::Content {
                    tokens: std::mem::take(&mut buffer),
                    batch_index,
                    token_count: buffered_count,
                };
                buffered_count = 0;
                if tx.send(event).await.is_err() {
                    close_session(&store, &session);
                    return;
                }

                if batch_index >= config.max_batches {
                    send_done(&tx, &session, DoneReason::MaxBatches).await;
                    close_session(&store, &session);
                    return;
                }

                if batch_index == 1 && config.first_batch_free {
                    debug!(session_id = %session_id, "first batch free, not gating");
                    continue;
                }

                match gate_on_payment(&wallet, &config, &session, batch_index, &tx).await {
                    Gate::Paid => continue,
                    Gate::TimedOut => {
                        let total_sats = session.lock().unwrap().total_sats;
                        let _ = tx
                            .send(StreamEvent::Paused {
                                reason: "payment_timeout".into(),
                                batch_index,
                                total_sats,
                                resume: format!(
                                    "POST {{\"session_id\":\"{session_id}\",\"preimage\":\"<hex>\"}} to the proof endpoint"
                                ),
                            })
                            .await;
                        // Not closed: a late proof within the grace window
                        // still lands in the session's paid set.
                        store.schedule_removal(&session_id);
                        info!(session_id = %session_id, batch_index, "stream paused awaiting payment");
                        return;
                    }
                    Gate::Failed | Gate::ConsumerGone => {
                        close_session(&store, &session);
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "producer failed");
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                close_session(&store, &session);
                return;
            }
            None => {
                if buffered_count > 0 {
                    let batch_index = {
                        let mut s = session.lock().unwrap();
                        s.batch_index += 1;
                        s.batch_index
                    };
                    let event = StreamEvent::Content {
                        tokens: std::mem::take(&mut buffer),
                        batch_index,
                        token_count: buffered_count,
                    };
                    if tx.send(event).await.is_err() {
                        close_session(&store, &session);
                        return;
                    }
                }
                send_done(&tx, &session, DoneReason::Complete).await;
                close_session(&store, &session);
                return;
            }
        }
    }
}

/// Create the batch invoice, publish it, and wait for confirmation from
/// whichever channel reports first: the proof POST or the wallet's own
/// settlement watch.
async fn gate_on_payment(
    wallet: &Arc<dyn WalletCapability>,
    config: &StreamConfig,
    session: &Arc<StdMutex<StreamSession>>,
    batch_index: u32,
    tx: &mpsc::Sender<StreamEvent>,
) -> Gate {
    let session_id = session.lock().unwrap().id.clone();

    let invoice = match wallet
        .create_invoice(
            config.sats_per_batch,
            &format!("stream {session_id} batch {batch_index}"),
            config.invoice_expiry_secs,
        )
        .await
    {
        Ok(inv) => inv,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "invoice creation failed");
            let _ = tx
                .send(StreamEvent::Error {
                    message: format!("could not create invoice: {e}"),
                })
                .await;
            return Gate::Failed;
        }
    };

    let (unlock_tx, mut unlock_rx) = mpsc::channel(2);
    {
        let mut s = session.lock().unwrap();
        s.pending = Some(PendingPayment {
            payment_hash: invoice.payment_hash,
            batch_index,
            invoice: invoice.bolt11.clone(),
            unlock: unlock_tx.clone(),
        });
    }

    if tx
        .send(StreamEvent::Invoice {
            invoice: invoice.bolt11,
            payment_hash: hex::encode(invoice.payment_hash),
            batch_index,
            sats: config.sats_per_batch,
        })
        .await
        .is_err()
    {
        return Gate::ConsumerGone;
    }

    // Second confirmation channel: poll the wallet directly, in short
    // slices so a transient wallet error doesn't burn the whole timeout.
    let poll = {
        let wallet = wallet.clone();
        let hash = invoice.payment_hash;
        let deadline = Instant::now() + config.payment_timeout;
        tokio::spawn(async move {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return;
                }
                match wallet.wait_for_payment(&hash, remaining.min(POLL_STEP)).await {
                    Ok(confirmation) if confirmation.paid => {
                        let _ = unlock_tx.try_send(PaymentSignal::Wallet);
                        return;
                    }
                    Ok(_) => continue,
                    Err(paygate_core::WalletError::Unsupported(_)) => {
                        // Proof submission is the only channel left.
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "settlement poll error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let outcome = tokio::time::timeout(config.payment_timeout, unlock_rx.recv()).await;
    poll.abort();

    match outcome {
        Ok(Some(signal)) => {
            let mut s = session.lock().unwrap();
            if let Some(pending) = s.pending.take() {
                s.paid.insert(pending.batch_index);
                s.resolved.insert(pending.payment_hash, pending.batch_index);
                // Counted exactly once here, regardless of which channel
                // won or whether the loser also observed the payment.
                s.total_sats += config.sats_per_batch;
            }
            debug!(session_id = %session_id, batch_index, signal = ?signal, "batch unlocked");
            Gate::Paid
        }
        Ok(None) | Err(_) => Gate::TimedOut,
    }
}

async fn send_done(
    tx: &mpsc::Sender<StreamEvent>,
    session: &Arc<StdMutex<StreamSession>>,
    reason: DoneReason,
) {
    let (total_batches, total_sats, total_tokens) = {
        let s = session.lock().unwrap();
        (s.batch_index, s.total_sats, s.total_tokens)
    };
    let _ = tx
        .send(StreamEvent::Done {
            reason,
            total_batches,
            total_sats,
            total_tokens,
        })
        .await;
}

fn close_session(store: &SessionStore, session: &Arc<StdMutex<StreamSession>>) {
    let id = {
        let mut s = session.lock().unwrap();
        s.closed = true;
        s.id.clone()
    };
    store.schedule_removal(&id);
}
