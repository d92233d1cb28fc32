//! Deterministic in-memory wallet for tests.
//!
//! [`MemoryWallet`] settles its own invoices instantly (unless told to hold
//! them), so escrow and streaming tests can exercise full payment flows
//! without a Lightning node. Hooks let a test delay settlement, force
//! payment failures, or settle a held invoice at a chosen moment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::hashes::{payment_hash, random_preimage};
use crate::wallet::{
    AddressPayment, CreatedInvoice, PaymentConfirmation, WalletCapability, WalletError,
};

struct IssuedInvoice {
    preimage: [u8; 32],
    amount_sats: u64,
    settled: bool,
    settled_at: Option<u64>,
}

#[derive(Default)]
struct Ledger {
    /// Invoices this wallet issued, keyed by payment hash.
    invoices: HashMap<[u8; 32], IssuedInvoice>,
    /// bolt11 string back to payment hash, for `pay_invoice`.
    by_bolt11: HashMap<String, [u8; 32]>,
    balance_sats: u64,
}

/// In-memory [`WalletCapability`] with no network behind it.
#[derive(Clone)]
pub struct MemoryWallet {
    ledger: Arc<Mutex<Ledger>>,
    settled: Arc<Notify>,
    hold_settlement: Arc<AtomicBool>,
    fail_payments: Arc<AtomicBool>,
}

impl MemoryWallet {
    pub fn new(balance_sats: u64) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                balance_sats,
                ..Ledger::default()
            })),
            settled: Arc::new(Notify::new()),
            hold_settlement: Arc::new(AtomicBool::new(false)),
            fail_payments: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While held, `pay_invoice` still succeeds but the inbound side stays
    /// unsettled until [`settle`](Self::settle) is called.
    pub fn hold_settlement(&self, hold: bool) {
        self.hold_settlement.store(hold, Ordering::SeqCst);
    }

    /// Make every outbound payment fail.
    pub fn fail_payments(&self, fail: bool) {
        self.fail_payments.store(fail, Ordering::SeqCst);
    }

    /// Settle a held invoice, waking anything blocked in `wait_for_payment`.
    pub fn settle(&self, payment_hash: &[u8; 32]) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(inv) = ledger.invoices.get_mut(payment_hash) {
            inv.settled = true;
            inv.settled_at = Some(unix_now());
        }
        drop(ledger);
        self.settled.notify_waiters();
    }

    /// The preimage behind an invoice this wallet issued. Tests use it to
    /// check that released escrows and proof submissions carry the real
    /// preimage, not a fabricated one.
    pub fn issued_preimage(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        self.ledger
            .lock()
            .unwrap()
            .invoices
            .get(payment_hash)
            .map(|inv| inv.preimage)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn mock_bolt11(hash: &[u8; 32]) -> String {
    format!("lnmock1{}", hex::encode(hash))
}

#[async_trait]
impl WalletCapability for MemoryWallet {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        _description: &str,
        _expiry_secs: u32,
    ) -> Result<CreatedInvoice, WalletError> {
        let preimage = random_preimage();
        let hash = payment_hash(&preimage);
        let bolt11 = mock_bolt11(&hash);

        let mut ledger = self.ledger.lock().unwrap();
        ledger.invoices.insert(
            hash,
            IssuedInvoice {
                preimage,
                amount_sats,
                settled: false,
                settled_at: None,
            },
        );
        ledger.by_bolt11.insert(bolt11.clone(), hash);

        Ok(CreatedInvoice {
            bolt11,
            payment_hash: hash,
        })
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<[u8; 32], WalletError> {
        if self.fail_payments.load(Ordering::SeqCst) {
            return Err(WalletError::PaymentFailed("simulated failure".into()));
        }

        let mut ledger = self.ledger.lock().unwrap();
        let hash = *ledger
            .by_bolt11
            .get(bolt11)
            .ok_or_else(|| WalletError::InvalidInvoice(bolt11.to_string()))?;

        let amount = ledger.invoices[&hash].amount_sats;
        if ledger.balance_sats < amount {
            return Err(WalletError::PaymentFailed("insufficient balance".into()));
        }
        ledger.balance_sats -= amount;

        let hold = self.hold_settlement.load(Ordering::SeqCst);
        let inv = ledger.invoices.get_mut(&hash).unwrap();
        if !hold {
            inv.settled = true;
            inv.settled_at = Some(unix_now());
        }
        let preimage = inv.preimage;
        drop(ledger);

        if !hold {
            self.settled.notify_waiters();
        }
        Ok(preimage)
    }

    async fn pay_address(
        &self,
        address: &str,
        amount_sats: u64,
        _comment: Option<&str>,
    ) -> Result<AddressPayment, WalletError> {
        if self.fail_payments.load(Ordering::SeqCst) {
            return Err(WalletError::PaymentFailed("simulated failure".into()));
        }
        if !address.contains('@') {
            return Err(WalletError::InvalidAddress(address.to_string()));
        }

        let mut ledger = self.ledger.lock().unwrap();
        if ledger.balance_sats < amount_sats {
            return Err(WalletError::PaymentFailed("insufficient balance".into()));
        }
        ledger.balance_sats -= amount_sats;
        drop(ledger);

        let preimage = random_preimage();
        Ok(AddressPayment {
            preimage,
            bolt11: mock_bolt11(&payment_hash(&preimage)),
        })
    }

    async fn wait_for_payment(
        &self,
        payment_hash: &[u8; 32],
        timeout: Duration,
    ) -> Result<PaymentConfirmation, WalletError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let ledger = self.ledger.lock().unwrap();
                if let Some(inv) = ledger.invoices.get(payment_hash) {
                    if inv.settled {
                        return Ok(PaymentConfirmation {
                            paid: true,
                            preimage: Some(inv.preimage),
                            settled_at: inv.settled_at,
                        });
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(PaymentConfirmation::unpaid());
            }
            if tokio::time::timeout(remaining, self.settled.notified())
                .await
                .is_err()
            {
                return Ok(PaymentConfirmation::unpaid());
            }
        }
    }

    async fn balance_sats(&self) -> Result<u64, WalletError> {
        Ok(self.ledger.lock().unwrap().balance_sats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::proves_payment;

    #[tokio::test]
    async fn test_pay_own_invoice_settles_and_debits() {
        let wallet = MemoryWallet::new(1000);
        let invoice = wallet.create_invoice(100, "test", 60).await.unwrap();
        let preimage = wallet.pay_invoice(&invoice.bolt11).await.unwrap();

        assert!(proves_payment(&preimage, &invoice.payment_hash));
        assert_eq!(wallet.balance_sats().await.unwrap(), 900);

        let confirmation = wallet
            .wait_for_payment(&invoice.payment_hash, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(confirmation.paid);
        assert_eq!(confirmation.preimage, Some(preimage));
    }

    #[tokio::test]
    async fn test_unknown_invoice_rejected() {
        let wallet = MemoryWallet::new(1000);
        let err = wallet.pay_invoice("lnmock1deadbeef").await.unwrap_err();
        assert!(matches!(err, WalletError::InvalidInvoice(_)));
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let wallet = MemoryWallet::new(50);
        let invoice = wallet.create_invoice(100, "test", 60).await.unwrap();
        let err = wallet.pay_invoice(&invoice.bolt11).await.unwrap_err();
        assert!(matches!(err, WalletError::PaymentFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_settlement_wakes_waiter() {
        let wallet = MemoryWallet::new(1000);
        wallet.hold_settlement(true);
        let invoice = wallet.create_invoice(100, "test", 60).await.unwrap();
        wallet.pay_invoice(&invoice.bolt11).await.unwrap();

        let waiter = {
            let wallet = wallet.clone();
            let hash = invoice.payment_hash;
            tokio::spawn(async move {
                wallet
                    .wait_for_payment(&hash, Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        wallet.settle(&invoice.payment_hash);
        let confirmation = waiter.await.unwrap();
        assert!(confirmation.paid);
        assert!(confirmation.preimage.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_unpaid() {
        let wallet = MemoryWallet::new(1000);
        let invoice = wallet.create_invoice(100, "test", 60).await.unwrap();
        let confirmation = wallet
            .wait_for_payment(&invoice.payment_hash, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!confirmation.paid);
    }

    #[tokio::test]
    async fn test_pay_address_requires_at_sign() {
        let wallet = MemoryWallet::new(1000);
        let err = wallet.pay_address("not-an-address", 10, None).await.unwrap_err();
        assert!(matches!(err, WalletError::InvalidAddress(_)));

        let payment = wallet.pay_address("alice@example.com", 10, None).await.unwrap();
        assert!(!payment.bolt11.is_empty());
        assert_eq!(wallet.balance_sats().await.unwrap(), 990);
    }
}
