//! The wallet capability: the narrow interface behind which all payment
//! transport lives.
//!
//! The escrow and streaming layers never talk to a Lightning node directly.
//! They ask a [`WalletCapability`] to create invoices, pay them, and report
//! settlement, and they trust its answers as ground truth — no independent
//! ledger reconciliation happens above this seam.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum WalletError {
    /// Failure talking to the wallet or the network behind it.
    #[error("wallet transport error: {0}")]
    Transport(String),
    /// The wallet tried to send a payment and the payment did not settle.
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),
    #[error("invalid lightning address: {0}")]
    InvalidAddress(String),
    /// The wallet does not implement this operation. Callers that can make
    /// progress another way (e.g. proof submission) should treat this as
    /// non-fatal.
    #[error("operation not supported by this wallet: {0}")]
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// A freshly created BOLT 11 invoice and the hash that correlates its
/// settlement.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub bolt11: String,
    pub payment_hash: [u8; 32],
}

/// Settlement state of an inbound payment, as reported by the wallet.
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub paid: bool,
    /// Preimage, when the wallet knows it (it may not for externally
    /// generated invoices).
    pub preimage: Option<[u8; 32]>,
    /// Unix seconds at which the payment settled.
    pub settled_at: Option<u64>,
}

impl PaymentConfirmation {
    pub fn unpaid() -> Self {
        Self {
            paid: false,
            preimage: None,
            settled_at: None,
        }
    }
}

/// Result of paying a Lightning address: the invoice the address resolved
/// to, plus the preimage proving the payment.
#[derive(Debug, Clone)]
pub struct AddressPayment {
    pub preimage: [u8; 32],
    pub bolt11: String,
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// The five wallet operations the payment rail is built on.
///
/// Every method that can wait on the network takes or implies a timeout;
/// implementations must never block indefinitely.
#[async_trait]
pub trait WalletCapability: Send + Sync {
    /// Create an invoice for `amount_sats`, expiring after `expiry_secs`.
    async fn create_invoice(
        &self,
        amount_sats: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice, WalletError>;

    /// Pay a BOLT 11 invoice. Returns the settlement preimage.
    async fn pay_invoice(&self, bolt11: &str) -> Result<[u8; 32], WalletError>;

    /// Resolve a `user@domain` Lightning address to an invoice and pay it.
    async fn pay_address(
        &self,
        address: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> Result<AddressPayment, WalletError>;

    /// Wait up to `timeout` for an inbound payment matching `payment_hash`
    /// to settle. A timeout is not an error: it returns
    /// [`PaymentConfirmation::unpaid`].
    async fn wait_for_payment(
        &self,
        payment_hash: &[u8; 32],
        timeout: Duration,
    ) -> Result<PaymentConfirmation, WalletError>;

    /// Spendable balance in sats.
    async fn balance_sats(&self) -> Result<u64, WalletError>;
}
