//! Lightning-funded escrow.
//!
//! A client funds an escrow by paying a hold invoice amount into the
//! service's wallet; the service later releases the amount to the worker's
//! invoice or Lightning address, or refunds it. The [`engine::EscrowEngine`]
//! drives the state machine, [`store::EscrowStore`] keeps the records, and
//! every state change is observable through a broadcast event channel.

use std::time::Duration;

use thiserror::Error;

pub mod engine;
pub mod record;
pub mod store;

pub use engine::{CreateEscrow, DisputeParty, EscrowConfig, EscrowEngine, EscrowEvent};
pub use record::{Destination, Escrow, EscrowState, Transition};
pub use store::EscrowStore;

#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input, rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no escrow with id {0}")]
    NotFound(String),
    /// The operation is not legal in the escrow's current state. The escrow
    /// is left unchanged.
    #[error("escrow {id} is {state:?}, cannot {op}")]
    StateConflict {
        id: String,
        state: record::EscrowState,
        op: &'static str,
    },
    /// Funding payment did not confirm within the timeout. The escrow stays
    /// in its prior state so the caller may retry.
    #[error("payment not received within {0:?}")]
    PaymentNotReceived(Duration),
    /// An outbound payout could not be sent. The escrow stays in its prior
    /// state.
    #[error("payout failed: {0}")]
    PaymentFailed(String),
    #[error(transparent)]
    Wallet(#[from] paygate_core::WalletError),
}
