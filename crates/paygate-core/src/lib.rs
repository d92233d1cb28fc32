//! Core wallet capability for the Paygate payment rail.
//!
//! Everything that touches Lightning goes through the [`wallet::WalletCapability`]
//! trait: the escrow engine and the metered streaming protocol consume it, an
//! embedded `ldk-node` implements it in production ([`ldk::LdkWallet`]), and
//! [`testing::MemoryWallet`] implements it deterministically for tests.

pub mod hashes;
pub mod ldk;
pub mod testing;
pub mod wallet;

pub use wallet::{AddressPayment, CreatedInvoice, PaymentConfirmation, WalletCapability, WalletError};
