//! Pay-per-batch content streaming.
//!
//! A [`provider::StreamProvider`] serves a token sequence to one consumer,
//! pausing after every batch until a Lightning micro-payment for it
//! confirms. Confirmation races two channels: a proof-of-payment preimage
//! POSTed by the consumer, and the provider wallet's own settlement watch.
//! [`client::StreamClient`] is the consuming side, auto-paying invoices up
//! to a budget.

pub mod client;
pub mod provider;
pub mod session;
pub mod wire;

pub use client::{StreamClient, StreamClientError};
pub use provider::{StreamConfig, StreamProvider};
pub use session::{ProofError, SessionStore};
pub use wire::{DoneReason, ProofResponse, ProofSubmission, StreamEvent};
