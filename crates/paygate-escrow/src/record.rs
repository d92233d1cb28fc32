//! Escrow records and the transition table.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::EscrowError;

/// Escrow lifecycle states.
///
/// `Released`, `Refunded`, and `Expired` are terminal. `Disputed` is not
/// terminal in principle (resolution happens out of band), but no automatic
/// transition leads out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowState {
    Created,
    Funded,
    Delivered,
    Released,
    Refunded,
    Expired,
    Disputed,
}

impl EscrowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Expired)
    }
}

/// The full transition table. Anything not listed here is rejected.
pub fn transition_allowed(from: EscrowState, to: EscrowState) -> bool {
    use EscrowState::*;
    matches!(
        (from, to),
        (Created, Funded)
            | (Created, Expired)
            | (Funded, Delivered)
            | (Funded, Released)
            | (Funded, Refunded)
            | (Funded, Expired)
            | (Funded, Disputed)
            | (Delivered, Released)
            | (Delivered, Refunded)
            | (Delivered, Disputed)
    )
}

/// One entry in an escrow's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// `None` only for the creation entry.
    pub from: Option<EscrowState>,
    pub to: EscrowState,
    pub at_ms: u64,
}

/// Where a released escrow pays out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// A `user@domain` Lightning address, resolved at release time.
    Address(String),
    /// A BOLT 11 invoice supplied by the worker up front.
    Invoice(String),
}

/// A single escrow record. Mutated only through [`Escrow::apply`] so the
/// transition table and history invariants hold everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: String,
    pub state: EscrowState,
    pub amount_sats: u64,
    pub destination: Destination,
    pub description: Option<String>,
    /// Funding invoice the client pays.
    pub invoice: String,
    #[serde(with = "hex_hash")]
    pub payment_hash: [u8; 32],
    /// Absolute deadline. Auto-expiry fires only from Created or Funded.
    pub deadline_ms: u64,
    pub created_at_ms: u64,
    pub funded_at_ms: Option<u64>,
    pub delivery_proof: Option<serde_json::Value>,
    #[serde(with = "hex_hash_opt")]
    pub release_preimage: Option<[u8; 32]>,
    pub refund_address: Option<String>,
    pub history: Vec<Transition>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Escrow {
    pub fn new(
        id: String,
        amount_sats: u64,
        destination: Destination,
        description: Option<String>,
        invoice: String,
        payment_hash: [u8; 32],
        deadline_ms: u64,
    ) -> Self {
        let created_at_ms = now_ms();
        Self {
            id,
            state: EscrowState::Created,
            amount_sats,
            destination,
            description,
            invoice,
            payment_hash,
            deadline_ms,
            created_at_ms,
            funded_at_ms: None,
            delivery_proof: None,
            release_preimage: None,
            refund_address: None,
            history: vec![Transition {
                from: None,
                to: EscrowState::Created,
                at_ms: created_at_ms,
            }],
            metadata: HashMap::new(),
        }
    }

    /// Transition to `to` if the table allows it, appending a history entry.
    /// Returns the prior state. On rejection the record is untouched.
    pub fn apply(&mut self, to: EscrowState, op: &'static str) -> Result<EscrowState, EscrowError> {
        let from = self.state;
        if !transition_allowed(from, to) {
            return Err(EscrowError::StateConflict {
                id: self.id.clone(),
                state: from,
                op,
            });
        }
        self.state = to;
        self.history.push(Transition {
            from: Some(from),
            to,
            at_ms: now_ms(),
        });
        Ok(from)
    }
}

pub fn new_escrow_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex_hash_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match hash {
            Some(h) => s.serialize_some(&hex::encode(h)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            None => Ok(None),
            Some(t) => {
                let bytes = hex::decode(&t).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EscrowState::*;

    fn sample() -> Escrow {
        Escrow::new(
            new_escrow_id(),
            500,
            Destination::Address("worker@example.com".into()),
            None,
            "lnbc...".into(),
            [7u8; 32],
            now_ms() + 3_600_000,
        )
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [Released, Refunded, Expired] {
            for to in [Created, Funded, Delivered, Released, Refunded, Expired, Disputed] {
                assert!(!transition_allowed(terminal, to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_disputed_has_no_automatic_exit() {
        for to in [Created, Funded, Delivered, Released, Refunded, Expired, Disputed] {
            assert!(!transition_allowed(Disputed, to));
        }
        assert!(!Disputed.is_terminal());
    }

    #[test]
    fn test_created_cannot_skip_funding() {
        assert!(!transition_allowed(Created, Delivered));
        assert!(!transition_allowed(Created, Released));
        assert!(!transition_allowed(Created, Disputed));
        assert!(transition_allowed(Created, Funded));
        assert!(transition_allowed(Created, Expired));
    }

    #[test]
    fn test_delivered_cannot_expire() {
        assert!(!transition_allowed(Delivered, Expired));
    }

    #[test]
    fn test_apply_appends_history() {
        let mut escrow = sample();
        assert_eq!(escrow.history.len(), 1);
        assert_eq!(escrow.history[0].from, None);
        assert_eq!(escrow.history[0].to, Created);

        let from = escrow.apply(Funded, "fund").unwrap();
        assert_eq!(from, Created);
        assert_eq!(escrow.history.len(), 2);
        assert_eq!(escrow.history[1].from, Some(Created));
        assert_eq!(escrow.history[1].to, Funded);
    }

    #[test]
    fn test_apply_rejected_leaves_record_unchanged() {
        let mut escrow = sample();
        escrow.apply(Funded, "fund").unwrap();
        escrow.apply(Released, "release").unwrap();

        let before_len = escrow.history.len();
        let err = escrow.apply(Refunded, "refund").unwrap_err();
        assert!(matches!(err, EscrowError::StateConflict { .. }));
        assert_eq!(escrow.state, Released);
        assert_eq!(escrow.history.len(), before_len);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Created).unwrap(), "\"created\"");
        assert_eq!(serde_json::to_string(&Disputed).unwrap(), "\"disputed\"");
    }
}
