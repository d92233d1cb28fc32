//! In-memory escrow table.
//!
//! Each escrow lives behind its own async mutex, so state-changing
//! operations on one id serialize (at most one in flight) while different
//! ids proceed independently. The outer map lock is a plain std mutex and
//! is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::record::{Escrow, EscrowState};
use crate::EscrowError;

#[derive(Default)]
pub struct EscrowStore {
    entries: StdMutex<HashMap<String, Arc<Mutex<Escrow>>>>,
}

impl EscrowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, escrow: Escrow) -> Arc<Mutex<Escrow>> {
        let id = escrow.id.clone();
        let entry = Arc::new(Mutex::new(escrow));
        self.entries.lock().unwrap().insert(id, entry.clone());
        entry
    }

    /// The live entry for `id`. Callers lock it to mutate.
    pub fn entry(&self, id: &str) -> Result<Arc<Mutex<Escrow>>, EscrowError> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(id.to_string()))
    }

    /// Independent copy of one escrow.
    pub async fn snapshot(&self, id: &str) -> Result<Escrow, EscrowError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    /// Independent copies of all escrows, optionally filtered by state.
    /// Entry arcs are collected before any await so the map lock never
    /// spans one.
    pub async fn list(&self, state: Option<EscrowState>) -> Vec<Escrow> {
        let arcs: Vec<Arc<Mutex<Escrow>>> =
            self.entries.lock().unwrap().values().cloned().collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.lock().await;
            if state.is_none() || state == Some(guard.state) {
                out.push(guard.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
