//! Production wallet: an embedded `ldk-node` 0.7 Lightning node behind the
//! [`WalletCapability`] seam.
//!
//! One background thread owns the node's event queue ([`PaymentRouter`]) and
//! fans settlement events out by payment hash, so any number of concurrent
//! escrow and stream operations can each wait on their own payment without
//! stealing events from the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ldk_node::bitcoin::Network;
use ldk_node::lightning::ln::msgs::SocketAddress;
use ldk_node::lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription, Description};
use ldk_node::lightning_types::payment::PaymentHash;
use ldk_node::lightning::ln::channelmanager::PaymentId;
use ldk_node::payment::{PaymentKind, PaymentStatus};
use ldk_node::{Builder, Event, Node};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wallet::{
    AddressPayment, CreatedInvoice, PaymentConfirmation, WalletCapability, WalletError,
};

/// Upper bound on how long an outbound payment may stay in flight before we
/// report it failed to the caller.
const PAY_TIMEOUT: Duration = Duration::from_secs(120);

const LNURL_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Chain data source for the LDK node.
#[derive(Debug, Clone)]
pub enum ChainSource {
    /// Esplora HTTP API (e.g. `https://mempool.space/signet/api`).
    Esplora(String),
    /// Bitcoind RPC (host, port, user, password).
    BitcoindRpc {
        host: String,
        port: u16,
        user: String,
        password: String,
    },
}

/// Configuration for the embedded LDK Lightning node.
#[derive(Debug, Clone)]
pub struct LightningConfig {
    /// Directory for LDK node data (keys, channels, etc.)
    pub storage_dir: String,
    /// Network: Signet for testing, Bitcoin for production.
    pub network: Network,
    /// Listening port for Lightning peer connections.
    pub listening_port: u16,
    /// Chain data source (Esplora or bitcoind RPC).
    pub chain_source: ChainSource,
    /// Human-readable node alias (max 32 bytes UTF-8).
    pub node_alias: Option<String>,
}

impl Default for LightningConfig {
    fn default() -> Self {
        Self {
            storage_dir: "/tmp/paygate-node".into(),
            network: Network::Signet,
            listening_port: 9735,
            chain_source: ChainSource::Esplora("https://mempool.space/signet/api".into()),
            node_alias: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Node lifecycle
// ---------------------------------------------------------------------------

/// Build and start an LDK node with the given config. The node begins
/// syncing with the chain and listening for peers.
pub fn start_node(config: &LightningConfig) -> Result<Node, WalletError> {
    let mut builder = Builder::new();

    builder.set_network(config.network);
    builder.set_storage_dir_path(config.storage_dir.clone());

    if let Some(ref alias) = config.node_alias {
        builder
            .set_node_alias(alias.clone())
            .map_err(|e| WalletError::Transport(format!("invalid node alias: {e:?}")))?;
    }

    match &config.chain_source {
        ChainSource::Esplora(url) => {
            builder.set_chain_source_esplora(url.clone(), None);
        }
        ChainSource::BitcoindRpc {
            host,
            port,
            user,
            password,
        } => {
            builder.set_chain_source_bitcoind_rpc(
                host.clone(),
                *port,
                user.clone(),
                password.clone(),
            );
        }
    }

    let addr: SocketAddress = format!("0.0.0.0:{}", config.listening_port)
        .parse()
        .map_err(|_| {
            WalletError::Transport(format!(
                "could not parse listening address 0.0.0.0:{}",
                config.listening_port
            ))
        })?;
    builder
        .set_listening_addresses(vec![addr])
        .map_err(|e| WalletError::Transport(e.to_string()))?;

    let node = builder
        .build()
        .map_err(|e| WalletError::Transport(e.to_string()))?;
    node.start()
        .map_err(|e| WalletError::Transport(e.to_string()))?;

    Ok(node)
}

/// The node's public key as a hex string.
pub fn node_id(node: &Node) -> String {
    node.node_id().to_string()
}

/// The node's listening addresses as strings.
pub fn listening_addresses(node: &Node) -> Vec<String> {
    node.listening_addresses()
        .unwrap_or_default()
        .iter()
        .map(|a| a.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Payment router — single event loop, dispatches by payment hash
// ---------------------------------------------------------------------------

/// Central event dispatcher. One dedicated thread calls `wait_next_event()`,
/// matches on payment hash, and forwards to the registered waiter. Events
/// that don't match any waiter are logged and acknowledged — they never
/// block other waiters or eat events meant for the node's internal state
/// machine.
pub struct PaymentRouter {
    waiters: Mutex<HashMap<PaymentHash, mpsc::UnboundedSender<Event>>>,
}

impl PaymentRouter {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register to receive events for a specific payment hash. Returns a
    /// receiver for `PaymentClaimable`, `PaymentReceived`,
    /// `PaymentSuccessful`, and `PaymentFailed` events matching this hash.
    pub fn register(&self, hash: PaymentHash) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().unwrap().insert(hash, tx);
        rx
    }

    /// Unregister a waiter (called when the waiter is done).
    pub fn unregister(&self, hash: &PaymentHash) {
        self.waiters.lock().unwrap().remove(hash);
    }

    fn payment_hash_of(event: &Event) -> Option<PaymentHash> {
        match event {
            Event::PaymentClaimable { payment_hash, .. } => Some(*payment_hash),
            Event::PaymentReceived { payment_hash, .. } => Some(*payment_hash),
            Event::PaymentSuccessful { payment_hash, .. } => Some(*payment_hash),
            Event::PaymentFailed {
                payment_hash: Some(hash),
                ..
            } => Some(*hash),
            _ => None,
        }
    }

    /// Run the event loop. Call from a dedicated thread: `wait_next_event`
    /// blocks, so it must stay off the async runtime.
    pub fn run(&self, node: &Arc<Node>) {
        loop {
            let event = node.wait_next_event();

            let mut delivered = false;
            if let Some(hash) = Self::payment_hash_of(&event) {
                let waiters = self.waiters.lock().unwrap();
                if let Some(sender) = waiters.get(&hash) {
                    // If send fails, the waiter dropped its receiver — fine.
                    let _ = sender.send(event.clone());
                    delivered = true;
                }
            }

            if !delivered {
                debug!(event = ?event, "unrouted node event");
            }

            if let Err(e) = node.event_handled() {
                warn!(error = ?e, "event_handled failed");
            }
        }
    }
}

impl Default for PaymentRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// The wallet
// ---------------------------------------------------------------------------

/// [`WalletCapability`] over an embedded LDK node.
pub struct LdkWallet {
    node: Arc<Node>,
    router: Arc<PaymentRouter>,
    http: reqwest::Client,
}

impl LdkWallet {
    /// Wrap an already-started node. Spawns the router thread.
    pub fn new(node: Arc<Node>) -> Self {
        let router = Arc::new(PaymentRouter::new());
        {
            let router = router.clone();
            let node = node.clone();
            std::thread::spawn(move || router.run(&node));
        }
        Self {
            node,
            router,
            http: reqwest::Client::new(),
        }
    }

    /// Start a node from config and wrap it.
    pub fn start(config: &LightningConfig) -> Result<Self, WalletError> {
        let node = Arc::new(start_node(config)?);
        Ok(Self::new(node))
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Look up a settled inbound/outbound payment by hash. LDK keys BOLT 11
    /// payments by their payment hash.
    fn settled_payment(&self, payment_hash: &[u8; 32]) -> Option<PaymentConfirmation> {
        let details = self.node.payment(&PaymentId(*payment_hash))?;
        if details.status != PaymentStatus::Succeeded {
            return None;
        }
        let preimage = match details.kind {
            PaymentKind::Bolt11 { preimage, .. } => preimage.map(|p| p.0),
            _ => None,
        };
        Some(PaymentConfirmation {
            paid: true,
            preimage,
            settled_at: Some(details.latest_update_timestamp),
        })
    }

    /// Resolve a `user@domain` Lightning address to a BOLT 11 invoice via
    /// the LNURL-pay well-known lookup.
    async fn resolve_address(
        &self,
        address: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> Result<String, WalletError> {
        let (user, domain) = address
            .split_once('@')
            .filter(|(u, d)| !u.is_empty() && !d.is_empty())
            .ok_or_else(|| WalletError::InvalidAddress(address.to_string()))?;

        let meta: serde_json::Value = self
            .http
            .get(format!("https://{domain}/.well-known/lnurlp/{user}"))
            .timeout(LNURL_HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;

        let callback = meta["callback"]
            .as_str()
            .ok_or_else(|| WalletError::InvalidAddress(format!("{address}: no LNURL callback")))?;

        let amount_msat = amount_sats * 1000;
        let mut query: Vec<(&str, String)> = vec![("amount", amount_msat.to_string())];
        if let Some(c) = comment {
            query.push(("comment", c.to_string()));
        }

        let resp: serde_json::Value = self
            .http
            .get(callback)
            .query(&query)
            .timeout(LNURL_HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;

        resp["pr"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                WalletError::InvalidAddress(format!(
                    "{address}: LNURL callback returned no invoice"
                ))
            })
    }
}

#[async_trait]
impl WalletCapability for LdkWallet {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        description: &str,
        expiry_secs: u32,
    ) -> Result<CreatedInvoice, WalletError> {
        let node = self.node.clone();
        let description = description.to_string();
        let invoice = tokio::task::spawn_blocking(move || {
            let desc = Description::new(description)
                .map_err(|e| WalletError::InvalidInvoice(e.to_string()))?;
            node.bolt11_payment()
                .receive(
                    amount_sats * 1000,
                    &Bolt11InvoiceDescription::Direct(desc),
                    expiry_secs,
                )
                .map_err(|e| WalletError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| WalletError::Transport(e.to_string()))??;

        let hash_bytes: &[u8] = invoice.payment_hash().as_ref();
        let mut payment_hash = [0u8; 32];
        payment_hash.copy_from_slice(hash_bytes);

        Ok(CreatedInvoice {
            bolt11: invoice.to_string(),
            payment_hash,
        })
    }

    async fn pay_invoice(&self, bolt11: &str) -> Result<[u8; 32], WalletError> {
        let invoice: Bolt11Invoice = bolt11
            .parse()
            .map_err(|e: ldk_node::lightning_invoice::ParseOrSemanticError| {
                WalletError::InvalidInvoice(e.to_string())
            })?;

        let hash_bytes: &[u8] = invoice.payment_hash().as_ref();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(hash_bytes);
        let target = PaymentHash(hash);

        // Register before sending: direct-channel payments can settle in
        // under a second, and an unrouted event is lost to this waiter.
        let mut rx = self.router.register(target);

        let node = self.node.clone();
        let send_result = tokio::task::spawn_blocking(move || {
            node.bolt11_payment()
                .send(&invoice, None)
                .map_err(|e| WalletError::PaymentFailed(e.to_string()))
        })
        .await
        .map_err(|e| WalletError::Transport(e.to_string()))?;

        if let Err(e) = send_result {
            self.router.unregister(&target);
            return Err(e);
        }

        let deadline = Instant::now() + PAY_TIMEOUT;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(WalletError::PaymentFailed(format!(
                    "payment did not settle within {PAY_TIMEOUT:?}"
                )));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(Event::PaymentSuccessful {
                    payment_preimage: Some(preimage),
                    ..
                })) => break Ok(preimage.0),
                Ok(Some(Event::PaymentFailed { reason, .. })) => {
                    break Err(WalletError::PaymentFailed(format!("{reason:?}")))
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    break Err(WalletError::Transport("payment router stopped".into()))
                }
                Err(_) => {
                    break Err(WalletError::PaymentFailed(format!(
                        "payment did not settle within {PAY_TIMEOUT:?}"
                    )))
                }
            }
        };
        self.router.unregister(&target);
        outcome
    }

    async fn pay_address(
        &self,
        address: &str,
        amount_sats: u64,
        comment: Option<&str>,
    ) -> Result<AddressPayment, WalletError> {
        let bolt11 = self.resolve_address(address, amount_sats, comment).await?;
        let preimage = self.pay_invoice(&bolt11).await?;
        Ok(AddressPayment { preimage, bolt11 })
    }

    async fn wait_for_payment(
        &self,
        payment_hash: &[u8; 32],
        timeout: Duration,
    ) -> Result<PaymentConfirmation, WalletError> {
        // The payment may have settled before this call: check the payment
        // store first, then fall back to the event stream.
        if let Some(confirmation) = self.settled_payment(payment_hash) {
            return Ok(confirmation);
        }

        let target = PaymentHash(*payment_hash);
        let mut rx = self.router.register(target);
        let deadline = Instant::now() + timeout;

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Ok(PaymentConfirmation::unpaid());
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(Event::PaymentReceived { .. })) => {
                    let preimage = self
                        .settled_payment(payment_hash)
                        .and_then(|c| c.preimage);
                    let settled_at = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    break Ok(PaymentConfirmation {
                        paid: true,
                        preimage,
                        settled_at: Some(settled_at),
                    });
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    break Err(WalletError::Transport("payment router stopped".into()))
                }
                Err(_) => break Ok(PaymentConfirmation::unpaid()),
            }
        };
        self.router.unregister(&target);
        outcome
    }

    async fn balance_sats(&self) -> Result<u64, WalletError> {
        Ok(self.node.list_balances().total_lightning_balance_sats)
    }
}
