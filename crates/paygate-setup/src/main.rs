//! Paygate Lightning node with metered streaming and live console.
//!
//! Starts the node, runs a command, stays online. Ctrl-C to stop.
//! `serve` exposes the streaming API plus an SSE console feed on
//! `--http-port`.
//!
//! Commands:
//!   serve     Start the node and serve the HTTP API
//!   info      Print node ID, addresses, balances
//!   balance   Print spendable Lightning balance

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ldk_node::bitcoin::Network;
use tracing::info;

use paygate_core::ldk::{self, ChainSource, LdkWallet, LightningConfig};
use paygate_core::WalletCapability;
use paygate_setup::cli::{Cli, Commands};
use paygate_setup::events::{ConsoleEmitter, EventLog};
use paygate_setup::{router, AppState};
use paygate_stream::{SessionStore, StreamConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let chain_source = match (&cli.esplora, &cli.rpc_host) {
        (Some(url), _) => ChainSource::Esplora(url.clone()),
        (None, Some(host)) => ChainSource::BitcoindRpc {
            host: host.clone(),
            port: cli.rpc_port,
            user: cli.rpc_user.clone(),
            password: cli.rpc_password.clone(),
        },
        (None, None) => ChainSource::Esplora("https://mempool.space/signet/api".into()),
    };

    std::fs::create_dir_all(&cli.storage_dir)
        .with_context(|| format!("could not create {}", cli.storage_dir))?;

    let config = LightningConfig {
        storage_dir: cli.storage_dir.clone(),
        network: Network::Signet,
        listening_port: cli.port,
        chain_source,
        node_alias: cli.alias.clone(),
    };

    let wallet = LdkWallet::start(&config).context("node startup failed")?;
    let node = wallet.node().clone();
    info!(node_id = %ldk::node_id(&node), "node started");

    match cli.command {
        Commands::Info => {
            println!("node id:   {}", ldk::node_id(&node));
            println!("addresses: {:?}", ldk::listening_addresses(&node));
            println!(
                "balance:   {} sats",
                wallet.balance_sats().await.unwrap_or(0)
            );
            node.stop().ok();
        }
        Commands::Balance => {
            println!("{} sats", wallet.balance_sats().await.unwrap_or(0));
            node.stop().ok();
        }
        Commands::Serve => {
            let log = EventLog::new(&cli.storage_dir)
                .map(Arc::new)
                .map_err(|e| anyhow::anyhow!("event log: {e}"))?;
            let emitter = Arc::new(ConsoleEmitter::new(Some(log)));

            let state = AppState {
                wallet: Arc::new(wallet),
                node: Some(node),
                node_alias: cli.alias.clone().unwrap_or_default(),
                emitter: emitter.clone(),
                sessions: SessionStore::default(),
                stream_config: StreamConfig {
                    sats_per_batch: cli.sats_per_batch,
                    tokens_per_batch: cli.tokens_per_batch,
                    max_batches: cli.max_batches,
                    payment_timeout: Duration::from_millis(cli.payment_timeout_ms),
                    first_batch_free: cli.first_batch_free,
                    ..StreamConfig::default()
                },
            };

            emitter.emit(
                "node",
                "SERVICE_UP",
                serde_json::json!({ "http_port": cli.http_port }),
            );

            let addr = format!("0.0.0.0:{}", cli.http_port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("could not bind {addr}"))?;
            info!(addr = %addr, "http api listening");
            axum::serve(listener, router(state)).await?;
        }
    }

    Ok(())
}
