use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "paygate")]
#[command(about = "Paygate Lightning node with metered streaming and live console")]
pub struct Cli {
    /// Storage directory for LDK node data
    #[arg(long, default_value = "/var/lib/paygate-node")]
    pub storage_dir: String,

    /// Lightning listening port
    #[arg(long, default_value = "9735")]
    pub port: u16,

    /// Esplora server URL
    #[arg(long)]
    pub esplora: Option<String>,

    /// Bitcoind RPC host
    #[arg(long)]
    pub rpc_host: Option<String>,

    /// Bitcoind RPC port
    #[arg(long, default_value = "38332")]
    pub rpc_port: u16,

    /// Bitcoind RPC username
    #[arg(long, default_value = "lightning")]
    pub rpc_user: String,

    /// Bitcoind RPC password
    #[arg(long, default_value = "lightning")]
    pub rpc_password: String,

    /// Human-readable node alias (max 32 bytes)
    #[arg(long)]
    pub alias: Option<String>,

    /// HTTP port for the streaming API and console
    #[arg(long, default_value = "3000")]
    pub http_port: u16,

    /// Price per content batch in satoshis
    #[arg(long, default_value = "10")]
    pub sats_per_batch: u64,

    /// Tokens per content batch
    #[arg(long, default_value = "50")]
    pub tokens_per_batch: usize,

    /// Hard cap on batches per session
    #[arg(long, default_value = "100")]
    pub max_batches: u32,

    /// Per-batch payment timeout in milliseconds
    #[arg(long, default_value = "60000")]
    pub payment_timeout_ms: u64,

    /// Serve the first batch without payment
    #[arg(long)]
    pub first_batch_free: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node and serve the HTTP API
    Serve,
    /// Print node ID, addresses, balances
    Info,
    /// Print spendable Lightning balance
    Balance,
}
