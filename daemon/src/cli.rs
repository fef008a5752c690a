//! # CLI Interface
//!
//! Defines the command-line argument structure for `prism-daemon` using
//! `clap` derive. Two subcommands: `run` and `version`. Everything a
//! deployment needs is also settable through `PRISM_*` environment
//! variables, because nobody wants a 12-flag systemd unit.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// PRISM ledger mirror daemon.
///
/// Follows an upstream DAG ledger node's event stream and maintains a
/// queryable mirror of UTXOs, address balances, and wallet balances.
#[derive(Parser, Debug)]
#[command(
    name = "prism-daemon",
    about = "PRISM ledger mirror daemon",
    version,
    propagate_version = true
)]
pub struct PrismDaemonCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the daemon binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the mirror daemon.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Data directory for the embedded store.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "PRISM_DATA_DIR", default_value = "./prism-data")]
    pub data_dir: PathBuf,

    /// WebSocket URL of the upstream node's event stream.
    #[arg(
        long,
        env = "PRISM_WS_URL",
        default_value = "ws://127.0.0.1:8080/v1a/event_ws"
    )]
    pub ws_url: String,

    /// Base HTTP URL of the upstream node's API.
    #[arg(long, env = "PRISM_NODE_URL", default_value = "http://127.0.0.1:8080")]
    pub node_url: String,

    /// Network the mirror belongs to. Events stamped with any other
    /// network are a fatal contract violation.
    #[arg(long, env = "PRISM_NETWORK", default_value = "mainnet")]
    pub network: String,

    /// Port for the status/read API.
    #[arg(long, env = "PRISM_HTTP_PORT", default_value_t = 8591)]
    pub http_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "PRISM_METRICS_PORT", default_value_t = 8592)]
    pub metrics_port: u16,

    /// Override for the idle ACK timeout, in milliseconds.
    #[arg(long, env = "PRISM_ACK_TIMEOUT_MS")]
    pub ack_timeout_ms: Option<u64>,

    /// Pin the upstream peer id. When omitted, the first event pins it.
    #[arg(long, env = "PRISM_PEER_ID")]
    pub peer_id: Option<String>,

    /// Pin the upstream stream id. When omitted, the first event pins it.
    #[arg(long, env = "PRISM_STREAM_ID")]
    pub stream_id: Option<String>,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "PRISM_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}
