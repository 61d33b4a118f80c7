use std::path::PathBuf;

use alloy_core::primitives::{Address, Bytes};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "relaynet")]
#[command(
    author,
    version,
    about = "Run a local settlement chain with interoperating rollups on anvil"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "RELAYNET_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Relaynet.toml configuration file.
    ///
    /// If not provided, ./Relaynet.toml is used when present. Every value can be overridden with
    /// RELAYNET_* environment variables.
    #[arg(short, long, global = true, env = "RELAYNET_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every stage, then the daemons until interrupted. Stops all chains on exit.
    Up,
    /// Start (or adopt) the configured anvil nodes.
    StartChains,
    /// Deploy the settlement contracts on L1.
    DeployL1,
    /// Register every rollup chain with the bridgehub.
    RegisterChains,
    /// Request the system contract initialization of every rollup.
    InitL2,
    /// Designate the gateway chain.
    SetupGateway,
    /// Run the settler and relayers in the foreground until interrupted.
    RunDaemons,
    /// Show the persisted deployment state.
    Status,
    /// Stop the nodes started by a previous invocation.
    Down,
    /// Send a cross-chain marker message from one rollup to another.
    #[command(name = "send-l2-to-l2")]
    SendL2ToL2 {
        /// Chain id of the source rollup.
        source: u64,
        /// Chain id of the target rollup.
        target: u64,
        /// Recipient of the call on the target chain. Defaults to the operator.
        #[arg(long, env = "RELAYNET_TARGET_ADDRESS")]
        target_address: Option<Address>,
        /// Hex calldata of the call on the target chain.
        #[arg(long, env = "RELAYNET_CALLDATA", default_value = "0x")]
        calldata: Bytes,
    },
    /// Compute the native token vault asset id of a token.
    AssetId {
        /// Chain id the token originates from.
        chain: u64,
        /// Token address. Defaults to the base token.
        token: Option<Address>,
    },
}
