//! relaynet-harness - Local multi-chain rollup test network.
//!
//! This crate brings up a settlement chain and several rollup chains as local anvil nodes,
//! deploys and registers the rollup contracts on them in resumable stages, and runs the daemons
//! that simulate batch settlement and cross-chain message delivery.

mod error;
pub use error::HarnessError;

pub mod client;
pub use client::{ChainClient, RpcChainClient};

pub mod config;
pub use config::{ChainRole, ChainSpec, HarnessConfig};

pub mod contracts;

pub mod daemon;
pub use daemon::{Daemon, DaemonHandle};

pub mod forge;
pub use forge::{ForgeScriptRunner, ScriptInvocation, ScriptOutput, ScriptRunner};

mod fs;

pub mod node;
pub use node::NodeManager;

pub mod pipeline;
pub use pipeline::{ChainConnector, Daemons, Orchestrator, RpcConnector, StageId};

pub mod relayer;
pub use relayer::{L1ToL2Relayer, L2ToL2Relayer, send_marker_message};

mod rpc;

pub mod settler;
pub use settler::{BatchSettler, BatchState};

pub mod state;
pub use state::{DeploymentInfo, DeploymentState, StateStore};

pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
