//! The staged deployment pipeline.
//!
//! Every stage is an independently invocable method of [`Orchestrator`]. A stage reads the state
//! persisted by earlier stages, fails with [`HarnessError::MissingPrerequisite`] if it is absent,
//! and skips whatever part of its own output is already recorded.
//!
//! [`HarnessError::MissingPrerequisite`]: crate::HarnessError::MissingPrerequisite

mod chains;
mod daemons;
mod gateway;
mod l2_init;
mod registration;
mod settlement;

use std::{future::Future, time::Duration};

use alloy_core::primitives::Address;
use anyhow::Result;

pub use daemons::Daemons;

use crate::{
    HarnessError,
    client::{ChainClient, RpcChainClient},
    config::HarnessConfig,
    forge::ScriptRunner,
    node::NodeManager,
    state::{Chain, DeploymentState, StateStore},
};

/// Identifies a pipeline stage. Displays as the CLI subcommand running it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum StageId {
    #[strum(serialize = "start-chains")]
    StartChains,
    #[strum(serialize = "deploy-l1")]
    DeployL1,
    #[strum(serialize = "register-chains")]
    RegisterChains,
    #[strum(serialize = "init-l2")]
    InitL2,
    #[strum(serialize = "setup-gateway")]
    SetupGateway,
    #[strum(serialize = "run-daemons")]
    RunDaemons,
}

/// Opens a client to a chain recorded in the deployment state.
pub trait ChainConnector: Send + Sync + 'static {
    type Client: ChainClient;

    fn connect(&self, chain: &Chain) -> Result<Self::Client>;
}

/// Connects to chains over JSON-RPC.
#[derive(Debug, Clone)]
pub struct RpcConnector {
    request_timeout: Duration,
}

impl RpcConnector {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.rpc.request_timeout_secs),
        }
    }
}

impl ChainConnector for RpcConnector {
    type Client = RpcChainClient;

    fn connect(&self, chain: &Chain) -> Result<RpcChainClient> {
        RpcChainClient::new(chain.chain_id, chain.rpc_url.clone(), self.request_timeout)
    }
}

/// Drives the deployment stages against the persisted state.
#[derive(Debug)]
pub struct Orchestrator<R, K> {
    config: HarnessConfig,
    store: StateStore,
    runner: R,
    connector: K,
    operator: Address,
}

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    pub fn new(config: HarnessConfig, runner: R, connector: K) -> Result<Self> {
        let operator = config.operator_address()?;
        let store = StateStore::new(config.state_dir());
        Ok(Self {
            config,
            store,
            runner,
            connector,
            operator,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Load the current deployment state.
    pub fn state(&self) -> Result<DeploymentState> {
        self.store.load()
    }

    /// Client of a recorded chain.
    pub fn connect(&self, state: &DeploymentState, chain_id: u64) -> Result<K::Client> {
        let chain = state
            .require_chains()?
            .get(chain_id)
            .ok_or(HarnessError::ChainNotFound(chain_id))?;
        self.connector.connect(chain)
    }

    /// Run every stage in order and start the daemons.
    pub async fn run_all(&self, nodes: &mut NodeManager) -> Result<Daemons<K::Client>> {
        self.start_chains(nodes).await?;
        self.deploy_l1().await?;
        self.register_chains().await?;
        self.init_l2().await?;
        self.setup_gateway().await?;
        self.start_daemons().await
    }

    async fn run_stage<F, T>(&self, stage: StageId, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tracing::info!(stage = %stage, "Running stage");
        let start = std::time::Instant::now();
        let result = f.await;
        match &result {
            Ok(_) => tracing::info!(stage = %stage, elapsed = ?start.elapsed(), "Stage completed"),
            Err(e) => tracing::error!(stage = %stage, error = %format!("{e:#}"), "Stage failed"),
        }
        result
    }
}
