use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;

use super::{ChainConnector, Orchestrator, StageId};
use crate::{
    HarnessError,
    client::ChainClient,
    daemon::DaemonHandle,
    forge::ScriptRunner,
    relayer::{L1ToL2Relayer, L2ToL2Relayer},
    settler::BatchSettler,
    state::{DeploymentInfo, contract},
};

/// The running background daemons.
#[derive(Debug)]
pub struct Daemons<C: ChainClient> {
    settler: DaemonHandle<BatchSettler<C>>,
    l1_to_l2: DaemonHandle<L1ToL2Relayer<C>>,
    l2_to_l2: DaemonHandle<L2ToL2Relayer<C>>,
    info_path: PathBuf,
    l1_start_block: u64,
    l2_start_blocks: BTreeMap<u64, u64>,
}

impl<C: ChainClient> Daemons<C> {
    /// Path of the exported `deployment-info.json`.
    pub fn info_path(&self) -> &Path {
        &self.info_path
    }

    /// First L1 block scanned by the L1 → L2 relayer.
    pub fn l1_start_block(&self) -> u64 {
        self.l1_start_block
    }

    /// First block of `chain_id` scanned by the L2 → L2 relayer.
    pub fn l2_start_block(&self, chain_id: u64) -> Option<u64> {
        self.l2_start_blocks.get(&chain_id).copied()
    }

    /// Returns `true` if any daemon task exited on its own.
    pub fn any_finished(&self) -> bool {
        self.settler.is_finished() || self.l1_to_l2.is_finished() || self.l2_to_l2.is_finished()
    }

    /// Stop every daemon, letting in-flight ticks finish.
    pub async fn stop_all(self) -> Result<()> {
        let (settler, l1_to_l2, l2_to_l2) = tokio::join!(
            self.settler.stop(),
            self.l1_to_l2.stop(),
            self.l2_to_l2.stop()
        );
        let (settler, l1_to_l2, _) = (settler?, l1_to_l2?, l2_to_l2?);

        for state in settler.states() {
            tracing::info!(
                chain_id = state.chain_id,
                committed = state.last_committed_batch,
                proved = state.last_proved_batch,
                executed = state.last_executed_batch,
                pending = state.pending.len(),
                "Final settlement state"
            );
        }
        tracing::info!(relayed = l1_to_l2.processed().len(), "Daemons stopped");
        Ok(())
    }
}

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 6: export the deployment summary and start the settler and both relayers.
    pub async fn start_daemons(&self) -> Result<Daemons<K::Client>> {
        self.run_stage(StageId::RunDaemons, async {
            let state = self.store.load()?;
            let chains = state.require_chains()?;
            let bridgehub = state.require_settlement()?.require(contract::BRIDGEHUB)?;
            let registered = state.require_chain_addresses()?;
            let l1 = self.connector.connect(chains.settlement()?)?;
            let relayer_config = &self.config.relayer;

            let first_block = relayer_config.start_block.or_else(|| {
                state
                    .l2_init
                    .as_ref()
                    .and_then(|records| records.iter().map(|r| r.l1_block).min())
            });
            let l1_cursor = match first_block {
                Some(block) => block.saturating_sub(1),
                None => l1.block_number().await?,
            };

            let mut settler = BatchSettler::new(
                l1.clone(),
                self.operator,
                self.config.settler.batch_size_limit,
            );
            let mut l1_to_l2 = L1ToL2Relayer::new(l1.clone(), bridgehub, self.operator, l1_cursor);
            let mut l2_to_l2 = L2ToL2Relayer::new(l1, bridgehub, self.operator, relayer_config);
            let mut l2_start_blocks = BTreeMap::new();

            for addresses in registered {
                let chain = chains
                    .get(addresses.chain_id)
                    .ok_or(HarnessError::ChainNotFound(addresses.chain_id))?;
                let client = self.connector.connect(chain)?;
                let head = client.block_number().await?;

                settler = settler.with_chain(client.clone(), addresses.diamond_proxy);
                l1_to_l2 = l1_to_l2.with_chain(client.clone());
                l2_to_l2 = l2_to_l2.with_chain(client, head);
                l2_start_blocks.insert(addresses.chain_id, head + 1);
            }

            let info_path = self
                .store
                .write_deployment_info(&DeploymentInfo::from_state(&state)?)?;
            tracing::info!(path = %info_path.display(), "Deployment info written");

            let relayer_interval = Duration::from_millis(relayer_config.polling_interval_ms);
            tracing::info!(chains = registered.len(), l1_from_block = l1_cursor + 1, "Starting daemons");

            Ok(Daemons {
                settler: DaemonHandle::spawn(
                    settler,
                    Duration::from_millis(self.config.settler.polling_interval_ms),
                ),
                l1_to_l2: DaemonHandle::spawn(l1_to_l2, relayer_interval),
                l2_to_l2: DaemonHandle::spawn(l2_to_l2, relayer_interval),
                info_path,
                l1_start_block: l1_cursor + 1,
                l2_start_blocks,
            })
        })
        .await
    }
}
