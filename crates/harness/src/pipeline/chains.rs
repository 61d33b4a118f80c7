use anyhow::Result;

use super::{ChainConnector, Orchestrator, StageId};
use crate::{
    client::ChainClient,
    forge::ScriptRunner,
    node::NodeManager,
    state::{Chain, ChainTopology, DeploymentState},
};

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 1: bring up the configured chains and record their endpoints.
    ///
    /// Recorded chains that still answer are reused. Recorded chains that are down are respawned
    /// on their recorded port.
    pub async fn start_chains(&self, nodes: &mut NodeManager) -> Result<ChainTopology> {
        self.run_stage(StageId::StartChains, async {
            let recorded = self.store.load()?.chains.unwrap_or_default();
            let adopted = nodes.adopt(&recorded)?;
            if !adopted.is_empty() {
                tracing::debug!(chains = ?adopted, "Adopted recorded nodes");
            }

            let mut chains = Vec::with_capacity(self.config.chains.len());
            for spec in &self.config.chains {
                let Some(existing) = recorded.get(spec.chain_id) else {
                    let chain = nodes
                        .start_chain(spec.chain_id, spec.port, spec.role, spec.is_gateway)
                        .await?;
                    chains.push(chain);
                    continue;
                };

                if self.is_alive(existing).await {
                    tracing::info!(chain_id = existing.chain_id, rpc_url = %existing.rpc_url, "Reusing running chain");
                    chains.push(existing.clone());
                    continue;
                }

                tracing::warn!(chain_id = existing.chain_id, port = existing.port, "Recorded chain is down, respawning");
                if nodes.is_tracked(existing.chain_id) {
                    nodes.stop_chain(existing.chain_id).await?;
                }
                let chain = nodes
                    .start_chain(
                        existing.chain_id,
                        existing.port,
                        existing.role,
                        existing.is_gateway,
                    )
                    .await?;
                chains.push(chain);
            }

            let topology = ChainTopology::new(chains);
            self.store.save(DeploymentState {
                chains: Some(topology.clone()),
                ..Default::default()
            })?;

            tracing::info!(chains = topology.len(), "Chains ready");
            Ok(topology)
        })
        .await
    }

    async fn is_alive(&self, chain: &Chain) -> bool {
        let Ok(client) = self.connector.connect(chain) else {
            return false;
        };
        matches!(client.chain_id().await, Ok(id) if id == chain.chain_id)
    }
}
