use std::path::Path;

use alloy_core::primitives::{Bytes, U256};
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};
use serde::Deserialize;

use super::{ChainConnector, Orchestrator, StageId};
use crate::{
    client::ChainClient,
    contracts::{
        L2_ASSET_ROUTER, L2_BRIDGEHUB, L2_NATIVE_TOKEN_VAULT, L2TransactionRequestDirect,
        MAX_NUMBER_OF_CHAINS, SYSTEM_CONTRACTS, initL2Call,
    },
    forge::ScriptRunner,
    relayer::submit_direct_request,
    state::{DeploymentState, L2InitRecord, contract},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    #[serde(default)]
    deployed_bytecode: Option<ArtifactBytecode>,
    #[serde(default)]
    bytecode: Option<ArtifactBytecode>,
}

#[derive(Debug, Deserialize)]
struct ArtifactBytecode {
    object: Bytes,
}

/// Read the runtime bytecode of a Foundry artifact, falling back to the creation bytecode.
async fn read_bytecode(path: &Path) -> Result<Bytes> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;
    let artifact: Artifact = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

    [artifact.deployed_bytecode, artifact.bytecode]
        .into_iter()
        .flatten()
        .map(|b| b.object)
        .find(|code| !code.is_empty())
        .with_context(|| format!("No bytecode in artifact {}", path.display()))
}

/// Install the system contracts on a rollup chain, skipping addresses that already hold code.
pub(crate) async fn bootstrap_system_contracts<C: ChainClient>(
    client: &C,
    artifacts_dir: &Path,
) -> Result<usize> {
    let mut installed = 0;
    for system in SYSTEM_CONTRACTS {
        if !client.code(system.address).await?.is_empty() {
            tracing::debug!(chain_id = client.id(), name = system.name, "System contract already present");
            continue;
        }

        let code = read_bytecode(&artifacts_dir.join(system.artifact)).await?;
        client.set_code(system.address, code).await?;
        tracing::debug!(chain_id = client.id(), name = system.name, address = %system.address, "System contract installed");
        installed += 1;
    }
    Ok(installed)
}

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 4: install the system contracts of every registered chain and request their
    /// initialization through the settlement layer.
    pub async fn init_l2(&self) -> Result<Vec<L2InitRecord>> {
        self.run_stage(StageId::InitL2, async {
            let state = self.store.load()?;
            let chains = state.require_chains()?;
            let bridgehub = state.require_settlement()?.require(contract::BRIDGEHUB)?;
            let registered = state.require_chain_addresses()?;
            let l1_chain = chains.settlement()?;
            let l1 = self.connector.connect(l1_chain)?;

            let mut records = Vec::new();
            for addresses in registered {
                let chain_id = addresses.chain_id;
                if let Some(record) = state.l2_init_record(chain_id) {
                    tracing::info!(chain_id, request = %record.request_tx_hash, "Chain already initialized");
                    records.push(record.clone());
                    continue;
                }

                let chain = chains
                    .get(chain_id)
                    .ok_or(crate::HarnessError::ChainNotFound(chain_id))?;
                let l2 = self.connector.connect(chain)?;

                match &self.config.forge.artifacts_dir {
                    Some(dir) => {
                        let installed = bootstrap_system_contracts(&l2, dir).await?;
                        tracing::info!(chain_id, installed, "System contracts bootstrapped");
                    }
                    None => tracing::debug!(chain_id, "No artifacts directory, skipping bootstrap"),
                }

                let calldata = initL2Call {
                    l1ChainId: U256::from(l1_chain.chain_id),
                    owner: self.operator,
                    maxNumberOfZKChains: U256::from(MAX_NUMBER_OF_CHAINS),
                }
                .abi_encode();
                let request = L2TransactionRequestDirect {
                    chainId: U256::from(chain_id),
                    mintValue: U256::ZERO,
                    l2Contract: L2_BRIDGEHUB,
                    l2Value: U256::ZERO,
                    l2Calldata: calldata.into(),
                    l2GasLimit: U256::from(self.config.relayer.l2_gas_limit),
                    l2GasPerPubdataByteLimit: U256::from(self.config.relayer.gas_per_pubdata),
                    factoryDeps: vec![],
                    refundRecipient: self.operator,
                };

                let receipt = submit_direct_request(&l1, bridgehub, self.operator, request)
                    .await
                    .with_context(|| format!("Failed to request initialization of chain {chain_id}"))?;

                let record = L2InitRecord {
                    chain_id,
                    l2_bridgehub: L2_BRIDGEHUB,
                    l2_asset_router: L2_ASSET_ROUTER,
                    l2_native_token_vault: L2_NATIVE_TOKEN_VAULT,
                    request_tx_hash: receipt.transaction_hash,
                    l1_block: receipt.block_number,
                };
                self.store.save(DeploymentState {
                    l2_init: Some(vec![record.clone()]),
                    ..Default::default()
                })?;
                tracing::info!(chain_id, request = %record.request_tx_hash, l1_block = record.l1_block, "L2 initialization requested");
                records.push(record);
            }

            Ok(records)
        })
        .await
    }
}
