use alloy_core::primitives::{Address, U256};
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};

use super::{ChainConnector, Orchestrator, StageId};
use crate::{
    client::ChainClient,
    contracts::{acceptAdminCall, chainTypeManagerIsRegisteredCall, pendingAdminCall},
    forge::{ScriptInvocation, ScriptOutput, ScriptRunner},
    state::{DeploymentState, SettlementAddresses, contract},
    types::TransactionRequest,
};

pub(crate) const L1_CONFIG_FILE: &str = "l1-deployment.toml";
pub(crate) const CTM_CONFIG_FILE: &str = "ctm-deployment.toml";
pub(crate) const PERMANENT_VALUES_FILE: &str = "permanent-values.toml";
pub(crate) const L1_OUTPUT_FILE: &str = "l1-core-output.toml";
pub(crate) const CTM_OUTPUT_FILE: &str = "ctm-output.toml";

/// Core deployment output keys, as `(name, path, required)`.
const CORE_ADDRESSES: &[(&str, &str, bool)] = &[
    (
        contract::BRIDGEHUB,
        "deployed_addresses.bridgehub.bridgehub_proxy_addr",
        true,
    ),
    (
        contract::CHAIN_ADMIN,
        "deployed_addresses.chain_admin",
        true,
    ),
    (
        contract::SHARED_BRIDGE,
        "deployed_addresses.bridges.shared_bridge_proxy_addr",
        true,
    ),
    (
        contract::VALIDATOR_TIMELOCK,
        "deployed_addresses.validator_timelock_addr",
        false,
    ),
    (
        contract::L1_NULLIFIER,
        "deployed_addresses.bridges.l1_nullifier_proxy_addr",
        false,
    ),
    (
        contract::NATIVE_TOKEN_VAULT,
        "deployed_addresses.native_token_vault_addr",
        false,
    ),
    (
        contract::ERC20_BRIDGE,
        "deployed_addresses.bridges.erc20_bridge_proxy_addr",
        false,
    ),
    (contract::GOVERNANCE, "deployed_addresses.governance_addr", false),
    (
        contract::PROXY_ADMIN,
        "deployed_addresses.transparent_proxy_admin_addr",
        false,
    ),
    (
        contract::BLOB_HASH_RETRIEVER,
        "deployed_addresses.blob_versioned_hash_retriever_addr",
        false,
    ),
];

/// Chain type manager deployment output keys.
const CTM_ADDRESSES: &[(&str, &str, bool)] = &[
    (
        contract::CHAIN_TYPE_MANAGER,
        "deployed_addresses.state_transition.state_transition_proxy_addr",
        true,
    ),
    (
        contract::ADMIN_FACET,
        "deployed_addresses.state_transition.admin_facet_addr",
        false,
    ),
    (
        contract::GETTERS_FACET,
        "deployed_addresses.state_transition.getters_facet_addr",
        false,
    ),
    (
        contract::MAILBOX_FACET,
        "deployed_addresses.state_transition.mailbox_facet_addr",
        false,
    ),
    (
        contract::EXECUTOR_FACET,
        "deployed_addresses.state_transition.executor_facet_addr",
        false,
    ),
    (
        contract::VERIFIER,
        "deployed_addresses.state_transition.verifier_addr",
        false,
    ),
];

pub(crate) fn collect_addresses(
    output: &ScriptOutput,
    keys: &[(&str, &str, bool)],
) -> Result<SettlementAddresses> {
    let mut addresses = SettlementAddresses::default();
    for (name, path, required) in keys {
        match output.address(path) {
            Ok(address) => addresses.insert(*name, address),
            Err(e) if *required => return Err(e),
            Err(_) => tracing::debug!(name, path, "Optional address missing from script output"),
        }
    }
    Ok(addresses)
}

/// One ether in wei.
fn one_ether() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 2: deploy the settlement contracts on L1 and take over the bridgehub admin role.
    pub async fn deploy_l1(&self) -> Result<SettlementAddresses> {
        self.run_stage(StageId::DeployL1, async {
            let state = self.store.load()?;
            let l1 = state.require_chains()?.settlement()?.clone();
            let client = self.connector.connect(&l1)?;
            let forge = &self.config.forge;

            let mut recorded = state.settlement.unwrap_or_default();

            if recorded.contains_key(contract::BRIDGEHUB) {
                tracing::info!("Core contracts already deployed");
            } else {
                let invocation = ScriptInvocation::new(&forge.scripts.l1_core, "runForAnvil()")
                    .env("L1_CONFIG", forge.input_path(L1_CONFIG_FILE))
                    .env("L1_OUTPUT", forge.output_path(L1_OUTPUT_FILE))
                    .env("PERMANENT_VALUES_INPUT", forge.input_path(PERMANENT_VALUES_FILE))
                    .output(forge.output_path(L1_OUTPUT_FILE));
                let output = self.runner.run(&l1.rpc_url, &invocation).await?;
                let core = collect_addresses(&output, CORE_ADDRESSES)
                    .context("Incomplete core deployment output")?;

                self.store.save(DeploymentState {
                    settlement: Some(core.clone()),
                    ..Default::default()
                })?;
                for (name, address) in core.iter() {
                    recorded.insert(name.clone(), *address);
                }
                tracing::info!(bridgehub = %recorded.require(contract::BRIDGEHUB)?, "Core contracts deployed");
            }

            let bridgehub = recorded.require(contract::BRIDGEHUB)?;

            if recorded.contains_key(contract::CHAIN_TYPE_MANAGER) {
                tracing::info!("Chain type manager already deployed");
            } else {
                let invocation =
                    ScriptInvocation::new(&forge.scripts.ctm, "runForTest(address,bool)")
                        .arg(bridgehub)
                        .arg(false)
                        .env("CTM_CONFIG", forge.input_path(CTM_CONFIG_FILE))
                        .env("CTM_OUTPUT", forge.output_path(CTM_OUTPUT_FILE))
                        .env("PERMANENT_VALUES_INPUT", forge.input_path(PERMANENT_VALUES_FILE))
                        .output(forge.output_path(CTM_OUTPUT_FILE));
                let output = self.runner.run(&l1.rpc_url, &invocation).await?;
                let ctm = collect_addresses(&output, CTM_ADDRESSES)
                    .context("Incomplete chain type manager deployment output")?;

                self.store.save(DeploymentState {
                    settlement: Some(ctm.clone()),
                    ..Default::default()
                })?;
                for (name, address) in ctm.iter() {
                    recorded.insert(name.clone(), *address);
                }
                tracing::info!(ctm = %recorded.require(contract::CHAIN_TYPE_MANAGER)?, "Chain type manager deployed");
            }

            let ctm = recorded.require(contract::CHAIN_TYPE_MANAGER)?;
            self.register_ctm(&client, &l1.rpc_url, bridgehub, ctm).await?;

            let chain_admin = recorded.require(contract::CHAIN_ADMIN)?;
            self.accept_bridgehub_admin(&client, bridgehub, chain_admin)
                .await?;

            Ok(recorded)
        })
        .await
    }

    async fn register_ctm(
        &self,
        client: &K::Client,
        rpc_url: &url::Url,
        bridgehub: Address,
        ctm: Address,
    ) -> Result<()> {
        let registered = client
            .call_function(
                bridgehub,
                chainTypeManagerIsRegisteredCall {
                    chainTypeManager: ctm,
                },
            )
            .await;
        match registered {
            Ok(r) if r._0 => {
                tracing::info!(ctm = %ctm, "Chain type manager already registered");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Could not query chain type manager registration")
            }
        }

        let invocation = ScriptInvocation::new(
            &self.config.forge.scripts.register_ctm,
            "runForTest(address,address)",
        )
        .arg(bridgehub)
        .arg(ctm)
        .env("BRIDGEHUB_ADDR", bridgehub)
        .env("CTM_ADDR", ctm);
        self.runner.run(rpc_url, &invocation).await?;

        tracing::info!(ctm = %ctm, bridgehub = %bridgehub, "Chain type manager registered");
        Ok(())
    }

    /// Complete the bridgehub's two-step ownership transfer to the chain admin contract.
    async fn accept_bridgehub_admin(
        &self,
        client: &K::Client,
        bridgehub: Address,
        chain_admin: Address,
    ) -> Result<()> {
        match client.call_function(bridgehub, pendingAdminCall {}).await {
            Ok(pending) if pending._0 != chain_admin => {
                tracing::info!(pending_admin = %pending._0, "Bridgehub admin already accepted");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Could not query pending bridgehub admin")
            }
        }

        client
            .send_and_confirm(TransactionRequest::new(self.operator, chain_admin).value(one_ether()))
            .await
            .context("Failed to fund chain admin")?;

        client.impersonate(chain_admin).await?;
        let accepted = client
            .send_and_confirm(
                TransactionRequest::new(chain_admin, bridgehub).input(acceptAdminCall {}.abi_encode()),
            )
            .await;
        client.stop_impersonating(chain_admin).await?;
        accepted.context("Failed to accept bridgehub admin")?;

        tracing::info!(bridgehub = %bridgehub, admin = %chain_admin, "Bridgehub admin accepted");
        Ok(())
    }
}
