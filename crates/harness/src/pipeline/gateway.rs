use anyhow::{Context, Result};

use super::{
    ChainConnector, Orchestrator, StageId,
    settlement::{CTM_CONFIG_FILE, PERMANENT_VALUES_FILE},
};
use crate::{
    forge::{ScriptInvocation, ScriptRunner},
    state::{DeploymentState, GatewayRecord, contract},
};

const GATEWAY_CTM_OUTPUT_FILE: &str = "gateway-ctm-output.toml";

const GATEWAY_CTM_PATH: &str = "deployed_addresses.state_transition.state_transition_proxy_addr";

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 5: deploy the gateway chain type manager and designate the configured gateway
    /// chain. Returns `None` when no gateway is configured.
    pub async fn setup_gateway(&self) -> Result<Option<GatewayRecord>> {
        self.run_stage(StageId::SetupGateway, async {
            let state = self.store.load()?;
            let chains = state.require_chains()?;

            let Some(gateway) = chains.gateway() else {
                tracing::info!("No gateway chain configured, skipping");
                return Ok(None);
            };

            if let Some(record) = &state.gateway {
                if record.chain_id != gateway.chain_id {
                    anyhow::bail!(
                        "gateway already recorded for chain {}, configured gateway is {}",
                        record.chain_id,
                        gateway.chain_id
                    );
                }
                tracing::info!(chain_id = record.chain_id, gateway_ctm = %record.gateway_ctm, "Gateway already designated");
                return Ok(Some(record.clone()));
            }

            state.chain_address(gateway.chain_id).ok_or_else(|| {
                crate::HarnessError::MissingPrerequisite {
                    stage: StageId::RegisterChains,
                    missing: "gateway chain registration",
                }
            })?;

            let bridgehub = state.require_settlement()?.require(contract::BRIDGEHUB)?;
            let l1 = chains.settlement()?;
            let forge = &self.config.forge;

            let invocation =
                ScriptInvocation::new(&forge.scripts.gateway_ctm, "runForTest(address,bool)")
                    .arg(bridgehub)
                    .arg(true)
                    .env("CTM_CONFIG", forge.input_path(CTM_CONFIG_FILE))
                    .env("CTM_OUTPUT", forge.output_path(GATEWAY_CTM_OUTPUT_FILE))
                    .env("PERMANENT_VALUES_INPUT", forge.input_path(PERMANENT_VALUES_FILE))
                    .output(forge.output_path(GATEWAY_CTM_OUTPUT_FILE));
            let output = self.runner.run(&l1.rpc_url, &invocation).await?;
            let gateway_ctm = output
                .address(GATEWAY_CTM_PATH)
                .context("Gateway deployment produced no chain type manager")?;

            let record = GatewayRecord {
                chain_id: gateway.chain_id,
                gateway_ctm,
            };
            self.store.save(DeploymentState {
                gateway: Some(record.clone()),
                ..Default::default()
            })?;

            tracing::info!(chain_id = record.chain_id, gateway_ctm = %gateway_ctm, "Gateway designated");
            Ok(Some(record))
        })
        .await
    }
}
