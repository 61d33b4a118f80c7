use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use serde::Serialize;

use super::{
    ChainConnector, Orchestrator, StageId,
    settlement::{CTM_OUTPUT_FILE, L1_OUTPUT_FILE},
};
use crate::{
    contracts::ETH_TOKEN_ADDRESS,
    forge::{ScriptInvocation, ScriptRunner},
    state::{ChainAddresses, DeploymentState, contract},
};

/// Salt multiplier keeping chain creation salts distinct per chain id.
const CREATE_CHAIN_SALT_FACTOR: u64 = 1_000_000;

/// Input document of the chain registration script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ChainRegistrationConfig {
    owner_address: Address,
    chain: ChainParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ChainParams {
    chain_chain_id: u64,
    base_token_addr: Address,
    bridgehub_create_new_chain_salt: u64,
    validium_mode: bool,
    base_token_gas_price_multiplier_nominator: u64,
    base_token_gas_price_multiplier_denominator: u64,
    governance_security_council_address: Address,
    governance_min_delay: u64,
    validator_sender_operator_eth: Address,
    validator_sender_operator_blobs_eth: Address,
    allow_evm_emulator: bool,
}

impl ChainRegistrationConfig {
    fn new(chain_id: u64, owner: Address) -> Result<Self> {
        let salt = chain_id
            .checked_mul(CREATE_CHAIN_SALT_FACTOR)
            .with_context(|| format!("Chain id {chain_id} is too large to derive a creation salt"))?;
        Ok(Self {
            owner_address: owner,
            chain: ChainParams {
                chain_chain_id: chain_id,
                base_token_addr: ETH_TOKEN_ADDRESS,
                bridgehub_create_new_chain_salt: salt,
                validium_mode: false,
                base_token_gas_price_multiplier_nominator: 1,
                base_token_gas_price_multiplier_denominator: 1,
                governance_security_council_address: Address::ZERO,
                governance_min_delay: 0,
                validator_sender_operator_eth: owner,
                validator_sender_operator_blobs_eth: owner,
                allow_evm_emulator: false,
            },
        })
    }
}

impl<R: ScriptRunner, K: ChainConnector> Orchestrator<R, K> {
    /// Stage 3: register every rollup chain with the chain type manager.
    pub async fn register_chains(&self) -> Result<Vec<ChainAddresses>> {
        self.run_stage(StageId::RegisterChains, async {
            let state = self.store.load()?;
            let chains = state.require_chains()?;
            let settlement = state.require_settlement()?;
            let l1 = chains.settlement()?;
            let bridgehub = settlement.require(contract::BRIDGEHUB)?;
            let ctm = settlement.require(contract::CHAIN_TYPE_MANAGER)?;
            let forge = &self.config.forge;

            let mut registered = Vec::new();
            for chain in chains.rollups() {
                if let Some(addresses) = state.chain_address(chain.chain_id) {
                    tracing::info!(chain_id = chain.chain_id, diamond_proxy = %addresses.diamond_proxy, "Chain already registered");
                    registered.push(addresses.clone());
                    continue;
                }

                let chain_id = chain.chain_id;
                let config_name = format!("chain-{chain_id}.toml");
                let output_name = format!("chain-{chain_id}-output.toml");
                let document =
                    toml::to_string_pretty(&ChainRegistrationConfig::new(chain_id, self.operator)?)
                        .context("Failed to serialize chain registration config")?;

                let config_path = forge.input_path(&config_name);
                let output_path = forge.output_path(&output_name);
                let invocation = ScriptInvocation::new(
                    &forge.scripts.register_chain,
                    "runForTest(address,uint256)",
                )
                .arg(ctm)
                .arg(chain_id)
                .env("CHAIN_CONFIG", &config_path)
                .env("CHAIN_OUTPUT", &output_path)
                .env("BRIDGEHUB_ADDR", bridgehub)
                .env("CTM_ADDR", ctm)
                .env("CTM_OUTPUT", forge.output_path(CTM_OUTPUT_FILE))
                .env("L1_OUTPUT", forge.output_path(L1_OUTPUT_FILE))
                .env("ZK_CHAIN_CONFIG", &config_path)
                .env("ZK_CHAIN_OUT", &output_path)
                .input(&config_path, document)
                .output(&output_path);

                let output = self.runner.run(&l1.rpc_url, &invocation).await?;
                let diamond_proxy = output
                    .first_address(&["diamond_proxy_addr", "diamond_proxy"])
                    .with_context(|| format!("Registration of chain {chain_id} produced no diamond proxy"))?;

                let addresses = ChainAddresses::new(chain_id, diamond_proxy);
                self.store.save(DeploymentState {
                    chain_addresses: Some(vec![addresses.clone()]),
                    ..Default::default()
                })?;
                tracing::info!(chain_id, diamond_proxy = %diamond_proxy, "Chain registered");
                registered.push(addresses);
            }

            Ok(registered)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_document() {
        let owner = Address::repeat_byte(0xf3);
        let document = toml::to_string(&ChainRegistrationConfig::new(11, owner).unwrap()).unwrap();
        let parsed: toml::Table = toml::from_str(&document).unwrap();

        let chain = parsed["chain"].as_table().unwrap();
        assert_eq!(chain["chain_chain_id"].as_integer(), Some(11));
        assert_eq!(
            chain["bridgehub_create_new_chain_salt"].as_integer(),
            Some(11_000_000)
        );
        assert_eq!(chain["validium_mode"].as_bool(), Some(false));
        assert_eq!(
            parsed["owner_address"].as_str().unwrap().parse::<Address>().unwrap(),
            owner
        );
    }

    #[test]
    fn test_oversized_chain_id_is_rejected() {
        let err = ChainRegistrationConfig::new(u64::MAX / 1_000, Address::ZERO).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
