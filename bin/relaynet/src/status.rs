use comfy_table::{Table, presets::UTF8_FULL};
use relaynet_harness::{DeploymentState, config::ChainRole};

/// Render the persisted deployment state.
pub fn render(state: &DeploymentState) -> String {
    let Some(chains) = &state.chains else {
        return "No chains recorded. Run `relaynet start-chains` first.".to_string();
    };

    let contracts = state.per_chain_contracts();
    let gateway = state.gateway.as_ref().map(|g| g.chain_id);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Chain",
        "Role",
        "RPC",
        "Diamond proxy",
        "L2 bridgehub",
        "Initialized",
    ]);

    for chain in chains.iter() {
        let role = match (chain.role, chain.is_gateway) {
            (ChainRole::Settlement, _) => "settlement".to_string(),
            (_, true) if gateway == Some(chain.chain_id) => "rollup (gateway)".to_string(),
            (_, true) => "rollup (gateway pending)".to_string(),
            _ => "rollup".to_string(),
        };
        let addresses = contracts.get(&chain.chain_id);
        let diamond = addresses.map(|a| a.diamond_proxy.to_string());
        let l2_bridgehub = addresses.and_then(|a| a.l2_bridgehub).map(|a| a.to_string());
        let initialized = match state.l2_init_record(chain.chain_id) {
            Some(record) => format!("L1 block {}", record.l1_block),
            None if chain.is_settlement() => String::new(),
            None => "no".to_string(),
        };

        table.add_row(vec![
            chain.chain_id.to_string(),
            role,
            chain.rpc_url.to_string(),
            diamond.unwrap_or_else(|| "-".to_string()),
            l2_bridgehub.unwrap_or_else(|| "-".to_string()),
            initialized,
        ]);
    }

    let mut output = table.to_string();

    if let Some(settlement) = &state.settlement {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL).set_header(vec!["Contract", "Address"]);
        for (name, address) in settlement.iter() {
            table.add_row(vec![name.clone(), address.to_string()]);
        }
        if let Some(record) = &state.gateway {
            table.add_row(vec!["gatewayChainTypeManager".to_string(), record.gateway_ctm.to_string()]);
        }
        output.push('\n');
        output.push_str(&table.to_string());
    }

    output
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::{Address, B256};
    use relaynet_harness::state::{
        Chain, ChainAddresses, ChainTopology, L2InitRecord, SettlementAddresses, contract,
    };
    use url::Url;

    use super::*;

    fn chain(chain_id: u64, role: ChainRole) -> Chain {
        Chain {
            chain_id,
            rpc_url: Url::parse(&format!("http://127.0.0.1:{}", 8545 + chain_id)).unwrap(),
            port: 8545 + chain_id as u16,
            role,
            is_gateway: false,
        }
    }

    #[test]
    fn test_render_without_chains() {
        assert!(render(&DeploymentState::default()).contains("start-chains"));
    }

    #[test]
    fn test_render_lists_chains_and_contracts() {
        let bridgehub = Address::repeat_byte(0xb1);
        let diamond = Address::repeat_byte(0xd1);
        let state = DeploymentState {
            chains: Some(ChainTopology::new(vec![
                chain(1, ChainRole::Settlement),
                chain(11, ChainRole::Rollup),
                chain(12, ChainRole::Rollup),
            ])),
            settlement: Some(SettlementAddresses::from_iter([(
                contract::BRIDGEHUB.to_string(),
                bridgehub,
            )])),
            chain_addresses: Some(vec![ChainAddresses::new(11, diamond)]),
            l2_init: Some(vec![L2InitRecord {
                chain_id: 11,
                l2_bridgehub: Address::repeat_byte(0x02),
                l2_asset_router: Address::repeat_byte(0x03),
                l2_native_token_vault: Address::repeat_byte(0x04),
                request_tx_hash: B256::ZERO,
                l1_block: 42,
            }]),
            gateway: None,
        };

        let output = render(&state);

        assert!(output.contains("settlement"));
        assert!(output.contains(&diamond.to_string()));
        assert!(output.contains("L1 block 42"));
        assert!(output.contains(&bridgehub.to_string()));
        assert!(output.contains("bridgehub"));
    }
}
