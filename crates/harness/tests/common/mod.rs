//! Mock network shared by the integration tests.

#![allow(dead_code)]

use alloy_core::primitives::Address;
use relaynet_harness::{
    ChainSpec, HarnessConfig, Orchestrator, ScriptInvocation, ScriptOutput,
    config::ForgeScripts,
    state::{Chain, ChainTopology, DeploymentState},
    test_utils::{MockChain, MockConnector, MockScriptRunner},
};
use tempdir::TempDir;
use url::Url;

pub const L1: u64 = 1;
pub const GATEWAY: u64 = 10;
pub const ROLLUPS: [u64; 3] = [10, 11, 12];

pub const BRIDGEHUB: Address = Address::repeat_byte(0xb1);
pub const CHAIN_ADMIN: Address = Address::repeat_byte(0xca);
pub const SHARED_BRIDGE: Address = Address::repeat_byte(0x5b);
pub const CTM: Address = Address::repeat_byte(0xc7);
pub const GATEWAY_CTM: Address = Address::repeat_byte(0x97);

/// Diamond proxy the mock registration script reports for `chain_id`.
pub fn diamond_proxy(chain_id: u64) -> Address {
    Address::left_padding_from(&[0xd0, chain_id as u8])
}

/// Answers every deployment script with the outputs the pipeline reads.
pub fn deployment_scripts(invocation: &ScriptInvocation) -> anyhow::Result<ScriptOutput> {
    let scripts = ForgeScripts::default();
    let document = if invocation.script == scripts.l1_core {
        format!(
            r#"
            [deployed_addresses]
            chain_admin = "{CHAIN_ADMIN}"
            [deployed_addresses.bridgehub]
            bridgehub_proxy_addr = "{BRIDGEHUB}"
            [deployed_addresses.bridges]
            shared_bridge_proxy_addr = "{SHARED_BRIDGE}"
            "#
        )
    } else if invocation.script == scripts.ctm {
        let ctm = match invocation.args.get(1).map(String::as_str) {
            Some("true") => GATEWAY_CTM,
            _ => CTM,
        };
        format!(
            r#"
            [deployed_addresses.state_transition]
            state_transition_proxy_addr = "{ctm}"
            "#
        )
    } else if invocation.script == scripts.register_chain {
        let chain_id: u64 = invocation.args[1].parse()?;
        format!(r#"diamond_proxy_addr = "{}""#, diamond_proxy(chain_id))
    } else {
        String::new()
    };
    ScriptOutput::parse(&document)
}

/// A mock network with its state directory in a temporary directory.
pub struct TestNetwork {
    pub dir: TempDir,
    pub config: HarnessConfig,
    pub connector: MockConnector,
    pub runner: MockScriptRunner,
}

impl TestNetwork {
    pub fn new() -> Self {
        let dir = TempDir::new("relaynet-test").unwrap();
        let config = HarnessConfig {
            outdata: dir.path().to_path_buf(),
            chains: vec![
                ChainSpec::settlement(L1, 8545),
                ChainSpec::rollup(10, 8546).gateway(),
                ChainSpec::rollup(11, 8547),
                ChainSpec::rollup(12, 8548),
            ],
            ..Default::default()
        };

        Self {
            dir,
            config,
            connector: MockConnector::new([L1, 10, 11, 12]),
            runner: MockScriptRunner::new(deployment_scripts),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator<MockScriptRunner, MockConnector> {
        Orchestrator::new(self.config.clone(), self.runner.clone(), self.connector.clone()).unwrap()
    }

    pub fn chain(&self, chain_id: u64) -> MockChain {
        self.connector.chain(chain_id)
    }

    /// Record the configured chains as if they had been started.
    pub fn record_chains(&self, orchestrator: &Orchestrator<MockScriptRunner, MockConnector>) {
        let chains = self
            .config
            .chains
            .iter()
            .map(|spec| Chain {
                chain_id: spec.chain_id,
                rpc_url: Url::parse(&format!("http://127.0.0.1:{}", spec.port)).unwrap(),
                port: spec.port,
                role: spec.role,
                is_gateway: spec.is_gateway,
            })
            .collect();

        orchestrator
            .store()
            .save(DeploymentState {
                chains: Some(ChainTopology::new(chains)),
                ..Default::default()
            })
            .unwrap();
    }

    /// Run stages 2 to 5 against recorded chains.
    pub async fn deploy(&self) -> Orchestrator<MockScriptRunner, MockConnector> {
        let orchestrator = self.orchestrator();
        self.record_chains(&orchestrator);
        orchestrator.deploy_l1().await.unwrap();
        orchestrator.register_chains().await.unwrap();
        orchestrator.init_l2().await.unwrap();
        orchestrator.setup_gateway().await.unwrap();
        orchestrator
    }
}
