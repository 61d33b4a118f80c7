//! Stage ordering and resumption tests against mock chains and scripts.
//!
//! Run with: cargo test --test pipeline_test

mod common;

use std::path::Path;

use alloy_core::primitives::{Address, U256};
use alloy_sol_types::{SolCall, SolValue};
use common::*;
use relaynet_harness::{
    ChainClient, HarnessError, NodeManager, StageId,
    config::ForgeScripts,
    contracts::{
        L2_BRIDGEHUB, chainTypeManagerIsRegisteredCall, initL2Call, pendingAdminCall,
        requestL2TransactionDirectCall,
    },
    state::contract,
};

fn missing_stage(err: &anyhow::Error) -> Option<StageId> {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::MissingPrerequisite { stage, .. }) => Some(*stage),
        _ => None,
    }
}

#[tokio::test]
async fn test_stages_name_their_missing_prerequisite() {
    let network = TestNetwork::new();
    let orchestrator = network.orchestrator();

    let err = orchestrator.deploy_l1().await.unwrap_err();
    assert_eq!(missing_stage(&err), Some(StageId::StartChains));

    network.record_chains(&orchestrator);

    let err = orchestrator.register_chains().await.unwrap_err();
    assert_eq!(missing_stage(&err), Some(StageId::DeployL1));
    let err = orchestrator.start_daemons().await.unwrap_err();
    assert_eq!(missing_stage(&err), Some(StageId::DeployL1));

    orchestrator.deploy_l1().await.unwrap();

    let err = orchestrator.init_l2().await.unwrap_err();
    assert_eq!(missing_stage(&err), Some(StageId::RegisterChains));
    assert_eq!(network.runner.runs_of(&ForgeScripts::default().register_chain), 0);
}

#[tokio::test]
async fn test_start_chains_reuses_live_recorded_chains() {
    let network = TestNetwork::new();
    let orchestrator = network.orchestrator();
    network.record_chains(&orchestrator);
    let recorded = orchestrator.state().unwrap();

    let mut nodes = NodeManager::new(&network.config);
    let topology = orchestrator.start_chains(&mut nodes).await.unwrap();

    assert!(nodes.chains().is_empty(), "no node spawned");
    assert_eq!(recorded.chains.as_ref(), Some(&topology));
    assert_eq!(orchestrator.state().unwrap(), recorded);
}

#[tokio::test]
async fn test_deploy_l1_resumes_without_redeploying() {
    let network = TestNetwork::new();
    let orchestrator = network.orchestrator();
    network.record_chains(&orchestrator);
    let scripts = ForgeScripts::default();

    let first = orchestrator.deploy_l1().await.unwrap();
    assert_eq!(first.get(contract::BRIDGEHUB), Some(&BRIDGEHUB));
    assert_eq!(first.get(contract::CHAIN_TYPE_MANAGER), Some(&CTM));

    let l1 = network.chain(L1);
    assert_eq!(l1.sent_to(BRIDGEHUB).len(), 1, "admin accepted once");
    assert!(!l1.is_impersonated(CHAIN_ADMIN));

    // The bridgehub now reports the registration and the completed ownership transfer.
    l1.set_call_response(
        BRIDGEHUB,
        chainTypeManagerIsRegisteredCall::SELECTOR,
        true.abi_encode(),
    );
    l1.set_call_response(BRIDGEHUB, pendingAdminCall::SELECTOR, Address::ZERO.abi_encode());

    let second = orchestrator.deploy_l1().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(network.runner.runs_of(&scripts.l1_core), 1);
    assert_eq!(network.runner.runs_of(&scripts.ctm), 1);
    assert_eq!(network.runner.runs_of(&scripts.register_ctm), 1);
    assert_eq!(l1.sent_to(BRIDGEHUB).len(), 1);
}

#[tokio::test]
async fn test_register_chains_once_per_rollup() {
    let network = TestNetwork::new();
    let orchestrator = network.orchestrator();
    network.record_chains(&orchestrator);
    orchestrator.deploy_l1().await.unwrap();

    let first = orchestrator.register_chains().await.unwrap();
    let second = orchestrator.register_chains().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|a| (a.chain_id, a.diamond_proxy)).collect::<Vec<_>>(),
        ROLLUPS.map(|id| (id, diamond_proxy(id))).to_vec()
    );
    assert_eq!(
        network.runner.runs_of(&ForgeScripts::default().register_chain),
        ROLLUPS.len()
    );

    let (_, invocation) = network
        .runner
        .invocations()
        .into_iter()
        .find(|(_, i)| i.args == [CTM.to_string(), "11".to_string()])
        .unwrap();
    assert_eq!(invocation.env["BRIDGEHUB_ADDR"], BRIDGEHUB.to_string());
    assert!(invocation.inputs[0].1.contains("chain_chain_id = 11"));
}

#[tokio::test]
async fn test_init_l2_requests_initialization_once() {
    let network = TestNetwork::new();
    let orchestrator = network.orchestrator();
    network.record_chains(&orchestrator);
    orchestrator.deploy_l1().await.unwrap();
    orchestrator.register_chains().await.unwrap();

    let records = orchestrator.init_l2().await.unwrap();
    orchestrator.init_l2().await.unwrap();

    let l1 = network.chain(L1);
    let requests: Vec<_> = l1
        .sent_to(BRIDGEHUB)
        .into_iter()
        .filter_map(|tx| requestL2TransactionDirectCall::abi_decode(tx.input.as_ref()?, true).ok())
        .collect();
    assert_eq!(requests.len(), ROLLUPS.len());
    assert_eq!(records.len(), ROLLUPS.len());

    let request = &requests[1].request;
    assert_eq!(request.chainId, U256::from(11));
    assert_eq!(request.l2Contract, L2_BRIDGEHUB);
    let init = initL2Call::abi_decode(&request.l2Calldata, true).unwrap();
    assert_eq!(init.l1ChainId, U256::from(L1));
    assert_eq!(init.owner, orchestrator.operator());

    let state = orchestrator.state().unwrap();
    let contracts = state.per_chain_contracts();
    assert_eq!(contracts[&11].l2_bridgehub, Some(L2_BRIDGEHUB));
    assert!(records.iter().all(|r| r.l1_block > 0));
}

#[tokio::test]
async fn test_gateway_is_designated_once() {
    let network = TestNetwork::new();
    let orchestrator = network.deploy().await;

    let record = orchestrator.setup_gateway().await.unwrap().unwrap();

    assert_eq!(record.chain_id, GATEWAY);
    assert_eq!(record.gateway_ctm, GATEWAY_CTM);
    assert_eq!(network.runner.runs_of(&ForgeScripts::default().gateway_ctm), 2);
    assert_eq!(
        network
            .runner
            .invocations()
            .iter()
            .filter(|(_, i)| i.args.get(1).is_some_and(|a| a == "true"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_gateway_skipped_without_gateway_chain() {
    let mut network = TestNetwork::new();
    for chain in &mut network.config.chains {
        chain.is_gateway = false;
    }
    let orchestrator = network.orchestrator();
    network.record_chains(&orchestrator);
    orchestrator.deploy_l1().await.unwrap();
    orchestrator.register_chains().await.unwrap();

    assert_eq!(orchestrator.setup_gateway().await.unwrap(), None);
}

#[tokio::test]
async fn test_run_daemons_exports_deployment_info() {
    let network = TestNetwork::new();
    let orchestrator = network.deploy().await;

    let daemons = orchestrator.start_daemons().await.unwrap();
    let info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(daemons.info_path()).unwrap()).unwrap();
    daemons.stop_all().await.unwrap();

    assert_eq!(info["l1ChainId"], 1);
    assert_eq!(info["bridgehub"].as_str().unwrap().parse::<Address>().unwrap(), BRIDGEHUB);
    assert_eq!(info["assetRouter"].as_str().unwrap().parse::<Address>().unwrap(), SHARED_BRIDGE);
    assert_eq!(info["l2Chains"].as_array().unwrap().len(), ROLLUPS.len());
    assert_eq!(info["l2Chains"][2]["chainId"], 12);
}

fn read_info(path: &Path) -> serde_json::Value {
    let mut info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    info.as_object_mut().unwrap().remove("generatedAt");
    info
}

#[tokio::test]
async fn test_run_daemons_restarts_from_the_same_state() {
    let network = TestNetwork::new();
    let orchestrator = network.deploy().await;
    let init_block = orchestrator
        .state()
        .unwrap()
        .l2_init
        .unwrap()
        .iter()
        .map(|r| r.l1_block)
        .min()
        .unwrap();

    let first = orchestrator.start_daemons().await.unwrap();
    let first_info = read_info(first.info_path());
    let (first_l1, first_l2) = (first.l1_start_block(), first.l2_start_block(11).unwrap());
    first.stop_all().await.unwrap();

    let second = orchestrator.start_daemons().await.unwrap();
    let second_info = read_info(second.info_path());
    let (second_l1, second_l2) = (second.l1_start_block(), second.l2_start_block(11).unwrap());
    assert_eq!(second.l2_start_block(99), None);
    second.stop_all().await.unwrap();

    assert_eq!(first_info, second_info);
    // The L1 relayer restarts at the earliest initialization request both times.
    assert_eq!(first_l1, init_block);
    assert_eq!(second_l1, init_block);
    // Rollup scanning starts past the head seen at startup.
    let head = network.chain(11).block_number().await.unwrap();
    assert!(first_l2 <= second_l2);
    assert!(second_l2 <= head + 1);
}
