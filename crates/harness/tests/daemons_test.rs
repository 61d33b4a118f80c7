//! Settlement and relay tests across mock chains.
//!
//! Run with: cargo test --test daemons_test

mod common;

use std::time::Duration;

use alloy_core::primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use common::*;
use relaynet_harness::{
    BatchSettler, Daemon, L1ToL2Relayer, L2ToL2Relayer,
    config::RelayerConfig,
    contracts::{
        commitBatchesSharedBridgeCall, executeBatchesSharedBridgeCall, proveBatchesSharedBridgeCall,
    },
    send_marker_message,
    test_utils::{MockChain, mock_tx},
};

const TARGET: Address = Address::repeat_byte(0x7a);

fn operator() -> Address {
    relaynet_harness::HarnessConfig::default().operator_address().unwrap()
}

#[tokio::test]
async fn test_full_batch_lifecycle() {
    let l1 = MockChain::new(L1);
    let rollup = MockChain::new(11);
    let diamond = diamond_proxy(11);
    let mut settler = BatchSettler::new(l1.clone(), operator(), 10).with_chain(rollup.clone(), diamond);

    for i in 0..10u8 {
        rollup.push_block(vec![mock_tx(Address::repeat_byte(i + 1), TARGET, vec![i])]);
    }

    let mut history = Vec::new();
    for _ in 0..5 {
        settler.tick().await.unwrap();
        let state = settler.state(11).unwrap();
        history.push((
            state.last_committed_batch,
            state.last_proved_batch,
            state.last_executed_batch,
        ));
    }

    assert_eq!(
        history,
        vec![(1, 0, 0), (1, 1, 0), (1, 1, 1), (1, 1, 1), (1, 1, 1)]
    );
    let selectors: Vec<[u8; 4]> = l1
        .sent_to(diamond)
        .iter()
        .map(|tx| tx.input.as_ref().unwrap()[..4].try_into().unwrap())
        .collect();
    assert_eq!(
        selectors,
        [
            commitBatchesSharedBridgeCall::SELECTOR,
            proveBatchesSharedBridgeCall::SELECTOR,
            executeBatchesSharedBridgeCall::SELECTOR,
        ]
    );
}

#[tokio::test]
async fn test_settlement_chains_progress_independently() {
    let l1 = MockChain::new(L1);
    let (busy, idle) = (MockChain::new(11), MockChain::new(12));
    let mut settler = BatchSettler::new(l1.clone(), operator(), 2)
        .with_chain(busy.clone(), diamond_proxy(11))
        .with_chain(idle.clone(), diamond_proxy(12));

    busy.push_block(vec![mock_tx(TARGET, TARGET, vec![]), mock_tx(TARGET, TARGET, vec![])]);
    idle.push_block(vec![mock_tx(TARGET, TARGET, vec![])]);

    settler.tick().await.unwrap();

    assert_eq!(settler.state(11).unwrap().last_committed_batch, 1);
    assert_eq!(settler.state(12).unwrap().last_committed_batch, 0);
    assert_eq!(settler.state(12).unwrap().pending.len(), 1);
    assert!(l1.sent_to(diamond_proxy(12)).is_empty());
}

#[tokio::test]
async fn test_marker_message_reaches_target_chain() {
    let l1 = MockChain::new(L1);
    let (source, target) = (MockChain::new(11), MockChain::new(12));

    let mut l2_to_l2 = L2ToL2Relayer::new(l1.clone(), BRIDGEHUB, operator(), &RelayerConfig::default())
        .with_chain(source.clone(), 0)
        .with_chain(target.clone(), 0);
    let mut l1_to_l2 = L1ToL2Relayer::new(l1.clone(), BRIDGEHUB, operator(), 0)
        .with_chain(source.clone())
        .with_chain(target.clone());

    let calldata = Bytes::from_static(&[0xa9, 0x05, 0x9c, 0xbb]);
    send_marker_message(&source, operator(), 12, TARGET, calldata.clone())
        .await
        .unwrap();

    l2_to_l2.tick().await.unwrap();
    l1_to_l2.tick().await.unwrap();
    // Replaying both legs does not deliver twice.
    l2_to_l2.tick().await.unwrap();
    l1_to_l2.tick().await.unwrap();

    let delivered = target.sent_to(TARGET);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].input, Some(calldata));
    assert!(source.sent_to(TARGET).is_empty());
}

#[tokio::test]
async fn test_running_daemons_deliver_marker_message() {
    let mut network = TestNetwork::new();
    network.config.settler.polling_interval_ms = 10;
    network.config.relayer.polling_interval_ms = 10;
    let orchestrator = network.deploy().await;

    let daemons = orchestrator.start_daemons().await.unwrap();

    let (source, target) = (network.chain(11), network.chain(12));
    let calldata = Bytes::from_static(&[0x12, 0x34]);
    send_marker_message(&source, orchestrator.operator(), 12, TARGET, calldata.clone())
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(tx) = target.sent_to(TARGET).into_iter().next() {
                return tx;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("marker message was not delivered");

    assert!(!daemons.any_finished());
    daemons.stop_all().await.unwrap();

    assert_eq!(delivered.input, Some(calldata));
    assert_eq!(delivered.from, Some(orchestrator.operator()));
}
