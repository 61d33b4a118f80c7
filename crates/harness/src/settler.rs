//! Batch settlement daemon.
//!
//! Every rollup chain gets its own [`BatchState`]. Each tick collects the chain's new
//! transactions and then attempts at most one settlement step on L1, draining the pipeline
//! before starting a new batch: execute a proved batch, else prove a committed batch, else
//! commit the pending transactions once there are enough of them.
//!
//! The batch data is placeholder content. Only the ordering of the calls is meaningful.

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_sol_types::{SolCall, SolValue};
use anyhow::{Context, Result};
use futures::future::join_all;

use crate::{
    HarnessError,
    client::ChainClient,
    contracts::{
        CommitBatchInfo, ProofInput, StoredBatchInfo, commitBatchesSharedBridgeCall,
        executeBatchesSharedBridgeCall, proveBatchesSharedBridgeCall,
    },
    daemon::Daemon,
    types::{RpcTransaction, TransactionRequest},
};

/// A rollup transaction waiting to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub sender: Address,
    pub recipient: Option<Address>,
    pub value: U256,
    pub payload: Bytes,
    pub gas_limit: u64,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub nonce: u64,
    pub hash: B256,
    pub origin_block: u64,
}

impl PendingTransaction {
    fn from_rpc(tx: RpcTransaction, origin_block: u64) -> Self {
        Self {
            sender: tx.from,
            recipient: tx.to,
            value: tx.value,
            payload: tx.input,
            gas_limit: tx.gas,
            max_fee_per_gas: tx.max_fee_per_gas.or(tx.gas_price).unwrap_or_default(),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas.unwrap_or_default(),
            nonce: tx.nonce,
            hash: tx.hash,
            origin_block,
        }
    }
}

/// Settlement progress of a rollup chain.
///
/// `last_executed_batch <= last_proved_batch <= last_committed_batch` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchState {
    pub chain_id: u64,
    pub last_committed_batch: u64,
    pub last_proved_batch: u64,
    pub last_executed_batch: u64,
    pub pending: Vec<PendingTransaction>,
    /// Last block whose transactions were collected.
    pub last_collected_block: u64,
}

impl BatchState {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }
}

/// The settlement step attempted in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Commit(u64),
    Prove(u64),
    Execute(u64),
}

impl BatchState {
    fn next_step(&self, batch_size_limit: usize) -> Option<Step> {
        if self.last_executed_batch < self.last_proved_batch {
            Some(Step::Execute(self.last_executed_batch + 1))
        } else if self.last_proved_batch < self.last_committed_batch {
            Some(Step::Prove(self.last_proved_batch + 1))
        } else if self.pending.len() >= batch_size_limit {
            Some(Step::Commit(self.last_committed_batch + 1))
        } else {
            None
        }
    }
}

fn label(text: impl AsRef<[u8]>) -> B256 {
    keccak256(text)
}

fn now() -> U256 {
    U256::from(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default())
}

/// Placeholder metadata of batch `number` as stored after commit.
pub fn stored_batch_info(number: u64, timestamp: U256) -> StoredBatchInfo {
    StoredBatchInfo {
        batchNumber: number,
        batchHash: label(format!("batch-{number}")),
        indexRepeatedStorageChanges: 0,
        numberOfLayer1Txs: U256::ZERO,
        priorityOperationsHash: label("empty"),
        l2LogsTreeRoot: label("logs"),
        timestamp,
        commitment: label(format!("commitment-{number}")),
    }
}

/// The transaction hashes, ABI-encoded as a `bytes32[]`. Empty without transactions.
pub fn encode_system_logs(transactions: &[PendingTransaction]) -> Bytes {
    if transactions.is_empty() {
        return Bytes::new();
    }
    let hashes: Vec<B256> = transactions.iter().map(|tx| tx.hash).collect();
    (hashes,).abi_encode_params().into()
}

pub fn commit_batch_info(
    number: u64,
    transactions: &[PendingTransaction],
    timestamp: U256,
) -> CommitBatchInfo {
    CommitBatchInfo {
        batchNumber: number,
        timestamp,
        indexRepeatedStorageChanges: 0,
        newStateRoot: label(format!("state-{number}-{}", transactions.len())),
        numberOfLayer1Txs: U256::ZERO,
        priorityOperationsHash: label("empty"),
        bootloaderHeapInitialContentsHash: label("bootloader"),
        eventsQueueStateHash: label("events"),
        systemLogs: encode_system_logs(transactions),
        operatorDAInput: Bytes::new(),
    }
}

/// A chain settled by the daemon.
#[derive(Debug)]
struct SettledChain<C> {
    client: C,
    diamond_proxy: Address,
    state: BatchState,
}

impl<C: ChainClient> SettledChain<C> {
    async fn collect(&mut self) -> Result<usize> {
        let head = self.client.block_number().await?;
        let mut collected = 0;

        for number in self.state.last_collected_block + 1..=head {
            let block = self
                .client
                .block_with_transactions(number)
                .await?
                .with_context(|| format!("block {number} of chain {} not found", self.state.chain_id))?;

            collected += block.transactions.len();
            self.state.pending.extend(
                block
                    .transactions
                    .into_iter()
                    .map(|tx| PendingTransaction::from_rpc(tx, number)),
            );
            self.state.last_collected_block = number;
        }

        if collected > 0 {
            tracing::debug!(chain_id = self.state.chain_id, collected, pending = self.state.pending.len(), "Collected transactions");
        }
        Ok(collected)
    }

    fn calldata(&self, step: Step) -> Vec<u8> {
        let chain_id = U256::from(self.state.chain_id);
        let timestamp = now();
        match step {
            Step::Commit(number) => commitBatchesSharedBridgeCall {
                chainId: chain_id,
                lastCommittedBatchData: stored_batch_info(number - 1, timestamp),
                newBatchesData: vec![commit_batch_info(number, &self.state.pending, timestamp)],
            }
            .abi_encode(),
            Step::Prove(number) => proveBatchesSharedBridgeCall {
                chainId: chain_id,
                prevBatch: stored_batch_info(number - 1, timestamp),
                committedBatches: vec![stored_batch_info(number, timestamp)],
                proof: ProofInput {
                    recursiveAggregationInput: vec![],
                    serializedProof: vec![],
                },
            }
            .abi_encode(),
            Step::Execute(number) => executeBatchesSharedBridgeCall {
                chainId: chain_id,
                batchesData: vec![stored_batch_info(number, timestamp)],
            }
            .abi_encode(),
        }
    }

    async fn tick<L: ChainClient>(&mut self, l1: &L, operator: Address, batch_size_limit: usize) -> Result<()> {
        self.collect().await?;

        let Some(step) = self.state.next_step(batch_size_limit) else {
            return Ok(());
        };

        let chain_id = self.state.chain_id;
        let request = TransactionRequest::new(operator, self.diamond_proxy).input(self.calldata(step));
        let receipt = l1.send_and_confirm(request).await?;

        let state = &mut self.state;
        match step {
            Step::Commit(number) => {
                let included = state.pending.len();
                state.last_committed_batch = number;
                state.pending.clear();
                tracing::info!(chain_id, batch = number, transactions = included, tx_hash = %receipt.transaction_hash, "Batch committed");
            }
            Step::Prove(number) => {
                state.last_proved_batch = number;
                tracing::info!(chain_id, batch = number, tx_hash = %receipt.transaction_hash, "Batch proved");
            }
            Step::Execute(number) => {
                state.last_executed_batch = number;
                tracing::info!(chain_id, batch = number, tx_hash = %receipt.transaction_hash, "Batch executed");
            }
        }
        Ok(())
    }
}

/// Simulates commit, prove and execute for every rollup chain on the settlement layer.
#[derive(Debug)]
pub struct BatchSettler<C> {
    l1: C,
    operator: Address,
    batch_size_limit: usize,
    chains: BTreeMap<u64, SettledChain<C>>,
}

impl<C: ChainClient> BatchSettler<C> {
    pub fn new(l1: C, operator: Address, batch_size_limit: usize) -> Self {
        Self {
            l1,
            operator,
            batch_size_limit: batch_size_limit.max(1),
            chains: BTreeMap::new(),
        }
    }

    /// Settle `client`'s chain through its diamond proxy on L1.
    pub fn with_chain(mut self, client: C, diamond_proxy: Address) -> Self {
        let chain_id = client.id();
        self.chains.insert(
            chain_id,
            SettledChain {
                client,
                diamond_proxy,
                state: BatchState::new(chain_id),
            },
        );
        self
    }

    pub fn state(&self, chain_id: u64) -> Option<&BatchState> {
        self.chains.get(&chain_id).map(|c| &c.state)
    }

    pub fn states(&self) -> impl Iterator<Item = &BatchState> {
        self.chains.values().map(|c| &c.state)
    }
}

impl<C: ChainClient> Daemon for BatchSettler<C> {
    const NAME: &'static str = "batch-settler";

    async fn tick(&mut self) -> Result<()> {
        let Self {
            l1,
            operator,
            batch_size_limit,
            chains,
        } = self;
        let (l1, operator, limit) = (&*l1, *operator, *batch_size_limit);

        let results = join_all(chains.values_mut().map(|chain| chain.tick(l1, operator, limit))).await;

        let failures: Vec<String> = chains
            .keys()
            .zip(results)
            .filter_map(|(chain_id, result)| {
                result.err().map(|e| {
                    let retry = e
                        .downcast_ref::<HarnessError>()
                        .is_some_and(HarnessError::is_recoverable);
                    tracing::warn!(chain_id, retry, error = %format!("{e:#}"), "Settlement step failed");
                    format!("chain {chain_id}: {e:#}")
                })
            })
            .collect();

        if !failures.is_empty() {
            anyhow::bail!("{} chain(s) failed to settle: {}", failures.len(), failures.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockChain, mock_tx};

    const DIAMOND: Address = Address::repeat_byte(0xd1);

    fn operator() -> Address {
        Address::repeat_byte(0xf3)
    }

    fn push_txs(chain: &MockChain, count: usize) {
        for _ in 0..count {
            chain.push_block(vec![mock_tx(Address::repeat_byte(7), Address::repeat_byte(8), vec![])]);
        }
    }

    fn settler(l1: &MockChain, l2: &MockChain, limit: usize) -> BatchSettler<MockChain> {
        BatchSettler::new(l1.clone(), operator(), limit).with_chain(l2.clone(), DIAMOND)
    }

    fn selectors(l1: &MockChain) -> Vec<[u8; 4]> {
        l1.sent_to(DIAMOND)
            .iter()
            .map(|tx| tx.input.as_ref().unwrap()[..4].try_into().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_commit_waits_for_batch_size_limit() {
        let (l1, l2) = (MockChain::new(1), MockChain::new(11));
        let mut settler = settler(&l1, &l2, 3);

        push_txs(&l2, 2);
        settler.tick().await.unwrap();
        assert!(l1.sent().is_empty());
        assert_eq!(settler.state(11).unwrap().pending.len(), 2);

        push_txs(&l2, 1);
        settler.tick().await.unwrap();

        let state = settler.state(11).unwrap();
        assert_eq!(state.last_committed_batch, 1);
        assert!(state.pending.is_empty());
        assert_eq!(selectors(&l1), vec![commitBatchesSharedBridgeCall::SELECTOR]);
    }

    #[tokio::test]
    async fn test_full_lifecycle_one_step_per_tick() {
        let (l1, l2) = (MockChain::new(1), MockChain::new(11));
        let mut settler = settler(&l1, &l2, 10);
        push_txs(&l2, 10);

        let mut progress = Vec::new();
        for _ in 0..4 {
            settler.tick().await.unwrap();
            let s = settler.state(11).unwrap();
            assert!(s.last_executed_batch <= s.last_proved_batch);
            assert!(s.last_proved_batch <= s.last_committed_batch);
            progress.push((s.last_committed_batch, s.last_proved_batch, s.last_executed_batch));
        }

        assert_eq!(progress, vec![(1, 0, 0), (1, 1, 0), (1, 1, 1), (1, 1, 1)]);
        assert_eq!(
            selectors(&l1),
            vec![
                commitBatchesSharedBridgeCall::SELECTOR,
                proveBatchesSharedBridgeCall::SELECTOR,
                executeBatchesSharedBridgeCall::SELECTOR,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_submission_keeps_state() {
        let (l1, l2) = (MockChain::new(1), MockChain::new(11));
        let mut settler = settler(&l1, &l2, 2);
        push_txs(&l2, 2);

        l1.revert_calls_to(DIAMOND);
        let err = settler.tick().await.unwrap_err();
        assert!(err.to_string().contains("chain 11"));

        let state = settler.state(11).unwrap();
        assert_eq!(state.last_committed_batch, 0);
        assert_eq!(state.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_commit_calldata_carries_transaction_hashes() {
        let (l1, l2) = (MockChain::new(1), MockChain::new(11));
        let mut settler = settler(&l1, &l2, 1);
        let tx = mock_tx(Address::repeat_byte(7), Address::repeat_byte(8), vec![1, 2]);
        let hash = tx.hash;
        l2.push_block(vec![tx]);

        settler.tick().await.unwrap();

        let sent = l1.sent_to(DIAMOND);
        let call = commitBatchesSharedBridgeCall::abi_decode(sent[0].input.as_ref().unwrap(), true).unwrap();
        assert_eq!(call.chainId, U256::from(11));
        assert_eq!(call.lastCommittedBatchData.batchNumber, 0);
        assert_eq!(call.newBatchesData[0].batchNumber, 1);

        let logged = Vec::<B256>::abi_decode(&call.newBatchesData[0].systemLogs, true).unwrap();
        assert_eq!(logged, vec![hash]);
    }

    #[test]
    fn test_empty_system_logs() {
        assert!(encode_system_logs(&[]).is_empty());
        assert_eq!(stored_batch_info(3, U256::ZERO).batchHash, keccak256("batch-3"));
    }
}
