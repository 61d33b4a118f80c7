use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};

use super::{DedupSet, RelayKey, RetryQueue};
use crate::{
    HarnessError,
    client::ChainClient,
    contracts::{L2TransactionRequestDirect, requestL2TransactionDirectCall},
    daemon::Daemon,
    types::{RpcTransaction, TransactionRequest},
};

/// Executes direct requests made to the L1 bridgehub on their target rollup.
///
/// The block cursor always advances to the scanned head. Requests whose submission failed wait
/// in a retry queue that is drained at the start of every tick.
#[derive(Debug)]
pub struct L1ToL2Relayer<C> {
    l1: C,
    bridgehub: Address,
    operator: Address,
    rollups: BTreeMap<u64, C>,
    last_processed_block: u64,
    processed: DedupSet,
    retries: RetryQueue<L2TransactionRequestDirect>,
}

impl<C: ChainClient> L1ToL2Relayer<C> {
    /// Scanning starts after `last_processed_block`.
    pub fn new(l1: C, bridgehub: Address, operator: Address, last_processed_block: u64) -> Self {
        Self {
            l1,
            bridgehub,
            operator,
            rollups: BTreeMap::new(),
            last_processed_block,
            processed: DedupSet::default(),
            retries: RetryQueue::default(),
        }
    }

    pub fn with_chain(mut self, client: C) -> Self {
        self.rollups.insert(client.id(), client);
        self
    }

    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block
    }

    pub fn processed(&self) -> &DedupSet {
        &self.processed
    }

    /// Number of requests waiting for another submission attempt.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Decode a bridgehub transaction into the request to relay. Returns `None` for transactions
    /// that are skipped for good.
    fn decode(&self, tx: &RpcTransaction) -> Option<(RelayKey, L2TransactionRequestDirect)> {
        let Ok(call) = requestL2TransactionDirectCall::abi_decode(&tx.input, true) else {
            tracing::trace!(tx_hash = %tx.hash, "Not a direct request, skipping");
            return None;
        };
        let request = call.request;

        let Ok(chain_id) = u64::try_from(request.chainId) else {
            tracing::warn!(tx_hash = %tx.hash, chain_id = %request.chainId, "Target chain id out of range, dropping");
            return None;
        };
        let key = RelayKey::new(chain_id, tx.hash);
        if self.processed.contains(&key) || self.retries.contains(&key) {
            return None;
        }

        if !self.rollups.contains_key(&chain_id) {
            let e = HarnessError::ChainNotFound(chain_id);
            tracing::warn!(tx_hash = %tx.hash, error = %e, "Dropping direct request");
            return None;
        }
        Some((key, request))
    }

    /// Submit `request` on its rollup. A failed submission is queued for the next tick.
    async fn deliver(&mut self, key: RelayKey, request: L2TransactionRequestDirect) {
        let result = match self.rollups.get(&key.chain_id) {
            Some(l2) => l2
                .send_and_confirm(l2_transaction(self.operator, &request))
                .await
                .with_context(|| format!("Relaying {} to chain {}", key.tx_hash, key.chain_id)),
            None => Err(HarnessError::ChainNotFound(key.chain_id).into()),
        };

        match result {
            Ok(receipt) => {
                self.processed.mark(key);
                tracing::info!(
                    chain_id = key.chain_id,
                    source_tx = %key.tx_hash,
                    l2_tx = %receipt.transaction_hash,
                    target = %request.l2Contract,
                    "Relayed L1 → L2 transaction"
                );
            }
            Err(e) => {
                tracing::warn!(chain_id = key.chain_id, tx_hash = %key.tx_hash, error = %format!("{e:#}"), "L1 → L2 relay failed, will retry");
                self.retries.push(key, request);
            }
        }
    }
}

/// The rollup transaction equivalent to a direct request.
fn l2_transaction(sender: Address, request: &L2TransactionRequestDirect) -> TransactionRequest {
    let gas = u64::try_from(request.l2GasLimit).unwrap_or(u64::MAX);
    TransactionRequest::new(sender, request.l2Contract)
        .value(request.l2Value)
        .input(request.l2Calldata.clone())
        .gas(gas)
}

impl<C: ChainClient> Daemon for L1ToL2Relayer<C> {
    const NAME: &'static str = "l1-to-l2-relayer";

    async fn tick(&mut self) -> Result<()> {
        for (key, request) in self.retries.drain() {
            self.deliver(key, request).await;
        }

        let head = self.l1.block_number().await?;
        if head <= self.last_processed_block {
            return Ok(());
        }

        let bridgehub = self.bridgehub;
        for number in self.last_processed_block + 1..=head {
            let block = self
                .l1
                .block_with_transactions(number)
                .await?
                .with_context(|| format!("L1 block {number} not found"))?;

            for tx in block.transactions.iter().filter(|tx| tx.to == Some(bridgehub)) {
                if let Some((key, request)) = self.decode(tx) {
                    self.deliver(key, request).await;
                }
            }
            self.last_processed_block = number;
        }
        Ok(())
    }
}
