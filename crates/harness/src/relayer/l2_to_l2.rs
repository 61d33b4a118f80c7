use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::{Address, Bytes, U256};
use alloy_sol_types::SolType;
use anyhow::{Context, Result};
use futures::future::join_all;

use super::{DedupSet, RelayKey, RetryQueue, submit_direct_request};
use crate::{
    HarnessError,
    client::ChainClient,
    config::RelayerConfig,
    contracts::{CROSS_CHAIN_MESSENGER, CrossChainMessage, L2TransactionRequestDirect},
    daemon::Daemon,
    types::{RpcReceipt, RpcTransaction, TransactionRequest},
};

/// Send a cross-chain message from `source` by calling the marker address.
pub async fn send_marker_message<C: ChainClient>(
    source: &C,
    sender: Address,
    target_chain_id: u64,
    target: Address,
    calldata: Bytes,
) -> Result<RpcReceipt> {
    let message = CrossChainMessage {
        targetChainId: U256::from(target_chain_id),
        targetAddress: target,
        targetCalldata: calldata,
    };
    let request = TransactionRequest::new(sender, CROSS_CHAIN_MESSENGER)
        .input(CrossChainMessage::abi_encode_params(&message));

    let receipt = source.send_and_confirm(request).await?;
    tracing::info!(
        chain_id = source.id(),
        target_chain_id,
        target = %target,
        tx_hash = %receipt.transaction_hash,
        "Marker message sent"
    );
    Ok(receipt)
}

/// Where relayed messages are forwarded.
#[derive(Debug)]
struct Route<C> {
    l1: C,
    bridgehub: Address,
    operator: Address,
    targets: BTreeSet<u64>,
    block_range: u64,
    l2_gas_limit: u64,
    gas_per_pubdata: u64,
}

#[derive(Debug)]
struct SourceChain<C> {
    client: C,
    last_processed_block: u64,
    processed: DedupSet,
    retries: RetryQueue<L2TransactionRequestDirect>,
}

impl<C: ChainClient> SourceChain<C> {
    async fn scan(&mut self, route: &Route<C>) -> Result<()> {
        for (key, request) in self.retries.drain() {
            self.forward(key, request, route).await;
        }

        let head = self.client.block_number().await?;
        while self.last_processed_block < head {
            let from = self.last_processed_block + 1;
            let to = head.min(from + route.block_range - 1);

            for number in from..=to {
                let block = self
                    .client
                    .block_with_transactions(number)
                    .await?
                    .with_context(|| format!("block {number} of chain {} not found", self.client.id()))?;

                for tx in block
                    .transactions
                    .iter()
                    .filter(|tx| tx.to == Some(CROSS_CHAIN_MESSENGER))
                {
                    if let Some((key, request)) = self.decode(tx, route) {
                        self.forward(key, request, route).await;
                    }
                }
            }
            self.last_processed_block = to;
        }
        Ok(())
    }

    /// Decode a marker transaction into the direct request forwarding it. Returns `None` for
    /// transactions that are skipped for good.
    fn decode(&self, tx: &RpcTransaction, route: &Route<C>) -> Option<(RelayKey, L2TransactionRequestDirect)> {
        let source = self.client.id();
        let key = RelayKey::new(source, tx.hash);
        if self.processed.contains(&key) || self.retries.contains(&key) {
            return None;
        }

        let message = match CrossChainMessage::abi_decode_params(&tx.input, true) {
            Ok(message) => message,
            Err(e) => {
                let e = HarnessError::DecodeFailure {
                    tx_hash: tx.hash,
                    reason: e.to_string(),
                };
                tracing::warn!(chain_id = source, error = %e, "Skipping marker transaction");
                return None;
            }
        };

        let known = u64::try_from(message.targetChainId).is_ok_and(|id| route.targets.contains(&id));
        if !known {
            let e = HarnessError::ChainNotFound(message.targetChainId.saturating_to());
            tracing::warn!(chain_id = source, tx_hash = %tx.hash, target_chain_id = %message.targetChainId, error = %e, "Dropping marker message");
            return None;
        }

        Some((
            key,
            L2TransactionRequestDirect {
                chainId: message.targetChainId,
                mintValue: U256::ZERO,
                l2Contract: message.targetAddress,
                l2Value: U256::ZERO,
                l2Calldata: message.targetCalldata,
                l2GasLimit: U256::from(route.l2_gas_limit),
                l2GasPerPubdataByteLimit: U256::from(route.gas_per_pubdata),
                factoryDeps: vec![],
                refundRecipient: route.operator,
            },
        ))
    }

    /// Submit `request` to the bridgehub. A failed submission is queued for the next tick.
    async fn forward(&mut self, key: RelayKey, request: L2TransactionRequestDirect, route: &Route<C>) {
        let target: u64 = request.chainId.saturating_to();
        let result = submit_direct_request(&route.l1, route.bridgehub, route.operator, request.clone())
            .await
            .with_context(|| format!("Forwarding {} from chain {} to chain {target}", key.tx_hash, key.chain_id));

        match result {
            Ok(receipt) => {
                self.processed.mark(key);
                tracing::info!(
                    chain_id = key.chain_id,
                    target_chain_id = target,
                    source_tx = %key.tx_hash,
                    l1_tx = %receipt.transaction_hash,
                    "Forwarded L2 → L2 message to L1"
                );
            }
            Err(e) => {
                tracing::warn!(chain_id = key.chain_id, tx_hash = %key.tx_hash, error = %format!("{e:#}"), "L2 → L2 relay failed, will retry");
                self.retries.push(key, request);
            }
        }
    }
}

/// Forwards marker messages sent on rollups to the L1 bridgehub as direct requests.
#[derive(Debug)]
pub struct L2ToL2Relayer<C> {
    route: Route<C>,
    sources: BTreeMap<u64, SourceChain<C>>,
}

impl<C: ChainClient> L2ToL2Relayer<C> {
    pub fn new(l1: C, bridgehub: Address, operator: Address, config: &RelayerConfig) -> Self {
        Self {
            route: Route {
                l1,
                bridgehub,
                operator,
                targets: BTreeSet::new(),
                block_range: config.block_range.max(1),
                l2_gas_limit: config.l2_gas_limit,
                gas_per_pubdata: config.gas_per_pubdata,
            },
            sources: BTreeMap::new(),
        }
    }

    /// Watch `client`'s chain after `last_processed_block` and accept it as a message target.
    pub fn with_chain(mut self, client: C, last_processed_block: u64) -> Self {
        let chain_id = client.id();
        self.route.targets.insert(chain_id);
        self.sources.insert(
            chain_id,
            SourceChain {
                client,
                last_processed_block,
                processed: DedupSet::default(),
                retries: RetryQueue::default(),
            },
        );
        self
    }

    pub fn last_processed_block(&self, chain_id: u64) -> Option<u64> {
        self.sources.get(&chain_id).map(|s| s.last_processed_block)
    }

    pub fn processed(&self, chain_id: u64) -> Option<&DedupSet> {
        self.sources.get(&chain_id).map(|s| &s.processed)
    }

    /// Number of messages from `chain_id` waiting for another forwarding attempt.
    pub fn pending_retries(&self, chain_id: u64) -> Option<usize> {
        self.sources.get(&chain_id).map(|s| s.retries.len())
    }
}

impl<C: ChainClient> Daemon for L2ToL2Relayer<C> {
    const NAME: &'static str = "l2-to-l2-relayer";

    async fn tick(&mut self) -> Result<()> {
        let Self { route, sources } = self;
        let route = &*route;

        let results = join_all(sources.values_mut().map(|source| source.scan(route))).await;

        let failures: Vec<String> = sources
            .keys()
            .zip(results)
            .filter_map(|(chain_id, result)| result.err().map(|e| format!("chain {chain_id}: {e:#}")))
            .collect();
        if !failures.is_empty() {
            anyhow::bail!("{} chain(s) failed to scan: {}", failures.len(), failures.join("; "));
        }
        Ok(())
    }
}
