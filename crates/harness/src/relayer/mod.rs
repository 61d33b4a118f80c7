//! Message relayers.
//!
//! [`L1ToL2Relayer`] replays direct requests made on the settlement layer onto the target
//! rollup. [`L2ToL2Relayer`] turns marker transactions on a rollup into direct requests on the
//! settlement layer, leaving the second leg to the L1 → L2 relayer.

mod l1_to_l2;
mod l2_to_l2;

use std::collections::HashSet;

use alloy_core::primitives::{Address, B256, U256};
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};

pub use l1_to_l2::L1ToL2Relayer;
pub use l2_to_l2::{L2ToL2Relayer, send_marker_message};

use crate::{
    client::ChainClient,
    contracts::{L2TransactionRequestDirect, l2TransactionBaseCostCall, requestL2TransactionDirectCall},
    types::{RpcReceipt, TransactionRequest},
};

/// Identifies a relayed source transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub chain_id: u64,
    pub tx_hash: B256,
}

impl RelayKey {
    pub const fn new(chain_id: u64, tx_hash: B256) -> Self {
        Self { chain_id, tx_hash }
    }
}

/// Source transactions already relayed. Lives as long as the relayer.
#[derive(Debug, Clone, Default)]
pub struct DedupSet(HashSet<RelayKey>);

impl DedupSet {
    pub fn contains(&self, key: &RelayKey) -> bool {
        self.0.contains(key)
    }

    pub fn mark(&mut self, key: RelayKey) {
        self.0.insert(key);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decoded requests whose submission failed, retried before new blocks are scanned.
#[derive(Debug, Clone)]
pub struct RetryQueue<T>(Vec<(RelayKey, T)>);

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> RetryQueue<T> {
    /// Queue `item` unless a request with the same key is already waiting.
    pub fn push(&mut self, key: RelayKey, item: T) {
        if !self.contains(&key) {
            self.0.push((key, item));
        }
    }

    pub fn contains(&self, key: &RelayKey) -> bool {
        self.0.iter().any(|(queued, _)| queued == key)
    }

    /// Remove and return every queued request, oldest first.
    pub fn drain(&mut self) -> Vec<(RelayKey, T)> {
        std::mem::take(&mut self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Submit `requestL2TransactionDirect` to the bridgehub, minting the request's base cost plus
/// its L2 value. Falls back to minting only the L2 value when the base cost query fails.
pub async fn submit_direct_request<C: ChainClient>(
    l1: &C,
    bridgehub: Address,
    sender: Address,
    mut request: L2TransactionRequestDirect,
) -> Result<RpcReceipt> {
    let target = request.chainId;
    let base_cost = match base_cost(l1, bridgehub, &request).await {
        Ok(cost) => cost,
        Err(e) => {
            tracing::warn!(chain_id = %target, error = %format!("{e:#}"), "Base cost query failed, minting the L2 value only");
            U256::ZERO
        }
    };
    request.mintValue = base_cost.saturating_add(request.l2Value);

    let mint_value = request.mintValue;
    let calldata = requestL2TransactionDirectCall { request }.abi_encode();
    let tx = TransactionRequest::new(sender, bridgehub)
        .value(mint_value)
        .input(calldata);

    let receipt = l1
        .send_and_confirm(tx)
        .await
        .with_context(|| format!("Direct request to chain {target}"))?;
    tracing::debug!(chain_id = %target, mint_value = %mint_value, tx_hash = %receipt.transaction_hash, "Direct request submitted");
    Ok(receipt)
}

async fn base_cost<C: ChainClient>(
    l1: &C,
    bridgehub: Address,
    request: &L2TransactionRequestDirect,
) -> Result<U256> {
    let gas_price = l1.gas_price().await?;
    let cost = l1
        .call_function(
            bridgehub,
            l2TransactionBaseCostCall {
                chainId: request.chainId,
                gasPrice: gas_price,
                l2GasLimit: request.l2GasLimit,
                l2GasPerPubdataByteLimit: request.l2GasPerPubdataByteLimit,
            },
        )
        .await?;
    Ok(cost._0)
}
