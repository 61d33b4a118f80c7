//! Per-chain RPC handle.
//!
//! Every component that touches a chain goes through [`ChainClient`]. The production
//! implementation is [`RpcChainClient`]; tests use the in-memory `MockChain` from
//! `test_utils`.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};
use backon::{ConstantBuilder, Retryable};
use serde_json::{Value, json};
use url::Url;

use crate::{
    HarnessError, rpc,
    types::{RpcBlock, RpcReceipt, RpcTransaction, TransactionRequest, quantity},
};

/// Interval between receipt polls after a submission.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Receipt polls before a submission is declared lost (30 seconds).
const RECEIPT_POLL_ATTEMPTS: usize = 120;

/// The chain RPC surface consumed by the harness.
pub trait ChainClient: Clone + Send + Sync + 'static {
    /// The chain id this handle was created for.
    fn id(&self) -> u64;

    /// The chain id reported by the node. Used as the liveness query.
    fn chain_id(&self) -> impl Future<Output = Result<u64>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<U256>> + Send;

    /// Fetch a block with full transaction objects, `None` past the chain head.
    fn block_with_transactions(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<RpcBlock>>> + Send;

    fn transaction(&self, hash: B256) -> impl Future<Output = Result<Option<RpcTransaction>>> + Send;

    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<RpcReceipt>>> + Send;

    /// Submit a transaction from an account the node can sign for.
    fn send_transaction(&self, request: TransactionRequest)
    -> impl Future<Output = Result<B256>> + Send;

    /// Execute a read-only call against the latest block.
    fn call(&self, request: TransactionRequest) -> impl Future<Output = Result<Bytes>> + Send;

    fn code(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send;

    fn impersonate(&self, address: Address) -> impl Future<Output = Result<()>> + Send;

    fn stop_impersonating(&self, address: Address) -> impl Future<Output = Result<()>> + Send;

    fn set_balance(&self, address: Address, balance: U256) -> impl Future<Output = Result<()>> + Send;

    fn set_code(&self, address: Address, code: Bytes) -> impl Future<Output = Result<()>> + Send;

    fn set_storage_at(
        &self,
        address: Address,
        slot: B256,
        value: B256,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Call a contract function and decode its return values.
    fn call_function<T>(&self, to: Address, call: T) -> impl Future<Output = Result<T::Return>> + Send
    where
        T: SolCall + Send,
        T::Return: Send,
    {
        async move {
            let request = TransactionRequest {
                to: Some(to),
                input: Some(call.abi_encode().into()),
                ..Default::default()
            };
            let output = self
                .call(request)
                .await
                .with_context(|| format!("{} on {to}", T::SIGNATURE))?;
            T::abi_decode_returns(&output, true)
                .map_err(|e| anyhow::anyhow!("Failed to decode {} output: {e}", T::SIGNATURE))
        }
    }

    /// Submit a transaction and wait for a successful receipt.
    ///
    /// Failing to send, never seeing a receipt, and a reverted receipt all surface as
    /// [`HarnessError::SubmissionFailure`].
    fn send_and_confirm(
        &self,
        request: TransactionRequest,
    ) -> impl Future<Output = Result<RpcReceipt>> + Send {
        async move {
            let chain_id = self.id();
            let submission_failure = |reason: String| HarnessError::SubmissionFailure { chain_id, reason };

            let hash = self
                .send_transaction(request)
                .await
                .map_err(|e| submission_failure(format!("{e:#}")))?;

            let receipt = (|| async {
                self.transaction_receipt(hash)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("receipt for {hash} not available yet"))
            })
            .retry(
                ConstantBuilder::default()
                    .with_delay(RECEIPT_POLL_INTERVAL)
                    .with_max_times(RECEIPT_POLL_ATTEMPTS),
            )
            .await
            .map_err(|e| submission_failure(format!("{e:#}")))?;

            if !receipt.succeeded() {
                return Err(submission_failure(format!("transaction {hash} reverted")).into());
            }

            tracing::debug!(chain_id, tx_hash = %hash, block = receipt.block_number, "Transaction confirmed");
            Ok(receipt)
        }
    }
}

/// JSON-RPC over HTTP client for a single chain.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    chain_id: u64,
    url: Url,
    client: reqwest::Client,
}

impl RpcChainClient {
    pub fn new(chain_id: u64, url: Url, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            chain_id,
            url,
            client: rpc::create_client(request_timeout)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T> {
        rpc::json_rpc_call(&self.client, self.url.as_str(), method, params)
            .await
            .with_context(|| format!("{} on chain {}", method, self.chain_id))
    }

    async fn quantity(&self, method: &str) -> Result<u64> {
        let raw: String = self.request(method, vec![]).await?;
        quantity::parse(&raw).map_err(anyhow::Error::msg)
    }
}

impl ChainClient for RpcChainClient {
    fn id(&self) -> u64 {
        self.chain_id
    }

    async fn chain_id(&self) -> Result<u64> {
        self.quantity("eth_chainId").await
    }

    async fn block_number(&self) -> Result<u64> {
        self.quantity("eth_blockNumber").await
    }

    async fn gas_price(&self) -> Result<U256> {
        self.request("eth_gasPrice", vec![]).await
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RpcBlock>> {
        self.request(
            "eth_getBlockByNumber",
            vec![json!(format!("{number:#x}")), json!(true)],
        )
        .await
    }

    async fn transaction(&self, hash: B256) -> Result<Option<RpcTransaction>> {
        self.request("eth_getTransactionByHash", vec![json!(hash)])
            .await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>> {
        self.request("eth_getTransactionReceipt", vec![json!(hash)])
            .await
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256> {
        self.request("eth_sendTransaction", vec![json!(request)])
            .await
    }

    async fn call(&self, request: TransactionRequest) -> Result<Bytes> {
        self.request("eth_call", vec![json!(request), json!("latest")])
            .await
    }

    async fn code(&self, address: Address) -> Result<Bytes> {
        self.request("eth_getCode", vec![json!(address), json!("latest")])
            .await
    }

    async fn impersonate(&self, address: Address) -> Result<()> {
        self.request("anvil_impersonateAccount", vec![json!(address)])
            .await
    }

    async fn stop_impersonating(&self, address: Address) -> Result<()> {
        self.request("anvil_stopImpersonatingAccount", vec![json!(address)])
            .await
    }

    async fn set_balance(&self, address: Address, balance: U256) -> Result<()> {
        self.request("anvil_setBalance", vec![json!(address), json!(balance)])
            .await
    }

    async fn set_code(&self, address: Address, code: Bytes) -> Result<()> {
        self.request("anvil_setCode", vec![json!(address), json!(code)])
            .await
    }

    async fn set_storage_at(&self, address: Address, slot: B256, value: B256) -> Result<()> {
        self.request(
            "anvil_setStorageAt",
            vec![json!(address), json!(slot), json!(value)],
        )
        .await
    }
}
