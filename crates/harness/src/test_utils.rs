//! In-memory chain used by unit and integration tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use alloy_core::primitives::{Address, B256, Bytes, U256, keccak256};
use anyhow::Result;
use url::Url;

use crate::{
    HarnessError,
    client::ChainClient,
    forge::{ScriptInvocation, ScriptOutput, ScriptRunner},
    pipeline::ChainConnector,
    state::Chain,
    types::{RpcBlock, RpcReceipt, RpcTransaction, TransactionRequest},
};

static TX_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_hash(chain_id: u64) -> B256 {
    let n = TX_COUNTER.fetch_add(1, Ordering::SeqCst);
    keccak256([chain_id.to_be_bytes(), n.to_be_bytes()].concat())
}

/// Build a transaction to `to` with the given input, ready to be mined with
/// [`MockChain::push_block`].
pub fn mock_tx(from: Address, to: Address, input: impl Into<Bytes>) -> RpcTransaction {
    RpcTransaction {
        hash: next_hash(0),
        from,
        to: Some(to),
        value: U256::ZERO,
        input: input.into(),
        gas: 100_000,
        gas_price: None,
        max_fee_per_gas: Some(U256::from(1_000_000_000u64)),
        max_priority_fee_per_gas: Some(U256::from(1u64)),
        nonce: 0,
        block_number: None,
    }
}

#[derive(Debug, Default)]
struct MockState {
    blocks: Vec<RpcBlock>,
    receipts: HashMap<B256, RpcReceipt>,
    sent: Vec<TransactionRequest>,
    code: HashMap<Address, Bytes>,
    balances: HashMap<Address, U256>,
    storage: HashMap<(Address, B256), B256>,
    impersonated: HashSet<Address>,
    call_responses: HashMap<(Address, [u8; 4]), Bytes>,
    reverting: HashSet<Address>,
    failing_sends: usize,
    offline: bool,
}

/// A chain that auto-mines every submitted transaction into its own block, like anvil does
/// with `--auto-impersonate` and no block time.
#[derive(Debug, Clone)]
pub struct MockChain {
    chain_id: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        let chain = Self {
            chain_id,
            state: Arc::default(),
        };
        chain.push_block(vec![]);
        chain
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Mine a block containing `transactions` and return its number.
    pub fn push_block(&self, transactions: Vec<RpcTransaction>) -> u64 {
        self.with_state(|state| Self::mine(self.chain_id, state, transactions, 1))
    }

    fn mine(
        chain_id: u64,
        state: &mut MockState,
        mut transactions: Vec<RpcTransaction>,
        status: u64,
    ) -> u64 {
        let number = state.blocks.len() as u64;
        for tx in &mut transactions {
            tx.block_number = Some(number);
            state.receipts.insert(
                tx.hash,
                RpcReceipt {
                    transaction_hash: tx.hash,
                    block_number: number,
                    status,
                    contract_address: None,
                },
            );
        }
        state.blocks.push(RpcBlock {
            number,
            hash: keccak256([chain_id.to_be_bytes(), number.to_be_bytes()].concat()),
            timestamp: 1_700_000_000 + number,
            transactions,
        });
        number
    }

    /// Every transaction submitted through [`ChainClient::send_transaction`], in order.
    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.with_state(|state| state.sent.clone())
    }

    /// Submitted transactions addressed to `to`.
    pub fn sent_to(&self, to: Address) -> Vec<TransactionRequest> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.to == Some(to))
            .collect()
    }

    /// Make the next `count` submissions fail before reaching the chain.
    pub fn fail_next_sends(&self, count: usize) {
        self.with_state(|state| state.failing_sends = count);
    }

    /// Transactions sent to `address` are mined with a failed status.
    pub fn revert_calls_to(&self, address: Address) {
        self.with_state(|state| {
            state.reverting.insert(address);
        });
    }

    /// Answer `eth_call` to `to` with `selector` using `output`.
    pub fn set_call_response(&self, to: Address, selector: [u8; 4], output: impl Into<Bytes>) {
        self.with_state(|state| {
            state.call_responses.insert((to, selector), output.into());
        });
    }

    /// Make liveness queries fail.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|state| state.offline = offline);
    }

    pub fn code_at(&self, address: Address) -> Option<Bytes> {
        self.with_state(|state| state.code.get(&address).cloned())
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.with_state(|state| state.balances.get(&address).copied().unwrap_or_default())
    }

    pub fn storage_at(&self, address: Address, slot: B256) -> Option<B256> {
        self.with_state(|state| state.storage.get(&(address, slot)).copied())
    }

    pub fn is_impersonated(&self, address: Address) -> bool {
        self.with_state(|state| state.impersonated.contains(&address))
    }
}

impl ChainClient for MockChain {
    fn id(&self) -> u64 {
        self.chain_id
    }

    async fn chain_id(&self) -> Result<u64> {
        if self.with_state(|state| state.offline) {
            anyhow::bail!("connection refused");
        }
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.with_state(|state| state.blocks.len() as u64 - 1))
    }

    async fn gas_price(&self) -> Result<U256> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RpcBlock>> {
        Ok(self.with_state(|state| state.blocks.get(number as usize).cloned()))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<RpcTransaction>> {
        Ok(self.with_state(|state| {
            state
                .blocks
                .iter()
                .flat_map(|block| block.transactions.iter())
                .find(|tx| tx.hash == hash)
                .cloned()
        }))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>> {
        Ok(self.with_state(|state| state.receipts.get(&hash).cloned()))
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<B256> {
        let chain_id = self.chain_id;
        self.with_state(|state| {
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                anyhow::bail!("injected send failure");
            }

            let hash = next_hash(chain_id);
            let status = match request.to {
                Some(to) if state.reverting.contains(&to) => 0,
                _ => 1,
            };
            let tx = RpcTransaction {
                hash,
                from: request.from.unwrap_or_default(),
                to: request.to,
                value: request.value.unwrap_or_default(),
                input: request.input.clone().unwrap_or_default(),
                gas: request.gas.unwrap_or(30_000_000),
                gas_price: None,
                max_fee_per_gas: Some(U256::from(1_000_000_000u64)),
                max_priority_fee_per_gas: Some(U256::from(1u64)),
                nonce: state.sent.len() as u64,
                block_number: None,
            };
            state.sent.push(request);
            Self::mine(chain_id, state, vec![tx], status);
            Ok(hash)
        })
    }

    async fn call(&self, request: TransactionRequest) -> Result<Bytes> {
        let to = request.to.unwrap_or_default();
        let input = request.input.unwrap_or_default();
        let selector: [u8; 4] = input
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .unwrap_or_default();
        self.with_state(|state| state.call_responses.get(&(to, selector)).cloned())
            .ok_or_else(|| anyhow::anyhow!("execution reverted"))
    }

    async fn code(&self, address: Address) -> Result<Bytes> {
        Ok(self.code_at(address).unwrap_or_default())
    }

    async fn impersonate(&self, address: Address) -> Result<()> {
        self.with_state(|state| state.impersonated.insert(address));
        Ok(())
    }

    async fn stop_impersonating(&self, address: Address) -> Result<()> {
        self.with_state(|state| state.impersonated.remove(&address));
        Ok(())
    }

    async fn set_balance(&self, address: Address, balance: U256) -> Result<()> {
        self.with_state(|state| state.balances.insert(address, balance));
        Ok(())
    }

    async fn set_code(&self, address: Address, code: Bytes) -> Result<()> {
        self.with_state(|state| state.code.insert(address, code));
        Ok(())
    }

    async fn set_storage_at(&self, address: Address, slot: B256, value: B256) -> Result<()> {
        self.with_state(|state| state.storage.insert((address, slot), value));
        Ok(())
    }
}

/// Hands out [`MockChain`]s by chain id.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    chains: Arc<Mutex<HashMap<u64, MockChain>>>,
}

impl MockConnector {
    pub fn new(chain_ids: impl IntoIterator<Item = u64>) -> Self {
        let connector = Self::default();
        for chain_id in chain_ids {
            connector.insert(MockChain::new(chain_id));
        }
        connector
    }

    pub fn insert(&self, chain: MockChain) {
        self.chains.lock().unwrap().insert(chain.chain_id, chain);
    }

    /// The chain behind `chain_id`. Panics if it was never inserted.
    pub fn chain(&self, chain_id: u64) -> MockChain {
        self.chains.lock().unwrap()[&chain_id].clone()
    }
}

impl ChainConnector for MockConnector {
    type Client = MockChain;

    fn connect(&self, chain: &Chain) -> Result<MockChain> {
        self.chains
            .lock()
            .unwrap()
            .get(&chain.chain_id)
            .cloned()
            .ok_or_else(|| HarnessError::ChainNotFound(chain.chain_id).into())
    }
}

type ScriptHandler = dyn Fn(&ScriptInvocation) -> Result<ScriptOutput> + Send + Sync;

/// Answers script invocations with a handler and records them.
#[derive(Clone)]
pub struct MockScriptRunner {
    handler: Arc<ScriptHandler>,
    invocations: Arc<Mutex<Vec<(Url, ScriptInvocation)>>>,
}

impl std::fmt::Debug for MockScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockScriptRunner")
            .field("invocations", &self.invocations)
            .finish_non_exhaustive()
    }
}

impl MockScriptRunner {
    pub fn new(
        handler: impl Fn(&ScriptInvocation) -> Result<ScriptOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            invocations: Arc::default(),
        }
    }

    /// Every invocation, with the RPC endpoint it targeted.
    pub fn invocations(&self) -> Vec<(Url, ScriptInvocation)> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of runs of `script`.
    pub fn runs_of(&self, script: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, invocation)| invocation.script == script)
            .count()
    }
}

impl ScriptRunner for MockScriptRunner {
    async fn run(&self, rpc_url: &Url, invocation: &ScriptInvocation) -> Result<ScriptOutput> {
        self.invocations
            .lock()
            .unwrap()
            .push((rpc_url.clone(), invocation.clone()));
        (self.handler)(invocation)
    }
}
