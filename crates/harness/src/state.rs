//! Durable record of pipeline progress.
//!
//! Every part of [`DeploymentState`] lives in its own JSON file under the state directory and is
//! written by exactly one pipeline stage. Parts are append-only: saving a value that conflicts
//! with a recorded one is rejected, saving the same value again is a no-op.

use std::{
    collections::BTreeMap,
    fmt::Display,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};
use derive_more::Deref;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use crate::{HarnessError, config::ChainRole, fs::FsHandler, pipeline::StageId};

pub const CHAINS_FILE: &str = "chains.json";
pub const SETTLEMENT_FILE: &str = "l1-deployment.json";
pub const CHAIN_ADDRESSES_FILE: &str = "chain-addresses.json";
pub const L2_INIT_FILE: &str = "l2-init.json";
pub const GATEWAY_FILE: &str = "gateway.json";
pub const DEPLOYMENT_INFO_FILE: &str = "deployment-info.json";

/// Names of the settlement contracts recorded by the L1 deployment.
pub mod contract {
    pub const BRIDGEHUB: &str = "bridgehub";
    pub const CHAIN_TYPE_MANAGER: &str = "chainTypeManager";
    pub const VALIDATOR_TIMELOCK: &str = "validatorTimelock";
    pub const SHARED_BRIDGE: &str = "sharedBridge";
    pub const L1_NULLIFIER: &str = "l1Nullifier";
    pub const NATIVE_TOKEN_VAULT: &str = "nativeTokenVault";
    pub const ERC20_BRIDGE: &str = "erc20Bridge";
    pub const GOVERNANCE: &str = "governance";
    pub const PROXY_ADMIN: &str = "transparentProxyAdmin";
    pub const BLOB_HASH_RETRIEVER: &str = "blobVersionedHashRetriever";
    pub const CHAIN_ADMIN: &str = "chainAdmin";
    pub const ADMIN_FACET: &str = "adminFacet";
    pub const GETTERS_FACET: &str = "gettersFacet";
    pub const MAILBOX_FACET: &str = "mailboxFacet";
    pub const EXECUTOR_FACET: &str = "executorFacet";
    pub const VERIFIER: &str = "verifier";
}

/// A running chain node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub chain_id: u64,
    pub rpc_url: Url,
    pub port: u16,
    pub role: ChainRole,
    #[serde(default)]
    pub is_gateway: bool,
}

impl Chain {
    pub fn is_settlement(&self) -> bool {
        self.role == ChainRole::Settlement
    }
}

/// The chains started by the pipeline, ordered by chain id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref)]
#[serde(transparent)]
pub struct ChainTopology(Vec<Chain>);

impl ChainTopology {
    pub fn new(mut chains: Vec<Chain>) -> Self {
        chains.sort_by_key(|c| c.chain_id);
        Self(chains)
    }

    pub fn get(&self, chain_id: u64) -> Option<&Chain> {
        self.0.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn settlement(&self) -> Result<&Chain> {
        self.0
            .iter()
            .find(|c| c.is_settlement())
            .context("No settlement chain recorded")
    }

    pub fn rollups(&self) -> impl Iterator<Item = &Chain> {
        self.0.iter().filter(|c| !c.is_settlement())
    }

    pub fn gateway(&self) -> Option<&Chain> {
        self.0.iter().find(|c| c.is_gateway)
    }
}

/// Settlement contract addresses by name, see [`contract`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref)]
#[serde(transparent)]
pub struct SettlementAddresses(BTreeMap<String, Address>);

impl SettlementAddresses {
    pub fn insert(&mut self, name: impl Into<String>, address: Address) {
        self.0.insert(name.into(), address);
    }

    /// Look up a contract, failing with the stage that records it.
    pub fn require(&self, name: &'static str) -> Result<Address> {
        self.0.get(name).copied().ok_or_else(|| {
            HarnessError::MissingPrerequisite {
                stage: StageId::DeployL1,
                missing: name,
            }
            .into()
        })
    }
}

impl FromIterator<(String, Address)> for SettlementAddresses {
    fn from_iter<T: IntoIterator<Item = (String, Address)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Contracts of a registered rollup chain.
///
/// Only the diamond proxy is recorded at registration. The system contract addresses are
/// filled in from the initialization records by [`DeploymentState::per_chain_contracts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAddresses {
    pub chain_id: u64,
    pub diamond_proxy: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_bridgehub: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_asset_router: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_native_token_vault: Option<Address>,
}

impl ChainAddresses {
    pub const fn new(chain_id: u64, diamond_proxy: Address) -> Self {
        Self {
            chain_id,
            diamond_proxy,
            l2_bridgehub: None,
            l2_asset_router: None,
            l2_native_token_vault: None,
        }
    }
}

/// Outcome of the system contract initialization of a rollup chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2InitRecord {
    pub chain_id: u64,
    pub l2_bridgehub: Address,
    pub l2_asset_router: Address,
    pub l2_native_token_vault: Address,
    /// The `requestL2TransactionDirect` transaction on the settlement chain.
    pub request_tx_hash: B256,
    pub l1_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub chain_id: u64,
    pub gateway_ctm: Address,
}

/// The union of everything the pipeline persisted. Absent parts have not been produced yet.
///
/// Also used as the argument of [`StateStore::save`], where only the parts that are set are
/// merged into the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentState {
    pub chains: Option<ChainTopology>,
    pub settlement: Option<SettlementAddresses>,
    pub chain_addresses: Option<Vec<ChainAddresses>>,
    pub l2_init: Option<Vec<L2InitRecord>>,
    pub gateway: Option<GatewayRecord>,
}

impl DeploymentState {
    pub fn require_chains(&self) -> Result<&ChainTopology> {
        self.chains.as_ref().ok_or_else(|| {
            HarnessError::MissingPrerequisite {
                stage: StageId::StartChains,
                missing: "chain topology",
            }
            .into()
        })
    }

    pub fn require_settlement(&self) -> Result<&SettlementAddresses> {
        self.settlement.as_ref().ok_or_else(|| {
            HarnessError::MissingPrerequisite {
                stage: StageId::DeployL1,
                missing: "settlement addresses",
            }
            .into()
        })
    }

    pub fn require_chain_addresses(&self) -> Result<&[ChainAddresses]> {
        self.chain_addresses
            .as_deref()
            .filter(|addresses| !addresses.is_empty())
            .ok_or_else(|| {
                HarnessError::MissingPrerequisite {
                    stage: StageId::RegisterChains,
                    missing: "chain addresses",
                }
                .into()
            })
    }

    pub fn chain_address(&self, chain_id: u64) -> Option<&ChainAddresses> {
        self.chain_addresses
            .iter()
            .flatten()
            .find(|a| a.chain_id == chain_id)
    }

    pub fn l2_init_record(&self, chain_id: u64) -> Option<&L2InitRecord> {
        self.l2_init.iter().flatten().find(|r| r.chain_id == chain_id)
    }

    /// Registered chains with their system contract addresses once initialized.
    pub fn per_chain_contracts(&self) -> BTreeMap<u64, ChainAddresses> {
        self.chain_addresses
            .iter()
            .flatten()
            .map(|addresses| {
                let mut addresses = addresses.clone();
                if let Some(init) = self.l2_init_record(addresses.chain_id) {
                    addresses.l2_bridgehub = Some(init.l2_bridgehub);
                    addresses.l2_asset_router = Some(init.l2_asset_router);
                    addresses.l2_native_token_vault = Some(init.l2_native_token_vault);
                }
                (addresses.chain_id, addresses)
            })
            .collect()
    }
}

/// Records merged by key into a list part.
trait Keyed {
    type Key: PartialEq + Ord + Display;

    fn key(&self) -> Self::Key;
}

impl Keyed for Chain {
    type Key = u64;

    fn key(&self) -> u64 {
        self.chain_id
    }
}

impl Keyed for ChainAddresses {
    type Key = u64;

    fn key(&self) -> u64 {
        self.chain_id
    }
}

impl Keyed for L2InitRecord {
    type Key = u64;

    fn key(&self) -> u64 {
        self.chain_id
    }
}

/// Append the records of `incoming` missing from `existing`. Returns whether anything changed.
fn merge_keyed<T: Keyed + PartialEq>(what: &str, existing: &mut Vec<T>, incoming: Vec<T>) -> Result<bool> {
    let mut changed = false;
    for record in incoming {
        match existing.iter().find(|r| r.key() == record.key()) {
            Some(recorded) if *recorded == record => {}
            Some(_) => anyhow::bail!("{what} for chain {} already recorded", record.key()),
            None => {
                existing.push(record);
                changed = true;
            }
        }
    }
    existing.sort_by_key(|r| r.key());
    Ok(changed)
}

/// File-backed [`DeploymentState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        FsHandler::read_json(&self.dir.join(file))
    }

    /// Write a state file. The caller must hold the directory lock.
    fn write<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        FsHandler::replace_json(&self.dir.join(file), value)?;
        tracing::debug!(file, dir = %self.dir.display(), "State file written");
        Ok(())
    }

    /// Read every part of the state. Missing files are absent parts.
    pub fn load(&self) -> Result<DeploymentState> {
        Ok(DeploymentState {
            chains: self.read(CHAINS_FILE)?,
            settlement: self.read(SETTLEMENT_FILE)?,
            chain_addresses: self.read(CHAIN_ADDRESSES_FILE)?,
            l2_init: self.read(L2_INIT_FILE)?,
            gateway: self.read(GATEWAY_FILE)?,
        })
    }

    /// Merge the parts set in `partial` into the store.
    ///
    /// The whole read-merge-write runs under the directory lock, so concurrent savers never drop
    /// each other's records.
    pub fn save(&self, partial: DeploymentState) -> Result<()> {
        let _lock = FsHandler::lock_dir(&self.dir)?;
        let DeploymentState {
            chains,
            settlement,
            chain_addresses,
            l2_init,
            gateway,
        } = partial;

        if let Some(chains) = chains {
            let mut recorded: Vec<Chain> = self
                .read::<ChainTopology>(CHAINS_FILE)?
                .map(|t| t.0)
                .unwrap_or_default();
            if merge_keyed("chain endpoint", &mut recorded, chains.0)? {
                self.write(CHAINS_FILE, &ChainTopology::new(recorded))?;
            }
        }

        if let Some(settlement) = settlement {
            let mut recorded: SettlementAddresses = self.read(SETTLEMENT_FILE)?.unwrap_or_default();
            let mut changed = false;
            for (name, address) in settlement.0 {
                match recorded.get(&name) {
                    Some(existing) if *existing == address => {}
                    Some(existing) => anyhow::bail!(
                        "settlement addresses already recorded: {name} is {existing}, refusing {address}"
                    ),
                    None => {
                        recorded.insert(name, address);
                        changed = true;
                    }
                }
            }
            if changed {
                self.write(SETTLEMENT_FILE, &recorded)?;
            }
        }

        if let Some(addresses) = chain_addresses {
            let mut recorded: Vec<ChainAddresses> =
                self.read(CHAIN_ADDRESSES_FILE)?.unwrap_or_default();
            if merge_keyed("chain addresses", &mut recorded, addresses)? {
                self.write(CHAIN_ADDRESSES_FILE, &recorded)?;
            }
        }

        if let Some(records) = l2_init {
            let mut recorded: Vec<L2InitRecord> = self.read(L2_INIT_FILE)?.unwrap_or_default();
            if merge_keyed("L2 initialization", &mut recorded, records)? {
                self.write(L2_INIT_FILE, &recorded)?;
            }
        }

        if let Some(gateway) = gateway {
            match self.read::<GatewayRecord>(GATEWAY_FILE)? {
                Some(recorded) if recorded == gateway => {}
                Some(recorded) => {
                    anyhow::bail!("gateway already recorded for chain {}", recorded.chain_id)
                }
                None => self.write(GATEWAY_FILE, &gateway)?,
            }
        }

        Ok(())
    }

    /// Export a summary of the deployment for external tooling.
    pub fn write_deployment_info(&self, info: &DeploymentInfo) -> Result<PathBuf> {
        let path = self.dir.join(DEPLOYMENT_INFO_FILE);
        FsHandler::write_json(&path, info)?;
        Ok(path)
    }
}

/// Summary exported to `deployment-info.json` once the daemons start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub l1_chain_id: u64,
    pub l1_rpc_url: Url,
    pub bridgehub: Address,
    pub asset_router: Address,
    pub chain_type_manager: Address,
    pub l2_chains: Vec<L2ChainInfo>,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2ChainInfo {
    pub chain_id: u64,
    pub rpc_url: Url,
    pub diamond_proxy: Address,
}

impl DeploymentInfo {
    pub fn from_state(state: &DeploymentState) -> Result<Self> {
        let chains = state.require_chains()?;
        let settlement = state.require_settlement()?;
        let l1 = chains.settlement()?;

        let l2_chains = state
            .require_chain_addresses()?
            .iter()
            .filter_map(|addresses| {
                chains.get(addresses.chain_id).map(|chain| L2ChainInfo {
                    chain_id: chain.chain_id,
                    rpc_url: chain.rpc_url.clone(),
                    diamond_proxy: addresses.diamond_proxy,
                })
            })
            .collect();

        Ok(Self {
            l1_chain_id: l1.chain_id,
            l1_rpc_url: l1.rpc_url.clone(),
            bridgehub: settlement.require(contract::BRIDGEHUB)?,
            asset_router: settlement.require(contract::SHARED_BRIDGE)?,
            chain_type_manager: settlement.require(contract::CHAIN_TYPE_MANAGER)?,
            l2_chains,
            generated_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn chain(chain_id: u64, port: u16, role: ChainRole) -> Chain {
        Chain {
            chain_id,
            rpc_url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            port,
            role,
            is_gateway: false,
        }
    }

    fn topology() -> ChainTopology {
        ChainTopology::new(vec![
            chain(11, 8547, ChainRole::Rollup),
            chain(1, 8545, ChainRole::Settlement),
        ])
    }

    #[test]
    fn test_load_empty_directory() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let state = StateStore::new(dir.path()).load().unwrap();
        assert_eq!(state, DeploymentState::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new("relaynet-state").unwrap();
        std::fs::write(dir.path().join(CHAINS_FILE), "[{]").unwrap();
        assert!(StateStore::new(dir.path()).load().is_err());
    }

    #[test]
    fn test_save_merges_parts() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let store = StateStore::new(dir.path());

        store
            .save(DeploymentState {
                chains: Some(topology()),
                ..Default::default()
            })
            .unwrap();
        store
            .save(DeploymentState {
                chain_addresses: Some(vec![ChainAddresses::new(11, Address::repeat_byte(0x11))]),
                ..Default::default()
            })
            .unwrap();

        let state = store.load().unwrap();
        let chains = state.require_chains().unwrap();
        assert_eq!(chains.settlement().unwrap().chain_id, 1);
        assert_eq!(chains.rollups().count(), 1);
        assert_eq!(
            state.chain_address(11).map(|a| a.diamond_proxy),
            Some(Address::repeat_byte(0x11))
        );
        assert!(state.settlement.is_none());
    }

    #[test]
    fn test_identical_resave_is_noop() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let store = StateStore::new(dir.path());
        let gateway = GatewayRecord {
            chain_id: 10,
            gateway_ctm: Address::repeat_byte(0x0a),
        };

        for _ in 0..2 {
            store
                .save(DeploymentState {
                    gateway: Some(gateway.clone()),
                    ..Default::default()
                })
                .unwrap();
        }

        assert_eq!(store.load().unwrap().gateway, Some(gateway));
    }

    #[test]
    fn test_conflicting_settlement_address_is_rejected() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let store = StateStore::new(dir.path());
        let save = |byte| {
            store.save(DeploymentState {
                settlement: Some(SettlementAddresses::from_iter([(
                    contract::BRIDGEHUB.to_string(),
                    Address::repeat_byte(byte),
                )])),
                ..Default::default()
            })
        };

        save(1).unwrap();
        let err = save(2).unwrap_err();
        assert!(err.to_string().contains("settlement addresses already recorded"));
    }

    #[test]
    fn test_settlement_parts_accumulate() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let store = StateStore::new(dir.path());

        for (name, byte) in [(contract::BRIDGEHUB, 1), (contract::CHAIN_TYPE_MANAGER, 2)] {
            store
                .save(DeploymentState {
                    settlement: Some(SettlementAddresses::from_iter([(
                        name.to_string(),
                        Address::repeat_byte(byte),
                    )])),
                    ..Default::default()
                })
                .unwrap();
        }

        let settlement = store.load().unwrap().settlement.unwrap();
        assert_eq!(settlement.len(), 2);
        assert_eq!(
            settlement.require(contract::CHAIN_TYPE_MANAGER).unwrap(),
            Address::repeat_byte(2)
        );
    }

    #[test]
    fn test_missing_prerequisite_names_stage() {
        let err = DeploymentState::default().require_settlement().unwrap_err();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::MissingPrerequisite { stage, .. }) => {
                assert_eq!(*stage, StageId::DeployL1)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_per_chain_contracts_include_init_records() {
        let state = DeploymentState {
            chain_addresses: Some(vec![
                ChainAddresses::new(11, Address::repeat_byte(0x11)),
                ChainAddresses::new(12, Address::repeat_byte(0x12)),
            ]),
            l2_init: Some(vec![L2InitRecord {
                chain_id: 12,
                l2_bridgehub: Address::repeat_byte(0xb0),
                l2_asset_router: Address::repeat_byte(0xb1),
                l2_native_token_vault: Address::repeat_byte(0xb2),
                request_tx_hash: B256::repeat_byte(1),
                l1_block: 7,
            }]),
            ..Default::default()
        };

        let contracts = state.per_chain_contracts();
        assert_eq!(contracts[&11].l2_bridgehub, None);
        assert_eq!(contracts[&12].l2_bridgehub, Some(Address::repeat_byte(0xb0)));
    }

    #[test]
    fn test_concurrent_saves_keep_every_record() {
        let dir = TempDir::new("relaynet-state").unwrap();
        let store = StateStore::new(dir.path());

        let handles: Vec<_> = (0..16u64)
            .map(|chain_id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .save(DeploymentState {
                            chain_addresses: Some(vec![ChainAddresses::new(
                                chain_id,
                                Address::with_last_byte(chain_id as u8),
                            )]),
                            ..Default::default()
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let recorded = store.load().unwrap().chain_addresses.unwrap();
        assert_eq!(
            recorded.iter().map(|a| a.chain_id).collect::<Vec<_>>(),
            (0..16).collect::<Vec<_>>()
        );
    }
}
