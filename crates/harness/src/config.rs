use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// The default name for the relaynet configuration file.
pub const CONFIG_FILENAME: &str = "Relaynet.toml";

/// Prefix of the environment variables overriding configuration values.
///
/// Nested keys are separated by a double underscore, e.g. `RELAYNET_SETTLER__BATCH_SIZE_LIMIT=5`.
pub const ENV_PREFIX: &str = "RELAYNET_";

/// First prefunded anvil account, used as operator unless overridden.
pub const DEFAULT_OPERATOR_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Role of a chain in the simulated network.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ChainRole {
    /// The settlement layer (L1).
    Settlement,
    /// A rollup settling on the settlement layer (L2).
    Rollup,
}

/// A chain of the static topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub chain_id: u64,
    pub port: u16,
    pub role: ChainRole,
    #[serde(default)]
    pub is_gateway: bool,
}

impl ChainSpec {
    pub const fn settlement(chain_id: u64, port: u16) -> Self {
        Self {
            chain_id,
            port,
            role: ChainRole::Settlement,
            is_gateway: false,
        }
    }

    pub const fn rollup(chain_id: u64, port: u16) -> Self {
        Self {
            chain_id,
            port,
            role: ChainRole::Rollup,
            is_gateway: false,
        }
    }

    pub const fn gateway(mut self) -> Self {
        self.is_gateway = true;
        self
    }
}

/// Configuration of the local anvil nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnvilConfig {
    /// Path or name of the anvil binary.
    pub binary: PathBuf,
    pub host: String,
    /// Block time in seconds.
    pub block_time: u64,
    pub accounts: u32,
    /// Balance of each prefunded account, in ether.
    pub balance: u64,
    pub gas_limit: u64,
    /// Liveness queries before a node is declared dead.
    pub startup_attempts: usize,
    pub startup_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace_period_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl Default for AnvilConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("anvil"),
            host: "127.0.0.1".to_string(),
            block_time: 1,
            accounts: 10,
            balance: 10_000,
            gas_limit: 100_000_000,
            startup_attempts: 30,
            startup_interval_ms: 1_000,
            stop_grace_period_secs: 5,
            extra_args: Vec::new(),
        }
    }
}

/// Script targets of each deployment step, as `path:Contract`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeScripts {
    pub l1_core: String,
    pub ctm: String,
    pub register_ctm: String,
    pub register_chain: String,
    pub gateway_ctm: String,
}

impl Default for ForgeScripts {
    fn default() -> Self {
        Self {
            l1_core: "deploy-scripts/ecosystem/DeployL1CoreContracts.s.sol:DeployL1CoreContractsScript"
                .to_string(),
            ctm: "deploy-scripts/ctm/DeployCTM.s.sol:DeployCTMScript".to_string(),
            register_ctm: "deploy-scripts/ecosystem/RegisterCTM.s.sol:RegisterCTM".to_string(),
            register_chain: "deploy-scripts/ctm/RegisterZKChain.s.sol:RegisterZKChainScript"
                .to_string(),
            gateway_ctm: "deploy-scripts/ctm/DeployCTM.s.sol:DeployCTMScript".to_string(),
        }
    }
}

/// Configuration of the contract deployment tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Path or name of the forge binary.
    pub binary: PathBuf,
    /// Foundry project the scripts run from.
    pub contracts_root: PathBuf,
    /// Script input documents, relative to the contracts root.
    pub inputs_dir: String,
    /// Script output documents, relative to the contracts root.
    pub outputs_dir: String,
    /// Compiled artifacts used to bootstrap L2 system contracts. Bootstrapping is skipped when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
    /// Time to wait for a script output document after the script exits.
    pub output_timeout_secs: u64,
    pub scripts: ForgeScripts,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("forge"),
            contracts_root: PathBuf::from("contracts/l1-contracts"),
            inputs_dir: "script-config".to_string(),
            outputs_dir: "script-out".to_string(),
            artifacts_dir: None,
            output_timeout_secs: 30,
            scripts: ForgeScripts::default(),
        }
    }
}

/// Batch settlement daemon options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlerConfig {
    pub polling_interval_ms: u64,
    /// Minimum pending transactions that trigger a commit.
    pub batch_size_limit: usize,
}

impl Default for SettlerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 5_000,
            batch_size_limit: 10,
        }
    }
}

/// Options shared by both relayers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerConfig {
    pub polling_interval_ms: u64,
    /// Blocks fetched per scan window by the L2 → L2 relayer.
    pub block_range: u64,
    /// L2 gas limit of the requests the L2 → L2 relayer submits on L1.
    pub l2_gas_limit: u64,
    pub gas_per_pubdata: u64,
    /// First L1 block scanned by the L1 → L2 relayer. Defaults to the earliest recorded
    /// initialization request, or the chain head.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 2_000,
            block_range: 10,
            l2_gas_limit: 1_000_000,
            gas_per_pubdata: crate::contracts::DEFAULT_GAS_PER_PUBDATA,
            start_block: None,
        }
    }
}

/// HTTP client options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    pub request_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

/// Complete harness configuration.
///
/// Loaded from defaults, then a `Relaynet.toml` file, then `RELAYNET_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Directory holding the persisted state and node logs.
    pub outdata: PathBuf,
    /// Private key of the account submitting every harness transaction.
    pub operator_private_key: String,
    pub chains: Vec<ChainSpec>,
    pub anvil: AnvilConfig,
    pub forge: ForgeConfig,
    pub settler: SettlerConfig,
    pub relayer: RelayerConfig,
    pub rpc: RpcConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            outdata: PathBuf::from("relaynet-data"),
            operator_private_key: DEFAULT_OPERATOR_PRIVATE_KEY.to_string(),
            chains: vec![
                ChainSpec::settlement(1, 8545),
                ChainSpec::rollup(10, 8546).gateway(),
                ChainSpec::rollup(11, 8547),
                ChainSpec::rollup(12, 8548),
            ],
            anvil: AnvilConfig::default(),
            forge: ForgeConfig::default(),
            settler: SettlerConfig::default(),
            relayer: RelayerConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load the configuration, layering `path` (or `Relaynet.toml` in the working directory) and
    /// the environment over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));

        if path.is_some() && !file.exists() {
            anyhow::bail!("Configuration file not found: {}", file.display());
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load configuration")?;

        config.validate()?;
        tracing::debug!(path = %file.display(), "Configuration loaded");
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, without defaults or environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let settlement = self
            .chains
            .iter()
            .filter(|c| c.role == ChainRole::Settlement)
            .count();
        if settlement != 1 {
            anyhow::bail!("Exactly one settlement chain must be configured, found {settlement}");
        }

        if let Some(chain) = self
            .chains
            .iter()
            .find(|c| c.is_gateway && c.role != ChainRole::Rollup)
        {
            anyhow::bail!("Gateway chain {} must be a rollup", chain.chain_id);
        }

        if self.chains.iter().filter(|c| c.is_gateway).count() > 1 {
            anyhow::bail!("At most one gateway chain can be configured");
        }

        let mut ids: Vec<_> = self.chains.iter().map(|c| c.chain_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.chains.len() {
            anyhow::bail!("Chain ids must be unique");
        }

        if self.settler.batch_size_limit == 0 {
            anyhow::bail!("settler.batch_size_limit must be at least 1");
        }

        Ok(())
    }

    /// The signer of every harness transaction.
    pub fn operator_signer(&self) -> Result<PrivateKeySigner> {
        self.operator_private_key
            .parse()
            .context("Invalid operator private key")
    }

    /// Address of the operator account.
    pub fn operator_address(&self) -> Result<Address> {
        let signer = self.operator_signer()?;
        Ok(Address::from_slice(signer.address().as_slice()))
    }

    /// Directory of the persisted deployment state.
    pub fn state_dir(&self) -> PathBuf {
        self.outdata.join("state")
    }

    /// Directory of node logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.outdata.join("logs")
    }

    pub fn gateway(&self) -> Option<&ChainSpec> {
        self.chains.iter().find(|c| c.is_gateway)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_default_topology() {
        let config = HarnessConfig::default();
        config.validate().unwrap();

        assert_eq!(config.gateway().map(|c| c.chain_id), Some(10));
        assert_eq!(
            config
                .chains
                .iter()
                .filter(|c| c.role == ChainRole::Rollup)
                .count(),
            3
        );
    }

    #[test]
    fn test_operator_address_from_default_key() {
        let config = HarnessConfig::default();
        assert_eq!(
            config.operator_address().unwrap(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new("relaynet-config").unwrap();
        let path = dir.path().join(CONFIG_FILENAME);

        let mut config = HarnessConfig::default();
        config.settler.batch_size_limit = 3;
        config.chains.truncate(3);
        config.save_to_file(&path).unwrap();

        assert_eq!(HarnessConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_is_layered_over_defaults() {
        let dir = TempDir::new("relaynet-config").unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "[settler]\npolling_interval_ms = 250\nbatch_size_limit = 2\n")
            .unwrap();

        let config = HarnessConfig::load(Some(&path)).unwrap();
        assert_eq!(config.settler.polling_interval_ms, 250);
        assert_eq!(config.settler.batch_size_limit, 2);
        assert_eq!(config.relayer, RelayerConfig::default());
    }

    #[test]
    fn test_rejects_two_settlement_chains() {
        let mut config = HarnessConfig::default();
        config.chains.push(ChainSpec::settlement(2, 9000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_parses_kebab_case() {
        assert_eq!("rollup".parse::<ChainRole>().unwrap(), ChainRole::Rollup);
        assert_eq!(ChainRole::Settlement.to_string(), "settlement");
    }
}
