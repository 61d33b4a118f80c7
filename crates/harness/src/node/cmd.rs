//! Command builder for Anvil.

use crate::config::AnvilConfig;

/// Builder for Anvil commands.
#[derive(Debug, Clone)]
pub struct AnvilCmdBuilder {
    host: String,
    port: u16,
    chain_id: u64,
    block_time: u64,
    accounts: u32,
    balance: u64,
    gas_limit: u64,
    auto_impersonate: bool,
    extra_args: Vec<String>,
}

impl AnvilCmdBuilder {
    /// Create a new Anvil command builder.
    pub fn new(chain_id: u64) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8545,
            chain_id,
            block_time: 1,
            accounts: 10,
            balance: 10_000,
            gas_limit: 100_000_000,
            auto_impersonate: true,
            extra_args: Vec::new(),
        }
    }

    /// Create a builder carrying the node options of `config`.
    pub fn from_config(chain_id: u64, config: &AnvilConfig) -> Self {
        Self::new(chain_id)
            .host(&config.host)
            .block_time(config.block_time)
            .accounts(config.accounts)
            .balance(config.balance)
            .gas_limit(config.gas_limit)
            .extra_args(config.extra_args.iter().cloned())
    }

    /// Set the block time in seconds.
    pub fn block_time(mut self, block_time: u64) -> Self {
        self.block_time = block_time;
        self
    }

    /// Set the host address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the number of prefunded accounts.
    pub fn accounts(mut self, accounts: u32) -> Self {
        self.accounts = accounts;
        self
    }

    /// Set the balance of each prefunded account, in ether.
    pub fn balance(mut self, balance: u64) -> Self {
        self.balance = balance;
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// Let any sender submit transactions without a signature.
    pub fn auto_impersonate(mut self, enabled: bool) -> Self {
        self.auto_impersonate = enabled;
        self
    }

    /// Add extra arguments.
    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Build the command as a vector of strings.
    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "--host".to_string(),
            self.host,
            "--port".to_string(),
            self.port.to_string(),
            "--chain-id".to_string(),
            self.chain_id.to_string(),
            "--accounts".to_string(),
            self.accounts.to_string(),
            "--balance".to_string(),
            self.balance.to_string(),
            "--block-time".to_string(),
            self.block_time.to_string(),
            "--gas-limit".to_string(),
            self.gas_limit.to_string(),
        ];

        if self.auto_impersonate {
            cmd.push("--auto-impersonate".to_string());
        }

        cmd.extend(self.extra_args);

        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anvil_cmd_builder() {
        let cmd = AnvilCmdBuilder::new(11).port(8547).build();

        assert_eq!(
            cmd,
            [
                "--host",
                "127.0.0.1",
                "--port",
                "8547",
                "--chain-id",
                "11",
                "--accounts",
                "10",
                "--balance",
                "10000",
                "--block-time",
                "1",
                "--gas-limit",
                "100000000",
                "--auto-impersonate",
            ]
        );
    }

    #[test]
    fn test_extra_args_from_config() {
        let config = AnvilConfig {
            extra_args: vec!["--no-mining".to_string()],
            ..Default::default()
        };
        let cmd = AnvilCmdBuilder::from_config(1, &config)
            .auto_impersonate(false)
            .build();

        assert_eq!(cmd.last().map(String::as_str), Some("--no-mining"));
        assert!(!cmd.contains(&"--auto-impersonate".to_string()));
    }
}
