//! Lifecycle of the local anvil nodes.
//!
//! [`NodeManager`] is the only component that spawns or signals node processes. The pids of the
//! running nodes are recorded in `anvil-pids.json` so that a later invocation can adopt and stop
//! them.

mod cmd;

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::process::{Child, Command};
use url::Url;

pub use cmd::AnvilCmdBuilder;

use crate::{
    HarnessError,
    client::{ChainClient, RpcChainClient},
    config::{AnvilConfig, ChainRole, HarnessConfig},
    fs::FsHandler,
    rpc,
    state::{Chain, ChainTopology},
};

/// File recording `{chainId → pid}` of the running nodes.
pub const PID_FILE: &str = "anvil-pids.json";

/// Interval of the liveness checks while waiting for a node to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A node tracked by the manager.
#[derive(Debug)]
struct NodeHandle {
    chain: Chain,
    pid: u32,
    /// `None` for nodes adopted from the pid file of a previous invocation.
    child: Option<Child>,
}

impl NodeHandle {
    fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => process_exists(self.pid),
        }
    }

    /// SIGTERM, then SIGKILL once `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        let chain_id = self.chain.chain_id;
        tracing::info!(chain_id, pid = self.pid, "Stopping node");

        if !signal(self.pid, Signal::Terminate)? {
            tracing::debug!(chain_id, pid = self.pid, "Node already exited");
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                tracing::info!(chain_id, "Node stopped");
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        tracing::warn!(chain_id, pid = self.pid, grace = ?grace, "Node ignored SIGTERM, killing it");
        signal(self.pid, Signal::Kill)?;

        if let Some(child) = &mut self.child {
            child
                .wait()
                .await
                .with_context(|| format!("Failed to reap node of chain {chain_id}"))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Send `signal` to `pid`. Returns `false` if the process no longer exists.
#[cfg(unix)]
fn signal(pid: u32, signal: Signal) -> Result<bool> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = libc::pid_t::try_from(pid).context("Pid out of range")?;

    // SAFETY: kill(2) has no memory safety requirements.
    if unsafe { libc::kill(pid, signo) } == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err).with_context(|| format!("Failed to signal process {pid}"))
}

#[cfg(not(unix))]
fn signal(pid: u32, _signal: Signal) -> Result<bool> {
    anyhow::bail!("Signalling process {pid} is only supported on unix")
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the permission and existence checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

/// Spawns, tracks and stops anvil processes.
#[derive(Debug)]
pub struct NodeManager {
    config: AnvilConfig,
    logs_dir: PathBuf,
    pid_file: PathBuf,
    request_timeout: Duration,
    nodes: HashMap<u64, NodeHandle>,
}

impl NodeManager {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            config: config.anvil.clone(),
            logs_dir: config.logs_dir(),
            pid_file: config.state_dir().join(PID_FILE),
            request_timeout: Duration::from_secs(config.rpc.request_timeout_secs),
            nodes: HashMap::new(),
        }
    }

    /// Spawn a node for `chain_id` on `port` and wait until it answers with its chain id.
    ///
    /// The process is killed if it does not become ready within the startup budget.
    pub async fn start_chain(
        &mut self,
        chain_id: u64,
        port: u16,
        role: ChainRole,
        is_gateway: bool,
    ) -> Result<Chain> {
        if let Some(node) = self.nodes.get(&chain_id) {
            anyhow::bail!("Chain {chain_id} is already running with pid {}", node.pid);
        }

        let rpc_url = Url::parse(&format!("http://{}:{}", self.config.host, port))
            .context("Failed to build node URL")?;
        let chain = Chain {
            chain_id,
            rpc_url,
            port,
            role,
            is_gateway,
        };

        FsHandler::create_dir(&self.logs_dir)?;
        let log_path = self.logs_dir.join(format!("anvil-{chain_id}.log"));
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?;
        let log_err = log.try_clone().context("Failed to clone log file handle")?;

        let args = AnvilCmdBuilder::from_config(chain_id, &self.config)
            .port(port)
            .build();
        tracing::debug!(chain_id, binary = %self.config.binary.display(), args = ?args, "Spawning node");

        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Keep the nodes out of the terminal's process group so Ctrl-C reaches only the harness.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.binary.display()))?;
        let pid = child.id().context("Node exited immediately")?;

        let mut node = NodeHandle {
            chain: chain.clone(),
            pid,
            child: Some(child),
        };
        tracing::info!(chain_id, port, pid, role = %role, log = %log_path.display(), "Node spawned");

        let client = RpcChainClient::new(chain_id, chain.rpc_url.clone(), self.request_timeout)?;
        let ready = {
            let client = &client;
            rpc::wait_until_ready(
                chain_id,
                self.config.startup_attempts,
                Duration::from_millis(self.config.startup_interval_ms),
                move || async move {
                    let reported = client.chain_id().await?;
                    anyhow::ensure!(
                        reported == chain_id,
                        "port {port} answers with chain id {reported}"
                    );
                    Ok(())
                },
            )
            .await
        };

        if let Err(e) = ready {
            if let Some(child) = &mut node.child {
                if let Err(kill_err) = child.kill().await {
                    tracing::warn!(chain_id, error = %kill_err, "Failed to kill unready node");
                }
            }
            return Err(e);
        }

        tracing::info!(chain_id, rpc_url = %chain.rpc_url, "Node ready");
        self.nodes.insert(chain_id, node);
        self.write_pid_file()?;
        Ok(chain)
    }

    /// Stop the node of `chain_id`.
    pub async fn stop_chain(&mut self, chain_id: u64) -> Result<()> {
        let mut node = self
            .nodes
            .remove(&chain_id)
            .ok_or(HarnessError::ChainNotFound(chain_id))?;
        node.terminate(self.grace_period()).await?;
        self.write_pid_file()
    }

    /// Stop every tracked node concurrently and remove the pid file.
    pub async fn stop_all(&mut self) -> Result<()> {
        let grace = self.grace_period();
        let mut nodes: Vec<NodeHandle> = self.nodes.drain().map(|(_, node)| node).collect();

        let results = join_all(nodes.iter_mut().map(|node| node.terminate(grace))).await;

        match std::fs::remove_file(&self.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove {}", self.pid_file.display()));
            }
        }

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| format!("{e:#}")))
            .collect();
        if !failures.is_empty() {
            anyhow::bail!("Failed to stop {} node(s): {}", failures.len(), failures.join("; "));
        }
        Ok(())
    }

    /// Track the nodes of `topology` started by a previous invocation that are still running.
    ///
    /// Returns the adopted chain ids.
    pub fn adopt(&mut self, topology: &ChainTopology) -> Result<Vec<u64>> {
        let recorded: BTreeMap<u64, u32> = FsHandler::read_json(&self.pid_file)?.unwrap_or_default();

        let mut adopted = Vec::new();
        for (chain_id, pid) in recorded {
            if self.nodes.contains_key(&chain_id) {
                continue;
            }
            let Some(chain) = topology.get(chain_id) else {
                tracing::warn!(chain_id, pid, "Recorded node is not part of the topology");
                continue;
            };
            if !process_exists(pid) {
                tracing::debug!(chain_id, pid, "Recorded node is gone");
                continue;
            }

            tracing::info!(chain_id, pid, "Adopting running node");
            self.nodes.insert(
                chain_id,
                NodeHandle {
                    chain: chain.clone(),
                    pid,
                    child: None,
                },
            );
            adopted.push(chain_id);
        }

        if !adopted.is_empty() {
            self.write_pid_file()?;
        }
        Ok(adopted)
    }

    /// RPC client of a tracked node.
    pub fn client(&self, chain_id: u64) -> Result<RpcChainClient> {
        let node = self
            .nodes
            .get(&chain_id)
            .ok_or(HarnessError::ChainNotFound(chain_id))?;
        RpcChainClient::new(chain_id, node.chain.rpc_url.clone(), self.request_timeout)
    }

    pub fn is_tracked(&self, chain_id: u64) -> bool {
        self.nodes.contains_key(&chain_id)
    }

    /// The tracked chains, ordered by chain id.
    pub fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.nodes.values().map(|n| n.chain.clone()).collect();
        chains.sort_by_key(|c| c.chain_id);
        chains
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.stop_grace_period_secs)
    }

    fn write_pid_file(&self) -> Result<()> {
        let pids: BTreeMap<u64, u32> = self
            .nodes
            .iter()
            .map(|(chain_id, node)| (*chain_id, node.pid))
            .collect();
        FsHandler::write_json(&self.pid_file, &pids)
    }
}
