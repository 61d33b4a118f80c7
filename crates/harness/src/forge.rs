//! Contract deployment through `forge script`.

use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use url::Url;

use crate::{config::ForgeConfig, fs::FsHandler};

/// Lines of stderr kept to explain a failed script.
const STDERR_TAIL_LINES: usize = 20;

/// A single `forge script` run.
///
/// Paths are relative to the contracts root and start with `/`, the form the deployment scripts
/// concatenate with their project root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptInvocation {
    /// Script target, as `path:Contract`.
    pub script: String,
    pub sig: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Documents written before the run, as `(path, contents)`.
    pub inputs: Vec<(String, String)>,
    /// Document read back after the run.
    pub output: Option<String>,
}

impl ScriptInvocation {
    pub fn new(script: impl Into<String>, sig: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            sig: sig.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), value.to_string());
        self
    }

    pub fn input(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.inputs.push((path.into(), contents.into()));
        self
    }

    pub fn output(mut self, path: impl Into<String>) -> Self {
        self.output = Some(path.into());
        self
    }
}

/// The TOML document written by a script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput(toml::Table);

impl ScriptOutput {
    pub fn new(table: toml::Table) -> Self {
        Self(table)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map(Self)
            .context("Failed to parse script output as TOML")
    }

    /// Read the address at a dotted key path, e.g. `deployed_addresses.bridgehub.bridgehub_proxy_addr`.
    pub fn address(&self, path: &str) -> Result<Address> {
        let mut keys = path.split('.');
        let first = keys.next().unwrap_or_default();
        let mut value = self
            .0
            .get(first)
            .with_context(|| format!("Key {path} not found in script output"))?;

        for key in keys {
            value = value
                .get(key)
                .with_context(|| format!("Key {path} not found in script output"))?;
        }

        value
            .as_str()
            .with_context(|| format!("Key {path} is not a string"))?
            .parse()
            .with_context(|| format!("Key {path} is not an address"))
    }

    /// The address at the first of `paths` present in the output.
    pub fn first_address(&self, paths: &[&str]) -> Result<Address> {
        paths
            .iter()
            .find_map(|path| self.address(path).ok())
            .with_context(|| format!("None of {} found in script output", paths.join(", ")))
    }
}

/// Runs deployment scripts against a chain.
pub trait ScriptRunner: Send + Sync + 'static {
    fn run(
        &self,
        rpc_url: &Url,
        invocation: &ScriptInvocation,
    ) -> impl Future<Output = Result<ScriptOutput>> + Send;
}

impl ForgeConfig {
    /// Root-relative path of a script input document.
    pub fn input_path(&self, name: &str) -> String {
        format!("/{}/{}", self.inputs_dir.trim_matches('/'), name)
    }

    /// Root-relative path of a script output document.
    pub fn output_path(&self, name: &str) -> String {
        format!("/{}/{}", self.outputs_dir.trim_matches('/'), name)
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.contracts_root.join(relative.trim_start_matches('/'))
    }
}

/// [`ScriptRunner`] spawning the `forge` binary from the contracts root.
#[derive(Debug, Clone)]
pub struct ForgeScriptRunner {
    config: ForgeConfig,
    sender: Address,
}

impl ForgeScriptRunner {
    pub fn new(config: ForgeConfig, sender: Address) -> Self {
        Self { config, sender }
    }

    /// Arguments of the `forge` invocation.
    pub fn build_args(&self, rpc_url: &Url, invocation: &ScriptInvocation) -> Vec<String> {
        let mut args = vec![
            "script".to_string(),
            invocation.script.clone(),
            "--rpc-url".to_string(),
            rpc_url.to_string(),
            "--unlocked".to_string(),
            "--sender".to_string(),
            self.sender.to_string(),
            "--broadcast".to_string(),
            "--slow".to_string(),
            "--legacy".to_string(),
            "--ffi".to_string(),
            "--sig".to_string(),
            invocation.sig.clone(),
        ];
        args.extend(invocation.args.iter().cloned());
        args
    }
}

async fn stream_lines(
    script: String,
    stream: impl AsyncRead + Unpin,
    keep: usize,
) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(script = %script, "{}", line);
        if keep > 0 {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
    tail
}

impl ScriptRunner for ForgeScriptRunner {
    async fn run(&self, rpc_url: &Url, invocation: &ScriptInvocation) -> Result<ScriptOutput> {
        for (relative, contents) in &invocation.inputs {
            let path = self.config.resolve(relative);
            if let Some(parent) = path.parent() {
                FsHandler::create_dir(parent)?;
            }
            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("Failed to write script input {}", path.display()))?;
        }

        let output_path = invocation.output.as_deref().map(|o| self.config.resolve(o));
        if let Some(path) = &output_path {
            if let Some(parent) = path.parent() {
                FsHandler::create_dir(parent)?;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale script output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }

        let args = self.build_args(rpc_url, invocation);
        tracing::info!(script = %invocation.script, sig = %invocation.sig, rpc_url = %rpc_url, "Running deployment script");
        tracing::debug!(args = ?args, env = ?invocation.env, "forge command");

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .envs(&invocation.env)
            .current_dir(&self.config.contracts_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.binary.display()))?;

        let stdout = child.stdout.take().context("forge stdout not captured")?;
        let stderr = child.stderr.take().context("forge stderr not captured")?;
        let stdout_task = tokio::spawn(stream_lines(invocation.script.clone(), stdout, 0));
        let stderr_task = tokio::spawn(stream_lines(
            invocation.script.clone(),
            stderr,
            STDERR_TAIL_LINES,
        ));

        let status = child.wait().await.context("Failed to wait for forge")?;
        let _ = stdout_task.await;
        let tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            anyhow::bail!(
                "forge script {} failed with {}:\n{}",
                invocation.script,
                status,
                Vec::from(tail).join("\n")
            );
        }

        let Some(path) = output_path else {
            return Ok(ScriptOutput::default());
        };

        FsHandler::wait_for_file(&path, Duration::from_secs(self.config.output_timeout_secs))
            .await?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read script output {}", path.display()))?;

        tracing::info!(script = %invocation.script, output = %path.display(), "Deployment script completed");
        ScriptOutput::parse(&content)
    }
}
