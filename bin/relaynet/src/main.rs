//! relaynet runs a local settlement chain with several interoperating rollups on anvil.

mod cli;
mod status;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Command};
use relaynet_harness::{
    Daemons, ForgeScriptRunner, HarnessConfig, NodeManager, Orchestrator, RpcChainClient,
    RpcConnector, contracts, send_marker_message,
};

type RpcOrchestrator = Orchestrator<ForgeScriptRunner, RpcConnector>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = HarnessConfig::load(cli.config.as_deref())?;

    tracing::debug!(
        outdata = %config.outdata.display(),
        chains = config.chains.len(),
        "Configuration loaded"
    );

    let orchestrator = orchestrator(config.clone())?;

    match cli.command {
        Command::Up => {
            let mut nodes = NodeManager::new(&config);
            let daemons = match orchestrator.run_all(&mut nodes).await {
                Ok(daemons) => daemons,
                Err(e) => {
                    // Leave no orphaned nodes behind a failed bring-up.
                    if let Err(stop) = nodes.stop_all().await {
                        tracing::warn!(error = %format!("{stop:#}"), "Failed to stop nodes");
                    }
                    return Err(e);
                }
            };
            print_endpoints(&nodes);
            wait_for_shutdown(&daemons).await;
            daemons.stop_all().await?;
            nodes.stop_all().await?;
        }
        Command::StartChains => {
            let mut nodes = NodeManager::new(&config);
            orchestrator.start_chains(&mut nodes).await?;
            print_endpoints(&nodes);
        }
        Command::DeployL1 => {
            orchestrator.deploy_l1().await?;
        }
        Command::RegisterChains => {
            orchestrator.register_chains().await?;
        }
        Command::InitL2 => {
            orchestrator.init_l2().await?;
        }
        Command::SetupGateway => {
            if orchestrator.setup_gateway().await?.is_none() {
                tracing::info!("No gateway chain configured");
            }
        }
        Command::RunDaemons => {
            let daemons = orchestrator.start_daemons().await?;
            tracing::info!(path = %daemons.info_path().display(), "Deployment info exported");
            wait_for_shutdown(&daemons).await;
            daemons.stop_all().await?;
        }
        Command::Status => {
            println!("{}", status::render(&orchestrator.state()?));
        }
        Command::Down => {
            let state = orchestrator.state()?;
            let Some(topology) = &state.chains else {
                tracing::info!("No chains recorded, nothing to stop");
                return Ok(());
            };
            let mut nodes = NodeManager::new(&config);
            let adopted = nodes.adopt(topology)?;
            tracing::info!(chains = ?adopted, "Stopping nodes");
            nodes.stop_all().await?;
        }
        Command::SendL2ToL2 {
            source,
            target,
            target_address,
            calldata,
        } => {
            let state = orchestrator.state()?;
            let source_client = orchestrator.connect(&state, source)?;
            // The target must be a recorded chain even though only the source is called.
            orchestrator.connect(&state, target)?;

            let operator = orchestrator.operator();
            let receipt = send_marker_message(
                &source_client,
                operator,
                target,
                target_address.unwrap_or(operator),
                calldata,
            )
            .await?;

            tracing::info!(
                source,
                target,
                tx_hash = %receipt.transaction_hash,
                block = receipt.block_number,
                "Marker message sent"
            );
        }
        Command::AssetId { chain, token } => {
            let id = match token {
                Some(token) => contracts::asset_id(chain, token),
                None => contracts::eth_asset_id(chain),
            };
            println!("{id}");
        }
    }

    Ok(())
}

fn orchestrator(config: HarnessConfig) -> Result<RpcOrchestrator> {
    let runner = ForgeScriptRunner::new(config.forge.clone(), config.operator_address()?);
    let connector = RpcConnector::new(&config);
    Orchestrator::new(config, runner, connector)
}

fn print_endpoints(nodes: &NodeManager) {
    for chain in nodes.chains() {
        tracing::info!(
            chain_id = chain.chain_id,
            rpc_url = %chain.rpc_url,
            role = %chain.role,
            "Chain available"
        );
    }
}

/// Resolve on Ctrl-C, SIGTERM, or when a daemon task exits on its own.
async fn wait_for_shutdown(daemons: &Daemons<RpcChainClient>) {
    let daemon_exit = async {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if daemons.any_finished() {
                return;
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Shutdown requested"),
        _ = daemon_exit => tracing::warn!("A daemon exited unexpectedly, shutting down"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
