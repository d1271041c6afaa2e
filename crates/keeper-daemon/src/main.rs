mod config;
mod error;
mod keeper;
mod process;
mod remote;
mod sandbox;
mod status;
mod sync;

#[cfg(test)]
mod testing;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keeper_core::{RemoteStore, StartOptions};
use serde_json::json;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Cli, Command, Config};
use keeper::Keeper;
use process::{KeywordSuccess, ProcessLifecycle};
use remote::RcloneRemote;
use sandbox::{HandleSupervisor, LocalSandbox};
use sync::{SyncEngine, SyncOutcome};

/// Lines of the sync log shown by `status`.
const STATUS_LOG_LINES: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Status => print_status(&config).await,
        Command::Sync => sync_once(&config).await,
        Command::ForceRestore => {
            let status = config.status_store();
            status.request_force_restore().await?;
            info!(
                "Next boot will restore from remote regardless of local state ({})",
                status.state_dir().display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            timeout_ms,
            success_keywords,
            command,
        } => exec(&config, timeout_ms, success_keywords, command).await,
    }
}

fn build_engine(config: &Config) -> Arc<SyncEngine> {
    let remote = config
        .rclone_settings()
        .map(|settings| Arc::new(RcloneRemote::new(settings)) as Arc<dyn RemoteStore>);
    Arc::new(SyncEngine::new(
        remote,
        config.layout(),
        config.status_store(),
        config.sync_force_interval(),
    ))
}

fn build_lifecycle(config: &Config) -> (Arc<HandleSupervisor>, Arc<ProcessLifecycle>) {
    let supervisor = Arc::new(HandleSupervisor::new(
        Arc::new(LocalSandbox::new()),
        config.handle_retry_attempts,
    ));
    let lifecycle = Arc::new(ProcessLifecycle::new(
        supervisor.clone(),
        config.poll_interval(),
    ));
    (supervisor, lifecycle)
}

async fn serve(config: &Config) -> anyhow::Result<ExitCode> {
    info!("Starting keeper-daemon");
    info!("  State dir: {}", config.effective_state_dir().display());
    info!("  Config dir: {}", config.effective_config_dir().display());
    info!("  Workspace dir: {}", config.effective_workspace_dir().display());
    info!("  Extensions dir: {}", config.effective_extensions_dir().display());

    let engine = build_engine(config);
    if engine.is_configured() {
        info!("  Backup bucket: {}", config.r2_bucket_name);
    } else {
        info!("  Backup: not configured");
    }
    let (supervisor, lifecycle) = build_lifecycle(config);
    let keeper = Keeper::new(engine, lifecycle, config.shutdown_sync_timeout());

    // Restore must be recorded before the first sync tick
    let restored = keeper.restore().await?;
    info!("Restore: {}", restored.state);

    let mut shutdown_rx = create_shutdown_signal();

    if let Some(spec) = config.gateway_spec() {
        if let Err(e) = keeper.start_gateway(&spec).await {
            error!("Gateway failed to start: {}", e);
            keeper.shutdown().await;
            return Err(e.into());
        }
    } else {
        info!("No gateway command configured, running backup only");
    }

    keeper.spawn_sync_loop(config.sync_scan_interval()).await;

    let exit = tokio::select! {
        _ = shutdown_rx.wait_for(|&v| v) => ExitCode::SUCCESS,
        status = keeper.gateway_exited() => {
            warn!("Gateway exited ({}), shutting down", status);
            ExitCode::FAILURE
        }
    };

    keeper.shutdown().await;
    info!(
        "Shutdown complete ({} handle reacquisitions)",
        supervisor.reacquisitions()
    );
    Ok(exit)
}

async fn print_status(config: &Config) -> anyhow::Result<ExitCode> {
    let status = config.status_store();
    let log = status.read_log().await?;
    let lines: Vec<&str> = log.lines().collect();
    let tail = &lines[lines.len().saturating_sub(STATUS_LOG_LINES)..];

    let report = json!({
        "configured": config.rclone_settings().is_some(),
        "restore": status.read_restore_status().await?,
        "sync": status.read_sync_record().await?,
        "force_restore_pending": status.force_restore_requested().await,
        "log": tail,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn sync_once(config: &Config) -> anyhow::Result<ExitCode> {
    let engine = build_engine(config);
    let outcome = engine.trigger_sync().await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(match outcome {
        SyncOutcome::Synced { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn exec(
    config: &Config,
    timeout_ms: u64,
    success_keywords: Vec<String>,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("No command given");
    };
    let options = StartOptions::new(program.as_str()).args(args);
    let predicate = KeywordSuccess::new(&success_keywords);

    let (_, lifecycle) = build_lifecycle(config);
    let outcome = lifecycle
        .run_command(&options, Duration::from_millis(timeout_ms), &predicate)
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
