#![forbid(unsafe_code)]

//! `plugin-supervisor`: plugin process supervisor binary.
//!
//! Bootstraps configuration, opens the instance store, starts the liveness
//! monitor and the optional file watch, then launches every configured
//! plugin and supervises it until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use plugin_supervisor::broker::ChannelBroker;
use plugin_supervisor::events::ChannelPublisher;
use plugin_supervisor::file_watcher::FileWatcher;
use plugin_supervisor::persistence::instance_repo::InstanceRepo;
use plugin_supervisor::persistence::memory::MemoryInstanceStore;
use plugin_supervisor::persistence::{db, InstanceStore};
use plugin_supervisor::supervisor::liveness::LivenessMonitor;
use plugin_supervisor::supervisor::runner::{ExitReport, ProcessRunner};
use plugin_supervisor::{AppError, Result, SupervisorConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "plugin-supervisor", about = "Plugin process supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("plugin-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = SupervisorConfig::load_from_path(&args.config)?;
    let capture = config.capture_config()?;
    info!(plugins = config.plugins.len(), "configuration loaded");

    // ── Open instance store ─────────────────────────────
    let store: Arc<dyn InstanceStore> = match &config.database_path {
        Some(path) => {
            let pool = db::connect(path).await?;
            info!(path = %path.display(), "database connected");
            Arc::new(InstanceRepo::new(Arc::new(pool)))
        }
        None => {
            info!("no database configured; instance status kept in memory");
            Arc::new(MemoryInstanceStore::new())
        }
    };

    let ct = CancellationToken::new();

    // ── Start liveness monitor ──────────────────────────
    let (broker, mut probes) = ChannelBroker::new();
    let probe_log = tokio::spawn(async move {
        while let Some(envelope) = probes.recv().await {
            debug!(
                routing_key = %envelope.routing_key,
                expiration_ms = envelope.expiration_ms,
                body = %envelope.body,
                "probe dispatched"
            );
        }
    });
    let monitor_handle = LivenessMonitor::new(
        Arc::clone(&store),
        Arc::new(broker),
        config.monitor_config(),
        ct.clone(),
    )
    .spawn();
    info!("liveness monitor started");

    // ── Start file watch ────────────────────────────────
    let (publisher, mut events) = ChannelPublisher::new();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(%event, "file event");
        }
    });
    let watcher = match &config.watch {
        Some(watch) => Some(
            FileWatcher::start(
                watch.path.clone(),
                watch.handlers(),
                Arc::new(publisher),
                watch.poll_interval(),
            )
            .await?,
        ),
        None => {
            drop(publisher);
            None
        }
    };

    // ── Launch plugins ──────────────────────────────────
    let mut runners: Vec<(String, ProcessRunner, JoinHandle<Result<ExitReport>>)> = Vec::new();
    for (name, params) in config.launch_params() {
        let runner = ProcessRunner::with_generated_id(params, capture);
        info!(plugin = %name, runner = %runner, "launching plugin");
        let handle = runner.spawn();
        runners.push((name, runner, handle));
    }

    info!("plugin-supervisor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Some(watcher) = &watcher {
        watcher.stop().await;
    }
    drop(watcher);

    stop_runners(&runners, config.shutdown_grace()).await;

    // ── Wait for background tasks ───────────────────────
    for (name, _, handle) in runners {
        match handle.await {
            Ok(Ok(report)) => info!(
                plugin = %name,
                exit_code = report.exit_code,
                signal = report.signal,
                "plugin exited"
            ),
            Ok(Err(err)) => error!(plugin = %name, %err, "plugin failed"),
            Err(err) => error!(plugin = %name, %err, "plugin task failed"),
        }
    }
    let _ = monitor_handle.await;
    let _ = tokio::join!(probe_log, event_log);
    info!("plugin-supervisor shut down");

    Ok(())
}

/// Interrupt every runner, then kill whatever is still running after `grace`.
async fn stop_runners(
    runners: &[(String, ProcessRunner, JoinHandle<Result<ExitReport>>)],
    grace: Duration,
) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let mut pending = false;
        for (_, runner, handle) in runners {
            if handle.is_finished() {
                continue;
            }
            pending = true;
            // A runner still launching is interrupted on a later pass.
            if runner.is_running() && !runner.state().stopped {
                runner.terminate();
            }
        }
        if !pending || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for (name, runner, handle) in runners {
        if !handle.is_finished() {
            warn!(plugin = %name, runner = %runner, "plugin ignored interrupt; killing");
            runner.kill();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
