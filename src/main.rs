// ABOUTME: Main entry point with the run and pre-sync subcommands.
// ABOUTME: Initializes logging and config, wires sink/manager/synchronizer/supervisor, maps exit codes.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chirp::config::Config;
use chirp::extensions::builtin_catalog;
use chirp::gateway::WsTransport;
use chirp::manager::ExtensionManager;
use chirp::metrics;
use chirp::sink::{HttpDelivery, SinkConfig, WebhookSink};
use chirp::supervisor::{ConnectionSupervisor, SessionError, SupervisorConfig};
use chirp::sync::{CommandSynchronizer, FingerprintStore, HttpCommandApi};

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_AUTH: i32 = 3;

#[derive(Parser)]
#[command(name = "chirp", about = "Persistent chat-platform bot runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Full boot: load extensions, sync commands, hold the gateway session
    Run,
    /// Load extensions, push command-tree changes, and exit without a session
    PreSync,
}

#[tokio::main]
async fn main() {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("chirp panicked: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration invalid, aborting");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        gateway = %config.gateway.url,
        application_id = config.gateway.application_id,
        guild_id = config.gateway.guild_id,
        extensions = config.extensions.enabled.len(),
        "Configuration loaded"
    );

    let code = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_bot(config).await,
        Command::PreSync => pre_sync(config).await,
    };
    std::process::exit(code);
}

/// Wire up the pieces shared by both entry points.
fn build_runtime(config: &Config) -> (WebhookSink, Arc<ExtensionManager>, CommandSynchronizer) {
    let sink = WebhookSink::spawn(
        SinkConfig::from(&config.webhook),
        Arc::new(HttpDelivery::new(&config.webhook.url, &config.webhook.token)),
    );

    let manager = Arc::new(ExtensionManager::new(
        builtin_catalog(),
        config.gateway.guild_id,
        sink.handle(),
        config.drain_grace(),
    ));

    let synchronizer = CommandSynchronizer::new(
        Arc::new(HttpCommandApi::new(
            &config.sync.api_base,
            &config.gateway.token,
            config.gateway.application_id,
        )),
        FingerprintStore::new(&config.sync.fingerprint_path),
        sink.handle(),
    );

    (sink, manager, synchronizer)
}

/// Full boot sequence: extensions, command sync, then the supervisor loop
/// until a termination signal or unrecoverable session failure.
async fn run_bot(config: Config) -> i32 {
    match metrics::init_metrics() {
        Ok(handle) => spawn_metrics_dump(handle),
        Err(e) => tracing::warn!(error = %e, "Metrics recorder unavailable, continuing without"),
    }

    let (sink, manager, synchronizer) = build_runtime(&config);

    manager.load_all(&config.extensions.enabled).await;
    tracing::info!(loaded = ?manager.loaded_names().await, "Extensions loaded");

    let registry = manager.registry_snapshot().await;
    match synchronizer.sync(&registry).await {
        Ok(report) => tracing::info!(
            pushed = report.pushed.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Command sync complete"
        ),
        Err(e) => tracing::error!(error = %e, "Command sync errored, continuing boot"),
    }

    let transport = Arc::new(WsTransport::new(
        &config.gateway.url,
        &config.gateway.token,
        config.gateway.application_id,
        config.gateway.shard,
    ));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        transport,
        Arc::clone(&manager),
        sink.handle(),
        SupervisorConfig::from_config(&config),
    ));

    let signal_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Termination signal received, shutting down");
        signal_supervisor.stop();
    });

    let result = supervisor.run().await;

    // Ordered teardown: the event loop has exited, so no new dispatch can
    // start; unload extensions, then flush the sink.
    manager.unload_all().await;
    sink.shutdown().await;

    match result {
        Ok(()) => EXIT_OK,
        Err(SessionError::AuthRejected(_)) => EXIT_AUTH,
        Err(SessionError::RetryBudgetExhausted(_)) => EXIT_FATAL,
    }
}

/// Push command-tree changes without opening a gateway session.
async fn pre_sync(config: Config) -> i32 {
    let (sink, manager, synchronizer) = build_runtime(&config);

    manager.load_all(&config.extensions.enabled).await;

    let registry = manager.registry_snapshot().await;
    let code = match synchronizer.sync(&registry).await {
        Ok(report) => {
            tracing::info!(
                pushed = ?report.pushed,
                unchanged = ?report.unchanged,
                failed = ?report.failed,
                "Pre-sync complete"
            );
            if report.failed.is_empty() {
                EXIT_OK
            } else {
                EXIT_FATAL
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Pre-sync failed");
            EXIT_FATAL
        }
    };

    manager.unload_all().await;
    sink.shutdown().await;
    code
}

/// Render the metrics registry to stderr on SIGUSR1. There is no scrape
/// listener; this is the on-demand inspection path.
fn spawn_metrics_dump(handle: metrics_exporter_prometheus::PrometheusHandle) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            tracing::warn!("SIGUSR1 handler unavailable, metrics dump disabled");
            return;
        };
        while usr1.recv().await.is_some() {
            eprintln!("{}", handle.render());
        }
    });
    #[cfg(not(unix))]
    drop(handle);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, using Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
