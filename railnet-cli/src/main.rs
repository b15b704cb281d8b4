//! RailNet CLI - the network manager daemon.
//!
//! Wires the registry, manager, control server and announcement beacon
//! together and runs them until a termination signal arrives. One flag
//! per configurable; everything else is library policy.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use railnet::announce::{ServiceAnnouncer, DEFAULT_DISCOVERY_PORT};
use railnet::logging;
use railnet::manager::{Manager, ManagerDependencies};
use railnet::metrics::{MetricsClient, MetricsDaemon};
use railnet::registry::{FileRegistry, RECONFIGURE_QUEUE_CAPACITY};
use railnet::server::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "railnet")]
#[command(version = railnet::VERSION)]
#[command(about = "Network manager for a model-railway control network", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "debug")]
    level: String,

    /// UDP port used for service announcements
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Folder containing worker configurations
    #[arg(long, default_value = "./configs")]
    folder: PathBuf,

    /// Host the server is listening on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port the server is listening on
    #[arg(long, default_value_t = 8823)]
    port: u16,

    /// Advertise the API as TLS-secured
    #[arg(long)]
    secure: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init_logging(
        &cli.level,
        logging::default_log_dir(),
        logging::default_log_file(),
    ) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {}", err);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = railnet::VERSION,
        folder = %cli.folder.display(),
        "starting railnet network manager"
    );

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    // Metrics pipeline.
    let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
    let metrics_daemon = MetricsDaemon::new(metrics_rx);
    let metrics_task = tokio::spawn(metrics_daemon.run(token.clone()));

    // Registry with its reconfigure queue.
    let (reconfigure_tx, reconfigure_rx) = mpsc::channel(RECONFIGURE_QUEUE_CAPACITY);
    let registry = Arc::new(FileRegistry::new(&cli.folder, reconfigure_tx));
    let registry_task = {
        let registry = Arc::clone(&registry);
        let token = token.clone();
        tokio::spawn(async move { registry.run_maintenance(token).await })
    };

    let manager = Arc::new(Manager::new(ManagerDependencies {
        registry,
        reconfigure_rx,
        metrics: MetricsClient::new(metrics_tx),
    }));
    let manager_task = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.run(token).await })
    };

    let announcer = ServiceAnnouncer::new(cli.port, cli.secure, cli.discovery_port);
    let announce_task = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = announcer.run(token).await {
                tracing::error!(error = %err, "service announcer failed");
            }
        })
    };

    let server = Server::new(
        ServerConfig {
            host: cli.host.clone(),
            port: cli.port,
        },
        manager,
    );

    let exit = match server.run(token.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "control server failed");
            ExitCode::FAILURE
        }
    };

    // Wind everything down.
    token.cancel();
    let _ = manager_task.await;
    let _ = registry_task.await;
    let _ = announce_task.await;
    let _ = metrics_task.await;
    tracing::info!("railnet network manager stopped");
    exit
}

/// Cancels the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sig) => sig,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot install SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        tracing::info!("interrupt received, shutting down");
                    }
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => tracing::info!("interrupt received, shutting down"),
                _ = sigterm.recv() => tracing::info!("termination signal received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                tracing::info!("interrupt received, shutting down");
            }
        }

        token.cancel();
    });
}
