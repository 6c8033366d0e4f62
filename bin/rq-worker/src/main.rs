//! RelayQueue Worker
//!
//! Runs the queue pool over RabbitMQ and the outbox relay over the
//! configured database, with a Prometheus metrics and health endpoint.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RQ_CONFIG` | `config/rq-worker.toml` | Path to the TOML configuration |
//! | `RQ_*` | - | Per-setting overrides, see `rq-config` |
//! | `RUST_LOG` | per `app.env` | Log filter |

mod database;
mod example;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rq_common::Shutdown;
use rq_config::AppConfig;
use rq_outbox::{OutboxRelay, RelayConfig};
use rq_queue::{AmqpBroker, Broker, Queue};
use rq_router::Pool;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::database::Database;

#[derive(Parser, Debug)]
#[command(name = "rq-worker")]
#[command(about = "RelayQueue worker - queue pool and transactional outbox relay")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "RQ_CONFIG", default_value = "config/rq-worker.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue workers and the outbox relay (default)
    Run,
    /// Create the outbox and example tables, then exit
    Migrate,
    /// Write an example log row and its outbox message in one transaction
    ExampleLog {
        /// Log message text
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    rq_common::logging::init(config.app.env);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Migrate => {
            let db = Database::connect(config.outbox.backend, &config.database).await?;
            db.migrate().await?;
            db.close().await;
            Ok(())
        }
        Command::ExampleLog { text } => {
            let db = Database::connect(config.outbox.backend, &config.database).await?;
            let log = example::create_log(&db, &text).await?;
            info!(log_id = %log.id, "Example log stored with its outbox message");
            db.close().await;
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!(app = %config.app.name, env = %config.app.env, "Starting RelayQueue worker");

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let db = Database::connect(config.outbox.backend, &config.database).await?;
    db.migrate().await?;

    let amqp = Arc::new(AmqpBroker::connect(&config.amqp.url).await?);
    let broker: Arc<dyn Broker> = amqp.clone();

    // Queues
    let example_queue = Queue::new(example::QUEUE_EXAMPLE, example::handlers(), broker.clone())
        .await?
        .with_poll_interval(config.worker.poll_interval())
        .with_workers(config.workers_for(example::QUEUE_EXAMPLE));
    let pool = Arc::new(Pool::with_queues([example_queue])?);
    info!(queues = ?pool.queue_names(), "Queue pool configured");

    let pool_handle = pool.clone().start();

    // Outbox relay
    let relay = if config.outbox.enabled {
        let relay = Arc::new(OutboxRelay::new(
            db.outbox_repository(),
            pool.clone(),
            RelayConfig {
                batch_size: config.outbox.batch_size as usize,
                poll_interval: config.outbox.poll_interval(),
                max_retries: config.outbox.max_retries,
                claim_timeout: config.outbox.claim_timeout(),
            },
        ));
        let task = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run().await })
        };
        Some((relay, task))
    } else {
        info!("Outbox relay disabled");
        None
    };

    // Metrics and health
    let server_shutdown = Shutdown::new();
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || metrics_handler(metrics_handle.clone())))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!("Metrics server listening on http://{}/metrics", metrics_addr);
    let metrics_server = {
        let server_shutdown = server_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move { server_shutdown.wait().await })
                .await
            {
                error!(error = %e, "Metrics server failed");
            }
        })
    };

    info!("RelayQueue worker started");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Stop feeding the queues first, then drain the workers
    if let Some((relay, task)) = relay {
        relay.shutdown();
        if tokio::time::timeout(config.worker.shutdown_timeout(), task).await.is_err() {
            warn!("Timed out waiting for outbox relay");
        }
    }

    if !pool_handle.shutdown(config.worker.shutdown_timeout()).await {
        warn!("Queue workers did not finish in time");
    }

    server_shutdown.trigger();
    join_task("metrics server", metrics_server).await;

    if let Err(e) = amqp.close().await {
        warn!(error = %e, "Failed to close AMQP connection");
    }
    db.close().await;

    info!("RelayQueue worker shutdown complete");
    Ok(())
}

/// Await a background task. Returns false if it panicked or was cancelled.
async fn join_task(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "Background task ended abnormally");
            false
        }
    }
}

async fn metrics_handler(handle: PrometheusHandle) -> String {
    handle.render()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_task_reports_clean_exit() {
        assert!(join_task("ok", tokio::spawn(async {})).await);
    }

    #[tokio::test]
    async fn test_join_task_reports_panic() {
        let task = tokio::spawn(async { panic!("metrics server crashed") });
        assert!(!join_task("metrics server", task).await);
    }

    #[tokio::test]
    async fn test_join_task_reports_abort() {
        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        assert!(!join_task("metrics server", task).await);
    }
}
