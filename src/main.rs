//! Binary entrypoint wiring config, tracing, and the three runtimes
//! (proxy, worker, watchdog) together behind a `clap` CLI, mirroring the
//! base crate's single-binary-with-subcommands shape.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use taskbridge::broker::{BrokerClient, RedisBroker};
use taskbridge::config::Config;
use taskbridge::proxy::{router, ProxyState};
use taskbridge::queue::Queue;
use taskbridge::watchdog;
use taskbridge::worker::{HttpBackendClient, Worker};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskbridge", about = "Job-dispatch and event-streaming layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP facade (proxy fan-in): enqueues jobs and serves
    /// SSE/blocking responses.
    Serve,
    /// Run the worker runtime: dequeues jobs and drives them to a
    /// terminal status by calling the backend.
    Worker,
    /// Run the watchdog: periodically fails jobs whose heartbeat has
    /// gone stale.
    Watchdog,
    /// Print the effective configuration and its source.
    Config,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Config => {
            let config = Config::from_env()?;
            for (key, value) in config.list() {
                println!("{key} = {value}");
            }
            Ok(())
        }
        Command::Serve => {
            init_tracing();
            let config = Arc::new(Config::from_env()?);
            let broker = build_broker(&config).await?;
            let queue = Queue::new(broker, config.clone());
            let state = ProxyState { queue, config: config.clone() };

            let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
            tracing::info!(addr = %config.bind_addr, "taskbridge proxy listening");
            axum::serve(listener, router(state)).await?;
            Ok(())
        }
        Command::Worker => {
            init_tracing();
            let config = Arc::new(Config::from_env()?);
            let broker = build_broker(&config).await?;
            let queue = Queue::new(broker, config.clone());
            let backend: Arc<dyn taskbridge::worker::BackendClient> = Arc::new(
                HttpBackendClient::new(&config.backend_url, config.bot_request_timeout()),
            );

            let shutdown = CancellationToken::new();
            spawn_shutdown_listener(shutdown.clone());

            let handles = Worker::new(queue, backend, config, shutdown).spawn_all();
            for handle in handles {
                handle.await?;
            }
            Ok(())
        }
        Command::Watchdog => {
            init_tracing();
            let config = Arc::new(Config::from_env()?);
            let broker = build_broker(&config).await?;
            let queue = Queue::new(broker, config.clone());

            let shutdown = CancellationToken::new();
            spawn_shutdown_listener(shutdown.clone());

            watchdog::spawn(queue, config.watchdog_interval(), shutdown).await?;
            Ok(())
        }
    }
}

async fn build_broker(config: &Config) -> anyhow::Result<Arc<dyn BrokerClient>> {
    let broker = RedisBroker::connect(&config.redis_url).await?;
    Ok(Arc::new(broker))
}

/// Cancels `token` on SIGINT/SIGTERM, per spec.md §5's graceful-shutdown
/// rule: the in-flight job is finished, not abandoned.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        token.cancel();
    });
}
