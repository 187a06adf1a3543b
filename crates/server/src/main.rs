//! Workflow server entry point.

use std::error::Error;
use std::sync::Arc;

use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use messaging::WorkerPool;
use server::AppState;
use server::config::{Config, LogFormat};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_store(config: &Config) -> Result<(Arc<dyn EventStore>, &'static str), Box<dyn Error>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresEventStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using postgres event store");
            Ok((Arc::new(store), "postgres"))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, events are kept in memory only");
            Ok((Arc::new(InMemoryEventStore::new()), "memory"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Event store and saga runtime
    let (store, store_kind) = open_store(&config).await?;
    let runtime = server::build_runtime(store, &config).await;

    // 4. Step workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::new(runtime.worker(), config.worker_pool_config());
    let workers = pool.spawn(shutdown_rx);
    tracing::info!(concurrency = config.worker_concurrency, "step workers started");

    // 5. HTTP surface
    let state = Arc::new(AppState {
        workflows: runtime.workflows().clone(),
        store_kind,
    });
    let app = server::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Let in-flight steps finish
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(error) = worker.await {
            tracing::error!(%error, "step worker terminated abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
