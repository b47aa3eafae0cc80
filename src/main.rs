use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use genjob::api::create_app;
use genjob::config::ServiceConfig;
use genjob::jobs::{JobService, spawn_eviction_task};
use genjob::provider::{HttpGenerationProvider, HttpProviderConfig};
use genjob::store::{JobStore, LibSqlJobStore, MemoryJobStore};

/// Stderr logging, plus a daily file under `GENJOB_LOG_DIR` when set.
/// The returned guard must live as long as the process.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("GENJOB_LOG_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "genjob.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = ServiceConfig::from_env();

    let provider_config = HttpProviderConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: GENJOB_PROVIDER_URL not set");
        eprintln!("  export GENJOB_PROVIDER_URL=https://provider.example/generate");
        std::process::exit(1);
    });
    let provider = Arc::new(HttpGenerationProvider::new(provider_config));

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = match &config.db_path {
        Some(path) => {
            let store = LibSqlJobStore::new_local(path)
                .await
                .with_context(|| format!("Failed to open job database at {}", path.display()))?;
            eprintln!("   Database: {}", path.display());
            Arc::new(store)
        }
        None => {
            eprintln!("   Database: in-memory");
            Arc::new(MemoryJobStore::new())
        }
    };

    let service = Arc::new(JobService::new(store, provider, config.clone()));
    let recovered = service.recover_interrupted().await?;
    if recovered > 0 {
        eprintln!("   Failed {recovered} jobs interrupted by the last shutdown");
    }

    eprintln!("genjob v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Jobs API: http://0.0.0.0:{}/jobs", config.port);
    eprintln!("   Server epoch: {}", service.server_epoch());
    eprintln!("   Max active jobs: {}\n", config.max_active_jobs);

    let eviction = spawn_eviction_task(Arc::clone(&service));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Job server started");

    axum::serve(listener, create_app(Arc::clone(&service)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    eviction.abort();
    service.shutdown().await;
    Ok(())
}
