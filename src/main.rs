//! LLM Relay - Main entry point
//!
//! Builds the runtime, wires the relay components from configuration and
//! serves the HTTP API until ctrl-c.

use anyhow::{Context, Result};
use llm_relay::{
    api::{build_router, AppState},
    core::{
        logging::init_tracing, middleware::install_panic_hook, AppConfig,
        InMemoryRequestLogStore, RequestLogStore,
    },
    services::{GenerationBackend, UpstreamBackend},
};
use std::net::SocketAddr;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> Result<()> {
    init_tracing();
    install_panic_hook();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    let backend: Arc<dyn GenerationBackend> = Arc::new(
        UpstreamBackend::new(&config.upstream).context("Failed to build upstream client")?,
    );
    let store: Arc<dyn RequestLogStore> =
        Arc::new(InMemoryRequestLogStore::new(config.request_log.capacity));
    let state = Arc::new(
        AppState::from_config(&config, backend, store).context("Failed to build app state")?,
    );
    let logger = state.logger.clone();

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    tracing::info!(
        upstream = %config.upstream.base_url,
        platform = %config.upstream.platform_name,
        workers = worker_threads,
        business_auth = !config.auth.api_keys.is_empty(),
        admin_api = config.auth.admin_key.is_some(),
        "Starting LLM relay on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    logger.flush().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// CPU quota from the cgroup, when the process runs in a limited container.
fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if let [quota, period] = parts.as_slice() {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                if quota > 0 && period > 0 {
                    return Some(((quota as f64 / period as f64).ceil() as usize).max(1));
                }
            }
        }
    }

    // cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 && period > 0 {
        Some(((quota as f64 / period as f64).ceil() as usize).max(1))
    } else {
        None
    }
}
