//! lcp-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! builds the scheduler, and starts the ambient HTTP server. Route
//! handlers live in `routes.rs`; shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use lcp_daemon::{routes, state};
use lcp_executor::NoopDecryptor;
use lcp_scheduler::{Scheduler, SchedulerConfig};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // PATCH S1: Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config_paths = config_paths_from_env();
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let loaded = lcp_config::load_layered_yaml(&path_refs)
        .with_context(|| format!("loading config from {config_paths:?}"))?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let database_url = std::env::var("LCP_DATABASE_URL").context("LCP_DATABASE_URL is not set")?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(loaded.engine.connection_acquire_timeout_seconds))
        .connect(&database_url)
        .await
        .context("connecting to control-plane database")?;

    let source_refs = lcp_sourcepool::load_source_refs(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("loading source refs: {e:?}"))?;
    info!(count = source_refs.len(), "registered source databases");
    let sourcepool = Arc::new(
        lcp_sourcepool::SourcePoolRegistry::new(source_refs)
            .await
            .map_err(|e| anyhow::anyhow!("building source pool registry: {e:?}"))?,
    );

    let scheduler = Scheduler::new(
        pool.clone(),
        sourcepool,
        Arc::new(NoopDecryptor),
        SchedulerConfig {
            sweep_interval: Duration::from_secs(loaded.engine.sweep_interval_seconds),
            claim_batch_size: 20,
            auto_recovery_after: Duration::from_secs(loaded.engine.failure_auto_recovery_minutes * 60),
            borrow_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(loaded.engine.executor_run_timeout_seconds),
            worker_concurrency: loaded.engine.executor_pool_size,
        },
    );

    let sweep_handle = Arc::clone(&scheduler).spawn_sweep_loop();

    let shared = Arc::new(state::AppState::new(Arc::clone(&scheduler), pool));
    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));
    info!("lcp-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    sweep_handle.abort();
    // Hand any in-flight claims this replica held back to IDLE before exiting.
    if let Err(err) = scheduler.release_in_flight_to_idle().await {
        tracing::error!(error = %err, "failed to release in-flight claims on shutdown");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("LCP_DAEMON_ADDR").ok()?.parse().ok()
}

/// `LCP_CONFIG_PATHS` is a colon-separated list of YAML files, later files
/// overriding earlier ones. Falls
/// back to a single conventional path when unset.
fn config_paths_from_env() -> Vec<String> {
    std::env::var("LCP_CONFIG_PATHS")
        .map(|raw| raw.split(':').map(str::to_string).collect())
        .unwrap_or_else(|_| vec!["config/base.yaml".to_string()])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
