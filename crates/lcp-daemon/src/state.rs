//! Shared runtime state for lcp-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Instant;

use lcp_scheduler::Scheduler;
use serde::{Deserialize, Serialize};

/// Static build metadata included in the `/healthz` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot returned by `GET /healthz`. This is ambient
/// process liveness, not a control-API projection of loader state — an
/// embedder wanting the latter calls `lcp-control-api` directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub build: BuildInfo,
    pub uptime_secs: u64,
    pub db_reachable: bool,
}

/// Cloneable (Arc) handle shared across every Axum handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub pool: sqlx::PgPool,
    started_at: Instant,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, pool: sqlx::PgPool) -> Self {
        AppState {
            scheduler,
            pool,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
