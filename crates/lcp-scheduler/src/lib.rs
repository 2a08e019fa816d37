//! Distributed scheduler.
//!
//! Claims eligible `ACTIVE`/`IDLE` loaders under `FOR UPDATE SKIP LOCKED`,
//! enforces the per-`entity_code` parallelism cap inline in the same
//! claim query, and dispatches each claim to `lcp-executor::run_once` on a
//! bounded worker pool. The sweep ticker runs on a plain
//! `tokio::time::interval` loop.
//!
//! `SKIP LOCKED` is native to both dialects this workspace's sources
//! target at the control-plane level (control storage is Postgres-only,
//! per `lcp-versionstore`), so no `pg_try_advisory_xact_lock` fallback is
//! implemented here — it would be dead code against a backend that never
//! lacks skip-locked support.

use chrono::{DateTime, Utc};
use lcp_errors::LoaderError;
use lcp_executor::Decryptor;
use lcp_sourcepool::SourcePoolRegistry;
use lcp_versionstore::LoaderRow;
use sqlx::PgPool;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

/// Upper bound on in-memory execution history kept per scheduler instance.
/// Oldest entries are evicted first; this is observability, not the system
/// of record (the watermark/signal rows are).
const EXECUTION_LOG_CAPACITY: usize = 1000;

/// One row of the execution log.
#[derive(Debug, Clone)]
pub struct ExecutionLogEntry {
    pub run_id: Uuid,
    pub sweep_id: Uuid,
    pub entity_code: String,
    pub started_at: DateTime<Utc>,
    pub rec_count: i64,
    pub error_kind: Option<lcp_errors::LoaderErrorKind>,
}

/// Knobs governing one replica's scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval: Duration,
    pub claim_batch_size: i64,
    /// Auto-recovery: fixed at 20 minutes by default, kept configurable
    /// here for tests.
    pub auto_recovery_after: Duration,
    pub borrow_timeout: Duration,
    /// Cancellation & timeouts: exceeding this triggers the executor's
    /// failure path.
    pub run_timeout: Duration,
    pub worker_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            sweep_interval: Duration::from_secs(30),
            claim_batch_size: 20,
            auto_recovery_after: Duration::from_secs(20 * 60),
            borrow_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(300),
            worker_concurrency: 4,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub recovered: i64,
    pub claimed: i64,
}

/// One replica's scheduler. Holds no state that needs to survive a
/// restart — a fresh `Scheduler` picks up wherever the claim query and
/// auto-recovery leave the `loader` table.
pub struct Scheduler {
    pool: PgPool,
    sourcepool: Arc<SourcePoolRegistry>,
    decryptor: Arc<dyn Decryptor>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    /// Loader ids this replica currently holds `RUNNING`, so a graceful
    /// shutdown can release exactly its own claims.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    execution_log: Arc<Mutex<VecDeque<ExecutionLogEntry>>>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        sourcepool: Arc<SourcePoolRegistry>,
        decryptor: Arc<dyn Decryptor>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let worker_concurrency = config.worker_concurrency.max(1);
        Arc::new(Scheduler {
            pool,
            sourcepool,
            decryptor,
            config,
            semaphore: Arc::new(Semaphore::new(worker_concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            execution_log: Arc::new(Mutex::new(VecDeque::with_capacity(EXECUTION_LOG_CAPACITY))),
        })
    }

    /// The most recent execution log entries for `entity_code`, newest
    /// first, capped at `limit`.
    pub async fn recent_executions(&self, entity_code: &str, limit: usize) -> Vec<ExecutionLogEntry> {
        self.execution_log
            .lock()
            .await
            .iter()
            .filter(|e| e.entity_code == entity_code)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Starts the periodic sweep ticker.
    pub fn spawn_sweep_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_sweep().await {
                    tracing::error!(error = %err, "sweep failed");
                }
            }
        })
    }

    /// Runs exactly one sweep: auto-recovers stale `FAILED` rows, claims
    /// eligible `IDLE` rows, and dispatches each to the executor on the
    /// bounded worker pool.
    pub async fn run_sweep(&self) -> Result<SweepReport, LoaderError> {
        let sweep_id = Uuid::new_v4();
        let now = Utc::now();

        let recovered = auto_recover_failed(&self.pool, now, self.config.auto_recovery_after).await?;
        if recovered > 0 {
            tracing::info!(sweep_id = %sweep_id, recovered, "auto-recovered FAILED loaders");
        }

        let claimed = claim_eligible(&self.pool, now, self.config.claim_batch_size).await?;
        tracing::info!(sweep_id = %sweep_id, claimed = claimed.len(), "claimed eligible loaders");

        let claimed_count = claimed.len() as i64;
        for loader in claimed {
            self.in_flight.lock().await.insert(loader.id);
            self.dispatch(sweep_id, loader, now);
        }

        Ok(SweepReport {
            sweep_id,
            recovered,
            claimed: claimed_count,
        })
    }

    /// Spawns one executor run bounded by `run_timeout` and the worker
    /// semaphore. A timed-out run is forced into `FAILED` here, since the
    /// cancelled executor task never reaches its own failure path.
    fn dispatch(&self, sweep_id: Uuid, loader: LoaderRow, now: DateTime<Utc>) {
        let pool = self.pool.clone();
        let sourcepool = Arc::clone(&self.sourcepool);
        let decryptor = Arc::clone(&self.decryptor);
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let execution_log = Arc::clone(&self.execution_log);
        let borrow_timeout = self.config.borrow_timeout;
        let run_timeout = self.config.run_timeout;
        let loader_id = loader.id;
        let entity_code = loader.entity_code.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            let run_id = Uuid::new_v4();

            let result = tokio::time::timeout(
                run_timeout,
                lcp_executor::run_once(&pool, &sourcepool, decryptor.as_ref(), run_id, loader, now, borrow_timeout),
            )
            .await;

            let log_entry = match &result {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        sweep_id = %sweep_id,
                        run_id = %run_id,
                        entity_code = %entity_code,
                        rec_count = outcome.rec_count,
                        error_kind = ?outcome.error_kind,
                        "executor run completed"
                    );
                    Some(ExecutionLogEntry {
                        run_id,
                        sweep_id,
                        entity_code: entity_code.clone(),
                        started_at: now,
                        rec_count: outcome.rec_count,
                        error_kind: outcome.error_kind,
                    })
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        sweep_id = %sweep_id,
                        run_id = %run_id,
                        entity_code = %entity_code,
                        error = %err,
                        "executor run errored outside its own failure path"
                    );
                    Some(ExecutionLogEntry {
                        run_id,
                        sweep_id,
                        entity_code: entity_code.clone(),
                        started_at: now,
                        rec_count: 0,
                        error_kind: Some(err.kind()),
                    })
                }
                Err(_) => {
                    tracing::warn!(
                        sweep_id = %sweep_id,
                        run_id = %run_id,
                        entity_code = %entity_code,
                        "executor run exceeded its wall-clock ceiling"
                    );
                    if let Err(err) = force_fail(&pool, loader_id, Utc::now()).await {
                        tracing::error!(run_id = %run_id, error = %err, "failed to mark timed-out run FAILED");
                    }
                    Some(ExecutionLogEntry {
                        run_id,
                        sweep_id,
                        entity_code: entity_code.clone(),
                        started_at: now,
                        rec_count: 0,
                        error_kind: Some(lcp_errors::LoaderErrorKind::TransientSource),
                    })
                }
            };

            if let Some(entry) = log_entry {
                let mut log = execution_log.lock().await;
                if log.len() == EXECUTION_LOG_CAPACITY {
                    log.pop_back();
                }
                log.push_front(entry);
            }

            in_flight.lock().await.remove(&loader_id);
        });
    }

    /// Resets every loader this replica still holds `RUNNING` back to
    /// `IDLE`.
    pub async fn release_in_flight_to_idle(&self) -> Result<(), LoaderError> {
        let ids: Vec<Uuid> = self.in_flight.lock().await.iter().copied().collect();
        for id in ids {
            release_to_idle(&self.pool, id).await?;
        }
        Ok(())
    }

    /// For observability endpoints: loader ids this replica currently has in flight.
    pub async fn in_flight_ids(&self) -> Vec<Uuid> {
        self.in_flight.lock().await.iter().copied().collect()
    }

    /// Run now: claim `entity_code` immediately, bypassing
    /// `min_interval_seconds`/`max_interval_seconds` but honoring every
    /// other eligibility condition (enabled, ACTIVE, IDLE, parallelism
    /// cap) and the same row lock the sweep uses. Returns `false` if the
    /// loader was not eligible to be claimed (already running, disabled,
    /// not ACTIVE, or over its parallelism cap).
    pub async fn run_now(&self, entity_code: &str) -> Result<bool, LoaderError> {
        let now = Utc::now();
        let Some(loader) = claim_now(&self.pool, entity_code).await? else {
            return Ok(false);
        };
        self.in_flight.lock().await.insert(loader.id);
        self.dispatch(Uuid::new_v4(), loader, now);
        Ok(true)
    }
}

/// Claims `entity_code` right now if it is `ACTIVE`, `enabled`, `IDLE`, and
/// under its parallelism cap — the same predicate as [`claim_eligible`]
/// minus the `min_interval_seconds`/`max_interval_seconds` timing clauses.
async fn claim_now(pool: &PgPool, entity_code: &str) -> Result<Option<LoaderRow>, LoaderError> {
    let sql = format!(
        r#"
        with eligible as (
            select loader.id
            from loader
            where loader.entity_code = $1
              and loader.enabled = true
              and loader.version_status = 'ACTIVE'
              and loader.load_status = 'IDLE'
              and (
                  select count(*) from loader running
                  where running.entity_code = loader.entity_code and running.load_status = 'RUNNING'
              ) < loader.max_parallel_executions
            for update of loader skip locked
        )
        update loader set load_status = 'RUNNING'
        where id in (select id from eligible)
        returning {cols}
        "#,
        cols = lcp_versionstore::SELECT_COLUMNS
    );

    let row = sqlx::query(&sql)
        .bind(entity_code)
        .fetch_optional(pool)
        .await
        .map_err(scheduler_error)?;

    row.as_ref().map(LoaderRow::from_row).transpose().map_err(scheduler_error)
}

/// Claims up to `limit` eligible loaders under `FOR UPDATE SKIP LOCKED`,
/// flipping them to `RUNNING` in the same statement. Two replicas racing
/// this query never claim the same row.
async fn claim_eligible(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<LoaderRow>, LoaderError> {
    let sql = format!(
        r#"
        with eligible as (
            select loader.id
            from loader
            where loader.enabled = true
              and loader.version_status = 'ACTIVE'
              and loader.load_status = 'IDLE'
              and (loader.last_success_timestamp is null
                   or $1 - loader.last_success_timestamp >= make_interval(secs => loader.max_interval_seconds::double precision))
              and (loader.last_success_timestamp is null
                   or $1 - loader.last_success_timestamp >= make_interval(secs => loader.min_interval_seconds::double precision))
              and (
                  select count(*) from loader running
                  where running.entity_code = loader.entity_code and running.load_status = 'RUNNING'
              ) < loader.max_parallel_executions
            order by loader.id
            limit $2
            for update of loader skip locked
        )
        update loader set load_status = 'RUNNING'
        where id in (select id from eligible)
        returning {cols}
        "#,
        cols = lcp_versionstore::SELECT_COLUMNS
    );

    let rows = sqlx::query(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(scheduler_error)?;

    rows.iter()
        .map(LoaderRow::from_row)
        .collect::<Result<_, _>>()
        .map_err(scheduler_error)
}

/// Auto-recovery: every `FAILED` row older than `after` transitions back
/// to `IDLE` with `failed_since` cleared.
async fn auto_recover_failed(pool: &PgPool, now: DateTime<Utc>, after: Duration) -> Result<i64, LoaderError> {
    let after_seconds = after.as_secs() as i64;
    let result = sqlx::query(
        r#"
        update loader
           set load_status = 'IDLE', failed_since = null
         where load_status = 'FAILED'
           and failed_since is not null
           and $1 - failed_since >= make_interval(secs => $2::double precision)
        "#,
    )
    .bind(now)
    .bind(after_seconds)
    .execute(pool)
    .await
    .map_err(scheduler_error)?;

    Ok(result.rows_affected() as i64)
}

async fn force_fail(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<(), LoaderError> {
    sqlx::query("update loader set load_status = 'FAILED', failed_since = $2 where id = $1 and load_status = 'RUNNING'")
        .bind(id)
        .bind(now)
        .execute(pool)
        .await
        .map_err(scheduler_error)?;
    Ok(())
}

async fn release_to_idle(pool: &PgPool, id: Uuid) -> Result<(), LoaderError> {
    sqlx::query("update loader set load_status = 'IDLE' where id = $1 and load_status = 'RUNNING'")
        .bind(id)
        .execute(pool)
        .await
        .map_err(scheduler_error)?;
    Ok(())
}

fn scheduler_error(e: sqlx::Error) -> LoaderError {
    LoaderError::TransientSource {
        source_code: "scheduler".to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_auto_recovery_window() {
        let config = SchedulerConfig::default();
        assert_eq!(config.auto_recovery_after, Duration::from_secs(1200));
    }

    #[test]
    fn default_config_has_at_least_one_worker() {
        let config = SchedulerConfig::default();
        assert!(config.worker_concurrency >= 1);
    }

    #[test]
    fn sweep_report_default_has_zero_counts() {
        let report = SweepReport::default();
        assert_eq!(report.claimed, 0);
        assert_eq!(report.recovered, 0);
    }
}
