//! Loader executor.
//!
//! One invocation = one claimed `ACTIVE` loader row already in
//! `RUNNING`. [`run_once`] does all the deciding and its own persistence
//! (advancing the watermark is part of the same commit as the signal
//! tuples), and returns a [`RunOutcome`] the caller (the scheduler) logs
//! as a structured execution record.

pub mod state_machine;

use chrono::Utc;
use lcp_clock::LoaderSchedule;
use lcp_errors::LoaderError;
use lcp_schemas::{LoadStatus, SignalTuple, TimeRange, DEFAULT_SEGMENT};
use lcp_sourcepool::SourcePoolRegistry;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Decrypts `sql_text` at the point of use. `sql_text` is opaque
/// ciphertext to every other crate in this workspace; the embedder supplies a
/// real implementation, tests use [`NoopDecryptor`].
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, LoaderError>;
}

/// Passthrough decryptor for tests/dev: treats `sql_text` as already
/// being UTF-8 plaintext.
pub struct NoopDecryptor;

impl Decryptor for NoopDecryptor {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, LoaderError> {
        String::from_utf8(ciphertext.to_vec()).map_err(|e| LoaderError::PermanentSource {
            source_code: "sql_text".to_string(),
            detail: format!("not valid utf-8: {e}"),
        })
    }
}

/// Aggregates accumulated for one `(bucket, segment)` during a run.
/// `bucket` here is the run's `to` timestamp — one signal tuple per
/// segment per invocation.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: i64,
    min: f64,
    max: f64,
    sum: f64,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            min: value,
            max: value,
            sum: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Result of one executor invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub loader_code: String,
    pub range: TimeRange,
    pub rec_count: i64,
    pub final_state: state_machine::RunState,
    pub error_kind: Option<lcp_errors::LoaderErrorKind>,
}

/// Run one invocation of `loader` (already claimed: `load_status =
/// RUNNING`). Returns the outcome; on failure, the loader row's
/// `load_status`/`failed_since` have already been persisted as `FAILED`
/// and the watermark is untouched.
#[allow(clippy::too_many_arguments)]
pub async fn run_once(
    pool: &PgPool,
    sourcepool: &SourcePoolRegistry,
    decryptor: &dyn Decryptor,
    run_id: Uuid,
    mut loader: lcp_versionstore::LoaderRow,
    now: chrono::DateTime<Utc>,
    borrow_timeout: Duration,
) -> Result<RunOutcome, LoaderError> {
    let loader_code = loader.entity_code.clone();

    let schedule = LoaderSchedule {
        last_load_timestamp: loader.last_load_timestamp,
        max_query_period_seconds: loader.max_query_period_seconds,
        source_timezone_offset_hours: loader.source_timezone_offset_hours,
    };
    let computed = lcp_clock::next_range(now, &schedule);

    tracing::info!(
        run_id = %run_id,
        entity_code = %loader_code,
        version_number = loader.version_number,
        from = %computed.utc.from,
        to = %computed.utc.to,
        "run_start"
    );

    match execute(
        pool,
        sourcepool,
        decryptor,
        &mut loader,
        computed.utc,
        computed.source_bind,
        now,
        borrow_timeout,
    )
    .await
    {
        Ok(rec_count) => {
            let final_state =
                state_machine::apply(state_machine::RunState::Running, &state_machine::RunEvent::Completed)
                    .expect("RUNNING always accepts Completed");
            tracing::info!(
                run_id = %run_id,
                entity_code = %loader_code,
                version_number = loader.version_number,
                rec_count,
                "run_success"
            );
            Ok(RunOutcome {
                run_id,
                loader_code,
                range: computed.utc,
                rec_count,
                final_state,
                error_kind: None,
            })
        }
        Err(err) => {
            mark_failed(pool, &mut loader, now).await?;
            let final_state =
                state_machine::apply(state_machine::RunState::Running, &state_machine::RunEvent::Failed {
                    detail: err.to_string(),
                })
                .expect("RUNNING always accepts Failed");
            tracing::error!(
                run_id = %run_id,
                entity_code = %loader_code,
                version_number = loader.version_number,
                error_kind = ?err.kind(),
                error = %err,
                "run_failure"
            );
            Ok(RunOutcome {
                run_id,
                loader_code,
                range: computed.utc,
                rec_count: 0,
                final_state,
                error_kind: Some(err.kind()),
            })
        }
    }
}

async fn execute(
    pool: &PgPool,
    sourcepool: &SourcePoolRegistry,
    decryptor: &dyn Decryptor,
    loader: &mut lcp_versionstore::LoaderRow,
    range: TimeRange,
    source_bind: TimeRange,
    now: chrono::DateTime<Utc>,
    borrow_timeout: Duration,
) -> Result<i64, LoaderError> {
    let sql_text = decryptor.decrypt(&loader.sql_text)?;

    let mut handle = sourcepool
        .borrow(&loader.source_db_ref, borrow_timeout)
        .await
        .map_err(|e| e.to_loader_error(&loader.source_db_ref))?;

    let rows_result = handle.stream_rows(&sql_text, source_bind).await;
    sourcepool.release(handle);
    let rows = rows_result.map_err(|e| e.to_loader_error(&loader.source_db_ref))?;

    // Rows past `to` are discarded; watermark capped at `to`.
    let kept: Vec<_> = rows.into_iter().filter(|r| r.ts < range.to).collect();

    let mut buckets: HashMap<String, Accumulator> = HashMap::new();
    let mut max_observed = range.from;
    for row in &kept {
        if row.ts > max_observed {
            max_observed = row.ts;
        }
        let segment = row.segment.clone().unwrap_or_else(|| DEFAULT_SEGMENT.to_string());
        buckets
            .entry(segment)
            .and_modify(|acc| acc.push(row.value))
            .or_insert_with(|| Accumulator::new(row.value));
    }

    let tuples: Vec<SignalTuple> = buckets
        .into_iter()
        .map(|(segment_code, acc)| SignalTuple {
            loader_code: loader.entity_code.clone(),
            load_timestamp_utc: max_observed,
            segment_code,
            rec_count: acc.count,
            min_val: acc.min,
            avg_val: acc.avg(),
            max_val: acc.max,
            sum_val: acc.sum,
        })
        .collect();

    let mut tx = pool.begin().await.map_err(|e| LoaderError::TransientSource {
        source_code: loader.source_db_ref.clone(),
        detail: e.to_string(),
    })?;

    lcp_signals::commit_tuples(&mut tx, &loader.entity_code, range, loader.purge_strategy, &tuples).await?;

    // max(observed, from) when rows were seen (late data still advances at
    // least to `from`); `to` on an empty result so catch-up proceeds
    // through data-quiet periods.
    loader.last_load_timestamp = Some(if kept.is_empty() { range.to } else { max_observed });
    loader.last_success_timestamp = Some(now);
    loader.failed_since = None;
    loader.load_status = LoadStatus::Idle;
    loader.consecutive_zero_record_runs = if kept.is_empty() {
        loader.consecutive_zero_record_runs + 1
    } else {
        0
    };

    lcp_versionstore::save(&mut *tx, loader).await?;

    tx.commit().await.map_err(|e| LoaderError::TransientSource {
        source_code: loader.source_db_ref.clone(),
        detail: e.to_string(),
    })?;

    Ok(kept.len() as i64)
}

async fn mark_failed(
    pool: &PgPool,
    loader: &mut lcp_versionstore::LoaderRow,
    now: chrono::DateTime<Utc>,
) -> Result<(), LoaderError> {
    loader.load_status = LoadStatus::Failed;
    loader.failed_since = Some(now);
    lcp_versionstore::save(pool, loader).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_decryptor_roundtrips_utf8() {
        let d = NoopDecryptor;
        let out = d.decrypt(b"select 1").unwrap();
        assert_eq!(out, "select 1");
    }

    #[test]
    fn noop_decryptor_rejects_non_utf8() {
        let d = NoopDecryptor;
        let err = d.decrypt(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert_eq!(err.kind(), lcp_errors::LoaderErrorKind::PermanentSource);
    }

    #[test]
    fn accumulator_tracks_min_max_sum_avg() {
        let mut acc = Accumulator::new(10.0);
        acc.push(20.0);
        acc.push(0.0);
        assert_eq!(acc.count, 3);
        assert_eq!(acc.min, 0.0);
        assert_eq!(acc.max, 20.0);
        assert_eq!(acc.sum, 30.0);
        assert!((acc.avg() - 10.0).abs() < f64::EPSILON);
    }
}
