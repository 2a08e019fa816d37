//! Signal sink.
//!
//! Persists the aggregated tuples produced by the executor under a
//! loader's `purge_strategy`. `commit_tuples` takes an open `Transaction`
//! so the caller (`lcp-executor`) can advance the watermark in the same
//! transaction — either the full batch commits and the watermark
//! advances, or nothing is persisted.

use chrono::{DateTime, Utc};
use lcp_errors::LoaderError;
use lcp_schemas::{PurgeStrategy, SignalTuple, TimeRange};
use sqlx::{PgPool, Postgres, Transaction};

/// Run embedded migrations (`signals_history`, its range partitions, and
/// the `(loader_code, load_timestamp_utc, segment_code)` unique index).
pub async fn migrate(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Outcome of a `commit_tuples` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOutcome {
    pub inserted: i64,
    pub skipped_duplicates: i64,
}

/// Persist `tuples` for `loader_code` covering `range`, honoring
/// `strategy`. Runs entirely inside `tx`; the caller
/// commits.
pub async fn commit_tuples(
    tx: &mut Transaction<'_, Postgres>,
    loader_code: &str,
    range: TimeRange,
    strategy: PurgeStrategy,
    tuples: &[SignalTuple],
) -> Result<CommitOutcome, LoaderError> {
    match strategy {
        PurgeStrategy::FailOnDuplicate => commit_fail_on_duplicate(tx, loader_code, tuples).await,
        PurgeStrategy::PurgeAndReload => commit_purge_and_reload(tx, loader_code, range, tuples).await,
        PurgeStrategy::SkipDuplicates => commit_skip_duplicates(tx, loader_code, tuples).await,
    }
}

async fn commit_fail_on_duplicate(
    tx: &mut Transaction<'_, Postgres>,
    loader_code: &str,
    tuples: &[SignalTuple],
) -> Result<CommitOutcome, LoaderError> {
    for t in tuples {
        insert_one(tx, t)
            .await
            .map_err(|e| classify(loader_code, e))?;
    }
    Ok(CommitOutcome {
        inserted: tuples.len() as i64,
        skipped_duplicates: 0,
    })
}

async fn commit_purge_and_reload(
    tx: &mut Transaction<'_, Postgres>,
    loader_code: &str,
    range: TimeRange,
    tuples: &[SignalTuple],
) -> Result<CommitOutcome, LoaderError> {
    // Delete signals where load_timestamp_utc falls in [from, to) for this
    // loader_code, then insert the new batch — `to` exclusive (DESIGN.md
    // Open Question decision #2).
    sqlx::query(
        "delete from signals_history where loader_code = $1 and load_timestamp_utc >= $2 and load_timestamp_utc < $3",
    )
    .bind(loader_code)
    .bind(range.from)
    .bind(range.to)
    .execute(&mut **tx)
    .await
    .map_err(|e| classify(loader_code, e))?;

    for t in tuples {
        insert_one(tx, t).await.map_err(|e| classify(loader_code, e))?;
    }

    Ok(CommitOutcome {
        inserted: tuples.len() as i64,
        skipped_duplicates: 0,
    })
}

async fn commit_skip_duplicates(
    tx: &mut Transaction<'_, Postgres>,
    loader_code: &str,
    tuples: &[SignalTuple],
) -> Result<CommitOutcome, LoaderError> {
    let mut outcome = CommitOutcome::default();
    for t in tuples {
        let inserted = sqlx::query(
            r#"
            insert into signals_history
                (loader_code, load_timestamp_utc, segment_code, rec_count, min_val, avg_val, max_val, sum_val)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (loader_code, load_timestamp_utc, segment_code) do nothing
            returning id
            "#,
        )
        .bind(&t.loader_code)
        .bind(t.load_timestamp_utc)
        .bind(&t.segment_code)
        .bind(t.rec_count)
        .bind(t.min_val)
        .bind(t.avg_val)
        .bind(t.max_val)
        .bind(t.sum_val)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| classify(loader_code, e))?;

        if inserted.is_some() {
            outcome.inserted += 1;
        } else {
            outcome.skipped_duplicates += 1;
        }
    }
    Ok(outcome)
}

async fn insert_one(tx: &mut Transaction<'_, Postgres>, t: &SignalTuple) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into signals_history
            (loader_code, load_timestamp_utc, segment_code, rec_count, min_val, avg_val, max_val, sum_val)
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&t.loader_code)
    .bind(t.load_timestamp_utc)
    .bind(&t.segment_code)
    .bind(t.rec_count)
    .bind(t.min_val)
    .bind(t.avg_val)
    .bind(t.max_val)
    .bind(t.sum_val)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Count existing rows in `[from, to)` for `loader_code` — used by tests
/// and by operators diagnosing a `PURGE_AND_RELOAD` run.
pub async fn count_in_range(
    pool: &sqlx::PgPool,
    loader_code: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64, LoaderError> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*) from signals_history where loader_code = $1 and load_timestamp_utc >= $2 and load_timestamp_utc < $3",
    )
    .bind(loader_code)
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
    .map_err(|e| classify(loader_code, e))?;
    Ok(n)
}

fn classify(loader_code: &str, e: sqlx::Error) -> LoaderError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return LoaderError::SinkConflict {
                loader_code: loader_code.to_string(),
                detail: db_err.message().to_string(),
            };
        }
    }
    LoaderError::TransientSource {
        source_code: loader_code.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple(loader_code: &str) -> SignalTuple {
        SignalTuple {
            loader_code: loader_code.to_string(),
            load_timestamp_utc: Utc::now(),
            segment_code: lcp_schemas::DEFAULT_SEGMENT.to_string(),
            rec_count: 10,
            min_val: 1.0,
            avg_val: 5.0,
            max_val: 9.0,
            sum_val: 50.0,
        }
    }

    #[test]
    fn commit_outcome_default_is_zero() {
        let outcome = CommitOutcome::default();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.skipped_duplicates, 0);
    }

    #[test]
    fn sample_tuple_uses_default_segment_when_unspecified() {
        let t = sample_tuple("DAILY_SALES");
        assert_eq!(t.segment_code, "_all_");
    }
}
