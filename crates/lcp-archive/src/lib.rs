//! Archive store.
//!
//! Append-only, keyed by `(entity_code, version_number)`. An archive id is
//! derived from its unique key via `on conflict ... do nothing` plus a
//! fallback read, so the same archive call can be retried safely and never
//! produces a duplicate row, onto a Postgres table sink matching
//! `lcp-versionstore`'s storage model.

use chrono::{DateTime, Utc};
use lcp_errors::LoaderError;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Run embedded migrations (`loader_archive` table and its unique index).
pub async fn migrate(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// One archived snapshot of a prior `Loader` row.
#[derive(Debug, Clone)]
pub struct ArchiveRow {
    pub archive_id: Uuid,
    pub entity_code: String,
    pub version_number: i32,
    pub loader_snapshot: serde_json::Value,
    pub archived_by: String,
    pub archived_at: DateTime<Utc>,
    pub archive_reason: String,
}

impl ArchiveRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ArchiveRow {
            archive_id: row.try_get("archive_id")?,
            entity_code: row.try_get("entity_code")?,
            version_number: row.try_get("version_number")?,
            loader_snapshot: row.try_get("loader_snapshot")?,
            archived_by: row.try_get("archived_by")?,
            archived_at: row.try_get("archived_at")?,
            archive_reason: row.try_get("archive_reason")?,
        })
    }
}

/// Prefix the approval state machine writes on reject.
pub const REJECTED_REASON_PREFIX: &str = "Rejected by ";

/// Archive `snapshot` under `(entity_code, version_number)`. Idempotent:
/// re-archiving the same key returns the existing `archive_id` rather than
/// erroring or duplicating.
pub async fn archive(
    tx: &mut Transaction<'_, Postgres>,
    entity_code: &str,
    version_number: i32,
    snapshot: serde_json::Value,
    archived_by: &str,
    reason: &str,
    archived_at: DateTime<Utc>,
) -> Result<Uuid, LoaderError> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into loader_archive (archive_id, entity_code, version_number, loader_snapshot, archived_by, archived_at, archive_reason)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (entity_code, version_number) do nothing
        returning archive_id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entity_code)
    .bind(version_number)
    .bind(&snapshot)
    .bind(archived_by)
    .bind(archived_at)
    .bind(reason)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    if let Some((id,)) = inserted {
        return Ok(id);
    }

    let (existing,): (Uuid,) = sqlx::query_as(
        "select archive_id from loader_archive where entity_code = $1 and version_number = $2",
    )
    .bind(entity_code)
    .bind(version_number)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    Ok(existing)
}

/// All archived versions of `entity_code`, newest version first.
pub async fn find_by_entity_code(
    pool: &sqlx::PgPool,
    entity_code: &str,
) -> Result<Vec<ArchiveRow>, LoaderError> {
    let rows = sqlx::query(
        "select archive_id, entity_code, version_number, loader_snapshot, archived_by, archived_at, archive_reason \
         from loader_archive where entity_code = $1 order by version_number desc",
    )
    .bind(entity_code)
    .fetch_all(pool)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    rows.iter().map(ArchiveRow::from_row).collect::<Result<_, _>>().map_err(|e| store_error(entity_code, e))
}

pub async fn find_by_entity_code_and_version(
    pool: &sqlx::PgPool,
    entity_code: &str,
    version_number: i32,
) -> Result<Option<ArchiveRow>, LoaderError> {
    let row = sqlx::query(
        "select archive_id, entity_code, version_number, loader_snapshot, archived_by, archived_at, archive_reason \
         from loader_archive where entity_code = $1 and version_number = $2",
    )
    .bind(entity_code)
    .bind(version_number)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    row.as_ref().map(ArchiveRow::from_row).transpose().map_err(|e| store_error(entity_code, e))
}

pub async fn count_by_entity_code(pool: &sqlx::PgPool, entity_code: &str) -> Result<i64, LoaderError> {
    let (n,): (i64,) = sqlx::query_as("select count(*) from loader_archive where entity_code = $1")
        .bind(entity_code)
        .fetch_one(pool)
        .await
        .map_err(|e| store_error(entity_code, e))?;
    Ok(n)
}

pub async fn exists(pool: &sqlx::PgPool, entity_code: &str, version_number: i32) -> Result<bool, LoaderError> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*) from loader_archive where entity_code = $1 and version_number = $2",
    )
    .bind(entity_code)
    .bind(version_number)
    .fetch_one(pool)
    .await
    .map_err(|e| store_error(entity_code, e))?;
    Ok(n > 0)
}

/// Archived versions whose `archive_reason` records a rejection.
pub async fn find_rejected_by_entity_code(
    pool: &sqlx::PgPool,
    entity_code: &str,
) -> Result<Vec<ArchiveRow>, LoaderError> {
    let rows = sqlx::query(
        "select archive_id, entity_code, version_number, loader_snapshot, archived_by, archived_at, archive_reason \
         from loader_archive where entity_code = $1 and archive_reason like $2 order by version_number desc",
    )
    .bind(entity_code)
    .bind(format!("{REJECTED_REASON_PREFIX}%"))
    .fetch_all(pool)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    rows.iter().map(ArchiveRow::from_row).collect::<Result<_, _>>().map_err(|e| store_error(entity_code, e))
}

fn store_error(entity_code: &str, e: sqlx::Error) -> LoaderError {
    LoaderError::TransientSource {
        source_code: entity_code.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_reason_prefix_matches_approval_state_machine_wording() {
        let reason = format!("{REJECTED_REASON_PREFIX}alice: needs a where clause");
        assert!(reason.starts_with(REJECTED_REASON_PREFIX));
    }
}
