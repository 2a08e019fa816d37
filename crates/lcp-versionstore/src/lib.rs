//! Version store.
//!
//! Exclusive owner of all `Loader` rows. The partial unique indexes in
//! `migrations/` enforce "one ACTIVE + one draft per `entity_code`"
//! atomically; this crate never re-derives that invariant in Rust, it
//! relies on the constraint and maps its violation to
//! `LoaderError::IntegrityViolation`.
//!
//! Decoding uses manual `Row::try_get` per field rather than
//! `derive(FromRow)`, because `version_status` / `load_status` /
//! `purge_strategy` round-trip through `lcp_schemas`'s
//! `as_db_str`/`from_db_str` rather than a 1:1 sqlx type.

use chrono::{DateTime, Utc};
use lcp_errors::LoaderError;
use lcp_schemas::{LoadStatus, PurgeStrategy, VersionStatus};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// A persisted `Loader` row.
#[derive(Debug, Clone)]
pub struct LoaderRow {
    pub id: Uuid,
    pub entity_code: String,
    pub version_number: i32,
    pub version_status: VersionStatus,
    pub parent_version_id: Option<Uuid>,

    pub source_db_ref: String,
    pub sql_text: Vec<u8>,

    pub min_interval_seconds: i64,
    pub max_interval_seconds: i64,
    pub max_query_period_seconds: i64,
    pub max_parallel_executions: i32,

    pub source_timezone_offset_hours: i32,

    pub load_status: LoadStatus,
    pub last_load_timestamp: Option<DateTime<Utc>>,
    pub last_success_timestamp: Option<DateTime<Utc>>,
    pub failed_since: Option<DateTime<Utc>>,
    pub consecutive_zero_record_runs: i64,

    pub purge_strategy: PurgeStrategy,
    pub enabled: bool,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub modified_by: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,

    pub change_type: Option<String>,
    pub change_summary: Option<serde_json::Value>,
    pub import_label: Option<String>,
}

impl LoaderRow {
    /// Public so `lcp-scheduler` can decode the rows returned by its own
    /// claim query without duplicating this mapping.
    pub fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let version_status_str: String = row.try_get("version_status")?;
        let load_status_str: String = row.try_get("load_status")?;
        let purge_strategy_str: String = row.try_get("purge_strategy")?;

        Ok(LoaderRow {
            id: row.try_get("id")?,
            entity_code: row.try_get("entity_code")?,
            version_number: row.try_get("version_number")?,
            version_status: VersionStatus::from_db_str(&version_status_str).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown version_status {version_status_str}").into())
            })?,
            parent_version_id: row.try_get("parent_version_id")?,
            source_db_ref: row.try_get("source_db_ref")?,
            sql_text: row.try_get("sql_text")?,
            min_interval_seconds: row.try_get("min_interval_seconds")?,
            max_interval_seconds: row.try_get("max_interval_seconds")?,
            max_query_period_seconds: row.try_get("max_query_period_seconds")?,
            max_parallel_executions: row.try_get("max_parallel_executions")?,
            source_timezone_offset_hours: row.try_get("source_timezone_offset_hours")?,
            load_status: LoadStatus::from_db_str(&load_status_str).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown load_status {load_status_str}").into())
            })?,
            last_load_timestamp: row.try_get("last_load_timestamp")?,
            last_success_timestamp: row.try_get("last_success_timestamp")?,
            failed_since: row.try_get("failed_since")?,
            consecutive_zero_record_runs: row.try_get("consecutive_zero_record_runs")?,
            purge_strategy: PurgeStrategy::from_db_str(&purge_strategy_str).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown purge_strategy {purge_strategy_str}").into())
            })?,
            enabled: row.try_get("enabled")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            modified_by: row.try_get("modified_by")?,
            modified_at: row.try_get("modified_at")?,
            approved_by: row.try_get("approved_by")?,
            approved_at: row.try_get("approved_at")?,
            rejected_by: row.try_get("rejected_by")?,
            rejected_at: row.try_get("rejected_at")?,
            rejection_reason: row.try_get("rejection_reason")?,
            change_type: row.try_get("change_type")?,
            change_summary: row.try_get("change_summary")?,
            import_label: row.try_get("import_label")?,
        })
    }
}

/// Public for the same reason as [`LoaderRow::from_row`]: `lcp-scheduler`'s
/// claim query projects the same columns in the same order.
pub const SELECT_COLUMNS: &str = r#"
    id, entity_code, version_number, version_status, parent_version_id,
    source_db_ref, sql_text,
    min_interval_seconds, max_interval_seconds, max_query_period_seconds, max_parallel_executions,
    source_timezone_offset_hours,
    load_status, last_load_timestamp, last_success_timestamp, failed_since, consecutive_zero_record_runs,
    purge_strategy, enabled,
    created_by, created_at, modified_by, modified_at,
    approved_by, approved_at, rejected_by, rejected_at, rejection_reason,
    change_type, change_summary, import_label
"#;

/// Run embedded migrations (source_database, loader, partial unique indexes).
pub async fn migrate(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// The single `ACTIVE` row for `entity_code`, if any.
/// Generic over `PgExecutor` (like [`save`]) so `lcp-approval` can call it
/// inside the same transaction that archives and replaces that row.
pub async fn find_active<'e, E>(executor: E, entity_code: &str) -> Result<Option<LoaderRow>, LoaderError>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!("select {SELECT_COLUMNS} from loader where entity_code = $1 and version_status = 'ACTIVE'");
    let row = sqlx::query(&sql)
        .bind(entity_code)
        .fetch_optional(executor)
        .await
        .map_err(|e| store_error(entity_code, e))?;
    row.as_ref().map(LoaderRow::from_row).transpose().map_err(|e| store_error(entity_code, e))
}

/// The single `DRAFT`-or-`PENDING_APPROVAL` row for `entity_code`, if any.
pub async fn find_draft(pool: &PgPool, entity_code: &str) -> Result<Option<LoaderRow>, LoaderError> {
    let sql = format!(
        "select {SELECT_COLUMNS} from loader where entity_code = $1 and version_status in ('DRAFT','PENDING_APPROVAL')"
    );
    let row = sqlx::query(&sql)
        .bind(entity_code)
        .fetch_optional(pool)
        .await
        .map_err(|e| store_error(entity_code, e))?;
    row.as_ref().map(LoaderRow::from_row).transpose().map_err(|e| store_error(entity_code, e))
}

/// Read-only projection over every `loader` row matching the given
/// filters, ordered alphabetically by `entity_code`. `search` matches
/// case-insensitively against `entity_code`.
pub async fn list_filtered(
    pool: &PgPool,
    version_status: Option<VersionStatus>,
    enabled: Option<bool>,
    search: Option<&str>,
) -> Result<Vec<LoaderRow>, LoaderError> {
    let sql = format!(
        "select {SELECT_COLUMNS} from loader \
         where ($1::text is null or version_status = $1) \
           and ($2::bool is null or enabled = $2) \
           and ($3::text is null or entity_code ilike $3) \
         order by entity_code"
    );
    let rows = sqlx::query(&sql)
        .bind(version_status.map(|s| s.as_db_str()))
        .bind(enabled)
        .bind(search.map(|s| format!("%{s}%")))
        .fetch_all(pool)
        .await
        .map_err(|e| store_error("loader", e))?;

    rows.iter().map(LoaderRow::from_row).collect::<Result<_, _>>().map_err(|e| store_error("loader", e))
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<LoaderRow>, LoaderError> {
    let sql = format!("select {SELECT_COLUMNS} from loader where id = $1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| store_error(&id.to_string(), e))?;
    row.as_ref()
        .map(LoaderRow::from_row)
        .transpose()
        .map_err(|e| store_error(&id.to_string(), e))
}

/// Upsert `row` by `id`.
pub async fn save<'e, E>(executor: E, row: &LoaderRow) -> Result<(), LoaderError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        insert into loader (
            id, entity_code, version_number, version_status, parent_version_id,
            source_db_ref, sql_text,
            min_interval_seconds, max_interval_seconds, max_query_period_seconds, max_parallel_executions,
            source_timezone_offset_hours,
            load_status, last_load_timestamp, last_success_timestamp, failed_since, consecutive_zero_record_runs,
            purge_strategy, enabled,
            created_by, created_at, modified_by, modified_at,
            approved_by, approved_at, rejected_by, rejected_at, rejection_reason,
            change_type, change_summary, import_label
        ) values (
            $1, $2, $3, $4, $5,
            $6, $7,
            $8, $9, $10, $11,
            $12,
            $13, $14, $15, $16, $17,
            $18, $19,
            $20, $21, $22, $23,
            $24, $25, $26, $27, $28,
            $29, $30, $31
        )
        on conflict (id) do update set
            version_status = excluded.version_status,
            source_db_ref = excluded.source_db_ref,
            sql_text = excluded.sql_text,
            min_interval_seconds = excluded.min_interval_seconds,
            max_interval_seconds = excluded.max_interval_seconds,
            max_query_period_seconds = excluded.max_query_period_seconds,
            max_parallel_executions = excluded.max_parallel_executions,
            source_timezone_offset_hours = excluded.source_timezone_offset_hours,
            load_status = excluded.load_status,
            last_load_timestamp = excluded.last_load_timestamp,
            last_success_timestamp = excluded.last_success_timestamp,
            failed_since = excluded.failed_since,
            consecutive_zero_record_runs = excluded.consecutive_zero_record_runs,
            purge_strategy = excluded.purge_strategy,
            enabled = excluded.enabled,
            modified_by = excluded.modified_by,
            modified_at = excluded.modified_at,
            approved_by = excluded.approved_by,
            approved_at = excluded.approved_at,
            rejected_by = excluded.rejected_by,
            rejected_at = excluded.rejected_at,
            rejection_reason = excluded.rejection_reason,
            change_type = excluded.change_type,
            change_summary = excluded.change_summary,
            import_label = excluded.import_label
        "#,
    )
    .bind(row.id)
    .bind(&row.entity_code)
    .bind(row.version_number)
    .bind(row.version_status.as_db_str())
    .bind(row.parent_version_id)
    .bind(&row.source_db_ref)
    .bind(&row.sql_text)
    .bind(row.min_interval_seconds)
    .bind(row.max_interval_seconds)
    .bind(row.max_query_period_seconds)
    .bind(row.max_parallel_executions)
    .bind(row.source_timezone_offset_hours)
    .bind(row.load_status.as_db_str())
    .bind(row.last_load_timestamp)
    .bind(row.last_success_timestamp)
    .bind(row.failed_since)
    .bind(row.consecutive_zero_record_runs)
    .bind(row.purge_strategy.as_db_str())
    .bind(row.enabled)
    .bind(&row.created_by)
    .bind(row.created_at)
    .bind(&row.modified_by)
    .bind(row.modified_at)
    .bind(&row.approved_by)
    .bind(row.approved_at)
    .bind(&row.rejected_by)
    .bind(row.rejected_at)
    .bind(&row.rejection_reason)
    .bind(&row.change_type)
    .bind(&row.change_summary)
    .bind(&row.import_label)
    .execute(executor)
    .await
    .map_err(|e| store_error(&row.entity_code, e))?;

    Ok(())
}

/// Generic over `PgExecutor` for the same reason as [`find_active`]: an
/// `approve` deletes the prior `ACTIVE` row in the same transaction that
/// installs its replacement.
pub async fn delete<'e, E>(executor: E, id: Uuid) -> Result<(), LoaderError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("delete from loader where id = $1")
        .bind(id)
        .execute(executor)
        .await
        .map_err(|e| store_error(&id.to_string(), e))?;
    Ok(())
}

/// `max(version_number)` across main + archive for `entity_code`, or 1 if
/// none exists yet.
pub async fn next_version_number(pool: &PgPool, entity_code: &str) -> Result<i32, LoaderError> {
    let row: (Option<i32>,) = sqlx::query_as(
        r#"
        select max(v) from (
            select max(version_number) as v from loader where entity_code = $1
            union all
            select max(version_number) as v from loader_archive where entity_code = $1
        ) combined
        "#,
    )
    .bind(entity_code)
    .fetch_one(pool)
    .await
    .map_err(|e| store_error(entity_code, e))?;

    Ok(row.0.unwrap_or(0) + 1)
}

/// Registered source database connection parameters, needed to resolve
/// `source_db_ref`. Passwords are never stored here — callers resolve
/// them via `lcp_config::secrets::resolve_source_password`.
#[derive(Debug, Clone)]
pub struct SourceDatabaseRow {
    pub source_code: String,
    pub host: String,
    pub port: i32,
    pub db_name: String,
    pub dialect: lcp_schemas::Dialect,
    pub username: String,
    pub read_only_verified: bool,
}

pub async fn list_source_databases(pool: &PgPool) -> Result<Vec<SourceDatabaseRow>, LoaderError> {
    let rows = sqlx::query(
        "select source_code, host, port, db_name, dialect, username, read_only_verified from source_database",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| store_error("source_database", e))?;

    rows.into_iter()
        .map(|row| {
            let dialect_str: String = row
                .try_get("dialect")
                .map_err(|e| store_error("source_database", e))?;
            let dialect = lcp_schemas::Dialect::from_db_str(&dialect_str).ok_or_else(|| {
                LoaderError::IntegrityViolation {
                    entity_code: "source_database".to_string(),
                    detail: format!("unknown dialect {dialect_str}"),
                }
            })?;
            Ok(SourceDatabaseRow {
                source_code: row.try_get("source_code").map_err(|e| store_error("source_database", e))?,
                host: row.try_get("host").map_err(|e| store_error("source_database", e))?,
                port: row.try_get("port").map_err(|e| store_error("source_database", e))?,
                db_name: row.try_get("db_name").map_err(|e| store_error("source_database", e))?,
                dialect,
                username: row.try_get("username").map_err(|e| store_error("source_database", e))?,
                read_only_verified: row
                    .try_get("read_only_verified")
                    .map_err(|e| store_error("source_database", e))?,
            })
        })
        .collect()
}

fn store_error(entity_code: &str, e: sqlx::Error) -> LoaderError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return LoaderError::IntegrityViolation {
                entity_code: entity_code.to_string(),
                detail: db_err.message().to_string(),
            };
        }
    }
    LoaderError::TransientSource {
        source_code: entity_code.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_columns_lists_every_loader_row_field() {
        // Every field on `LoaderRow` must have a corresponding column name
        // in `SELECT_COLUMNS`, or `from_row` would panic on a real query.
        for field in [
            "id", "entity_code", "version_number", "version_status", "parent_version_id",
            "source_db_ref", "sql_text", "min_interval_seconds", "max_interval_seconds",
            "max_query_period_seconds", "max_parallel_executions", "source_timezone_offset_hours",
            "load_status", "last_load_timestamp", "last_success_timestamp", "failed_since",
            "consecutive_zero_record_runs", "purge_strategy", "enabled", "created_by", "created_at",
            "modified_by", "modified_at", "approved_by", "approved_at", "rejected_by", "rejected_at",
            "rejection_reason", "change_type", "change_summary", "import_label",
        ] {
            assert!(
                SELECT_COLUMNS.contains(field),
                "SELECT_COLUMNS is missing {field}"
            );
        }
    }
}
