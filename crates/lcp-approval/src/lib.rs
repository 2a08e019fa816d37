//! Approval state machine.
//!
//! Mutates only `DRAFT`/`PENDING_APPROVAL` rows, and promotes one to
//! `ACTIVE` transactionally with archival of the prior `ACTIVE`. The
//! scheduler and this crate write disjoint row sets by construction —
//! neither ever needs to coordinate with the other beyond the partial
//! unique indexes `lcp-versionstore` owns.
//!
//! Plain functions that take a state and an intent and either return
//! the next state or a typed rejection, with all persistence happening
//! in the caller-visible transaction rather than hidden inside the
//! transition function.

use chrono::{DateTime, Utc};
use lcp_errors::LoaderError;
use lcp_schemas::{LoadStatus, PurgeStrategy, VersionStatus};
use lcp_versionstore::LoaderRow;
use sqlx::PgPool;
use uuid::Uuid;

/// The fields an operator can set on a draft.
#[derive(Debug, Clone)]
pub struct DraftPayload {
    pub source_db_ref: String,
    pub sql_text: Vec<u8>,
    pub min_interval_seconds: i64,
    pub max_interval_seconds: i64,
    pub max_query_period_seconds: i64,
    pub max_parallel_executions: i32,
    pub source_timezone_offset_hours: i32,
    pub purge_strategy: PurgeStrategy,
    pub enabled: bool,
}

/// `create_draft`: overwrite-in-place if a draft already
/// exists (drafts are cumulative), else create a fresh `DRAFT` row.
pub async fn create_draft(
    pool: &PgPool,
    entity_code: &str,
    payload: DraftPayload,
    user: &str,
    change_type: Option<String>,
    import_label: Option<String>,
    now: DateTime<Utc>,
) -> Result<LoaderRow, LoaderError> {
    if let Some(mut existing) = lcp_versionstore::find_draft(pool, entity_code).await? {
        apply_payload(&mut existing, payload);
        existing.modified_by = Some(user.to_string());
        existing.modified_at = Some(now);
        existing.change_type = change_type;
        existing.import_label = import_label;
        lcp_versionstore::save(pool, &existing).await?;
        tracing::info!(
            entity_code = %existing.entity_code,
            version_number = existing.version_number,
            actor = %user,
            "draft_created"
        );
        return Ok(existing);
    }

    let active = lcp_versionstore::find_active(pool, entity_code).await?;
    let version_number = lcp_versionstore::next_version_number(pool, entity_code).await?;

    let mut row = LoaderRow {
        id: Uuid::new_v4(),
        entity_code: entity_code.to_string(),
        version_number,
        version_status: VersionStatus::Draft,
        parent_version_id: active.map(|a| a.id),
        source_db_ref: String::new(),
        sql_text: Vec::new(),
        min_interval_seconds: 0,
        max_interval_seconds: 0,
        max_query_period_seconds: 0,
        max_parallel_executions: 1,
        source_timezone_offset_hours: 0,
        load_status: LoadStatus::Idle,
        last_load_timestamp: None,
        last_success_timestamp: None,
        failed_since: None,
        consecutive_zero_record_runs: 0,
        purge_strategy: PurgeStrategy::FailOnDuplicate,
        enabled: true,
        created_by: user.to_string(),
        created_at: now,
        modified_by: None,
        modified_at: None,
        approved_by: None,
        approved_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
        change_type,
        change_summary: None,
        import_label,
    };
    apply_payload(&mut row, payload);

    lcp_versionstore::save(pool, &row).await?;
    tracing::info!(
        entity_code = %row.entity_code,
        version_number = row.version_number,
        actor = %user,
        "draft_created"
    );
    Ok(row)
}

/// `update_draft`: legal only when `DRAFT`.
pub async fn update_draft(
    pool: &PgPool,
    draft_id: Uuid,
    payload: DraftPayload,
    user: &str,
    now: DateTime<Utc>,
) -> Result<LoaderRow, LoaderError> {
    let mut row = get_draft_row(pool, draft_id).await?;
    require_status(&row, VersionStatus::Draft)?;

    apply_payload(&mut row, payload);
    row.modified_by = Some(user.to_string());
    row.modified_at = Some(now);

    lcp_versionstore::save(pool, &row).await?;
    Ok(row)
}

/// `submit`: legal only when `DRAFT`; moves to
/// `PENDING_APPROVAL`.
pub async fn submit(pool: &PgPool, draft_id: Uuid, user: &str, now: DateTime<Utc>) -> Result<LoaderRow, LoaderError> {
    let mut row = get_draft_row(pool, draft_id).await?;
    require_status(&row, VersionStatus::Draft)?;

    row.version_status = VersionStatus::PendingApproval;
    row.modified_by = Some(user.to_string());
    row.modified_at = Some(now);

    lcp_versionstore::save(pool, &row).await?;
    tracing::info!(
        entity_code = %row.entity_code,
        version_number = row.version_number,
        actor = %user,
        "draft_submitted"
    );
    Ok(row)
}

/// `approve`: legal only when `PENDING_APPROVAL`. Archives
/// the prior `ACTIVE` (if any) and deletes it, installs the draft as the
/// new `ACTIVE`, and carries its watermark forward — all in one
/// transaction, so the scheduler never observes zero or two `ACTIVE` rows
/// for this `entity_code`.
pub async fn approve(
    pool: &PgPool,
    draft_id: Uuid,
    admin: &str,
    comments: &str,
    now: DateTime<Utc>,
) -> Result<LoaderRow, LoaderError> {
    let mut row = get_draft_row(pool, draft_id).await?;
    require_status(&row, VersionStatus::PendingApproval)?;

    let mut tx = pool.begin().await.map_err(|e| tx_error(&row.entity_code, e))?;

    let prior_active = lcp_versionstore::find_active(&mut *tx, &row.entity_code).await?;
    let mut carried_watermark = None;
    if let Some(prior) = &prior_active {
        carried_watermark = prior.last_load_timestamp;
        let snapshot = snapshot_json(prior)?;
        lcp_archive::archive(
            &mut tx,
            &prior.entity_code,
            prior.version_number,
            snapshot,
            admin,
            &format!("Replaced by version {}", row.version_number),
            now,
        )
        .await?;
        lcp_versionstore::delete(&mut *tx, prior.id).await?;
    }

    row.version_status = VersionStatus::Active;
    row.approved_by = Some(admin.to_string());
    row.approved_at = Some(now);
    row.change_summary = Some(append_comment(&row.change_summary, comments));
    row.load_status = LoadStatus::Idle;
    row.last_load_timestamp = carried_watermark;
    row.last_success_timestamp = None;
    row.failed_since = None;
    row.consecutive_zero_record_runs = 0;

    lcp_versionstore::save(&mut *tx, &row).await?;
    tx.commit().await.map_err(|e| tx_error(&row.entity_code, e))?;

    tracing::info!(
        entity_code = %row.entity_code,
        version_number = row.version_number,
        actor = %admin,
        "approved"
    );
    Ok(row)
}

/// `reject`: legal only when `PENDING_APPROVAL`; `reason`
/// must be non-empty. Archives the draft (not deleted from the active
/// row set, since a rejected draft never was `ACTIVE`) with a
/// `"Rejected by <admin>: <reason>"` reason and deletes it from the main
/// store. Rejected drafts cannot be resubmitted — a new draft must be
/// created.
pub async fn reject(
    pool: &PgPool,
    draft_id: Uuid,
    admin: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), LoaderError> {
    if reason.trim().is_empty() {
        return Err(LoaderError::InvalidTransition {
            entity_code: draft_id.to_string(),
            detail: "rejection reason must be non-empty".to_string(),
        });
    }

    let mut row = get_draft_row(pool, draft_id).await?;
    require_status(&row, VersionStatus::PendingApproval)?;

    row.rejected_by = Some(admin.to_string());
    row.rejected_at = Some(now);
    row.rejection_reason = Some(reason.to_string());

    let mut tx = pool.begin().await.map_err(|e| tx_error(&row.entity_code, e))?;

    let snapshot = snapshot_json(&row)?;
    lcp_archive::archive(
        &mut tx,
        &row.entity_code,
        row.version_number,
        snapshot,
        admin,
        &format!("{}{}: {}", lcp_archive::REJECTED_REASON_PREFIX, admin, reason),
        now,
    )
    .await?;
    lcp_versionstore::delete(&mut *tx, row.id).await?;

    tx.commit().await.map_err(|e| tx_error(&row.entity_code, e))?;
    tracing::info!(
        entity_code = %row.entity_code,
        version_number = row.version_number,
        actor = %admin,
        "rejected"
    );
    Ok(())
}

fn apply_payload(row: &mut LoaderRow, payload: DraftPayload) {
    row.source_db_ref = payload.source_db_ref;
    row.sql_text = payload.sql_text;
    row.min_interval_seconds = payload.min_interval_seconds;
    row.max_interval_seconds = payload.max_interval_seconds;
    row.max_query_period_seconds = payload.max_query_period_seconds;
    row.max_parallel_executions = payload.max_parallel_executions;
    row.source_timezone_offset_hours = payload.source_timezone_offset_hours;
    row.purge_strategy = payload.purge_strategy;
    row.enabled = payload.enabled;
}

async fn get_draft_row(pool: &PgPool, draft_id: Uuid) -> Result<LoaderRow, LoaderError> {
    lcp_versionstore::find_by_id(pool, draft_id)
        .await?
        .ok_or_else(|| LoaderError::NotFound {
            what: format!("loader draft {draft_id}"),
        })
}

fn require_status(row: &LoaderRow, expected: VersionStatus) -> Result<(), LoaderError> {
    if row.version_status == expected {
        Ok(())
    } else {
        Err(LoaderError::InvalidTransition {
            entity_code: row.entity_code.clone(),
            detail: format!("expected {:?}, found {:?}", expected, row.version_status),
        })
    }
}

fn append_comment(existing: &Option<serde_json::Value>, comments: &str) -> serde_json::Value {
    let mut list: Vec<serde_json::Value> = match existing {
        Some(serde_json::Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    };
    if !comments.trim().is_empty() {
        list.push(serde_json::Value::String(comments.to_string()));
    }
    serde_json::Value::Array(list)
}

fn snapshot_json(row: &LoaderRow) -> Result<serde_json::Value, LoaderError> {
    serde_json::to_value(LoaderSnapshot::from(row)).map_err(|e| LoaderError::IntegrityViolation {
        entity_code: row.entity_code.clone(),
        detail: format!("failed to snapshot loader row: {e}"),
    })
}

fn tx_error(entity_code: &str, e: sqlx::Error) -> LoaderError {
    LoaderError::TransientSource {
        source_code: entity_code.to_string(),
        detail: e.to_string(),
    }
}

/// Serializable mirror of `LoaderRow`, used only as the `loader_snapshot`
/// jsonb payload. `sql_text` round-trips as a plain byte
/// array (serde's default `Vec<u8>` encoding); everything else maps 1:1.
#[derive(serde::Serialize)]
struct LoaderSnapshot {
    id: Uuid,
    entity_code: String,
    version_number: i32,
    version_status: &'static str,
    parent_version_id: Option<Uuid>,
    source_db_ref: String,
    sql_text: Vec<u8>,
    min_interval_seconds: i64,
    max_interval_seconds: i64,
    max_query_period_seconds: i64,
    max_parallel_executions: i32,
    source_timezone_offset_hours: i32,
    load_status: &'static str,
    last_load_timestamp: Option<DateTime<Utc>>,
    last_success_timestamp: Option<DateTime<Utc>>,
    failed_since: Option<DateTime<Utc>>,
    consecutive_zero_record_runs: i64,
    purge_strategy: &'static str,
    enabled: bool,
    created_by: String,
    created_at: DateTime<Utc>,
    modified_by: Option<String>,
    modified_at: Option<DateTime<Utc>>,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    rejected_by: Option<String>,
    rejected_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    change_type: Option<String>,
    change_summary: Option<serde_json::Value>,
    import_label: Option<String>,
}

impl From<&LoaderRow> for LoaderSnapshot {
    fn from(row: &LoaderRow) -> Self {
        LoaderSnapshot {
            id: row.id,
            entity_code: row.entity_code.clone(),
            version_number: row.version_number,
            version_status: row.version_status.as_db_str(),
            parent_version_id: row.parent_version_id,
            source_db_ref: row.source_db_ref.clone(),
            sql_text: row.sql_text.clone(),
            min_interval_seconds: row.min_interval_seconds,
            max_interval_seconds: row.max_interval_seconds,
            max_query_period_seconds: row.max_query_period_seconds,
            max_parallel_executions: row.max_parallel_executions,
            source_timezone_offset_hours: row.source_timezone_offset_hours,
            load_status: row.load_status.as_db_str(),
            last_load_timestamp: row.last_load_timestamp,
            last_success_timestamp: row.last_success_timestamp,
            failed_since: row.failed_since,
            consecutive_zero_record_runs: row.consecutive_zero_record_runs,
            purge_strategy: row.purge_strategy.as_db_str(),
            enabled: row.enabled,
            created_by: row.created_by.clone(),
            created_at: row.created_at,
            modified_by: row.modified_by.clone(),
            modified_at: row.modified_at,
            approved_by: row.approved_by.clone(),
            approved_at: row.approved_at,
            rejected_by: row.rejected_by.clone(),
            rejected_at: row.rejected_at,
            rejection_reason: row.rejection_reason.clone(),
            change_type: row.change_type.clone(),
            change_summary: row.change_summary.clone(),
            import_label: row.import_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> DraftPayload {
        DraftPayload {
            source_db_ref: "SRC1".to_string(),
            sql_text: b"select ts, value from readings".to_vec(),
            min_interval_seconds: 60,
            max_interval_seconds: 3600,
            max_query_period_seconds: 900,
            max_parallel_executions: 1,
            source_timezone_offset_hours: 0,
            purge_strategy: PurgeStrategy::SkipDuplicates,
            enabled: true,
        }
    }

    fn sample_row(status: VersionStatus) -> LoaderRow {
        LoaderRow {
            id: Uuid::new_v4(),
            entity_code: "DAILY_SALES".to_string(),
            version_number: 1,
            version_status: status,
            parent_version_id: None,
            source_db_ref: "SRC1".to_string(),
            sql_text: b"select 1".to_vec(),
            min_interval_seconds: 60,
            max_interval_seconds: 3600,
            max_query_period_seconds: 900,
            max_parallel_executions: 1,
            source_timezone_offset_hours: 0,
            load_status: LoadStatus::Idle,
            last_load_timestamp: None,
            last_success_timestamp: None,
            failed_since: None,
            consecutive_zero_record_runs: 0,
            purge_strategy: PurgeStrategy::FailOnDuplicate,
            enabled: true,
            created_by: "alice".to_string(),
            created_at: Utc::now(),
            modified_by: None,
            modified_at: None,
            approved_by: None,
            approved_at: None,
            rejected_by: None,
            rejected_at: None,
            rejection_reason: None,
            change_type: None,
            change_summary: None,
            import_label: None,
        }
    }

    #[test]
    fn require_status_accepts_matching_state() {
        let row = sample_row(VersionStatus::Draft);
        assert!(require_status(&row, VersionStatus::Draft).is_ok());
    }

    #[test]
    fn require_status_rejects_mismatched_state() {
        let row = sample_row(VersionStatus::PendingApproval);
        let err = require_status(&row, VersionStatus::Draft).unwrap_err();
        assert_eq!(err.kind(), lcp_errors::LoaderErrorKind::InvalidTransition);
    }

    #[test]
    fn apply_payload_copies_every_editable_field() {
        let mut row = sample_row(VersionStatus::Draft);
        apply_payload(&mut row, sample_payload());
        assert_eq!(row.purge_strategy, PurgeStrategy::SkipDuplicates);
        assert_eq!(row.max_query_period_seconds, 900);
    }

    #[test]
    fn append_comment_accumulates_as_json_array() {
        let first = append_comment(&None, "looks good");
        let second = append_comment(&Some(first), "approved after review");
        assert_eq!(
            second,
            serde_json::json!(["looks good", "approved after review"])
        );
    }

    #[test]
    fn append_comment_skips_blank_comment() {
        let result = append_comment(&None, "   ");
        assert_eq!(result, serde_json::json!([]));
    }

    #[test]
    fn snapshot_json_round_trips_sql_text() {
        let row = sample_row(VersionStatus::Draft);
        let value = snapshot_json(&row).unwrap();
        assert!(value["sql_text"].is_array());
        assert_eq!(value["entity_code"], "DAILY_SALES");
    }
}
