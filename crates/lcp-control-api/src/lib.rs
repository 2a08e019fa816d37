//! In-process handler functions for the loader control plane's operator
//! operations, transport-agnostic on purpose: no extractors, `Json<T>`
//! wrappers, or status codes here. HTTP transport, HATEOAS action-link
//! synthesis, and auth/role checks are left to whatever transport crate
//! an embedder layers on top of this one.
//!
//! Every function here is a thin composition over `lcp-versionstore`,
//! `lcp-approval`, `lcp-archive`, and `lcp-scheduler`; none of them contain
//! business logic of their own.

use chrono::Utc;
use lcp_approval::DraftPayload;
use lcp_errors::LoaderError;
use lcp_schemas::VersionStatus;
use lcp_scheduler::{ExecutionLogEntry, Scheduler};
use lcp_versionstore::LoaderRow;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// GET `/loaders` filters.
#[derive(Debug, Clone, Default)]
pub struct LoaderListFilter {
    pub version_status: Option<VersionStatus>,
    pub enabled: Option<bool>,
    /// Case-insensitive substring match against `entity_code`.
    pub search: Option<String>,
}

/// GET `/loaders` — read-only projection of C6.
pub async fn list_loaders(pool: &PgPool, filter: &LoaderListFilter) -> Result<Vec<LoaderRow>, LoaderError> {
    lcp_versionstore::list_filtered(pool, filter.version_status, filter.enabled, filter.search.as_deref()).await
}

/// GET `/loaders/{entity_code}` — the current `ACTIVE` row, or its draft
/// if `include_draft` is set.
pub async fn get_loader(pool: &PgPool, entity_code: &str, include_draft: bool) -> Result<Option<LoaderRow>, LoaderError> {
    if include_draft {
        if let Some(draft) = lcp_versionstore::find_draft(pool, entity_code).await? {
            return Ok(Some(draft));
        }
    }
    lcp_versionstore::find_active(pool, entity_code).await
}

/// POST `/loaders` — `lcp-approval::create_draft`.
pub async fn create_draft(
    pool: &PgPool,
    entity_code: &str,
    payload: DraftPayload,
    user: &str,
    change_type: Option<String>,
    import_label: Option<String>,
) -> Result<LoaderRow, LoaderError> {
    lcp_approval::create_draft(pool, entity_code, payload, user, change_type, import_label, Utc::now()).await
}

/// PUT `/loaders/{entity_code}/draft` — `lcp-approval::update_draft`.
pub async fn update_draft(
    pool: &PgPool,
    draft_id: Uuid,
    payload: DraftPayload,
    user: &str,
) -> Result<LoaderRow, LoaderError> {
    lcp_approval::update_draft(pool, draft_id, payload, user, Utc::now()).await
}

/// POST `/loaders/{entity_code}/submit` — `lcp-approval::submit`.
pub async fn submit(pool: &PgPool, draft_id: Uuid, user: &str) -> Result<LoaderRow, LoaderError> {
    lcp_approval::submit(pool, draft_id, user, Utc::now()).await
}

/// POST `/loaders/{entity_code}/approve` — `lcp-approval::approve`.
pub async fn approve(pool: &PgPool, draft_id: Uuid, admin: &str, comments: &str) -> Result<LoaderRow, LoaderError> {
    lcp_approval::approve(pool, draft_id, admin, comments, Utc::now()).await
}

/// POST `/loaders/{entity_code}/reject` (body: reason) — `lcp-approval::reject`.
pub async fn reject(pool: &PgPool, draft_id: Uuid, admin: &str, reason: &str) -> Result<(), LoaderError> {
    lcp_approval::reject(pool, draft_id, admin, reason, Utc::now()).await
}

/// POST `/loaders/{entity_code}/pause` or `/resume` — toggles `enabled` on
/// the `ACTIVE` row. Pausing does not interrupt an in-flight run; it only withholds future claims.
pub async fn set_enabled(pool: &PgPool, entity_code: &str, enabled: bool, user: &str) -> Result<LoaderRow, LoaderError> {
    let mut row = lcp_versionstore::find_active(pool, entity_code)
        .await?
        .ok_or_else(|| LoaderError::NotFound {
            what: format!("ACTIVE loader {entity_code}"),
        })?;
    row.enabled = enabled;
    row.modified_by = Some(user.to_string());
    row.modified_at = Some(Utc::now());
    lcp_versionstore::save(pool, &row).await?;
    Ok(row)
}

/// POST `/loaders/{entity_code}/run` — enqueue an immediate claim attempt.
/// Returns `false` when the loader was not
/// eligible to be claimed right now (already running, disabled, not
/// `ACTIVE`, or over its parallelism cap) rather than erroring, since
/// "not eligible this instant" is an expected outcome, not a failure.
pub async fn run_now(scheduler: &Arc<Scheduler>, entity_code: &str) -> Result<bool, LoaderError> {
    scheduler.run_now(entity_code).await
}

/// GET `/loaders/{entity_code}/executions` — read-only log, a thin
/// passthrough over the scheduler's in-memory execution log.
pub async fn executions(scheduler: &Arc<Scheduler>, entity_code: &str, limit: usize) -> Vec<ExecutionLogEntry> {
    scheduler.recent_executions(entity_code, limit).await
}

/// GET `/loaders/{entity_code}/history` — C8 projection, newest version
/// first.
pub async fn history(pool: &PgPool, entity_code: &str) -> Result<Vec<lcp_archive::ArchiveRow>, LoaderError> {
    lcp_archive::find_by_entity_code(pool, entity_code).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_matches_everything() {
        let filter = LoaderListFilter::default();
        assert!(filter.version_status.is_none());
        assert!(filter.enabled.is_none());
        assert!(filter.search.is_none());
    }
}
