//! Shared DTOs for the loader control plane.
//!
//! Kept deliberately small: plain data + the enums whose string
//! representation is also the on-disk (Postgres) representation. Crates
//! that own a table (`lcp-versionstore`, `lcp-archive`, `lcp-signals`)
//! convert these to/from `sqlx::Row` themselves; this crate has no IO.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of a `Loader` row in the approval lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    Draft,
    PendingApproval,
    Active,
}

impl VersionStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "DRAFT",
            VersionStatus::PendingApproval => "PENDING_APPROVAL",
            VersionStatus::Active => "ACTIVE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(VersionStatus::Draft),
            "PENDING_APPROVAL" => Some(VersionStatus::PendingApproval),
            "ACTIVE" => Some(VersionStatus::Active),
            _ => None,
        }
    }
}

/// Runtime execution state of an ACTIVE loader.
///
/// `Paused` is carried for schema completeness; no transition in this
/// workspace writes it — pausing a loader is done by clearing `enabled`,
/// which makes the loader ineligible regardless of `load_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Idle,
    Running,
    Failed,
    Paused,
}

impl LoadStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LoadStatus::Idle => "IDLE",
            LoadStatus::Running => "RUNNING",
            LoadStatus::Failed => "FAILED",
            LoadStatus::Paused => "PAUSED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(LoadStatus::Idle),
            "RUNNING" => Some(LoadStatus::Running),
            "FAILED" => Some(LoadStatus::Failed),
            "PAUSED" => Some(LoadStatus::Paused),
            _ => None,
        }
    }
}

/// Handling of pre-existing signal rows during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurgeStrategy {
    FailOnDuplicate,
    PurgeAndReload,
    SkipDuplicates,
}

impl PurgeStrategy {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PurgeStrategy::FailOnDuplicate => "FAIL_ON_DUPLICATE",
            PurgeStrategy::PurgeAndReload => "PURGE_AND_RELOAD",
            PurgeStrategy::SkipDuplicates => "SKIP_DUPLICATES",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "FAIL_ON_DUPLICATE" => Some(PurgeStrategy::FailOnDuplicate),
            "PURGE_AND_RELOAD" => Some(PurgeStrategy::PurgeAndReload),
            "SKIP_DUPLICATES" => Some(PurgeStrategy::SkipDuplicates),
            _ => None,
        }
    }
}

/// Source database wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgresql,
    Mysql,
}

impl Dialect {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Dialect::Postgresql => "postgresql",
            Dialect::Mysql => "mysql",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "postgresql" => Some(Dialect::Postgresql),
            "mysql" => Some(Dialect::Mysql),
            _ => None,
        }
    }
}

/// Segment dimension constant used when a loader's query has no designated
/// projection column to derive a segment from.
pub const DEFAULT_SEGMENT: &str = "_all_";

/// One aggregated output tuple for a single `(loader, bucket, segment)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTuple {
    pub loader_code: String,
    pub load_timestamp_utc: DateTime<Utc>,
    pub segment_code: String,
    pub rec_count: i64,
    pub min_val: f64,
    pub avg_val: f64,
    pub max_val: f64,
    pub sum_val: f64,
}

/// Half-open UTC time range `[from, to)` computed by `lcp-clock` for one
/// executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// `true` when the range contains no instants to query.
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }
}

/// Stable identity for one sweep of the scheduler, propagated into
/// executor/approval log events as a correlation id.
pub type SweepId = Uuid;
/// Stable identity for one executor invocation, propagated as a
/// correlation id.
pub type RunId = Uuid;
