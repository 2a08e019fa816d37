//! Operator CLI for the loader control plane.
//!
//! One flat `Commands` enum, each arm opening its own short-lived DB
//! pool and calling straight into the
//! domain crates — no daemon process is required to be running for any
//! command here except `run`, which needs a scheduler to dispatch through
//! and so builds a single-use one of its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lcp_approval::DraftPayload;
use lcp_executor::NoopDecryptor;
use lcp_schemas::{PurgeStrategy, VersionStatus};
use lcp_scheduler::{Scheduler, SchedulerConfig};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lcp")]
#[command(about = "Loader control plane CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute a layered config hash and print the canonical JSON.
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides ...).
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// List loaders, optionally filtered.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        search: Option<String>,
    },

    /// Show the current ACTIVE (or draft) row for one loader.
    Show {
        entity_code: String,
        #[arg(long)]
        draft: bool,
    },

    /// Create or overwrite a DRAFT for `entity_code`.
    Draft {
        entity_code: String,
        #[arg(long)]
        source_db_ref: String,
        /// Path to a file containing the loader's SQL text.
        #[arg(long)]
        sql_file: String,
        #[arg(long, default_value_t = 60)]
        min_interval_seconds: i64,
        #[arg(long, default_value_t = 3600)]
        max_interval_seconds: i64,
        #[arg(long, default_value_t = 900)]
        max_query_period_seconds: i64,
        #[arg(long, default_value_t = 1)]
        max_parallel_executions: i32,
        #[arg(long, default_value_t = 0)]
        source_timezone_offset_hours: i32,
        /// One of FAIL_ON_DUPLICATE | PURGE_AND_RELOAD | SKIP_DUPLICATES.
        #[arg(long, default_value = "SKIP_DUPLICATES")]
        purge_strategy: String,
        #[arg(long)]
        change_type: Option<String>,
        #[arg(long)]
        import_label: Option<String>,
        #[arg(long)]
        user: String,
    },

    /// Submit a draft for approval.
    Submit {
        draft_id: Uuid,
        #[arg(long)]
        user: String,
    },

    /// Approve a submitted draft, promoting it to ACTIVE.
    Approve {
        draft_id: Uuid,
        #[arg(long)]
        admin: String,
        #[arg(long, default_value = "")]
        comments: String,
    },

    /// Reject a submitted draft.
    Reject {
        draft_id: Uuid,
        #[arg(long)]
        admin: String,
        #[arg(long)]
        reason: String,
    },

    /// Pause a loader (withholds future claims; does not cancel an
    /// in-flight run).
    Pause {
        entity_code: String,
        #[arg(long)]
        user: String,
    },

    /// Resume a paused loader.
    Resume {
        entity_code: String,
        #[arg(long)]
        user: String,
    },

    /// Claim and run a loader immediately, bypassing its interval timing.
    Run {
        entity_code: String,
        #[arg(long, default_value_t = 60)]
        wait_seconds: u64,
    },

    /// Print the approved-version history for a loader, newest first.
    History { entity_code: String },

    /// List every registered source database.
    Sources,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let ok = sqlx::query("select 1").execute(&pool).await.is_ok();
                    println!("db_ok={ok}");
                }
                DbCmd::Migrate => {
                    lcp_versionstore::migrate(&pool).await?;
                    lcp_archive::migrate(&pool).await?;
                    lcp_signals::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let loaded = lcp_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::List { status, enabled, search } => {
            let pool = connect_from_env().await?;
            let version_status = status.as_deref().and_then(parse_version_status);
            let filter = lcp_control_api::LoaderListFilter {
                version_status,
                enabled,
                search,
            };
            let loaders = lcp_control_api::list_loaders(&pool, &filter).await?;
            for l in loaders {
                println!(
                    "{}\tv{}\t{:?}\t{:?}\tenabled={}",
                    l.entity_code, l.version_number, l.version_status, l.load_status, l.enabled
                );
            }
        }

        Commands::Show { entity_code, draft } => {
            let pool = connect_from_env().await?;
            match lcp_control_api::get_loader(&pool, &entity_code, draft).await? {
                Some(row) => println!("{row:#?}"),
                None => println!("not found: {entity_code}"),
            }
        }

        Commands::Draft {
            entity_code,
            source_db_ref,
            sql_file,
            min_interval_seconds,
            max_interval_seconds,
            max_query_period_seconds,
            max_parallel_executions,
            source_timezone_offset_hours,
            purge_strategy,
            change_type,
            import_label,
            user,
        } => {
            let pool = connect_from_env().await?;
            let sql_text = std::fs::read(&sql_file).with_context(|| format!("reading {sql_file}"))?;
            let purge_strategy = PurgeStrategy::from_db_str(&purge_strategy)
                .ok_or_else(|| anyhow::anyhow!("unknown purge strategy: {purge_strategy}"))?;
            let payload = DraftPayload {
                source_db_ref,
                sql_text,
                min_interval_seconds,
                max_interval_seconds,
                max_query_period_seconds,
                max_parallel_executions,
                source_timezone_offset_hours,
                purge_strategy,
                enabled: true,
            };
            let row = lcp_control_api::create_draft(&pool, &entity_code, payload, &user, change_type, import_label).await?;
            println!("draft_id={} entity_code={} version={}", row.id, row.entity_code, row.version_number);
        }

        Commands::Submit { draft_id, user } => {
            let pool = connect_from_env().await?;
            let row = lcp_control_api::submit(&pool, draft_id, &user).await?;
            println!("submitted draft_id={} status={:?}", row.id, row.version_status);
        }

        Commands::Approve { draft_id, admin, comments } => {
            let pool = connect_from_env().await?;
            let row = lcp_control_api::approve(&pool, draft_id, &admin, &comments).await?;
            println!("approved entity_code={} now ACTIVE version={}", row.entity_code, row.version_number);
        }

        Commands::Reject { draft_id, admin, reason } => {
            let pool = connect_from_env().await?;
            lcp_control_api::reject(&pool, draft_id, &admin, &reason).await?;
            println!("rejected draft_id={draft_id}");
        }

        Commands::Pause { entity_code, user } => {
            let pool = connect_from_env().await?;
            lcp_control_api::set_enabled(&pool, &entity_code, false, &user).await?;
            println!("paused {entity_code}");
        }

        Commands::Resume { entity_code, user } => {
            let pool = connect_from_env().await?;
            lcp_control_api::set_enabled(&pool, &entity_code, true, &user).await?;
            println!("resumed {entity_code}");
        }

        Commands::Run { entity_code, wait_seconds } => {
            let pool = connect_from_env().await?;
            let source_refs = lcp_sourcepool::load_source_refs(&pool)
                .await
                .map_err(|e| anyhow::anyhow!("loading source refs: {e:?}"))?;
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
                    worker_concurrency: 1,
                    ..SchedulerConfig::default()
                },
            );

            let claimed = lcp_control_api::run_now(&scheduler, &entity_code).await?;
            if !claimed {
                println!("not eligible to run now: {entity_code}");
                return Ok(());
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_seconds);
            loop {
                let entries = lcp_control_api::executions(&scheduler, &entity_code, 1).await;
                if let Some(entry) = entries.into_iter().next() {
                    println!(
                        "run_id={} rec_count={} error={:?}",
                        entry.run_id, entry.rec_count, entry.error_kind
                    );
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    println!("timed out waiting for {entity_code} to finish");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        Commands::History { entity_code } => {
            let pool = connect_from_env().await?;
            let rows = lcp_control_api::history(&pool, &entity_code).await?;
            for r in rows {
                println!("v{} archived_at={} by {}", r.version_number, r.archived_at, r.archived_by);
            }
        }

        Commands::Sources => {
            let pool = connect_from_env().await?;
            let sources = lcp_versionstore::list_source_databases(&pool).await?;
            for s in sources {
                println!(
                    "{}\t{:?}\t{}:{}/{}\tread_only_verified={}",
                    s.source_code, s.dialect, s.host, s.port, s.db_name, s.read_only_verified
                );
            }
        }
    }

    Ok(())
}

async fn connect_from_env() -> Result<sqlx::PgPool> {
    let url = std::env::var("LCP_DATABASE_URL").context("LCP_DATABASE_URL is not set")?;
    PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .context("connecting to control-plane database")
}

fn parse_version_status(s: &str) -> Option<VersionStatus> {
    VersionStatus::from_db_str(&s.to_ascii_uppercase())
}
