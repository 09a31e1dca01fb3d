//! Database setup: WAL mode, schema, indexes

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::PersistenceError;

/// Open (creating if missing) the database in WAL mode and ensure the
/// schema exists. WAL keeps the engine's writes from blocking the admin
/// surface's reads.
pub async fn open_database(db_path: &Path) -> Result<SqlitePool, PersistenceError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::InvalidState(format!("create db dir: {e}")))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;
    create_schema(&pool).await?;
    tracing::info!(path = %db_path.display(), "database open (wal)");
    Ok(pool)
}

/// Fresh in-memory database with the full schema, for tests.
pub async fn open_test_database() -> Result<SqlitePool, PersistenceError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(PersistenceError::Database)?;
    let pool = SqlitePool::connect_with(options).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_history (
            id TEXT PRIMARY KEY,
            call_id TEXT NOT NULL,
            caller_number TEXT NOT NULL DEFAULT '',
            called_number TEXT NOT NULL DEFAULT '',
            context_name TEXT NOT NULL DEFAULT '',
            direction TEXT NOT NULL DEFAULT 'inbound',
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            duration_seconds INTEGER NOT NULL DEFAULT 0,
            provider_name TEXT NOT NULL DEFAULT '',
            pipeline_components TEXT NOT NULL DEFAULT '[]',
            conversation_history TEXT NOT NULL DEFAULT '[]',
            tool_calls TEXT NOT NULL DEFAULT '[]',
            pre_call_results TEXT NOT NULL DEFAULT '{}',
            outcome TEXT NOT NULL DEFAULT 'completed',
            transfer_destination TEXT,
            error_message TEXT,
            avg_turn_latency_ms REAL NOT NULL DEFAULT 0,
            max_turn_latency_ms INTEGER NOT NULL DEFAULT 0,
            total_turns INTEGER NOT NULL DEFAULT 0,
            barge_in_count INTEGER NOT NULL DEFAULT 0,
            caller_audio_format TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_call_history_start_time ON call_history(start_time)",
        "CREATE INDEX IF NOT EXISTS idx_call_history_caller ON call_history(caller_number)",
        "CREATE INDEX IF NOT EXISTS idx_call_history_outcome ON call_history(outcome)",
        "CREATE INDEX IF NOT EXISTS idx_call_history_provider ON call_history(provider_name)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            context_name TEXT NOT NULL DEFAULT 'default',
            timezone TEXT NOT NULL DEFAULT 'UTC',
            window_start TEXT NOT NULL DEFAULT '09:00',
            window_end TEXT NOT NULL DEFAULT '20:00',
            max_concurrent INTEGER NOT NULL DEFAULT 1,
            min_interval_ms INTEGER NOT NULL DEFAULT 1000,
            pacing_state TEXT NOT NULL DEFAULT 'draft',
            consent_required INTEGER NOT NULL DEFAULT 0,
            voicemail_drop_enabled INTEGER NOT NULL DEFAULT 0,
            voicemail_media_uri TEXT,
            caller_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_leads (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES outbound_campaigns(id),
            number TEXT NOT NULL,
            name TEXT,
            custom_vars TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'pending',
            leased_until TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_leads_campaign_state ON outbound_leads(campaign_id, state)",
        "CREATE INDEX IF NOT EXISTS idx_leads_leased_until ON outbound_leads(leased_until)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_attempts (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL REFERENCES outbound_leads(id),
            started_at TEXT NOT NULL,
            ended_at TEXT,
            amd_status TEXT,
            amd_cause TEXT,
            consent_digit INTEGER,
            outcome TEXT,
            call_history_call_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_attempts_lead ON outbound_attempts(lead_id)")
        .execute(pool)
        .await?;

    Ok(())
}
