//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    debug!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_reliability_tables(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: idempotency, inbound DLQ, messaging outbox, HTTP outbox.
fn migrate_v1_reliability_tables(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: reliability tables");

    // Idempotency records are keyed by the derived hash; rows are never
    // deleted so completed results stay available for duplicate deliveries.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS idempotency (
            idem_key TEXT PRIMARY KEY,
            strategy TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            lock_until TEXT,
            result_json TEXT,
            last_error_code TEXT,
            last_error_message TEXT,
            skipped_reason TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_idempotency_status
            ON idempotency(status);
        CREATE INDEX IF NOT EXISTS idx_idempotency_updated_at
            ON idempotency(updated_at);
        ",
    )?;

    // Inbound dead letters keep the full envelope for replay; headers are
    // sanitized before they get here.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS inbound_dlq (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            type TEXT,
            message_id TEXT,
            correlation_id TEXT,
            branch_id TEXT,
            user_id TEXT,
            headers_json TEXT,
            payload_json TEXT,
            source_meta_json TEXT,
            idem_key TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error_at TEXT,
            error_code TEXT,
            error_message TEXT,
            replayed_at TEXT,
            replay_result_json TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_inbound_dlq_status
            ON inbound_dlq(status);
        CREATE INDEX IF NOT EXISTS idx_inbound_dlq_type
            ON inbound_dlq(type);
        CREATE INDEX IF NOT EXISTS idx_inbound_dlq_branch_id
            ON inbound_dlq(branch_id);
        CREATE INDEX IF NOT EXISTS idx_inbound_dlq_updated_at
            ON inbound_dlq(updated_at);
        ",
    )?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messaging_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            provider TEXT NOT NULL,
            destination TEXT NOT NULL,
            message_key TEXT,
            headers_json TEXT,
            payload_json TEXT,
            source_message_id TEXT,
            correlation_id TEXT,
            idem_key TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at TEXT NOT NULL,
            last_error_at TEXT,
            last_error_code TEXT,
            last_error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messaging_outbox_due
            ON messaging_outbox(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_messaging_outbox_updated_at
            ON messaging_outbox(updated_at);
        ",
    )?;

    // The HTTP variant stores the connector id and relative path so the base
    // URL and auth can be resolved from config at send time; auth material
    // itself is never written here.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS http_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            http_method TEXT NOT NULL,
            url TEXT NOT NULL,
            connector_id TEXT,
            path TEXT,
            headers_json TEXT,
            body_json TEXT,
            idempotency_key TEXT,
            source_message_id TEXT,
            correlation_id TEXT,
            idem_key TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at TEXT NOT NULL,
            treat_4xx_as_success TEXT,
            last_error_at TEXT,
            last_error_code TEXT,
            last_error_message TEXT,
            last_http_status INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_http_outbox_due
            ON http_outbox(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_http_outbox_updated_at
            ON http_outbox(updated_at);
        ",
    )?;

    record_migration(conn, 1, "reliability_tables")?;
    Ok(())
}
