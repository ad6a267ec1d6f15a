//! Standalone query functions that work with any connection.
//!
//! Each function takes a `&Connection` as its first parameter so it can run
//! inside `AsyncDatabase::call()`. The conditional updates here
//! (`WHERE status = ?`) are the broker's only claim primitive: multiple
//! broker instances may race on the same row and exactly one wins.

use crate::{
    DatabaseResult, DlqFullRecord, DlqRecord, DlqStatus, HttpOutboxListItem, HttpOutboxRecord,
    IdempotencyRecord, IdempotencyStatus, MessagingOutboxListItem, MessagingOutboxRecord,
    NewDlqRecord, NewHttpOutboxRecord, NewMessagingOutboxRecord, OutboxStatus, SkippedReason,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};

/// Serialize a timestamp in the fixed-width form stored everywhere.
///
/// Fixed-width UTC text keeps lexicographic order equal to chronological
/// order, which `next_attempt_at <= now` relies on.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_datetime_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(parse_datetime)
}

// ==========================================
// Idempotency
// ==========================================

/// Try to create a fresh in-progress idempotency record.
///
/// Returns false when the key already exists (the store-enforced uniqueness
/// that makes duplicate detection work).
pub fn try_insert_idempotency(
    conn: &Connection,
    idem_key: &str,
    strategy: &str,
    lock_until: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO idempotency (idem_key, strategy, status, created_at, updated_at, lock_until)
         VALUES (?1, ?2, 'in_progress', ?3, ?3, ?4)",
        params![idem_key, strategy, now, ts(lock_until)],
    )?;
    Ok(inserted == 1)
}

fn map_idempotency_row(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        idem_key: row.get(0)?,
        strategy: row.get(1)?,
        status: IdempotencyStatus::from_str(&row.get::<_, String>(2)?),
        created_at: parse_datetime(row.get(3)?),
        updated_at: parse_datetime(row.get(4)?),
        lock_until: parse_datetime_opt(row.get(5)?),
        result_json: row.get(6)?,
        last_error_code: row.get(7)?,
        last_error_message: row.get(8)?,
        skipped_reason: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| SkippedReason::from_str(&s)),
    })
}

const IDEMPOTENCY_COLUMNS: &str = "idem_key, strategy, status, created_at, updated_at, lock_until, result_json, last_error_code, last_error_message, skipped_reason";

/// Get an idempotency record by key.
pub fn get_idempotency(conn: &Connection, idem_key: &str) -> DatabaseResult<Option<IdempotencyRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency WHERE idem_key = ?1"
    ))?;

    match stmt.query_row(params![idem_key], map_idempotency_row) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reclaim a failed or expired in-progress record for a new processing run.
///
/// Conditional on the row still being reclaimable, so concurrent reclaimers
/// cannot both win.
pub fn reclaim_idempotency(
    conn: &Connection,
    idem_key: &str,
    lock_until: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE idempotency
         SET status = 'in_progress', updated_at = ?2, lock_until = ?3, skipped_reason = NULL
         WHERE idem_key = ?1
           AND (status = 'failed' OR (status = 'in_progress' AND lock_until <= ?2))",
        params![idem_key, now, ts(lock_until)],
    )?;
    Ok(updated == 1)
}

/// Record a completed processing run and its result.
pub fn mark_idempotency_completed(
    conn: &Connection,
    idem_key: &str,
    result_json: &str,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE idempotency
         SET status = 'completed', updated_at = ?2, lock_until = ?2, result_json = ?3,
             last_error_code = NULL, last_error_message = NULL, skipped_reason = NULL
         WHERE idem_key = ?1",
        params![idem_key, now, result_json],
    )?;
    Ok(())
}

/// Record a failed processing run.
pub fn mark_idempotency_failed(
    conn: &Connection,
    idem_key: &str,
    error_code: &str,
    error_message: &str,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE idempotency
         SET status = 'failed', updated_at = ?2, lock_until = ?2,
             last_error_code = ?3, last_error_message = ?4, skipped_reason = NULL
         WHERE idem_key = ?1",
        params![idem_key, now, error_code, error_message],
    )?;
    Ok(())
}

/// Remember why the latest duplicate delivery was skipped.
pub fn set_idempotency_skipped_reason(
    conn: &Connection,
    idem_key: &str,
    reason: SkippedReason,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE idempotency SET skipped_reason = ?2, updated_at = ?3 WHERE idem_key = ?1",
        params![idem_key, reason.as_str(), now],
    )?;
    Ok(())
}

/// Operator escape hatch: force a stuck in-progress record to failed.
///
/// Conditional on the record still being in progress; the stored payload and
/// result are untouched.
pub fn manual_unlock_idempotency(
    conn: &Connection,
    idem_key: &str,
    audit: &str,
) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE idempotency
         SET status = 'failed', updated_at = ?2, lock_until = ?2,
             last_error_code = 'MANUAL_UNLOCK', last_error_message = ?3, skipped_reason = 'expired'
         WHERE idem_key = ?1 AND status = 'in_progress'",
        params![idem_key, now, audit],
    )?;
    Ok(updated == 1)
}

/// List idempotency records, newest first.
pub fn list_idempotency(
    conn: &Connection,
    status: Option<IdempotencyStatus>,
    limit: i64,
) -> DatabaseResult<Vec<IdempotencyRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY updated_at DESC LIMIT ?2"
    ))?;

    let records = stmt
        .query_map(
            params![status.map(|s| s.as_str()), limit],
            map_idempotency_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Count idempotency records in one status.
pub fn count_idempotency_by_status(
    conn: &Connection,
    status: IdempotencyStatus,
) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM idempotency WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// Inbound DLQ
// ==========================================

/// Insert a new dead letter; returns the generated id.
pub fn insert_dlq(conn: &Connection, record: &NewDlqRecord) -> DatabaseResult<i64> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO inbound_dlq (status, created_at, updated_at, kind, type, message_id, correlation_id, branch_id, user_id, headers_json, payload_json, source_meta_json, idem_key, attempts, max_attempts, last_error_at, error_code, error_message)
         VALUES ('pending', ?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?1, ?13, ?14)",
        params![
            now,
            record.kind,
            record.message_type,
            record.message_id,
            record.correlation_id,
            record.branch_id,
            record.user_id,
            record.headers_json,
            record.payload_json,
            record.source_meta_json,
            record.idem_key,
            record.max_attempts,
            record.error_code,
            record.error_message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_dlq_row(row: &Row<'_>) -> rusqlite::Result<DlqRecord> {
    Ok(DlqRecord {
        id: row.get(0)?,
        status: DlqStatus::from_str(&row.get::<_, String>(1)?),
        created_at: parse_datetime(row.get(2)?),
        updated_at: parse_datetime(row.get(3)?),
        kind: row.get(4)?,
        message_type: row.get(5)?,
        message_id: row.get(6)?,
        correlation_id: row.get(7)?,
        branch_id: row.get(8)?,
        user_id: row.get(9)?,
        idem_key: row.get(10)?,
        attempts: row.get(11)?,
        max_attempts: row.get(12)?,
        last_error_at: parse_datetime_opt(row.get(13)?),
        error_code: row.get(14)?,
        error_message: row.get(15)?,
        replayed_at: parse_datetime_opt(row.get(16)?),
    })
}

const DLQ_COLUMNS: &str = "id, status, created_at, updated_at, kind, type, message_id, correlation_id, branch_id, user_id, idem_key, attempts, max_attempts, last_error_at, error_code, error_message, replayed_at";

/// Get a DLQ record by id, without the envelope blobs.
pub fn get_dlq(conn: &Connection, id: i64) -> DatabaseResult<Option<DlqRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DLQ_COLUMNS} FROM inbound_dlq WHERE id = ?1"
    ))?;

    match stmt.query_row(params![id], map_dlq_row) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Get a full DLQ row, including everything needed to rebuild the envelope.
pub fn get_dlq_full(conn: &Connection, id: i64) -> DatabaseResult<Option<DlqFullRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DLQ_COLUMNS}, headers_json, payload_json, source_meta_json, replay_result_json
         FROM inbound_dlq WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id], |row| {
        Ok(DlqFullRecord {
            record: map_dlq_row(row)?,
            headers_json: row.get(17)?,
            payload_json: row.get(18)?,
            source_meta_json: row.get(19)?,
            replay_result_json: row.get(20)?,
        })
    });

    match result {
        Ok(full) => Ok(Some(full)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List DLQ records, newest first, with optional filters.
///
/// Returns each record together with its raw source meta so the caller can
/// apply the non-indexed source filter.
pub fn list_dlq(
    conn: &Connection,
    status: Option<DlqStatus>,
    message_type: Option<&str>,
    branch_id: Option<&str>,
    limit: i64,
) -> DatabaseResult<Vec<(DlqRecord, Option<String>)>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DLQ_COLUMNS}, source_meta_json FROM inbound_dlq
         WHERE (?1 IS NULL OR status = ?1)
           AND (?2 IS NULL OR type = ?2)
           AND (?3 IS NULL OR branch_id = ?3)
         ORDER BY updated_at DESC LIMIT ?4"
    ))?;

    let rows = stmt
        .query_map(
            params![status.map(|s| s.as_str()), message_type, branch_id, limit],
            |row| Ok((map_dlq_row(row)?, row.get::<_, Option<String>>(17)?)),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Record a successful replay. Terminal.
pub fn mark_dlq_replayed(conn: &Connection, id: i64, replay_result_json: &str) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE inbound_dlq
         SET status = 'replayed', updated_at = ?2, replayed_at = ?2, replay_result_json = ?3
         WHERE id = ?1",
        params![id, now, replay_result_json],
    )?;
    Ok(())
}

/// Record a failed replay attempt with the caller-computed attempt count.
pub fn mark_dlq_replay_failed(
    conn: &Connection,
    id: i64,
    attempts: i64,
    dead: bool,
    error_code: &str,
    error_message: &str,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    let status = if dead { DlqStatus::Dead } else { DlqStatus::Pending };
    conn.execute(
        "UPDATE inbound_dlq
         SET status = ?2, updated_at = ?3, last_error_at = ?3, attempts = ?4,
             error_code = ?5, error_message = ?6
         WHERE id = ?1",
        params![id, status.as_str(), now, attempts, error_code, error_message],
    )?;
    Ok(())
}

/// Count DLQ records in one status.
pub fn count_dlq_by_status(conn: &Connection, status: DlqStatus) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM inbound_dlq WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// Messaging outbox
// ==========================================

/// Insert a pending messaging outbox row due immediately; returns the id.
pub fn insert_messaging_outbox(
    conn: &Connection,
    record: &NewMessagingOutboxRecord,
) -> DatabaseResult<i64> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO messaging_outbox (status, created_at, updated_at, provider, destination, message_key, headers_json, payload_json, source_message_id, correlation_id, idem_key, attempts, max_attempts, next_attempt_at)
         VALUES ('pending', ?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?1)",
        params![
            now,
            record.provider,
            record.destination,
            record.message_key,
            record.headers_json,
            record.payload_json,
            record.source_message_id,
            record.correlation_id,
            record.idem_key,
            record.max_attempts,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_messaging_row(row: &Row<'_>) -> rusqlite::Result<MessagingOutboxRecord> {
    Ok(MessagingOutboxRecord {
        id: row.get(0)?,
        status: OutboxStatus::from_str(&row.get::<_, String>(1)?),
        provider: row.get(2)?,
        destination: row.get(3)?,
        message_key: row.get(4)?,
        headers_json: row.get(5)?,
        payload_json: row.get(6)?,
        source_message_id: row.get(7)?,
        correlation_id: row.get(8)?,
        idem_key: row.get(9)?,
        attempts: row.get(10)?,
        max_attempts: row.get(11)?,
        next_attempt_at: parse_datetime(row.get(12)?),
        last_error_code: row.get(13)?,
        last_error_message: row.get(14)?,
        updated_at: parse_datetime(row.get(15)?),
    })
}

const MESSAGING_COLUMNS: &str = "id, status, provider, destination, message_key, headers_json, payload_json, source_message_id, correlation_id, idem_key, attempts, max_attempts, next_attempt_at, last_error_code, last_error_message, updated_at";

/// Get a messaging outbox record by id.
pub fn get_messaging_outbox(
    conn: &Connection,
    id: i64,
) -> DatabaseResult<Option<MessagingOutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGING_COLUMNS} FROM messaging_outbox WHERE id = ?1"
    ))?;

    match stmt.query_row(params![id], map_messaging_row) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List messaging outbox records (no payload), newest first.
pub fn list_messaging_outbox(
    conn: &Connection,
    status: Option<OutboxStatus>,
    limit: i64,
) -> DatabaseResult<Vec<MessagingOutboxListItem>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, status, provider, destination, attempts, max_attempts, next_attempt_at, updated_at
         FROM messaging_outbox
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY updated_at DESC LIMIT ?2",
    )?;

    let items = stmt
        .query_map(params![status.map(|s| s.as_str()), limit], |row| {
            Ok(MessagingOutboxListItem {
                id: row.get(0)?,
                status: OutboxStatus::from_str(&row.get::<_, String>(1)?),
                provider: row.get(2)?,
                destination: row.get(3)?,
                attempts: row.get(4)?,
                max_attempts: row.get(5)?,
                next_attempt_at: parse_datetime(row.get(6)?),
                updated_at: parse_datetime(row.get(7)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Pick due pending messaging records, oldest id first.
pub fn pick_due_messaging(
    conn: &Connection,
    limit: i64,
) -> DatabaseResult<Vec<MessagingOutboxRecord>> {
    let now = ts(Utc::now());
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGING_COLUMNS} FROM messaging_outbox
         WHERE status = 'pending' AND next_attempt_at <= ?1
         ORDER BY id ASC LIMIT ?2"
    ))?;

    let records = stmt
        .query_map(params![now, limit], map_messaging_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Claim a messaging record for delivery.
///
/// Atomic `pending -> sending`; false means another worker won the race and
/// the caller must skip the record.
pub fn mark_messaging_sending(conn: &Connection, id: i64) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE messaging_outbox SET status = 'sending', updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(updated == 1)
}

/// Terminal success; clears error fields.
pub fn mark_messaging_sent(conn: &Connection, id: i64) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE messaging_outbox
         SET status = 'sent', updated_at = ?2,
             last_error_at = NULL, last_error_code = NULL, last_error_message = NULL
         WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Record a failed delivery attempt; dead records stop being scheduled.
pub fn mark_messaging_failed(
    conn: &Connection,
    id: i64,
    attempts: i64,
    max_attempts: i64,
    next_attempt_at: DateTime<Utc>,
    error_code: &str,
    error_message: &str,
    dead: bool,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    let status = if dead { OutboxStatus::Dead } else { OutboxStatus::Pending };
    conn.execute(
        "UPDATE messaging_outbox
         SET status = ?2, updated_at = ?3, attempts = ?4, max_attempts = ?5,
             next_attempt_at = ?6, last_error_at = ?3, last_error_code = ?7, last_error_message = ?8
         WHERE id = ?1",
        params![
            id,
            status.as_str(),
            now,
            attempts,
            max_attempts,
            ts(next_attempt_at),
            error_code,
            error_message,
        ],
    )?;
    Ok(())
}

/// Operator re-arm: back to pending, due now, optionally resetting attempts.
/// Works on dead records too.
pub fn replay_messaging_outbox(
    conn: &Connection,
    id: i64,
    reset_attempts: bool,
) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE messaging_outbox
         SET status = 'pending', updated_at = ?3, next_attempt_at = ?3,
             attempts = CASE WHEN ?2 THEN 0 ELSE attempts END,
             last_error_at = NULL, last_error_code = NULL, last_error_message = NULL
         WHERE id = ?1",
        params![id, reset_attempts, now],
    )?;
    Ok(updated == 1)
}

/// Count messaging outbox records in one status.
pub fn count_messaging_by_status(conn: &Connection, status: OutboxStatus) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM messaging_outbox WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// HTTP outbox
// ==========================================

/// Insert a pending HTTP outbox row due immediately; returns the id.
pub fn insert_http_outbox(conn: &Connection, record: &NewHttpOutboxRecord) -> DatabaseResult<i64> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO http_outbox (status, created_at, updated_at, http_method, url, connector_id, path, headers_json, body_json, idempotency_key, source_message_id, correlation_id, idem_key, attempts, max_attempts, next_attempt_at, treat_4xx_as_success)
         VALUES ('pending', ?1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?1, ?13)",
        params![
            now,
            record.http_method,
            record.url,
            record.connector_id,
            record.path,
            record.headers_json,
            record.body_json,
            record.idempotency_key,
            record.source_message_id,
            record.correlation_id,
            record.idem_key,
            record.max_attempts,
            record.treat_4xx_as_success,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_http_row(row: &Row<'_>) -> rusqlite::Result<HttpOutboxRecord> {
    Ok(HttpOutboxRecord {
        id: row.get(0)?,
        status: OutboxStatus::from_str(&row.get::<_, String>(1)?),
        http_method: row.get(2)?,
        url: row.get(3)?,
        connector_id: row.get(4)?,
        path: row.get(5)?,
        headers_json: row.get(6)?,
        body_json: row.get(7)?,
        idempotency_key: row.get(8)?,
        source_message_id: row.get(9)?,
        correlation_id: row.get(10)?,
        idem_key: row.get(11)?,
        attempts: row.get(12)?,
        max_attempts: row.get(13)?,
        next_attempt_at: parse_datetime(row.get(14)?),
        treat_4xx_as_success: row.get(15)?,
        last_error_code: row.get(16)?,
        last_error_message: row.get(17)?,
        last_http_status: row.get(18)?,
        updated_at: parse_datetime(row.get(19)?),
    })
}

const HTTP_COLUMNS: &str = "id, status, http_method, url, connector_id, path, headers_json, body_json, idempotency_key, source_message_id, correlation_id, idem_key, attempts, max_attempts, next_attempt_at, treat_4xx_as_success, last_error_code, last_error_message, last_http_status, updated_at";

/// Get an HTTP outbox record by id.
pub fn get_http_outbox(conn: &Connection, id: i64) -> DatabaseResult<Option<HttpOutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {HTTP_COLUMNS} FROM http_outbox WHERE id = ?1"
    ))?;

    match stmt.query_row(params![id], map_http_row) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List HTTP outbox records (no body), newest first.
pub fn list_http_outbox(
    conn: &Connection,
    status: Option<OutboxStatus>,
    limit: i64,
) -> DatabaseResult<Vec<HttpOutboxListItem>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, status, http_method, url, connector_id, path, attempts, max_attempts, next_attempt_at, updated_at
         FROM http_outbox
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY updated_at DESC LIMIT ?2",
    )?;

    let items = stmt
        .query_map(params![status.map(|s| s.as_str()), limit], |row| {
            Ok(HttpOutboxListItem {
                id: row.get(0)?,
                status: OutboxStatus::from_str(&row.get::<_, String>(1)?),
                http_method: row.get(2)?,
                url: row.get(3)?,
                connector_id: row.get(4)?,
                path: row.get(5)?,
                attempts: row.get(6)?,
                max_attempts: row.get(7)?,
                next_attempt_at: parse_datetime(row.get(8)?),
                updated_at: parse_datetime(row.get(9)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Pick due pending HTTP records, oldest id first.
pub fn pick_due_http(conn: &Connection, limit: i64) -> DatabaseResult<Vec<HttpOutboxRecord>> {
    let now = ts(Utc::now());
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {HTTP_COLUMNS} FROM http_outbox
         WHERE status = 'pending' AND next_attempt_at <= ?1
         ORDER BY id ASC LIMIT ?2"
    ))?;

    let records = stmt
        .query_map(params![now, limit], map_http_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Claim an HTTP record for delivery (atomic `pending -> sending`).
pub fn mark_http_sending(conn: &Connection, id: i64) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE http_outbox SET status = 'sending', updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(updated == 1)
}

/// Terminal success; records the final HTTP status and clears error fields.
pub fn mark_http_sent(conn: &Connection, id: i64, http_status: i64) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    conn.execute(
        "UPDATE http_outbox
         SET status = 'sent', updated_at = ?2, last_http_status = ?3,
             last_error_at = NULL, last_error_code = NULL, last_error_message = NULL
         WHERE id = ?1",
        params![id, now, http_status],
    )?;
    Ok(())
}

/// Record a failed HTTP delivery attempt.
pub fn mark_http_failed(
    conn: &Connection,
    id: i64,
    attempts: i64,
    max_attempts: i64,
    next_attempt_at: DateTime<Utc>,
    error_code: &str,
    error_message: &str,
    http_status: Option<i64>,
    dead: bool,
) -> DatabaseResult<()> {
    let now = ts(Utc::now());
    let status = if dead { OutboxStatus::Dead } else { OutboxStatus::Pending };
    conn.execute(
        "UPDATE http_outbox
         SET status = ?2, updated_at = ?3, attempts = ?4, max_attempts = ?5,
             next_attempt_at = ?6, last_error_at = ?3, last_error_code = ?7,
             last_error_message = ?8, last_http_status = ?9
         WHERE id = ?1",
        params![
            id,
            status.as_str(),
            now,
            attempts,
            max_attempts,
            ts(next_attempt_at),
            error_code,
            error_message,
            http_status,
        ],
    )?;
    Ok(())
}

/// Operator re-arm for an HTTP record; works on dead records too.
pub fn replay_http_outbox(conn: &Connection, id: i64, reset_attempts: bool) -> DatabaseResult<bool> {
    let now = ts(Utc::now());
    let updated = conn.execute(
        "UPDATE http_outbox
         SET status = 'pending', updated_at = ?3, next_attempt_at = ?3,
             attempts = CASE WHEN ?2 THEN 0 ELSE attempts END,
             last_error_at = NULL, last_error_code = NULL, last_error_message = NULL
         WHERE id = ?1",
        params![id, reset_attempts, now],
    )?;
    Ok(updated == 1)
}

/// Count HTTP outbox records in one status.
pub fn count_http_by_status(conn: &Connection, status: OutboxStatus) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(1) FROM http_outbox WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;
    use chrono::Duration;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn new_messaging() -> NewMessagingOutboxRecord {
        NewMessagingOutboxRecord {
            provider: "logging".to_string(),
            destination: "events.visits".to_string(),
            message_key: Some("m1".to_string()),
            headers_json: None,
            payload_json: Some(r#"{"visitId":1}"#.to_string()),
            source_message_id: Some("m1".to_string()),
            correlation_id: Some("c1".to_string()),
            idem_key: None,
            max_attempts: 3,
        }
    }

    #[test]
    fn idempotency_insert_is_unique() {
        let conn = test_conn();
        let lock = Utc::now() + Duration::seconds(60);

        assert!(try_insert_idempotency(&conn, "k1", "AUTO", lock).unwrap());
        assert!(!try_insert_idempotency(&conn, "k1", "AUTO", lock).unwrap());

        let record = get_idempotency(&conn, "k1").unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::InProgress);
        assert_eq!(record.strategy, "AUTO");
        assert!(record.result_json.is_none());
    }

    #[test]
    fn idempotency_reclaim_requires_failed_or_expired() {
        let conn = test_conn();
        let future = Utc::now() + Duration::seconds(60);

        // Live in-progress lock is not reclaimable.
        try_insert_idempotency(&conn, "k1", "AUTO", future).unwrap();
        assert!(!reclaim_idempotency(&conn, "k1", future).unwrap());

        // Failed records are reclaimable.
        mark_idempotency_failed(&conn, "k1", "FLOW_EXECUTION_ERROR", "boom").unwrap();
        assert!(reclaim_idempotency(&conn, "k1", future).unwrap());
        assert_eq!(
            get_idempotency(&conn, "k1").unwrap().unwrap().status,
            IdempotencyStatus::InProgress
        );

        // Expired in-progress locks are reclaimable.
        let past = Utc::now() - Duration::seconds(10);
        try_insert_idempotency(&conn, "k2", "AUTO", past).unwrap();
        assert!(reclaim_idempotency(&conn, "k2", future).unwrap());

        // Completed records are never reclaimable.
        mark_idempotency_completed(&conn, "k1", r#"{"ok":true}"#).unwrap();
        assert!(!reclaim_idempotency(&conn, "k1", future).unwrap());
    }

    #[test]
    fn idempotency_completed_keeps_result_and_clears_errors() {
        let conn = test_conn();
        let lock = Utc::now() + Duration::seconds(60);
        try_insert_idempotency(&conn, "k1", "MESSAGE_ID", lock).unwrap();
        mark_idempotency_failed(&conn, "k1", "E1", "first failure").unwrap();
        mark_idempotency_completed(&conn, "k1", r#"{"out":1}"#).unwrap();

        let record = get_idempotency(&conn, "k1").unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.result_json.as_deref(), Some(r#"{"out":1}"#));
        assert!(record.last_error_code.is_none());
        assert!(record.last_error_message.is_none());
    }

    #[test]
    fn manual_unlock_only_touches_in_progress() {
        let conn = test_conn();
        let lock = Utc::now() + Duration::seconds(60);
        try_insert_idempotency(&conn, "k1", "AUTO", lock).unwrap();

        assert!(manual_unlock_idempotency(&conn, "k1", "actor=ops; reason=stuck").unwrap());
        let record = get_idempotency(&conn, "k1").unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.last_error_code.as_deref(), Some("MANUAL_UNLOCK"));
        assert_eq!(record.skipped_reason, Some(SkippedReason::Expired));

        // Second unlock is a no-op: no longer in progress.
        assert!(!manual_unlock_idempotency(&conn, "k1", "again").unwrap());
    }

    #[test]
    fn idempotency_list_and_count() {
        let conn = test_conn();
        let lock = Utc::now() + Duration::seconds(60);
        try_insert_idempotency(&conn, "k1", "AUTO", lock).unwrap();
        try_insert_idempotency(&conn, "k2", "AUTO", lock).unwrap();
        mark_idempotency_completed(&conn, "k2", "{}").unwrap();

        assert_eq!(count_idempotency_by_status(&conn, IdempotencyStatus::InProgress).unwrap(), 1);
        assert_eq!(count_idempotency_by_status(&conn, IdempotencyStatus::Completed).unwrap(), 1);
        assert_eq!(count_idempotency_by_status(&conn, IdempotencyStatus::Failed).unwrap(), 0);

        assert_eq!(list_idempotency(&conn, None, 10).unwrap().len(), 2);
        let completed = list_idempotency(&conn, Some(IdempotencyStatus::Completed), 10).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].idem_key, "k2");
    }

    #[test]
    fn dlq_insert_and_full_round_trip() {
        let conn = test_conn();
        let id = insert_dlq(
            &conn,
            &NewDlqRecord {
                kind: "EVENT".to_string(),
                message_type: Some("visit.created".to_string()),
                message_id: Some("m1".to_string()),
                correlation_id: None,
                branch_id: Some("b1".to_string()),
                user_id: None,
                headers_json: Some(r#"{"X-Req":"1"}"#.to_string()),
                payload_json: Some(r#"{"visitId":1}"#.to_string()),
                source_meta_json: Some(r#"{"source":"crm"}"#.to_string()),
                idem_key: Some("k1".to_string()),
                max_attempts: 5,
                error_code: Some("FLOW_EXECUTION_ERROR".to_string()),
                error_message: Some("boom".to_string()),
            },
        )
        .unwrap();
        assert!(id > 0);

        let full = get_dlq_full(&conn, id).unwrap().unwrap();
        assert_eq!(full.record.status, DlqStatus::Pending);
        assert_eq!(full.record.attempts, 0);
        assert_eq!(full.record.max_attempts, 5);
        assert_eq!(full.payload_json.as_deref(), Some(r#"{"visitId":1}"#));
        assert_eq!(full.source_meta_json.as_deref(), Some(r#"{"source":"crm"}"#));
        assert!(full.replay_result_json.is_none());

        assert!(get_dlq(&conn, id + 1).unwrap().is_none());
    }

    #[test]
    fn dlq_replay_bookkeeping() {
        let conn = test_conn();
        let id = insert_dlq(
            &conn,
            &NewDlqRecord {
                kind: "EVENT".to_string(),
                message_type: None,
                message_id: None,
                correlation_id: None,
                branch_id: None,
                user_id: None,
                headers_json: None,
                payload_json: None,
                source_meta_json: None,
                idem_key: None,
                max_attempts: 2,
                error_code: None,
                error_message: None,
            },
        )
        .unwrap();

        mark_dlq_replay_failed(&conn, id, 1, false, "REPLAY_FAILED", "still broken").unwrap();
        let record = get_dlq(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, DlqStatus::Pending);
        assert_eq!(record.attempts, 1);

        mark_dlq_replay_failed(&conn, id, 2, true, "REPLAY_FAILED", "gave up").unwrap();
        let record = get_dlq(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, DlqStatus::Dead);
        assert_eq!(record.attempts, 2);

        mark_dlq_replayed(&conn, id, r#"{"outcome":"PROCESSED"}"#).unwrap();
        let full = get_dlq_full(&conn, id).unwrap().unwrap();
        assert_eq!(full.record.status, DlqStatus::Replayed);
        assert!(full.record.replayed_at.is_some());
        assert!(full.replay_result_json.is_some());
    }

    #[test]
    fn messaging_claim_is_exclusive() {
        let conn = test_conn();
        let id = insert_messaging_outbox(&conn, &new_messaging()).unwrap();

        assert!(mark_messaging_sending(&conn, id).unwrap());
        // Second claim must lose: the row is no longer pending.
        assert!(!mark_messaging_sending(&conn, id).unwrap());

        mark_messaging_sent(&conn, id).unwrap();
        let record = get_messaging_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Sent);
        assert!(record.last_error_code.is_none());
    }

    #[test]
    fn messaging_pick_due_is_fifo_and_skips_future() {
        let conn = test_conn();
        let first = insert_messaging_outbox(&conn, &new_messaging()).unwrap();
        let second = insert_messaging_outbox(&conn, &new_messaging()).unwrap();
        let deferred = insert_messaging_outbox(&conn, &new_messaging()).unwrap();

        // Push one record into the future.
        mark_messaging_failed(
            &conn,
            deferred,
            1,
            3,
            Utc::now() + Duration::seconds(300),
            "SEND_ERROR",
            "later",
            false,
        )
        .unwrap();

        let due = pick_due_messaging(&conn, 10).unwrap();
        let ids: Vec<i64> = due.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn messaging_failed_then_replay() {
        let conn = test_conn();
        let id = insert_messaging_outbox(&conn, &new_messaging()).unwrap();

        mark_messaging_failed(
            &conn,
            id,
            3,
            3,
            Utc::now() + Duration::seconds(60),
            "SEND_ERROR",
            "broker unavailable",
            true,
        )
        .unwrap();
        let record = get_messaging_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Dead);
        assert_eq!(record.attempts, 3);
        assert!(pick_due_messaging(&conn, 10).unwrap().is_empty());

        // Replay re-arms even a dead record and can reset the counter.
        assert!(replay_messaging_outbox(&conn, id, true).unwrap());
        let record = get_messaging_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error_code.is_none());
        assert_eq!(pick_due_messaging(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn http_outbox_round_trip() {
        let conn = test_conn();
        let id = insert_http_outbox(
            &conn,
            &NewHttpOutboxRecord {
                http_method: "POST".to_string(),
                url: "https://crm.internal/v1/customers".to_string(),
                connector_id: Some("crm".to_string()),
                path: Some("/v1/customers".to_string()),
                headers_json: Some(r#"{"Content-Type":"application/json"}"#.to_string()),
                body_json: Some(r#"{"name":"n"}"#.to_string()),
                idempotency_key: Some("idem-1".to_string()),
                source_message_id: Some("m1".to_string()),
                correlation_id: Some("c1".to_string()),
                idem_key: Some("k1".to_string()),
                max_attempts: 3,
                treat_4xx_as_success: Some("409".to_string()),
            },
        )
        .unwrap();

        let record = get_http_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.connector_id.as_deref(), Some("crm"));
        assert_eq!(record.treat_4xx_as_success.as_deref(), Some("409"));
        assert!(record.last_http_status.is_none());

        assert!(mark_http_sending(&conn, id).unwrap());
        assert!(!mark_http_sending(&conn, id).unwrap());

        mark_http_sent(&conn, id, 201).unwrap();
        let record = get_http_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Sent);
        assert_eq!(record.last_http_status, Some(201));

        assert_eq!(count_http_by_status(&conn, OutboxStatus::Sent).unwrap(), 1);
        assert_eq!(list_http_outbox(&conn, Some(OutboxStatus::Sent), 10).unwrap().len(), 1);
    }

    #[test]
    fn http_failed_records_status_and_schedules_retry() {
        let conn = test_conn();
        let id = insert_http_outbox(
            &conn,
            &NewHttpOutboxRecord {
                http_method: "POST".to_string(),
                url: "https://x".to_string(),
                connector_id: None,
                path: None,
                headers_json: None,
                body_json: None,
                idempotency_key: None,
                source_message_id: None,
                correlation_id: None,
                idem_key: None,
                max_attempts: 5,
                treat_4xx_as_success: None,
            },
        )
        .unwrap();

        mark_http_failed(
            &conn,
            id,
            1,
            5,
            Utc::now() + Duration::seconds(5),
            "HTTP_500",
            "server error",
            Some(500),
            false,
        )
        .unwrap();

        let record = get_http_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_http_status, Some(500));
        // Not due yet.
        assert!(pick_due_http(&conn, 10).unwrap().is_empty());

        assert!(replay_http_outbox(&conn, id, false).unwrap());
        let record = get_http_outbox(&conn, id).unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(pick_due_http(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn dlq_list_filters() {
        let conn = test_conn();
        for (message_type, branch) in [
            ("visit.created", "b1"),
            ("visit.created", "b2"),
            ("ticket.call", "b1"),
        ] {
            insert_dlq(
                &conn,
                &NewDlqRecord {
                    kind: "EVENT".to_string(),
                    message_type: Some(message_type.to_string()),
                    message_id: None,
                    correlation_id: None,
                    branch_id: Some(branch.to_string()),
                    user_id: None,
                    headers_json: None,
                    payload_json: None,
                    source_meta_json: Some(r#"{"source":"crm"}"#.to_string()),
                    idem_key: None,
                    max_attempts: 3,
                    error_code: None,
                    error_message: None,
                },
            )
            .unwrap();
        }

        assert_eq!(list_dlq(&conn, None, None, None, 10).unwrap().len(), 3);
        assert_eq!(
            list_dlq(&conn, Some(DlqStatus::Pending), Some("visit.created"), None, 10)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            list_dlq(&conn, None, Some("visit.created"), Some("b1"), 10)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(list_dlq(&conn, Some(DlqStatus::Dead), None, None, 10).unwrap().len(), 0);
        assert_eq!(list_dlq(&conn, None, None, None, 2).unwrap().len(), 2);
    }
}
