//! Sync ledger: append-only record of every synchronization attempt.
//!
//! Every workflow invocation writes exactly one ledger row regardless of
//! outcome. Ledger rows are never updated after insert. Terminal stock-sync
//! failures additionally land in `unresolved_sync_failures`, whose open rows
//! (`resolved_at IS NULL`) are the retry coordinator's work queue — those
//! rows are stamped resolved, never deleted.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;

// Ledger status values
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_PARTIAL: &str = "partial_success";

// Sync types
pub const SYNC_STOCK: &str = "stock_reconciliation";
pub const SYNC_PO_ACCRUAL: &str = "purchase_order_accrual";
pub const SYNC_ID_RESOLUTION: &str = "id_resolution";

/// One synchronization attempt, ready to be appended to the ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub sync_type: &'static str,
    pub direction: &'static str,
    pub article_number: Option<String>,
    pub product_id: Option<String>,
    pub status: &'static str,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
}

impl LedgerEntry {
    pub fn outbound(sync_type: &'static str, status: &'static str) -> Self {
        Self {
            sync_type,
            direction: "outbound",
            article_number: None,
            product_id: None,
            status,
            request_payload: None,
            response_payload: None,
            error_message: None,
            duration_ms: None,
        }
    }

    pub fn article(mut self, article_number: Option<&str>) -> Self {
        self.article_number = article_number.map(|s| s.to_string());
        self
    }

    pub fn product(mut self, product_id: &str) -> Self {
        self.product_id = Some(product_id.to_string());
        self
    }

    pub fn request(mut self, payload: Value) -> Self {
        self.request_payload = Some(payload);
        self
    }

    pub fn response(mut self, payload: Value) -> Self {
        self.response_payload = Some(payload);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn duration(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Append a ledger row. Best-effort: a failed ledger write is logged and
/// swallowed so the workflow outcome still reaches the caller; it is never
/// retried.
pub fn record(db: &DbState, entry: LedgerEntry) {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "sync ledger: connection lock poisoned, entry dropped");
            return;
        }
    };
    if let Err(e) = insert_entry(&conn, &entry) {
        warn!(
            sync_type = entry.sync_type,
            error = %e,
            "sync ledger write failed, entry dropped"
        );
    }
}

fn insert_entry(conn: &Connection, entry: &LedgerEntry) -> Result<(), String> {
    let request = entry
        .request_payload
        .as_ref()
        .map(|v| v.to_string());
    let response = entry
        .response_payload
        .as_ref()
        .map(|v| v.to_string());

    conn.execute(
        "INSERT INTO sync_ledger (
            sync_type, direction, article_number, product_id, status,
            request_payload, response_payload, error_message, duration_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.sync_type,
            entry.direction,
            entry.article_number,
            entry.product_id,
            entry.status,
            request,
            response,
            entry.error_message,
            entry.duration_ms.map(|ms| ms as i64),
        ],
    )
    .map_err(|e| format!("insert sync_ledger: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Unresolved failure queue
// ---------------------------------------------------------------------------

/// An open stock-sync failure awaiting retry.
#[derive(Debug, Clone)]
pub struct UnresolvedFailure {
    pub id: i64,
    pub product_id: String,
    pub article_number: Option<String>,
    pub quantity_changed: i64,
    pub order_number: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// Record a terminal stock-sync failure for later retry. Only the stock
/// reconciliation workflow enqueues here; it must not block the operator's
/// receive/pick action on ERP availability.
pub fn enqueue_unresolved(
    db: &DbState,
    product_id: &str,
    article_number: Option<&str>,
    quantity_changed: i64,
    order_number: Option<&str>,
    error_message: &str,
) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO unresolved_sync_failures (
            product_id, article_number, quantity_changed, order_number, error_message
         ) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            product_id,
            article_number,
            quantity_changed,
            order_number,
            error_message
        ],
    )
    .map_err(|e| format!("insert unresolved failure: {e}"))?;
    Ok(conn.last_insert_rowid())
}

/// Fetch up to `limit` open failures, oldest first.
pub fn fetch_unresolved(db: &DbState, limit: i64) -> Result<Vec<UnresolvedFailure>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, product_id, article_number, quantity_changed,
                    order_number, error_message, created_at
             FROM unresolved_sync_failures
             WHERE resolved_at IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )
        .map_err(|e| format!("prepare unresolved query: {e}"))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(UnresolvedFailure {
                id: row.get(0)?,
                product_id: row.get(1)?,
                article_number: row.get(2)?,
                quantity_changed: row.get(3)?,
                order_number: row.get(4)?,
                error_message: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .map_err(|e| format!("query unresolved failures: {e}"))?;

    let mut failures = Vec::new();
    for row in rows {
        match row {
            Ok(f) => failures.push(f),
            Err(e) => warn!("skipping malformed unresolved failure row: {e}"),
        }
    }
    Ok(failures)
}

/// Stamp an open failure as resolved. The row stays for audit; a second
/// retry pass will not see it again.
pub fn mark_resolved(db: &DbState, failure_id: i64, resolved_by: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let updated = conn
        .execute(
            "UPDATE unresolved_sync_failures
             SET resolved_at = datetime('now'), resolved_by = ?2
             WHERE id = ?1 AND resolved_at IS NULL",
            params![failure_id, resolved_by],
        )
        .map_err(|e| format!("mark failure resolved: {e}"))?;
    if updated == 0 {
        warn!(failure_id, "mark_resolved: row missing or already resolved");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

fn count_where(conn: &Connection, table: &str, where_clause: &str) -> i64 {
    let query = format!("SELECT COUNT(*) FROM {table} WHERE {where_clause}");
    conn.query_row(&query, [], |row| row.get(0)).unwrap_or(0)
}

/// Ledger and retry-queue statistics for the sync status screen.
pub fn stats(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let success = count_where(&conn, "sync_ledger", "status = 'success'");
    let errors = count_where(&conn, "sync_ledger", "status = 'error'");
    let partial = count_where(&conn, "sync_ledger", "status = 'partial_success'");
    let open_failures = count_where(&conn, "unresolved_sync_failures", "resolved_at IS NULL");
    let resolved_failures = count_where(
        &conn,
        "unresolved_sync_failures",
        "resolved_at IS NOT NULL",
    );

    let last_attempt: Option<String> = conn
        .query_row("SELECT MAX(created_at) FROM sync_ledger", [], |row| {
            row.get(0)
        })
        .ok()
        .flatten();

    Ok(serde_json::json!({
        "totalAttempts": success + errors + partial,
        "success": success,
        "errors": errors,
        "partialSuccess": partial,
        "openFailures": open_failures,
        "resolvedFailures": resolved_failures,
        "lastAttemptAt": last_attempt,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_record_appends_one_row() {
        let db = test_db();
        record(
            &db,
            LedgerEntry::outbound(SYNC_STOCK, STATUS_SUCCESS)
                .article(Some("1201"))
                .product("p1")
                .request(serde_json::json!({"stock": 7}))
                .duration(120),
        );

        let conn = db.conn.lock().unwrap();
        let (count, status, article): (i64, String, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*),
                        (SELECT status FROM sync_ledger LIMIT 1),
                        (SELECT article_number FROM sync_ledger LIMIT 1)
                 FROM sync_ledger",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(status, "success");
        assert_eq!(article.as_deref(), Some("1201"));
    }

    #[test]
    fn test_record_is_best_effort_on_poisoned_state() {
        // Dropping the ledger table simulates a broken local DB layer; the
        // write must be swallowed, not propagated.
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch("DROP TABLE sync_ledger;").unwrap();
        }
        record(&db, LedgerEntry::outbound(SYNC_STOCK, STATUS_ERROR));
    }

    #[test]
    fn test_unresolved_queue_is_oldest_first_and_never_deleted() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO unresolved_sync_failures
                    (product_id, quantity_changed, error_message, created_at)
                 VALUES ('p-old', 3, 'first', '2026-01-01 10:00:00')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO unresolved_sync_failures
                    (product_id, quantity_changed, error_message, created_at)
                 VALUES ('p-new', 5, 'second', '2026-01-02 10:00:00')",
                [],
            )
            .unwrap();
        }

        let open = fetch_unresolved(&db, 10).unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].product_id, "p-old");
        assert_eq!(open[1].product_id, "p-new");

        mark_resolved(&db, open[0].id, "retry_coordinator").unwrap();

        let remaining = fetch_unresolved(&db, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].product_id, "p-new");

        // Resolved rows stay for audit
        let conn = db.conn.lock().unwrap();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM unresolved_sync_failures", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(total, 2);
        let resolved_by: Option<String> = conn
            .query_row(
                "SELECT resolved_by FROM unresolved_sync_failures WHERE product_id = 'p-old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(resolved_by.as_deref(), Some("retry_coordinator"));
    }

    #[test]
    fn test_mark_resolved_skips_already_resolved_rows() {
        let db = test_db();
        let id = enqueue_unresolved(&db, "p1", Some("1201"), 4, Some("GODS-42"), "boom").unwrap();
        mark_resolved(&db, id, "retry_coordinator").unwrap();
        // Second stamp is a no-op, not an error
        mark_resolved(&db, id, "other").unwrap();

        let conn = db.conn.lock().unwrap();
        let resolved_by: String = conn
            .query_row(
                "SELECT resolved_by FROM unresolved_sync_failures WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(resolved_by, "retry_coordinator");
    }

    #[test]
    fn test_stats_counts_by_status() {
        let db = test_db();
        record(&db, LedgerEntry::outbound(SYNC_STOCK, STATUS_SUCCESS));
        record(&db, LedgerEntry::outbound(SYNC_STOCK, STATUS_PARTIAL));
        record(&db, LedgerEntry::outbound(SYNC_PO_ACCRUAL, STATUS_ERROR));
        enqueue_unresolved(&db, "p1", None, 1, None, "boom").unwrap();

        let stats = stats(&db).unwrap();
        assert_eq!(stats.get("totalAttempts").unwrap(), 3);
        assert_eq!(stats.get("success").unwrap(), 1);
        assert_eq!(stats.get("partialSuccess").unwrap(), 1);
        assert_eq!(stats.get("errors").unwrap(), 1);
        assert_eq!(stats.get("openFailures").unwrap(), 1);
    }
}
