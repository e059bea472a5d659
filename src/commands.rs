//! Trigger surface for the warehouse UI.
//!
//! Each entry point maps 1:1 to a workflow and returns a structured JSON
//! outcome the UI can render verbatim. Payloads arrive loosely shaped
//! (camelCase or snake_case, bare ids or wrapper objects), so parsing is
//! alias-tolerant. Workflow failures come back inside the outcome value;
//! only malformed payloads are `Err`.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;
use crate::delivery;
use crate::receiving::{self, AccrualStatus};
use crate::resolver;
use crate::retry;
use crate::stock;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckOffPayload {
    #[serde(alias = "item_id", alias = "id")]
    item_id: String,
    #[serde(default = "default_checked")]
    checked: bool,
    #[serde(default, alias = "quantity_checked", alias = "quantityChecked")]
    quantity: Option<i64>,
}

fn default_checked() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncStockPayload {
    #[serde(alias = "product_id", alias = "id")]
    product_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RetryPayload {
    #[serde(default, alias = "max", alias = "count")]
    limit: Option<i64>,
}

/// Normalize a bare-string argument into the wrapper object the payload
/// structs expect.
fn wrap_bare_id(arg: Option<Value>, key: &str) -> Value {
    match arg {
        Some(Value::String(id)) => serde_json::json!({ key: id }),
        Some(v) => v,
        None => serde_json::json!({}),
    }
}

// ---------------------------------------------------------------------------
// check_off_delivery_item
// ---------------------------------------------------------------------------

/// Operator checked (or unchecked) a delivery note item.
///
/// Checking runs stock reconciliation and purchase-order accrual for the
/// newly-checked quantity and merges both into one outcome:
/// `status` is `success`, `partial` (local state updated, some remote leg
/// skipped or unverified), or `error`.
pub async fn check_off_delivery_item(db: &DbState, payload: Option<Value>) -> Result<Value, String> {
    let parsed: CheckOffPayload = serde_json::from_value(wrap_bare_id(payload, "itemId"))
        .map_err(|e| format!("Invalid check-off payload: {e}"))?;

    let change = delivery::set_item_checked(db, &parsed.item_id, parsed.checked, parsed.quantity)?;

    if !change.is_checked {
        return Ok(serde_json::json!({
            "success": true,
            "status": "success",
            "message": "Item unchecked; no ERP sync performed",
            "item": change,
        }));
    }

    if change.newly_checked == 0 {
        return Ok(serde_json::json!({
            "success": true,
            "status": "success",
            "message": "Item already checked; nothing new to sync",
            "item": change,
        }));
    }

    let article = change.article_number.clone();
    let order_number = change.order_number.clone();
    let received = change.newly_checked;

    // Stock first: the authoritative total must reach Sellus even when the
    // purchase order cannot be found.
    let product_id = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        crate::orders::find_product_by_article(&conn, &article)?
    };
    let stock_result = match product_id.as_deref() {
        Some(pid) => Some(
            stock::reconcile_stock_with_context(db, pid, Some(received), order_number.as_deref())
                .await,
        ),
        None => {
            warn!(article = %article, "no local product for checked item, stock sync skipped");
            None
        }
    };

    let accrual = receiving::accrue_purchase_order(
        db,
        &article,
        received,
        order_number.as_deref().unwrap_or(""),
    )
    .await;

    let stock_ok = matches!(&stock_result, Some(Ok(o)) if o.verified);
    let stock_failed = matches!(&stock_result, Some(Err(_)));
    let status = if stock_ok && accrual.status == AccrualStatus::Success {
        "success"
    } else if stock_failed && accrual.status == AccrualStatus::Error {
        "error"
    } else {
        "partial"
    };

    let mut messages: Vec<String> = Vec::new();
    match &stock_result {
        Some(Ok(outcome)) => messages.push(outcome.message.clone()),
        Some(Err(e)) => messages.push(format!("Stock sync failed (queued for retry): {e}")),
        None => messages.push(format!("No local product for article {article}; stock sync skipped")),
    }
    messages.push(accrual.message.clone());

    let stock_json = match stock_result {
        Some(Ok(outcome)) => serde_json::to_value(outcome).unwrap_or(Value::Null),
        Some(Err(e)) => serde_json::json!({ "error": e }),
        None => Value::Null,
    };

    Ok(serde_json::json!({
        "success": status != "error",
        "status": status,
        "message": messages.join(" | "),
        "item": change,
        "stock": stock_json,
        "purchaseOrder": accrual,
    }))
}

// ---------------------------------------------------------------------------
// sync_product_stock
// ---------------------------------------------------------------------------

/// Push one product's stock total to Sellus.
pub async fn sync_product_stock(db: &DbState, payload: Option<Value>) -> Result<Value, String> {
    let parsed: SyncStockPayload = serde_json::from_value(wrap_bare_id(payload, "productId"))
        .map_err(|e| format!("Invalid stock sync payload: {e}"))?;
    let product_id = parsed.product_id.trim();
    if product_id.is_empty() {
        return Err("Missing productId".into());
    }

    match stock::reconcile_stock(db, product_id).await {
        Ok(outcome) => {
            let verified = outcome.verified;
            let message = outcome.message.clone();
            Ok(serde_json::json!({
                "success": true,
                "status": if verified { "success" } else { "partial" },
                "message": message,
                "stock": outcome,
            }))
        }
        Err(e) => Ok(serde_json::json!({
            "success": false,
            "status": "error",
            "message": e,
        })),
    }
}

// ---------------------------------------------------------------------------
// retry_failed_syncs
// ---------------------------------------------------------------------------

const DEFAULT_RETRY_LIMIT: i64 = 50;
const MAX_RETRY_LIMIT: i64 = 500;

fn parse_retry_limit(payload: Option<Value>) -> i64 {
    let limit = match payload {
        Some(Value::Number(num)) => num.as_i64(),
        Some(Value::Object(obj)) => {
            serde_json::from_value::<RetryPayload>(Value::Object(obj))
                .ok()
                .and_then(|p| p.limit)
        }
        _ => None,
    };
    limit.unwrap_or(DEFAULT_RETRY_LIMIT).clamp(1, MAX_RETRY_LIMIT)
}

/// Re-attempt unresolved sync failures, oldest first.
pub async fn retry_failed_syncs(db: &DbState, payload: Option<Value>) -> Result<Value, String> {
    let limit = parse_retry_limit(payload);
    let report = retry::retry_unresolved(db, limit).await?;
    Ok(serde_json::json!({
        "success": true,
        "processed": report.processed,
        "resolved": report.resolved,
        "stillFailing": report.still_failing,
        "details": report.details,
    }))
}

// ---------------------------------------------------------------------------
// resolve_all_pending_ids
// ---------------------------------------------------------------------------

/// Resolve Sellus item ids for every product still missing one.
pub async fn resolve_all_pending_ids(db: &DbState) -> Result<Value, String> {
    let summary = resolver::resolve_all_pending(db).await?;
    let failed = summary.get("failed").and_then(Value::as_i64).unwrap_or(0);
    Ok(serde_json::json!({
        "success": true,
        "status": if failed == 0 { "success" } else { "partial" },
        "summary": summary,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::{params, Connection};

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

    fn insert_item(db: &DbState, id: &str, article: &str, expected: i64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO delivery_note_items
                (id, delivery_note_number, article_number, order_number, quantity_expected)
             VALUES (?1, 'DN-1', ?2, 'GODS-42', ?3)",
            params![id, article, expected],
        )
        .unwrap();
    }

    #[test]
    fn test_retry_limit_parsing_clamps_and_aliases() {
        assert_eq!(parse_retry_limit(None), DEFAULT_RETRY_LIMIT);
        assert_eq!(parse_retry_limit(Some(serde_json::json!(25))), 25);
        assert_eq!(parse_retry_limit(Some(serde_json::json!(100000))), MAX_RETRY_LIMIT);
        assert_eq!(parse_retry_limit(Some(serde_json::json!(-3))), 1);
        assert_eq!(
            parse_retry_limit(Some(serde_json::json!({"limit": 7}))),
            7
        );
        assert_eq!(parse_retry_limit(Some(serde_json::json!({"max": 9}))), 9);
    }

    #[tokio::test]
    async fn test_sync_product_stock_rejects_missing_id() {
        let db = test_db();
        let err = sync_product_stock(&db, Some(serde_json::json!({"productId": "  "})))
            .await
            .unwrap_err();
        assert!(err.contains("productId"));
    }

    #[tokio::test]
    async fn test_sync_product_stock_returns_error_outcome_not_err() {
        let db = test_db();
        let result = sync_product_stock(&db, Some(serde_json::json!("ghost")))
            .await
            .unwrap();
        assert_eq!(result.get("success").unwrap(), false);
        assert_eq!(result.get("status").and_then(Value::as_str), Some("error"));
    }

    #[tokio::test]
    async fn test_uncheck_performs_no_sync() {
        let db = test_db();
        insert_item(&db, "item-1", "1201", 5);

        let result = check_off_delivery_item(
            &db,
            Some(serde_json::json!({"itemId": "item-1", "checked": false})),
        )
        .await
        .unwrap();

        assert_eq!(result.get("status").and_then(Value::as_str), Some("success"));

        // No ledger traffic for an uncheck.
        let conn = db.conn.lock().unwrap();
        let ledger_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ledger_rows, 0);
    }

    #[tokio::test]
    async fn test_check_off_merges_workflow_outcomes_into_partial() {
        // Offline engine, item present, product known with a cached item id:
        // the stock push fails (queued for retry) and the accrual downgrades
        // to a warning, so the merged outcome is partial and the local item
        // stays checked.
        let db = test_db();
        insert_item(&db, "item-1", "1201", 5);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO products (id, article_number, sellus_item_id)
                 VALUES ('p1', '1201', '55')",
                [],
            )
            .unwrap();
        }

        let result = check_off_delivery_item(
            &db,
            Some(serde_json::json!({"itemId": "item-1"})),
        )
        .await
        .unwrap();

        assert_eq!(result.get("status").and_then(Value::as_str), Some("partial"));
        assert_eq!(result.get("success").unwrap(), true);

        let conn = db.conn.lock().unwrap();
        let is_checked: i64 = conn
            .query_row(
                "SELECT is_checked FROM delivery_note_items WHERE id = 'item-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(is_checked, 1);

        // One ledger entry per workflow invocation: stock + accrual.
        let ledger_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ledger_rows, 2);

        // The failed stock push queued a retry row with the checked delta.
        let (failures, qty): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(MAX(quantity_changed), 0)
                 FROM unresolved_sync_failures",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(qty, 5);
    }

    #[tokio::test]
    async fn test_recheck_is_a_noop_sync() {
        let db = test_db();
        insert_item(&db, "item-1", "1201", 5);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE delivery_note_items
                 SET is_checked = 1, quantity_checked = 5 WHERE id = 'item-1'",
                [],
            )
            .unwrap();
        }

        let result = check_off_delivery_item(&db, Some(serde_json::json!("item-1")))
            .await
            .unwrap();
        assert_eq!(result.get("status").and_then(Value::as_str), Some("success"));
        assert!(result
            .get("message")
            .and_then(Value::as_str)
            .unwrap()
            .contains("nothing new"));

        let conn = db.conn.lock().unwrap();
        let ledger_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ledger_rows, 0);
    }

    #[tokio::test]
    async fn test_resolve_all_pending_ids_with_empty_backlog() {
        let db = test_db();
        let result = resolve_all_pending_ids(&db).await.unwrap();
        assert_eq!(result.get("status").and_then(Value::as_str), Some("success"));
    }
}
