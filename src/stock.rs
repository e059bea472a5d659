//! Stock reconciliation: push a product's authoritative local stock total to
//! Sellus and verify the write landed.
//!
//! The pushed value is always the sum across every inventory location, never
//! a per-location partial. The update payload carries the new value under
//! all three field names Sellus deployments have been observed to accept.
//! Every invocation writes exactly one sync ledger entry, whatever the
//! outcome; terminal failures additionally enqueue an unresolved-failure row
//! so the operator's pick/receive action never blocks on ERP availability.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use crate::api;
use crate::db::DbState;
use crate::ledger;
use crate::resolver;
use crate::value_i64;

/// Outcome of a stock reconciliation run.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSyncOutcome {
    pub product_id: String,
    pub article_number: Option<String>,
    pub sellus_item_id: String,
    pub target_stock: i64,
    pub old_stock: Option<i64>,
    pub observed_stock: Option<i64>,
    pub verified: bool,
    pub message: String,
}

/// Authoritative total stock: the sum of all inventory records for the
/// product.
pub fn total_stock(conn: &Connection, product_id: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(SUM(quantity), 0) FROM inventory_records WHERE product_id = ?1",
        params![product_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("sum inventory: {e}"))
}

/// Stock value of a remote item payload, under the field aliases Sellus
/// deployments use.
pub(crate) fn parse_stock_value(item: &Value) -> Option<i64> {
    value_i64(
        item,
        &[
            "stock",
            "quantity",
            "availableQuantity",
            "available_quantity",
            "stockQuantity",
            "stock_quantity",
        ],
    )
}

/// Build the stock update payload: echo the identifying fields Sellus
/// requires back unchanged, and carry the new value under every accepted
/// alias, since the exact field name is not guaranteed by the API docs.
pub(crate) fn build_stock_update_payload(remote_item: &Value, target_stock: i64) -> Value {
    let mut payload = serde_json::Map::new();
    for echo_key in ["id", "itemNumber", "item_number", "name", "unit", "groupId"] {
        if let Some(v) = remote_item.get(echo_key) {
            if !v.is_null() {
                payload.insert(echo_key.to_string(), v.clone());
            }
        }
    }
    payload.insert("stock".to_string(), Value::from(target_stock));
    payload.insert("quantity".to_string(), Value::from(target_stock));
    payload.insert("availableQuantity".to_string(), Value::from(target_stock));
    Value::Object(payload)
}

/// Record the single terminal-failure ledger entry, enqueue the retry row
/// (unless the run came from the retry coordinator, whose source row stays
/// open by itself), and hand back the error message.
fn fail_terminal(
    db: &DbState,
    product_id: &str,
    article_number: Option<&str>,
    quantity_changed: i64,
    order_number: Option<&str>,
    error: String,
    started: Instant,
    enqueue: bool,
) -> String {
    if enqueue {
        if let Err(e) = ledger::enqueue_unresolved(
            db,
            product_id,
            article_number,
            quantity_changed,
            order_number,
            &error,
        ) {
            warn!(product_id, error = %e, "failed to enqueue unresolved stock failure");
        }
    }
    ledger::record(
        db,
        ledger::LedgerEntry::outbound(ledger::SYNC_STOCK, ledger::STATUS_ERROR)
            .article(article_number)
            .product(product_id)
            .error(error.clone())
            .duration(started.elapsed().as_millis() as u64),
    );
    error
}

/// Reconcile a product's stock with Sellus. See
/// [`reconcile_stock_with_context`] for the variant that records the
/// triggering receipt delta for retry bookkeeping.
pub async fn reconcile_stock(db: &DbState, product_id: &str) -> Result<StockSyncOutcome, String> {
    reconcile_stock_with_context(db, product_id, None, None).await
}

/// Reconcile a product's stock with Sellus.
///
/// `quantity_changed` and `order_number` describe the receipt/pick event
/// that triggered the run; they are recorded on the unresolved-failure row
/// so a later retry can report what was at stake.
pub async fn reconcile_stock_with_context(
    db: &DbState,
    product_id: &str,
    quantity_changed: Option<i64>,
    order_number: Option<&str>,
) -> Result<StockSyncOutcome, String> {
    run_reconcile(db, product_id, quantity_changed, order_number, true).await
}

/// Re-run used by the retry coordinator: terminal failures leave the
/// original unresolved row in place instead of enqueueing a duplicate.
pub(crate) async fn reconcile_stock_for_retry(
    db: &DbState,
    product_id: &str,
    quantity_changed: Option<i64>,
    order_number: Option<&str>,
) -> Result<StockSyncOutcome, String> {
    run_reconcile(db, product_id, quantity_changed, order_number, false).await
}

async fn run_reconcile(
    db: &DbState,
    product_id: &str,
    quantity_changed: Option<i64>,
    order_number: Option<&str>,
    enqueue_on_failure: bool,
) -> Result<StockSyncOutcome, String> {
    let started = Instant::now();

    // 1. Authoritative local total. The lock is released before any ledger
    //    write below; std::sync::Mutex is not reentrant.
    let loaded: Result<Option<(Option<String>, i64)>, String> = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let article: Option<Option<String>> = conn
            .query_row(
                "SELECT article_number FROM products WHERE id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("load product: {e}"))?;
        match article {
            Some(article) => total_stock(&conn, product_id).map(|sum| Some((article, sum))),
            None => Ok(None),
        }
    };
    let (article_number, target_stock) = match loaded {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            return Err(fail_terminal(
                db,
                product_id,
                None,
                quantity_changed.unwrap_or(0),
                order_number,
                format!("Product {product_id} not found in local database"),
                started,
                enqueue_on_failure,
            ));
        }
        Err(e) => {
            return Err(fail_terminal(
                db,
                product_id,
                None,
                quantity_changed.unwrap_or(0),
                order_number,
                e,
                started,
                enqueue_on_failure,
            ));
        }
    };
    let delta = quantity_changed.unwrap_or(target_stock);

    // 2. Resolve the Sellus item id. This is the only workflow allowed to
    //    enqueue the retry table.
    let item_id = match resolver::resolve_item_id(db, product_id).await {
        Ok(id) => id,
        Err(e) => {
            return Err(fail_terminal(
                db,
                product_id,
                article_number.as_deref(),
                delta,
                order_number,
                e.to_string(),
                started,
                enqueue_on_failure,
            ));
        }
    };

    // 3. Current remote record: old stock for audit plus the fields that
    //    must be echoed back unchanged.
    let current = api::call_configured(&format!("/items/{item_id}"), "GET", None).await;
    if !current.success {
        return Err(fail_terminal(
            db,
            product_id,
            article_number.as_deref(),
            delta,
            order_number,
            format!("Failed to read current Sellus item: {}", current.error_text()),
            started,
            enqueue_on_failure,
        ));
    }
    let old_stock = parse_stock_value(&current.data);
    let payload = build_stock_update_payload(&current.data, target_stock);

    // 4. Push the new total. POST first; some deployments only accept PUT
    //    on the item endpoint, so retry once on a method-not-allowed error.
    let endpoint = format!("/items/{item_id}");
    let mut push = api::call_configured(&endpoint, "POST", Some(payload.clone())).await;
    if !push.success && api::is_method_not_allowed_error(&push.error_text()) {
        info!(item_id = %item_id, "POST rejected, retrying stock update with PUT");
        push = api::call_configured(&endpoint, "PUT", Some(payload.clone())).await;
    }
    if !push.success {
        return Err(fail_terminal(
            db,
            product_id,
            article_number.as_deref(),
            delta,
            order_number,
            format!("Stock update rejected by Sellus: {}", push.error_text()),
            started,
            enqueue_on_failure,
        ));
    }

    // 5. Read back and compare. A mismatch is the signal, not an error:
    //    the write is still reported as having happened.
    let readback = api::call_configured(&format!("/items/{item_id}"), "GET", None).await;
    let observed_stock = if readback.success {
        parse_stock_value(&readback.data)
    } else {
        warn!(
            item_id = %item_id,
            error = %readback.error_text(),
            "stock verification read failed"
        );
        None
    };
    let verified = observed_stock == Some(target_stock);

    let message = if verified {
        format!("Stock synced and verified at {target_stock}")
    } else if let Some(observed) = observed_stock {
        format!("Stock pushed as {target_stock} but Sellus reports {observed}")
    } else {
        format!("Stock pushed as {target_stock} but verification read failed")
    };

    let status = if verified {
        ledger::STATUS_SUCCESS
    } else {
        ledger::STATUS_PARTIAL
    };
    ledger::record(
        db,
        ledger::LedgerEntry::outbound(ledger::SYNC_STOCK, status)
            .article(article_number.as_deref())
            .product(product_id)
            .request(payload)
            .response(serde_json::json!({
                "oldStock": old_stock,
                "observedStock": observed_stock,
                "verified": verified,
            }))
            .duration(started.elapsed().as_millis() as u64),
    );

    // Stamp the sync moment on the product row.
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let _ = conn.execute(
            "UPDATE products
             SET sync_status = 'synced', last_synced_at = datetime('now'),
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![product_id],
        );
    }

    info!(
        product_id,
        target_stock, verified, "stock reconciliation complete"
    );

    Ok(StockSyncOutcome {
        product_id: product_id.to_string(),
        article_number,
        sellus_item_id: item_id,
        target_stock,
        old_stock,
        observed_stock,
        verified,
        message,
    })
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

    fn insert_product(db: &DbState, id: &str, article: Option<&str>, item_id: Option<&str>) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (id, article_number, sellus_item_id) VALUES (?1, ?2, ?3)",
            params![id, article, item_id],
        )
        .unwrap();
    }

    fn insert_inventory(db: &DbState, product_id: &str, location: &str, qty: i64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO inventory_records (id, product_id, location_id, quantity)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                format!("{product_id}-{location}"),
                product_id,
                location,
                qty
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_total_stock_sums_all_locations() {
        let db = test_db();
        insert_product(&db, "p1", Some("1201"), None);
        insert_inventory(&db, "p1", "A", 4);
        insert_inventory(&db, "p1", "B", 7);
        insert_inventory(&db, "p1", "C", 0);
        // A different product's stock must not leak in.
        insert_product(&db, "p2", Some("1202"), None);
        insert_inventory(&db, "p2", "A", 99);

        let conn = db.conn.lock().unwrap();
        assert_eq!(total_stock(&conn, "p1").unwrap(), 11);
        assert_eq!(total_stock(&conn, "missing").unwrap(), 0);
    }

    #[test]
    fn test_update_payload_carries_all_three_aliases() {
        let remote_item = serde_json::json!({
            "id": "55",
            "itemNumber": "1201",
            "name": "Widget",
            "stock": 10
        });
        let payload = build_stock_update_payload(&remote_item, 13);
        assert_eq!(payload.get("stock").unwrap(), 13);
        assert_eq!(payload.get("quantity").unwrap(), 13);
        assert_eq!(payload.get("availableQuantity").unwrap(), 13);
        // Remote-required fields echoed back unchanged
        assert_eq!(payload.get("id").unwrap(), "55");
        assert_eq!(payload.get("itemNumber").unwrap(), "1201");
        assert_eq!(payload.get("name").unwrap(), "Widget");
    }

    #[test]
    fn test_parse_stock_value_aliases() {
        assert_eq!(parse_stock_value(&serde_json::json!({"stock": 5})), Some(5));
        assert_eq!(
            parse_stock_value(&serde_json::json!({"availableQuantity": 8})),
            Some(8)
        );
        assert_eq!(
            parse_stock_value(&serde_json::json!({"stock_quantity": 3})),
            Some(3)
        );
        assert_eq!(parse_stock_value(&serde_json::json!({"name": "x"})), None);
    }

    #[tokio::test]
    async fn test_resolution_failure_enqueues_retry_row_and_one_ledger_entry() {
        // Unconfigured remote: resolution cannot succeed, so the workflow
        // must fail terminally, enqueue exactly one unresolved failure, and
        // write exactly one ledger entry.
        let db = test_db();
        insert_product(&db, "p1", Some("1201"), None);
        insert_inventory(&db, "p1", "A", 6);

        let err = reconcile_stock_with_context(&db, "p1", Some(6), Some("GODS-42"))
            .await
            .unwrap_err();
        assert!(!err.is_empty());

        let conn = db.conn.lock().unwrap();
        let (failures, ledger_rows): (i64, i64) = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM unresolved_sync_failures),
                        (SELECT COUNT(*) FROM sync_ledger)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(ledger_rows, 1);

        let (qty, order_number, status): (i64, Option<String>, String) = conn
            .query_row(
                "SELECT quantity_changed, order_number,
                        (SELECT status FROM sync_ledger LIMIT 1)
                 FROM unresolved_sync_failures",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(qty, 6);
        assert_eq!(order_number.as_deref(), Some("GODS-42"));
        assert_eq!(status, "error");
    }

    #[tokio::test]
    async fn test_remote_read_failure_after_cached_resolution_is_terminal() {
        // Cached item id: resolution succeeds offline, the subsequent item
        // read fails, and the failure must land in both tables exactly once.
        let db = test_db();
        insert_product(&db, "p1", Some("1201"), Some("55"));
        insert_inventory(&db, "p1", "A", 9);

        let err = reconcile_stock(&db, "p1").await.unwrap_err();
        assert!(err.contains("Sellus"));

        let conn = db.conn.lock().unwrap();
        let (failures, ledger_rows): (i64, i64) = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM unresolved_sync_failures),
                        (SELECT COUNT(*) FROM sync_ledger)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(ledger_rows, 1);

        // With no explicit delta the full target total is recorded.
        let qty: i64 = conn
            .query_row(
                "SELECT quantity_changed FROM unresolved_sync_failures",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(qty, 9);
    }

    #[tokio::test]
    async fn test_unknown_product_fails_terminally() {
        let db = test_db();
        let err = reconcile_stock(&db, "ghost").await.unwrap_err();
        assert!(err.contains("not found"));

        let conn = db.conn.lock().unwrap();
        let ledger_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ledger_rows, 1);
    }
}
