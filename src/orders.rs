//! Remote order resolution and the local order shadow.
//!
//! The resolution chain turns partial, unreliable hints (an operator-entered
//! cargo marking, an article number) into a concrete Sellus order id. The
//! shadow tables mirror the remote orders this warehouse touches so picks
//! and receipts remain visible while the ERP is unreachable.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api;
use crate::db::DbState;
use crate::resolver::{self, ResolveError};
use crate::{value_i64, value_str};

/// Orders absent from the remote listing are kept this long before the
/// zombie cleanup may delete them; protects against eventual-consistency
/// lag on the Sellus side.
const ZOMBIE_GRACE_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum OrderResolveError {
    #[error("No Sellus order found for article {0}")]
    NoOrderFound(String),
    #[error("Sellus unavailable: {0}")]
    RemoteUnavailable(String),
    #[error(transparent)]
    Resolution(#[from] ResolveError),
    #[error("{0}")]
    Db(String),
}

/// A resolved remote order: the opaque id plus the full detail payload.
#[derive(Debug, Clone)]
pub struct RemoteOrder {
    pub id: String,
    pub number: Option<String>,
    pub details: Value,
}

// ---------------------------------------------------------------------------
// Remote listing helpers
// ---------------------------------------------------------------------------

pub(crate) fn order_entry_id(entry: &Value) -> Option<String> {
    for key in ["id", "orderId", "order_id"] {
        match entry.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

pub(crate) fn order_entry_number(entry: &Value) -> Option<String> {
    value_str(
        entry,
        &["orderNumber", "order_number", "number", "reference", "cargoMarking"],
    )
}

/// Whether the remote system considers this order entry active. Sellus
/// deployments disagree on the encoding: a boolean flag or a status string.
pub(crate) fn is_active_order(entry: &Value) -> bool {
    for key in ["isActive", "active", "is_active"] {
        if let Some(flag) = entry.get(key).and_then(Value::as_bool) {
            return flag;
        }
    }
    let status = value_str(entry, &["status", "state", "orderStatus"])
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(status.as_str(), "open" | "active" | "in_progress" | "processing")
}

/// Choose the order entry to use from a remote listing. An exact match on
/// the supplied reference (order number or id) always wins; otherwise the
/// first active entry; otherwise the first entry at all.
pub(crate) fn pick_order_entry<'a>(entries: &'a [Value], hint: Option<&str>) -> Option<&'a Value> {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(exact) = entries.iter().find(|e| {
            order_entry_number(e).as_deref() == Some(hint)
                || order_entry_id(e).as_deref() == Some(hint)
        }) {
            return Some(exact);
        }
    }
    entries
        .iter()
        .find(|e| is_active_order(e))
        .or_else(|| entries.first())
}

// ---------------------------------------------------------------------------
// Resolution chain
// ---------------------------------------------------------------------------

/// Resolve the remote order for an article, trying strategies in priority
/// order. Failure of every strategy is terminal — retries happen only at the
/// workflow level via the retry coordinator, never in here.
pub async fn resolve_remote_order(
    db: &DbState,
    article_ref: &str,
    hint: Option<&str>,
) -> Result<RemoteOrder, OrderResolveError> {
    // Strategy 1: the operator-entered reference is the most specific signal
    // when present, but is frequently missing or malformed.
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        let resp = api::call_configured(
            &format!("/orders/{}", api::percent_encode(hint)),
            "GET",
            None,
        )
        .await;
        if resp.success {
            if let Some(id) = order_entry_id(&resp.data) {
                debug!(article_ref, hint, order_id = %id, "order resolved via direct lookup");
                return Ok(RemoteOrder {
                    number: order_entry_number(&resp.data),
                    details: resp.data,
                    id,
                });
            }
        }
        debug!(article_ref, hint, "direct order lookup missed, falling back");
    }

    // Strategy 2: orders referencing the article's item id.
    let product_id = {
        let conn = db
            .conn
            .lock()
            .map_err(|e| OrderResolveError::Db(e.to_string()))?;
        find_product_by_article(&conn, article_ref)
            .map_err(OrderResolveError::Db)?
            .ok_or_else(|| OrderResolveError::NoOrderFound(article_ref.to_string()))?
    };
    let item_id = resolver::resolve_item_id(db, &product_id).await?;

    let listing = api::call_configured(&format!("/items/{item_id}/orders"), "GET", None).await;
    if !listing.success {
        return Err(OrderResolveError::RemoteUnavailable(listing.error_text()));
    }
    let entries = resolver::catalog_items(&listing.data);
    let chosen = pick_order_entry(&entries, hint)
        .ok_or_else(|| OrderResolveError::NoOrderFound(article_ref.to_string()))?;
    let order_id = order_entry_id(chosen)
        .ok_or_else(|| OrderResolveError::NoOrderFound(article_ref.to_string()))?;

    // Strategy 3: full details for the chosen order.
    let details = api::call_configured(&format!("/orders/{order_id}"), "GET", None).await;
    if !details.success {
        return Err(OrderResolveError::RemoteUnavailable(details.error_text()));
    }

    info!(article_ref, order_id = %order_id, "order resolved via item listing");
    Ok(RemoteOrder {
        number: order_entry_number(&details.data).or_else(|| order_entry_number(chosen)),
        details: details.data,
        id: order_id,
    })
}

pub(crate) fn find_product_by_article(
    conn: &Connection,
    article_ref: &str,
) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT id FROM products WHERE article_number = ?1 LIMIT 1",
        params![article_ref],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("find product by article: {e}"))
}

// ---------------------------------------------------------------------------
// Remote order line helpers
// ---------------------------------------------------------------------------

/// Find the line for an article inside an order detail payload.
pub(crate) fn remote_line_for_article<'a>(details: &'a Value, article_ref: &str) -> Option<&'a Value> {
    let lines = ["lines", "items", "orderLines", "order_lines", "rows"]
        .iter()
        .find_map(|key| details.get(*key).and_then(Value::as_array))?;
    lines.iter().find(|line| {
        value_str(
            line,
            &["articleNumber", "article_number", "itemNumber", "item_number", "sku"],
        )
        .as_deref()
            == Some(article_ref)
    })
}

pub(crate) fn remote_quantity_ordered(line: &Value) -> i64 {
    value_i64(
        line,
        &["quantityOrdered", "quantity_ordered", "quantity", "amount"],
    )
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Local shadow
// ---------------------------------------------------------------------------

/// Insert or refresh the local shadow row for a remote order. Marks the
/// order as seen now, which resets its zombie-cleanup clock.
pub fn upsert_order_shadow(
    conn: &Connection,
    sellus_order_id: &str,
    order_number: Option<&str>,
    order_kind: &str,
) -> Result<String, String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM orders WHERE sellus_order_id = ?1",
            params![sellus_order_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("query order shadow: {e}"))?;

    if let Some(local_id) = existing {
        conn.execute(
            "UPDATE orders
             SET order_number = COALESCE(?2, order_number),
                 last_seen_remote_at = datetime('now'),
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![local_id, order_number],
        )
        .map_err(|e| format!("refresh order shadow: {e}"))?;
        return Ok(local_id);
    }

    let local_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO orders (id, sellus_order_id, order_number, order_kind, last_seen_remote_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
        params![local_id, sellus_order_id, order_number, order_kind],
    )
    .map_err(|e| format!("insert order shadow: {e}"))?;
    Ok(local_id)
}

/// Accrue a received quantity into the shadow order line, creating it when
/// absent. `is_picked` flips once picked reaches ordered (when ordered is
/// known).
pub fn apply_receipt_to_line(
    conn: &Connection,
    order_local_id: &str,
    article_ref: &str,
    quantity_received: i64,
    quantity_ordered_hint: Option<i64>,
) -> Result<(i64, bool), String> {
    let existing: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT id, quantity_ordered, quantity_picked FROM order_lines
             WHERE order_id = ?1 AND article_number = ?2",
            params![order_local_id, article_ref],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| format!("query order line: {e}"))?;

    let (line_id, quantity_ordered, old_picked) = match existing {
        Some((id, ordered, picked)) => {
            let ordered = if ordered <= 0 {
                quantity_ordered_hint.unwrap_or(ordered)
            } else {
                ordered
            };
            (id, ordered, picked)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            let ordered = quantity_ordered_hint.unwrap_or(0);
            conn.execute(
                "INSERT INTO order_lines (id, order_id, article_number, quantity_ordered)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, order_local_id, article_ref, ordered],
            )
            .map_err(|e| format!("insert order line: {e}"))?;
            (id, ordered, 0)
        }
    };

    let new_picked = old_picked + quantity_received;
    let is_picked = quantity_ordered > 0 && new_picked >= quantity_ordered;

    conn.execute(
        "UPDATE order_lines
         SET quantity_ordered = ?2,
             quantity_picked = ?3,
             is_picked = ?4,
             updated_at = datetime('now')
         WHERE id = ?1",
        params![line_id, quantity_ordered, new_picked, is_picked as i64],
    )
    .map_err(|e| format!("update order line: {e}"))?;

    Ok((new_picked, is_picked))
}

// ---------------------------------------------------------------------------
// Zombie cleanup
// ---------------------------------------------------------------------------

/// Delete shadow orders that have been absent from the remote listing for
/// longer than the grace window. Orders present in `remote_ids` get their
/// seen-stamp refreshed instead. Bulk sales-import calls this after each
/// full listing fetch.
pub fn cleanup_zombie_orders(db: &DbState, remote_ids: &[String]) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    for remote_id in remote_ids {
        conn.execute(
            "UPDATE orders SET last_seen_remote_at = datetime('now')
             WHERE sellus_order_id = ?1",
            params![remote_id],
        )
        .map_err(|e| format!("stamp order seen: {e}"))?;
    }

    let cutoff = format!("-{ZOMBIE_GRACE_HOURS} hours");
    let removed = conn
        .execute(
            "DELETE FROM orders
             WHERE COALESCE(last_seen_remote_at, created_at) <= datetime('now', ?1)",
            params![cutoff],
        )
        .map_err(|e| format!("delete zombie orders: {e}"))?;

    if removed > 0 {
        warn!(removed, "removed zombie order shadows absent from Sellus");
    }
    Ok(removed)
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
    fn test_exact_reference_match_beats_first_active() {
        let entries = vec![
            serde_json::json!({"id": 1, "orderNumber": "A-1", "status": "open"}),
            serde_json::json!({"id": 2, "orderNumber": "GODS-42", "status": "closed"}),
        ];
        let picked = pick_order_entry(&entries, Some("GODS-42")).unwrap();
        assert_eq!(order_entry_id(picked).as_deref(), Some("2"));
    }

    #[test]
    fn test_hint_miss_falls_back_to_first_active() {
        let entries = vec![
            serde_json::json!({"id": 1, "orderNumber": "A-1", "status": "closed"}),
            serde_json::json!({"id": 2, "orderNumber": "A-2", "status": "open"}),
            serde_json::json!({"id": 3, "orderNumber": "A-3", "status": "open"}),
        ];
        let picked = pick_order_entry(&entries, Some("NOPE")).unwrap();
        assert_eq!(order_entry_id(picked).as_deref(), Some("2"));
    }

    #[test]
    fn test_no_active_entry_falls_back_to_first() {
        let entries = vec![
            serde_json::json!({"id": 7, "status": "closed"}),
            serde_json::json!({"id": 8, "status": "closed"}),
        ];
        let picked = pick_order_entry(&entries, None).unwrap();
        assert_eq!(order_entry_id(picked).as_deref(), Some("7"));
    }

    #[test]
    fn test_is_active_order_variants() {
        assert!(is_active_order(&serde_json::json!({"isActive": true})));
        assert!(!is_active_order(&serde_json::json!({"isActive": false, "status": "open"})));
        assert!(is_active_order(&serde_json::json!({"status": "In_Progress"})));
        assert!(!is_active_order(&serde_json::json!({"status": "shipped"})));
        assert!(!is_active_order(&serde_json::json!({})));
    }

    #[test]
    fn test_remote_line_lookup_and_quantity() {
        let details = serde_json::json!({
            "id": "500",
            "lines": [
                {"articleNumber": "1200", "quantityOrdered": 4},
                {"article_number": "1201", "quantity": 9},
            ]
        });
        let line = remote_line_for_article(&details, "1201").unwrap();
        assert_eq!(remote_quantity_ordered(line), 9);
        assert!(remote_line_for_article(&details, "9999").is_none());
    }

    #[test]
    fn test_apply_receipt_accrues_and_flips_picked() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let local_id = upsert_order_shadow(&conn, "remote-1", Some("GODS-42"), "purchase").unwrap();

        let (picked, done) = apply_receipt_to_line(&conn, &local_id, "1201", 3, Some(5)).unwrap();
        assert_eq!(picked, 3);
        assert!(!done);

        let (picked, done) = apply_receipt_to_line(&conn, &local_id, "1201", 2, Some(5)).unwrap();
        assert_eq!(picked, 5);
        assert!(done);

        let is_picked: i64 = conn
            .query_row(
                "SELECT is_picked FROM order_lines WHERE order_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(is_picked, 1);
    }

    #[test]
    fn test_upsert_shadow_is_idempotent_per_remote_id() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let first = upsert_order_shadow(&conn, "remote-1", None, "purchase").unwrap();
        let second = upsert_order_shadow(&conn, "remote-1", Some("GODS-42"), "purchase").unwrap();
        assert_eq!(first, second);

        let (count, number): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), (SELECT order_number FROM orders LIMIT 1) FROM orders",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(number.as_deref(), Some("GODS-42"));
    }

    #[test]
    fn test_zombie_cleanup_respects_grace_window() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            // Absent from remote and last seen two days ago: eligible.
            conn.execute(
                "INSERT INTO orders (id, sellus_order_id, last_seen_remote_at)
                 VALUES ('stale', 'remote-stale', datetime('now', '-2 days'))",
                [],
            )
            .unwrap();
            // Absent from remote but seen recently: protected by the grace window.
            conn.execute(
                "INSERT INTO orders (id, sellus_order_id, last_seen_remote_at)
                 VALUES ('fresh', 'remote-fresh', datetime('now', '-1 hour'))",
                [],
            )
            .unwrap();
            // Present in the remote listing and stale: stamp refreshed, kept.
            conn.execute(
                "INSERT INTO orders (id, sellus_order_id, last_seen_remote_at)
                 VALUES ('listed', 'remote-listed', datetime('now', '-3 days'))",
                [],
            )
            .unwrap();
        }

        let removed = cleanup_zombie_orders(&db, &["remote-listed".to_string()]).unwrap();
        assert_eq!(removed, 1);

        let conn = db.conn.lock().unwrap();
        let survivors: Vec<String> = {
            let mut stmt = conn.prepare("SELECT id FROM orders ORDER BY id").unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        assert_eq!(survivors, vec!["fresh".to_string(), "listed".to_string()]);
    }
}
