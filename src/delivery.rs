//! Delivery note items.
//!
//! Rows originate from the label/delivery-note extraction service, whose
//! output is untrusted and gets the same validation as manual entry. When
//! an operator checks an item off, the newly-checked delta feeds the stock
//! reconciliation and purchase-order accrual workflows; re-checking an
//! already-checked item yields a zero delta so retries never double-count.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::{value_i64, value_str};

/// Result of flipping an item's checked state.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOffChange {
    pub item_id: String,
    pub article_number: String,
    pub order_number: Option<String>,
    pub is_checked: bool,
    pub quantity_checked: i64,
    /// Quantity newly confirmed by this action; zero when re-checking.
    pub newly_checked: i64,
}

// ---------------------------------------------------------------------------
// Vision ingestion
// ---------------------------------------------------------------------------

/// Store the structured fields extracted from a delivery note photo.
///
/// Expected shape (camelCase, but snake_case aliases are accepted):
/// ```json
/// {
///   "deliveryNoteNumber": "DN-123",
///   "cargoMarking": "GODS-42",
///   "items": [
///     {"articleNumber": "1201", "orderNumber": "GODS-42",
///      "description": "Widget", "quantity": 5}
///   ]
/// }
/// ```
/// Items without an article number or with a non-positive quantity are
/// dropped and reported, not stored.
pub fn ingest_extracted_note(db: &DbState, payload: &Value) -> Result<Value, String> {
    let note_number = value_str(payload, &["deliveryNoteNumber", "delivery_note_number"]);
    let note_marking = value_str(payload, &["cargoMarking", "cargo_marking"]);
    let items = payload
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut imported = 0usize;
    let mut skipped: Vec<Value> = Vec::new();

    for item in &items {
        let article = value_str(item, &["articleNumber", "article_number"]);
        let quantity = value_i64(item, &["quantity", "quantityExpected", "quantity_expected"]);

        let (Some(article), Some(quantity)) = (article, quantity) else {
            skipped.push(serde_json::json!({
                "item": item,
                "reason": "missing article number or quantity",
            }));
            continue;
        };
        if quantity <= 0 {
            skipped.push(serde_json::json!({
                "item": item,
                "reason": format!("non-positive quantity {quantity}"),
            }));
            continue;
        }

        let order_number = value_str(item, &["orderNumber", "order_number"])
            .or_else(|| note_marking.clone());
        let description = value_str(item, &["description", "name"]);

        conn.execute(
            "INSERT INTO delivery_note_items (
                id, delivery_note_number, article_number, order_number,
                description, quantity_expected
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                note_number,
                article,
                order_number,
                description,
                quantity
            ],
        )
        .map_err(|e| format!("insert delivery note item: {e}"))?;
        imported += 1;
    }

    if !skipped.is_empty() {
        warn!(
            note = note_number.as_deref().unwrap_or("?"),
            skipped = skipped.len(),
            "dropped invalid extracted delivery note items"
        );
    }
    info!(
        note = note_number.as_deref().unwrap_or("?"),
        imported, "delivery note items ingested"
    );

    Ok(serde_json::json!({
        "deliveryNoteNumber": note_number,
        "imported": imported,
        "skipped": skipped.len(),
        "skippedItems": skipped,
    }))
}

// ---------------------------------------------------------------------------
// Check-off
// ---------------------------------------------------------------------------

struct ItemRow {
    article_number: String,
    order_number: Option<String>,
    quantity_expected: i64,
    quantity_checked: i64,
}

fn load_item(conn: &Connection, item_id: &str) -> Result<Option<ItemRow>, String> {
    conn.query_row(
        "SELECT article_number, order_number, quantity_expected, quantity_checked
         FROM delivery_note_items WHERE id = ?1",
        params![item_id],
        |row| {
            Ok(ItemRow {
                article_number: row.get(0)?,
                order_number: row.get(1)?,
                quantity_expected: row.get(2)?,
                quantity_checked: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| format!("load delivery note item: {e}"))
}

/// Flip an item's checked state and compute the newly-checked delta.
///
/// Checking records `quantity` (defaulting to the expected quantity) as
/// checked; the delta is how much of that is new compared to any earlier
/// check, so a re-check contributes nothing. Unchecking only clears the
/// flag — no compensating ERP write is attempted, and the checked quantity
/// is kept so a later re-check still nets to zero.
pub fn set_item_checked(
    db: &DbState,
    item_id: &str,
    checked: bool,
    quantity: Option<i64>,
) -> Result<CheckOffChange, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let item = load_item(&conn, item_id)?
        .ok_or_else(|| format!("Delivery note item {item_id} not found"))?;

    if !checked {
        conn.execute(
            "UPDATE delivery_note_items
             SET is_checked = 0, checked_at = NULL, updated_at = datetime('now')
             WHERE id = ?1",
            params![item_id],
        )
        .map_err(|e| format!("uncheck delivery note item: {e}"))?;

        return Ok(CheckOffChange {
            item_id: item_id.to_string(),
            article_number: item.article_number,
            order_number: item.order_number,
            is_checked: false,
            quantity_checked: item.quantity_checked,
            newly_checked: 0,
        });
    }

    let target = quantity.unwrap_or(item.quantity_expected).max(0);
    let newly_checked = (target - item.quantity_checked).max(0);
    let new_checked = item.quantity_checked.max(target);

    conn.execute(
        "UPDATE delivery_note_items
         SET is_checked = 1,
             quantity_checked = ?2,
             checked_at = datetime('now'),
             updated_at = datetime('now')
         WHERE id = ?1",
        params![item_id, new_checked],
    )
    .map_err(|e| format!("check delivery note item: {e}"))?;

    Ok(CheckOffChange {
        item_id: item_id.to_string(),
        article_number: item.article_number,
        order_number: item.order_number,
        is_checked: true,
        quantity_checked: new_checked,
        newly_checked,
    })
}

/// List items for a delivery note, unchecked first.
pub fn items_for_note(db: &DbState, note_number: &str) -> Result<Vec<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, article_number, order_number, description,
                    quantity_expected, quantity_checked, is_checked, checked_at
             FROM delivery_note_items
             WHERE delivery_note_number = ?1
             ORDER BY is_checked ASC, created_at ASC",
        )
        .map_err(|e| format!("prepare note items: {e}"))?;

    let rows = stmt
        .query_map(params![note_number], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "articleNumber": row.get::<_, String>(1)?,
                "orderNumber": row.get::<_, Option<String>>(2)?,
                "description": row.get::<_, Option<String>>(3)?,
                "quantityExpected": row.get::<_, i64>(4)?,
                "quantityChecked": row.get::<_, i64>(5)?,
                "isChecked": row.get::<_, i64>(6)? != 0,
                "checkedAt": row.get::<_, Option<String>>(7)?,
            }))
        })
        .map_err(|e| format!("query note items: {e}"))?;

    let mut items = Vec::new();
    for row in rows {
        match row {
            Ok(item) => items.push(item),
            Err(e) => warn!("skipping malformed delivery note item row: {e}"),
        }
    }
    Ok(items)
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
    fn test_ingest_validates_untrusted_extraction_output() {
        let db = test_db();
        let payload = serde_json::json!({
            "deliveryNoteNumber": "DN-9",
            "cargoMarking": "GODS-42",
            "items": [
                {"articleNumber": "1201", "quantity": 5, "description": "Widget"},
                {"articleNumber": "  ", "quantity": 2},
                {"articleNumber": "1202", "quantity": 0},
                {"description": "no article", "quantity": 3},
            ]
        });

        let report = ingest_extracted_note(&db, &payload).unwrap();
        assert_eq!(report.get("imported").unwrap(), 1);
        assert_eq!(report.get("skipped").unwrap(), 3);

        let conn = db.conn.lock().unwrap();
        let (count, order_number): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), (SELECT order_number FROM delivery_note_items LIMIT 1)
                 FROM delivery_note_items",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        // Item without its own order number inherits the note-level marking.
        assert_eq!(order_number.as_deref(), Some("GODS-42"));
    }

    #[test]
    fn test_check_off_delta_guards_against_double_counting() {
        let db = test_db();
        insert_item(&db, "item-1", "1201", 5);

        let first = set_item_checked(&db, "item-1", true, None).unwrap();
        assert!(first.is_checked);
        assert_eq!(first.quantity_checked, 5);
        assert_eq!(first.newly_checked, 5);

        // Re-checking contributes nothing new.
        let again = set_item_checked(&db, "item-1", true, None).unwrap();
        assert_eq!(again.newly_checked, 0);
        assert_eq!(again.quantity_checked, 5);
    }

    #[test]
    fn test_uncheck_then_recheck_nets_to_zero() {
        let db = test_db();
        insert_item(&db, "item-1", "1201", 5);
        set_item_checked(&db, "item-1", true, None).unwrap();

        let unchecked = set_item_checked(&db, "item-1", false, None).unwrap();
        assert!(!unchecked.is_checked);
        assert_eq!(unchecked.newly_checked, 0);

        // The checked quantity survives the uncheck, so a re-check does not
        // feed the accrual a second time.
        let rechecked = set_item_checked(&db, "item-1", true, None).unwrap();
        assert_eq!(rechecked.newly_checked, 0);
        assert_eq!(rechecked.quantity_checked, 5);
    }

    #[test]
    fn test_partial_then_full_check_accrues_only_the_difference() {
        let db = test_db();
        insert_item(&db, "item-1", "1201", 10);

        let partial = set_item_checked(&db, "item-1", true, Some(4)).unwrap();
        assert_eq!(partial.newly_checked, 4);

        let full = set_item_checked(&db, "item-1", true, Some(10)).unwrap();
        assert_eq!(full.newly_checked, 6);
        assert_eq!(full.quantity_checked, 10);
    }

    #[test]
    fn test_unknown_item_is_an_error() {
        let db = test_db();
        let err = set_item_checked(&db, "ghost", true, None).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_items_for_note_lists_unchecked_first() {
        let db = test_db();
        insert_item(&db, "a", "1201", 5);
        insert_item(&db, "b", "1202", 2);
        set_item_checked(&db, "a", true, None).unwrap();

        let items = items_for_note(&db, "DN-1").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].get("articleNumber").and_then(Value::as_str),
            Some("1202")
        );
        assert_eq!(items[1].get("isChecked").unwrap(), true);
    }
}
