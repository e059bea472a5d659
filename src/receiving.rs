//! Purchase-order accrual: book a received quantity onto the matching Sellus
//! purchase order.
//!
//! Sellus has no atomic increment, so the workflow reads the current
//! quantity counters, adds the received amount locally, and posts the full
//! recomputed triple back. The read and the write are two separate calls;
//! a concurrent update from elsewhere in that window is lost. That race is
//! an accepted property of the integration — the remote API offers no
//! optimistic-concurrency token to close it with.
//!
//! Outcomes are three-way (success / warning / error), never a boolean:
//! a missing purchase order must not invalidate the operator's local
//! receipt.

use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use crate::api;
use crate::db::DbState;
use crate::ledger;
use crate::orders::{self, RemoteOrder};
use crate::value_i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccrualStatus {
    Success,
    Warning,
    Error,
}

/// The three quantity counters Sellus tracks per purchase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityTriple {
    pub shipped_quantity: i64,
    pub stock_quantity: i64,
    pub total_stock_quantity: i64,
}

/// Structured outcome of a purchase-order accrual run.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualOutcome {
    pub status: AccrualStatus,
    pub message: String,
    pub article_number: String,
    pub quantity_received: i64,
    pub remote_order_id: Option<String>,
    pub purchase_order_id: Option<String>,
    pub skipped_order_sync: bool,
    pub accrued: Option<QuantityTriple>,
}

impl AccrualOutcome {
    fn base(article_number: &str, quantity_received: i64) -> Self {
        Self {
            status: AccrualStatus::Error,
            message: String::new(),
            article_number: article_number.to_string(),
            quantity_received,
            remote_order_id: None,
            purchase_order_id: None,
            skipped_order_sync: false,
            accrued: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Quantity parsing and accrual
// ---------------------------------------------------------------------------

/// Current counters of a purchase-order payload, tolerating the field-name
/// variants seen across deployments. Absent counters read as zero.
pub(crate) fn read_quantity_triple(po: &Value) -> QuantityTriple {
    QuantityTriple {
        shipped_quantity: value_i64(po, &["shippedQuantity", "shipped_quantity", "shipped"])
            .unwrap_or(0),
        stock_quantity: value_i64(po, &["stockQuantity", "stock_quantity", "stock"]).unwrap_or(0),
        total_stock_quantity: value_i64(
            po,
            &["totalStockQuantity", "total_stock_quantity", "totalStock", "total_stock"],
        )
        .unwrap_or(0),
    }
}

/// Accrue a received quantity onto the existing counters. Always an
/// addition — overwriting with the delta alone would erase prior receipts.
pub(crate) fn accrue(old: QuantityTriple, received: i64) -> QuantityTriple {
    QuantityTriple {
        shipped_quantity: old.shipped_quantity + received,
        stock_quantity: old.stock_quantity + received,
        total_stock_quantity: old.total_stock_quantity + received,
    }
}

/// Build the update payload: echo identifying fields, carry the full
/// recomputed triple.
pub(crate) fn build_accrual_payload(po: &Value, new: QuantityTriple) -> Value {
    let mut payload = serde_json::Map::new();
    for echo_key in ["id", "orderNumber", "order_number", "number", "cargoMarking"] {
        if let Some(v) = po.get(echo_key) {
            if !v.is_null() {
                payload.insert(echo_key.to_string(), v.clone());
            }
        }
    }
    payload.insert(
        "shippedQuantity".to_string(),
        Value::from(new.shipped_quantity),
    );
    payload.insert("stockQuantity".to_string(), Value::from(new.stock_quantity));
    payload.insert(
        "totalStockQuantity".to_string(),
        Value::from(new.total_stock_quantity),
    );
    Value::Object(payload)
}

/// Choose the purchase order from a filtered listing. The server already
/// filtered by the cargo marking, but an exact field match still wins over
/// blind first-entry when the filter matched loosely.
pub(crate) fn match_purchase_order<'a>(entries: &'a [Value], marking: &str) -> Option<&'a Value> {
    let marking = marking.trim();
    entries
        .iter()
        .find(|e| {
            crate::value_str(
                e,
                &["cargoMarking", "cargo_marking", "reference", "orderNumber", "number"],
            )
            .as_deref()
                == Some(marking)
        })
        .or_else(|| entries.first())
}

// ---------------------------------------------------------------------------
// Local mirror
// ---------------------------------------------------------------------------

/// Mirror the receipt into the local order shadow, creating the order and
/// line when absent.
fn mirror_receipt(
    db: &DbState,
    remote_order: &RemoteOrder,
    article_ref: &str,
    quantity_received: i64,
) -> Result<(i64, bool), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let local_id = orders::upsert_order_shadow(
        &conn,
        &remote_order.id,
        remote_order.number.as_deref(),
        "purchase",
    )?;
    let ordered_hint = orders::remote_line_for_article(&remote_order.details, article_ref)
        .map(orders::remote_quantity_ordered)
        .filter(|q| *q > 0);
    orders::apply_receipt_to_line(&conn, &local_id, article_ref, quantity_received, ordered_hint)
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn ledger_status_for(status: AccrualStatus) -> &'static str {
    match status {
        AccrualStatus::Success => ledger::STATUS_SUCCESS,
        AccrualStatus::Warning => ledger::STATUS_PARTIAL,
        AccrualStatus::Error => ledger::STATUS_ERROR,
    }
}

fn finish(db: &DbState, outcome: AccrualOutcome, started: Instant) -> AccrualOutcome {
    ledger::record(
        db,
        ledger::LedgerEntry::outbound(ledger::SYNC_PO_ACCRUAL, ledger_status_for(outcome.status))
            .article(Some(outcome.article_number.as_str()))
            .request(serde_json::json!({
                "quantityReceived": outcome.quantity_received,
                "remoteOrderId": outcome.remote_order_id,
                "purchaseOrderId": outcome.purchase_order_id,
            }))
            .response(serde_json::json!({
                "status": outcome.status,
                "message": outcome.message,
                "accrued": outcome.accrued,
            }))
            .duration(started.elapsed().as_millis() as u64),
    );
    outcome
}

/// Accrue a received quantity onto the matching Sellus purchase order.
///
/// Never raises: the outcome's status field distinguishes full success,
/// warning (local receipt kept, remote purchase order not updated), and
/// hard failure.
pub async fn accrue_purchase_order(
    db: &DbState,
    article_ref: &str,
    quantity_received: i64,
    cargo_marking: &str,
) -> AccrualOutcome {
    let started = Instant::now();
    let mut outcome = AccrualOutcome::base(article_ref, quantity_received);

    if quantity_received <= 0 {
        outcome.message = format!("Received quantity must be positive, got {quantity_received}");
        return finish(db, outcome, started);
    }

    // 1. Locate the remote order. A miss downgrades to a warning: the
    //    operator's local receipt stands even when the ERP knows nothing
    //    about the delivery.
    let remote_order = match orders::resolve_remote_order(db, article_ref, Some(cargo_marking)).await
    {
        Ok(order) => order,
        Err(e) => {
            warn!(article_ref, cargo_marking, error = %e, "purchase order sync skipped");
            outcome.status = AccrualStatus::Warning;
            outcome.skipped_order_sync = true;
            outcome.message = format!("Purchase order sync skipped: {e}");
            return finish(db, outcome, started);
        }
    };
    outcome.remote_order_id = Some(remote_order.id.clone());

    // 2. Mirror the receipt locally before touching remote counters, so the
    //    warehouse view is correct whatever happens next.
    match mirror_receipt(db, &remote_order, article_ref, quantity_received) {
        Ok((picked, done)) => {
            info!(
                article_ref,
                order_id = %remote_order.id,
                quantity_picked = picked,
                line_complete = done,
                "receipt mirrored into order shadow"
            );
        }
        Err(e) => {
            outcome.message = format!("Failed to record receipt locally: {e}");
            return finish(db, outcome, started);
        }
    }

    // 3. Find the purchase order by cargo marking.
    let filter_endpoint = format!(
        "/purchase-orders?filter=%22{}%22",
        api::percent_encode(cargo_marking.trim())
    );
    let search = api::call_configured(&filter_endpoint, "GET", None).await;
    if !search.success {
        outcome.message = format!(
            "Purchase order search failed: {}",
            search.error_text()
        );
        return finish(db, outcome, started);
    }
    let entries = crate::resolver::catalog_items(&search.data);
    let Some(po_entry) = match_purchase_order(&entries, cargo_marking) else {
        outcome.status = AccrualStatus::Warning;
        outcome.message = format!(
            "No Sellus purchase order matches cargo marking {cargo_marking}; local receipt kept"
        );
        return finish(db, outcome, started);
    };
    let Some(po_id) = orders::order_entry_id(po_entry) else {
        outcome.status = AccrualStatus::Warning;
        outcome.message =
            "Matched purchase order carries no usable id; local receipt kept".to_string();
        return finish(db, outcome, started);
    };
    outcome.purchase_order_id = Some(po_id.clone());

    // 4. Read the current counters and push the accrued triple back.
    //    Optimistic read-then-write; see the module docs for the race note.
    let details = api::call_configured(&format!("/purchase-orders/{po_id}"), "GET", None).await;
    if !details.success {
        outcome.message = format!(
            "Failed to read purchase order {po_id}: {}",
            details.error_text()
        );
        return finish(db, outcome, started);
    }

    let old = read_quantity_triple(&details.data);
    let new = accrue(old, quantity_received);
    let payload = build_accrual_payload(&details.data, new);

    let push = api::call_configured(
        &format!("/purchase-orders/{po_id}"),
        "POST",
        Some(payload),
    )
    .await;
    if !push.success {
        outcome.message = format!(
            "Purchase order update rejected by Sellus: {}",
            push.error_text()
        );
        return finish(db, outcome, started);
    }

    info!(
        article_ref,
        po_id = %po_id,
        received = quantity_received,
        shipped = new.shipped_quantity,
        "purchase order counters accrued"
    );

    outcome.status = AccrualStatus::Success;
    outcome.accrued = Some(new);
    outcome.message = format!(
        "Accrued {quantity_received} onto purchase order {po_id} (shipped {} -> {})",
        old.shipped_quantity, new.shipped_quantity
    );
    finish(db, outcome, started)
}

// ===========================================================================
// Tests
// ===========================================================================
