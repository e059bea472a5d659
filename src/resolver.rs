//! Sellus item identifier resolution.
//!
//! Maps a product's human-entered article number to the ERP's opaque numeric
//! item id. Resolved ids are cached on the product row and never re-derived
//! unless explicitly cleared. The catalog-scan fallback exists because not
//! every Sellus deployment supports direct lookup by article number.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api;
use crate::db::DbState;
use crate::ledger;
use crate::value_str;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Product {0} not found in local database")]
    ProductNotFound(String),
    #[error("Product has no Sellus article number")]
    MissingArticleRef,
    #[error("Article {0} not found in Sellus catalog")]
    ArticleNotFound(String),
    #[error("Sellus unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("{0}")]
    Db(String),
}

/// Locally cached view of the fields resolution reads and writes.
struct ProductRef {
    article_number: Option<String>,
    sellus_item_id: Option<String>,
}

fn load_product(conn: &Connection, product_id: &str) -> Result<Option<ProductRef>, ResolveError> {
    conn.query_row(
        "SELECT article_number, sellus_item_id FROM products WHERE id = ?1",
        params![product_id],
        |row| {
            Ok(ProductRef {
                article_number: row.get(0)?,
                sellus_item_id: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| ResolveError::Db(format!("load product: {e}")))
}

/// Persist a freshly resolved item id and mark the product synced.
fn persist_resolved(
    conn: &Connection,
    product_id: &str,
    item_id: &str,
) -> Result<(), ResolveError> {
    conn.execute(
        "UPDATE products
         SET sellus_item_id = ?2,
             sync_status = 'synced',
             sync_error = NULL,
             last_synced_at = datetime('now'),
             updated_at = datetime('now')
         WHERE id = ?1",
        params![product_id, item_id],
    )
    .map_err(|e| ResolveError::Db(format!("persist resolved id: {e}")))?;
    Ok(())
}

fn mark_resolution_failure(conn: &Connection, product_id: &str, error: &str) {
    let result = conn.execute(
        "UPDATE products
         SET sync_status = 'error', sync_error = ?2, updated_at = datetime('now')
         WHERE id = ?1",
        params![product_id, error],
    );
    if let Err(e) = result {
        warn!(product_id, error = %e, "failed to record resolution failure on product");
    }
}

/// Drop the cached id so the next resolution re-derives it. The only path
/// that ever clears the cache.
pub fn clear_resolved(db: &DbState, product_id: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE products
         SET sellus_item_id = NULL, sync_status = 'unsynced', updated_at = datetime('now')
         WHERE id = ?1",
        params![product_id],
    )
    .map_err(|e| format!("clear resolved id: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Catalog parsing
// ---------------------------------------------------------------------------

/// Extract the item list from a catalog response. Deployments differ on the
/// envelope: a bare array, or wrapped under `items` / `data` / `result`.
pub(crate) fn catalog_items(data: &Value) -> Vec<Value> {
    if let Some(arr) = data.as_array() {
        return arr.clone();
    }
    for key in ["items", "data", "result"] {
        if let Some(arr) = data.get(key).and_then(Value::as_array) {
            return arr.clone();
        }
    }
    Vec::new()
}

/// The ERP's opaque id for an item, tolerating numeric and string encodings.
pub(crate) fn item_id_of(item: &Value) -> Option<String> {
    for key in ["id", "itemId", "item_id"] {
        match item.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// The item's article number under the field names observed across
/// deployments.
pub(crate) fn item_article_number(item: &Value) -> Option<String> {
    value_str(
        item,
        &["itemNumber", "item_number", "articleNumber", "article_number", "number", "sku"],
    )
}

/// Build an article-number → item-id map from a catalog listing.
pub(crate) fn build_catalog_map(items: &[Value]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        let (Some(article), Some(id)) = (item_article_number(item), item_id_of(item)) else {
            continue;
        };
        map.insert(article, id);
    }
    map
}

/// Fetch the full remote item catalog. `/items` first; some deployments only
/// populate `/items/full`.
async fn fetch_item_catalog() -> Result<Vec<Value>, ResolveError> {
    let resp = api::call_configured("/items", "GET", None).await;
    if !resp.success {
        return Err(ResolveError::RemoteUnavailable(resp.error_text()));
    }
    let mut items = catalog_items(&resp.data);
    if items.is_empty() {
        debug!("catalog empty from /items, trying /items/full");
        let full = api::call_configured("/items/full", "GET", None).await;
        if !full.success {
            return Err(ResolveError::RemoteUnavailable(full.error_text()));
        }
        items = catalog_items(&full.data);
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the article number against an already-fetched catalog map and
/// persist the hit. Shared seam between the single and batch paths so the
/// resolve-once invariant is testable without a remote.
fn resolve_from_map(
    conn: &Connection,
    product_id: &str,
    article_number: &str,
    catalog: &HashMap<String, String>,
) -> Result<String, ResolveError> {
    match catalog.get(article_number) {
        Some(item_id) => {
            persist_resolved(conn, product_id, item_id)?;
            info!(product_id, article_number, item_id = %item_id, "resolved Sellus item id");
            Ok(item_id.clone())
        }
        None => {
            let err = ResolveError::ArticleNotFound(article_number.to_string());
            mark_resolution_failure(conn, product_id, &err.to_string());
            warn!(product_id, article_number, "article not in Sellus catalog");
            Err(err)
        }
    }
}

/// Resolve a product's Sellus item id.
///
/// The cached id is the fast path and performs no remote call. Otherwise a
/// direct by-item-number lookup is attempted, then a full catalog scan.
/// A hit is persisted on the product row before returning.
pub async fn resolve_item_id(db: &DbState, product_id: &str) -> Result<String, ResolveError> {
    let product = {
        let conn = db.conn.lock().map_err(|e| ResolveError::Db(e.to_string()))?;
        load_product(&conn, product_id)?
            .ok_or_else(|| ResolveError::ProductNotFound(product_id.to_string()))?
    };

    if let Some(cached) = product
        .sellus_item_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        debug!(product_id, item_id = cached, "using cached Sellus item id");
        return Ok(cached.to_string());
    }

    let article_number = product
        .article_number
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ResolveError::MissingArticleRef)?
        .to_string();

    // Direct lookup first; not every deployment supports it, so a miss or
    // failure falls through to the catalog scan.
    let direct = api::call_configured(
        &format!("/items/by-item-number/{}", api::percent_encode(&article_number)),
        "GET",
        None,
    )
    .await;
    if direct.success {
        if let Some(item_id) = item_id_of(&direct.data) {
            let conn = db.conn.lock().map_err(|e| ResolveError::Db(e.to_string()))?;
            persist_resolved(&conn, product_id, &item_id)?;
            info!(product_id, article_number = %article_number, item_id = %item_id,
                "resolved via direct lookup");
            return Ok(item_id);
        }
    }

    let catalog = build_catalog_map(&fetch_item_catalog().await?);

    let conn = db.conn.lock().map_err(|e| ResolveError::Db(e.to_string()))?;
    resolve_from_map(&conn, product_id, &article_number, &catalog)
}

// ---------------------------------------------------------------------------
// Batch resolution
// ---------------------------------------------------------------------------

/// Resolve every product that has an article number but no cached item id,
/// amortizing a single catalog fetch across all of them. Writes one ledger
/// entry summarizing the batch.
pub async fn resolve_all_pending(db: &DbState) -> Result<Value, String> {
    let pending: Vec<(String, String)> = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, article_number FROM products
                 WHERE article_number IS NOT NULL
                   AND TRIM(article_number) != ''
                   AND (sellus_item_id IS NULL OR TRIM(sellus_item_id) = '')
                 ORDER BY created_at ASC",
            )
            .map_err(|e| format!("prepare pending products: {e}"))?;
        let rows: Vec<_> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| format!("query pending products: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    if pending.is_empty() {
        return Ok(serde_json::json!({
            "processed": 0,
            "resolved": 0,
            "failed": 0,
            "failures": [],
        }));
    }

    let started = std::time::Instant::now();
    let catalog = match fetch_item_catalog().await {
        Ok(items) => build_catalog_map(&items),
        Err(e) => {
            ledger::record(
                db,
                ledger::LedgerEntry::outbound(ledger::SYNC_ID_RESOLUTION, ledger::STATUS_ERROR)
                    .error(e.to_string())
                    .duration(started.elapsed().as_millis() as u64),
            );
            return Err(e.to_string());
        }
    };

    let mut resolved = 0usize;
    let mut failures: Vec<Value> = Vec::new();
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        for (product_id, article_number) in &pending {
            match resolve_from_map(&conn, product_id, article_number, &catalog) {
                Ok(_) => resolved += 1,
                Err(e) => failures.push(serde_json::json!({
                    "productId": product_id,
                    "articleNumber": article_number,
                    "error": e.to_string(),
                })),
            }
        }
    }

    let status = if failures.is_empty() {
        ledger::STATUS_SUCCESS
    } else {
        ledger::STATUS_PARTIAL
    };
    ledger::record(
        db,
        ledger::LedgerEntry::outbound(ledger::SYNC_ID_RESOLUTION, status)
            .request(serde_json::json!({
                "pending": pending.len(),
                "catalogSize": catalog.len(),
            }))
            .response(serde_json::json!({
                "resolved": resolved,
                "failed": failures.len(),
            }))
            .duration(started.elapsed().as_millis() as u64),
    );

    info!(
        processed = pending.len(),
        resolved,
        failed = failures.len(),
        "batch id resolution complete"
    );

    Ok(serde_json::json!({
        "processed": pending.len(),
        "resolved": resolved,
        "failed": failures.len(),
        "failures": failures,
    }))
}

/// Echo helper for callers needing the cached id without triggering
/// resolution.
pub fn cached_item_id(db: &DbState, product_id: &str) -> Result<Option<String>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT sellus_item_id FROM products WHERE id = ?1",
        params![product_id],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map_err(|e| format!("read cached item id: {e}"))
    .map(|opt| opt.flatten().filter(|s| !s.trim().is_empty()))
}

// ===========================================================================
// Tests
// ===========================================================================
