//! Retry coordinator for unresolved stock-sync failures.
//!
//! Walks the open rows of `unresolved_sync_failures` oldest-first,
//! re-running identifier resolution (cheap, and often freshly satisfied by
//! a prior batch resolution) and then the stock reconciliation workflow.
//! Successful retries stamp `resolved_at`; failing rows are left untouched
//! for the next pass. Rows are never deleted, and a repeatedly-failing row
//! is treated no differently from a first-time failure — there is no
//! backoff and no attempt cap.

use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::config;
use crate::db::DbState;
use crate::ledger;
use crate::resolver;
use crate::stock;

const RESOLVED_BY: &str = "retry_coordinator";

/// How many failures one periodic pass may take on.
const LOOP_PASS_LIMIT: i64 = 100;

/// Shared state of the background retry loop.
pub struct RetryLoopState {
    pub is_running: Arc<AtomicBool>,
    pub last_pass: Arc<Mutex<Option<String>>>,
}

impl RetryLoopState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_pass: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for RetryLoopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one retry pass.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub processed: usize,
    pub resolved: usize,
    pub still_failing: usize,
    pub details: Vec<Value>,
}

/// Re-attempt up to `limit` of the oldest unresolved failures.
pub async fn retry_unresolved(db: &DbState, limit: i64) -> Result<RetryReport, String> {
    let open = ledger::fetch_unresolved(db, limit)?;
    let mut report = RetryReport {
        processed: 0,
        resolved: 0,
        still_failing: 0,
        details: Vec::new(),
    };

    if open.is_empty() {
        return Ok(report);
    }

    info!(count = open.len(), "retrying unresolved sync failures");

    for failure in open {
        report.processed += 1;

        // Resolution first: when it still fails there is no point invoking
        // the full workflow, and the row simply waits for the next pass.
        if let Err(e) = resolver::resolve_item_id(db, &failure.product_id).await {
            report.still_failing += 1;
            report.details.push(serde_json::json!({
                "failureId": failure.id,
                "productId": failure.product_id,
                "articleNumber": failure.article_number,
                "resolved": false,
                "reason": format!("id resolution still failing: {e}"),
            }));
            continue;
        }

        match stock::reconcile_stock_for_retry(
            db,
            &failure.product_id,
            Some(failure.quantity_changed),
            failure.order_number.as_deref(),
        )
        .await
        {
            Ok(outcome) => {
                ledger::mark_resolved(db, failure.id, RESOLVED_BY)?;
                report.resolved += 1;
                report.details.push(serde_json::json!({
                    "failureId": failure.id,
                    "productId": failure.product_id,
                    "articleNumber": failure.article_number,
                    "resolved": true,
                    "verified": outcome.verified,
                    "targetStock": outcome.target_stock,
                }));
            }
            Err(e) => {
                warn!(
                    failure_id = failure.id,
                    product_id = %failure.product_id,
                    error = %e,
                    "retry still failing"
                );
                report.still_failing += 1;
                report.details.push(serde_json::json!({
                    "failureId": failure.id,
                    "productId": failure.product_id,
                    "articleNumber": failure.article_number,
                    "resolved": false,
                    "reason": e,
                }));
            }
        }
    }

    info!(
        processed = report.processed,
        resolved = report.resolved,
        still_failing = report.still_failing,
        "retry pass complete"
    );

    Ok(report)
}

/// Start the background retry loop.
///
/// Sleeps `interval_secs` between passes and skips passes entirely while
/// the engine is not connected to a Sellus instance — open failure rows
/// simply wait. Stop by clearing `state.is_running`.
pub fn start_retry_loop(db: Arc<DbState>, state: Arc<RetryLoopState>, interval_secs: u64) {
    let is_running = state.is_running.clone();
    let last_pass = state.last_pass.clone();

    is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Retry loop started (interval: {interval_secs}s)");

        loop {
            if !is_running.load(Ordering::SeqCst) {
                info!("Retry loop stopped");
                break;
            }

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !is_running.load(Ordering::SeqCst) {
                break;
            }

            if !config::is_configured() {
                continue;
            }

            match retry_unresolved(&db, LOOP_PASS_LIMIT).await {
                Ok(report) => {
                    if report.processed > 0 {
                        info!(
                            resolved = report.resolved,
                            still_failing = report.still_failing,
                            "periodic retry pass finished"
                        );
                    }
                    // A rejected token will fail every row the same way;
                    // stop hammering Sellus until credentials change.
                    let auth_rejected = report.details.iter().any(|d| {
                        d.get("reason")
                            .and_then(Value::as_str)
                            .is_some_and(crate::api::is_auth_error)
                    });
                    if auth_rejected {
                        warn!("Sellus rejected the API token; pausing retry loop");
                        is_running.store(false, Ordering::SeqCst);
                        break;
                    }
                    if let Ok(mut guard) = last_pass.lock() {
                        *guard = Some(Utc::now().to_rfc3339());
                    }
                }
                Err(e) => {
                    warn!("periodic retry pass failed: {e}");
                }
            }
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
