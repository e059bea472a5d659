//! Sellus Bridge - warehouse ERP reconciliation engine.
//!
//! Keeps the local WMS database consistent with the Sellus ERP: resolves
//! local article references into Sellus item ids, pushes authoritative
//! stock totals and verifies they landed, accrues received quantities onto
//! remote purchase orders, and durably logs and retries failures. The web
//! UI calls the entry points in [`commands`]; everything remote goes
//! through the gateway in [`api`].

use serde_json::Value;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod commands;
pub mod config;
pub mod db;
pub mod delivery;
pub mod ledger;
pub mod orders;
pub mod receiving;
pub mod resolver;
pub mod retry;
pub mod stock;

/// First non-empty string under any of the given keys.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First integer under any of the given keys. Whole-number floats are
/// accepted because the extraction service is not consistent about numeric
/// types.
pub(crate) fn value_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(x) = v.get(*key) {
            if let Some(n) = x.as_i64() {
                return Some(n);
            }
            if let Some(f) = x.as_f64() {
                if f.fract() == 0.0 {
                    return Some(f as i64);
                }
            }
        }
    }
    None
}

/// Initialize structured logging: console always, plus a daily rolling file
/// when a log directory is given.
///
/// The file-writer guard is intentionally leaked; the engine logs until
/// process exit and dropping the guard would flush-and-stop early.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sellus_bridge=debug"));

    let console_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "sellus-bridge");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            std::mem::forget(guard);
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
        }
    }

    info!("Sellus Bridge v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
