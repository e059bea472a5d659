//! Local SQLite database layer for the WMS backend.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared connection state used by the sync workflows.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 6;

/// Initialize the database at `{data_dir}/wms.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("wms.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }
    if current < 5 {
        migrate_v5(conn)?;
    }
    if current < 6 {
        migrate_v6(conn)?;
    }

    Ok(())
}

fn stamp_version(conn: &Connection, version: i32) -> Result<(), String> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| format!("stamp schema v{version}: {e}"))?;
    Ok(())
}

/// Migration v1: products, inventory, and local settings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- products
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT,
            article_number TEXT,
            sellus_item_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'unsynced',
            last_synced_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- inventory_records (one row per product per location)
        CREATE TABLE IF NOT EXISTS inventory_records (
            id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            location_id TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(product_id, location_id)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_products_article_number ON products(article_number);
        CREATE INDEX IF NOT EXISTS idx_products_sync_status ON products(sync_status);
        CREATE INDEX IF NOT EXISTS idx_inventory_product ON inventory_records(product_id);
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))?;
    stamp_version(conn, 1)
}

/// Migration v2: local shadow of remote sales/purchase orders.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            sellus_order_id TEXT UNIQUE,
            order_number TEXT,
            order_kind TEXT NOT NULL DEFAULT 'purchase',
            status TEXT NOT NULL DEFAULT 'open',
            last_seen_remote_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS order_lines (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            article_number TEXT NOT NULL,
            quantity_ordered INTEGER NOT NULL DEFAULT 0,
            quantity_picked INTEGER NOT NULL DEFAULT 0,
            is_picked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(order_id, article_number)
        );

        CREATE INDEX IF NOT EXISTS idx_orders_number ON orders(order_number);
        CREATE INDEX IF NOT EXISTS idx_order_lines_order ON order_lines(order_id);
        CREATE INDEX IF NOT EXISTS idx_order_lines_article ON order_lines(article_number);
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))?;
    stamp_version(conn, 2)
}

/// Migration v3: append-only sync ledger.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sync_type TEXT NOT NULL,
            direction TEXT NOT NULL DEFAULT 'outbound',
            article_number TEXT,
            product_id TEXT,
            status TEXT NOT NULL,
            request_payload TEXT,
            response_payload TEXT,
            error_message TEXT,
            duration_ms INTEGER,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_ledger_type ON sync_ledger(sync_type);
        CREATE INDEX IF NOT EXISTS idx_sync_ledger_status ON sync_ledger(status);
        CREATE INDEX IF NOT EXISTS idx_sync_ledger_created ON sync_ledger(created_at);
        ",
    )
    .map_err(|e| format!("migrate v3: {e}"))?;
    stamp_version(conn, 3)
}

/// Migration v4: unresolved stock-sync failures (the retry queue).
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS unresolved_sync_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id TEXT NOT NULL,
            article_number TEXT,
            quantity_changed INTEGER NOT NULL DEFAULT 0,
            order_number TEXT,
            error_message TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            resolved_at TEXT,
            resolved_by TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_unresolved_failures_open
            ON unresolved_sync_failures(resolved_at)
            WHERE resolved_at IS NULL;
        ",
    )
    .map_err(|e| format!("migrate v4: {e}"))?;
    stamp_version(conn, 4)
}

/// Migration v5: delivery note items produced by the label extraction step.
fn migrate_v5(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS delivery_note_items (
            id TEXT PRIMARY KEY,
            delivery_note_number TEXT,
            article_number TEXT NOT NULL,
            order_number TEXT,
            description TEXT,
            quantity_expected INTEGER NOT NULL DEFAULT 0,
            quantity_checked INTEGER NOT NULL DEFAULT 0,
            is_checked INTEGER NOT NULL DEFAULT 0,
            checked_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_delivery_items_note
            ON delivery_note_items(delivery_note_number);
        CREATE INDEX IF NOT EXISTS idx_delivery_items_article
            ON delivery_note_items(article_number);
        ",
    )
    .map_err(|e| format!("migrate v5: {e}"))?;
    stamp_version(conn, 5)
}

/// Migration v6: sync_error column on products and ledger article index.
fn migrate_v6(conn: &Connection) -> Result<(), String> {
    let has_column = conn.prepare("SELECT sync_error FROM products LIMIT 0").is_ok();
    if !has_column {
        conn.execute_batch("ALTER TABLE products ADD COLUMN sync_error TEXT;")
            .map_err(|e| format!("migrate v6 add column: {e}"))?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_ledger_article
             ON sync_ledger(article_number);",
    )
    .map_err(|e| format!("migrate v6: {e}"))?;
    stamp_version(conn, 6)
}

// ---------------------------------------------------------------------------
// Settings helpers (local_settings table)
// ---------------------------------------------------------------------------

/// Read a single local setting value.
pub fn setting_get(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings \
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a single local setting value.
pub fn setting_set(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at) \
         VALUES (?1, ?2, ?3, datetime('now')) \
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET \
            setting_value = excluded.setting_value, updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("setting_set: {e}"))?;
    Ok(())
}

/// Return all settings grouped by category.
pub fn all_settings(conn: &Connection) -> serde_json::Value {
    let mut stmt = match conn
        .prepare("SELECT setting_category, setting_key, setting_value FROM local_settings")
    {
        Ok(s) => s,
        Err(e) => {
            error!("all_settings prepare: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();

    let rows = match stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("all_settings query: {e}");
            return serde_json::json!({});
        }
    };

    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    serde_json::Value::Object(result)
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
