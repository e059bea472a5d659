//! Engine configuration store.
//!
//! Holds the Sellus ERP connection settings (base URL, bearer token,
//! warehouse id) in an in-memory map backed by an optional JSON file.
//! Environment variables override stored values so containerized
//! deployments can inject credentials without touching the file.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};
use tracing::{info, warn};

// Setting keys
pub const KEY_BASE_URL: &str = "sellus_base_url";
pub const KEY_API_TOKEN: &str = "sellus_api_token";
pub const KEY_WAREHOUSE_ID: &str = "warehouse_id";

/// All setting keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BASE_URL, KEY_API_TOKEN, KEY_WAREHOUSE_ID];

struct ConfigStore {
    values: HashMap<String, String>,
    file_path: Option<PathBuf>,
}

fn store() -> &'static RwLock<ConfigStore> {
    static STORE: OnceLock<RwLock<ConfigStore>> = OnceLock::new();
    STORE.get_or_init(|| {
        RwLock::new(ConfigStore {
            values: HashMap::new(),
            file_path: None,
        })
    })
}

/// Environment variable name for a setting key, e.g. `sellus_base_url`
/// becomes `SELLUS_BRIDGE_SELLUS_BASE_URL`.
fn env_var_for(key: &str) -> String {
    format!("SELLUS_BRIDGE_{}", key.to_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Connection string decoding
// ---------------------------------------------------------------------------

/// Operators paste a single connection string issued by the Sellus admin
/// console. It is either raw JSON or url-safe base64 of JSON:
/// `{"url": "...", "key": "...", "wid": "..."}`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_token_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .or_else(|| v.get("token"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_base_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(crate::api::normalize_base_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_warehouse_id_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("wid")
                .or_else(|| v.get("warehouseId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single setting. Environment overrides win over stored values.
pub fn get_setting(key: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_var_for(key)) {
        let trimmed = v.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    let guard = match store().read() {
        Ok(g) => g,
        Err(e) => {
            warn!(key, error = %e, "config store poisoned");
            return None;
        }
    };
    guard.values.get(key).cloned()
}

/// Store a setting in memory and persist the full map to the backing file
/// when one has been configured via [`init_from_file`].
pub fn set_setting(key: &str, value: &str) -> Result<(), String> {
    let mut guard = store().write().map_err(|e| e.to_string())?;
    guard.values.insert(key.to_string(), value.to_string());
    persist_locked(&guard)
}

/// Remove a setting. Silently succeeds if absent.
pub fn delete_setting(key: &str) -> Result<(), String> {
    let mut guard = store().write().map_err(|e| e.to_string())?;
    guard.values.remove(key);
    persist_locked(&guard)
}

pub fn has_setting(key: &str) -> bool {
    get_setting(key).is_some()
}

fn persist_locked(guard: &ConfigStore) -> Result<(), String> {
    let Some(path) = guard.file_path.as_ref() else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(&guard.values).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| format!("write config file: {e}"))
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Load settings from a JSON file (`{"sellus_base_url": "...", ...}`) and
/// remember the path so later writes persist. A missing file is not an
/// error; it will be created on the first write.
pub fn init_from_file(path: &Path) -> Result<(), String> {
    let mut values = HashMap::new();
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let parsed: HashMap<String, String> = serde_json::from_str(&raw)
                .map_err(|e| format!("parse config file {}: {e}", path.display()))?;
            values = parsed;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, starting empty");
        }
        Err(e) => return Err(format!("read config file {}: {e}", path.display())),
    }

    let mut guard = store().write().map_err(|e| e.to_string())?;
    guard.values = values;
    guard.file_path = Some(path.to_path_buf());
    Ok(())
}

/// The engine is considered configured when the ERP base URL and API token
/// are both present.
pub fn is_configured() -> bool {
    has_setting(KEY_BASE_URL) && has_setting(KEY_API_TOKEN)
}

/// Resolved `(base_url, token)` pair for the gateway, or `None` when the
/// engine has not been connected to a Sellus instance yet.
pub fn remote_credentials() -> Option<(String, String)> {
    let url = get_setting(KEY_BASE_URL)?;
    let token = get_setting(KEY_API_TOKEN)?;
    Some((url, token))
}

/// Return the stored config as a JSON value for the settings screen.
/// The token is masked; it never leaves the backend in full.
pub fn get_full_config() -> Value {
    let token_masked = get_setting(KEY_API_TOKEN).map(|t| {
        if t.len() <= 8 {
            "********".to_string()
        } else {
            format!("{}…{}", &t[..4], &t[t.len() - 4..])
        }
    });
    serde_json::json!({
        "sellus_base_url": get_setting(KEY_BASE_URL),
        "warehouse_id":    get_setting(KEY_WAREHOUSE_ID),
        "api_token":       token_masked,
        "configured":      is_configured(),
    })
}

/// Store ERP credentials received from the settings screen.
///
/// Expected JSON shape (camelCase):
/// ```json
/// {
///   "apiToken": "...",      // raw token or connection string
///   "baseUrl": "...",       // optional when encoded in the connection string
///   "warehouseId": "..."    // optional
/// }
/// ```
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let raw_token = payload
        .get("apiToken")
        .or_else(|| payload.get("api_token"))
        .or_else(|| payload.get("connectionString"))
        .and_then(Value::as_str)
        .ok_or("Missing required field: apiToken")?;
    let mut base_url = payload
        .get("baseUrl")
        .or_else(|| payload.get("base_url"))
        .or_else(|| payload.get("sellus_base_url"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut warehouse_id = payload
        .get("warehouseId")
        .or_else(|| payload.get("warehouse_id"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut token = raw_token.trim().to_string();
    if let Some(decoded_token) = extract_token_from_connection_string(raw_token) {
        token = decoded_token;
        if let Some(decoded_url) = extract_base_url_from_connection_string(raw_token) {
            base_url = Some(decoded_url);
        }
        if let Some(decoded_wid) = extract_warehouse_id_from_connection_string(raw_token) {
            warehouse_id = Some(decoded_wid);
        }
    }

    if token.trim().is_empty() {
        return Err("Missing required field: apiToken".to_string());
    }

    set_setting(KEY_API_TOKEN, token.trim())?;

    if let Some(url) = base_url.as_deref() {
        let normalized = crate::api::normalize_base_url(url);
        if !normalized.trim().is_empty() {
            set_setting(KEY_BASE_URL, normalized.trim())?;
        }
    }
    if let Some(wid) = warehouse_id.as_deref() {
        set_setting(KEY_WAREHOUSE_ID, wid)?;
    }

    info!("Sellus credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored setting (disconnect from the ERP).
pub fn clear_all() -> Result<Value, String> {
    info!("clearing all Sellus connection settings");
    for key in ALL_KEYS {
        delete_setting(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_store() {
        let mut guard = store().write().unwrap();
        guard.values.clear();
        guard.file_path = None;
    }

    #[test]
    #[serial]
    fn test_set_get_roundtrip() {
        reset_store();
        set_setting(KEY_BASE_URL, "https://erp.example.com").unwrap();
        assert_eq!(
            get_setting(KEY_BASE_URL).as_deref(),
            Some("https://erp.example.com")
        );
        delete_setting(KEY_BASE_URL).unwrap();
        assert!(get_setting(KEY_BASE_URL).is_none());
    }

    #[test]
    #[serial]
    fn test_is_configured_requires_url_and_token() {
        reset_store();
        assert!(!is_configured());
        set_setting(KEY_BASE_URL, "https://erp.example.com").unwrap();
        assert!(!is_configured());
        set_setting(KEY_API_TOKEN, "tok-123").unwrap();
        assert!(is_configured());
        assert_eq!(
            remote_credentials(),
            Some(("https://erp.example.com".to_string(), "tok-123".to_string()))
        );
        reset_store();
    }

    #[test]
    #[serial]
    fn test_update_credentials_with_plain_fields() {
        reset_store();
        let payload = serde_json::json!({
            "apiToken": "  tok-plain  ",
            "baseUrl": "erp.example.com/api/",
            "warehouseId": "wh-1"
        });
        update_credentials(&payload).unwrap();
        assert_eq!(get_setting(KEY_API_TOKEN).as_deref(), Some("tok-plain"));
        assert_eq!(
            get_setting(KEY_BASE_URL).as_deref(),
            Some("https://erp.example.com")
        );
        assert_eq!(get_setting(KEY_WAREHOUSE_ID).as_deref(), Some("wh-1"));
        reset_store();
    }

    #[test]
    #[serial]
    fn test_update_credentials_decodes_connection_string() {
        reset_store();
        let inner = serde_json::json!({
            "url": "https://erp.example.com",
            "key": "tok-encoded",
            "wid": "wh-9"
        });
        let encoded = BASE64_STANDARD.encode(inner.to_string());
        let payload = serde_json::json!({ "apiToken": encoded });
        update_credentials(&payload).unwrap();
        assert_eq!(get_setting(KEY_API_TOKEN).as_deref(), Some("tok-encoded"));
        assert_eq!(
            get_setting(KEY_BASE_URL).as_deref(),
            Some("https://erp.example.com")
        );
        assert_eq!(get_setting(KEY_WAREHOUSE_ID).as_deref(), Some("wh-9"));
        reset_store();
    }

    #[test]
    #[serial]
    fn test_connection_string_accepts_raw_json() {
        reset_store();
        let raw = r#"{"url": "https://erp.example.com", "key": "tok-raw"}"#;
        assert_eq!(
            extract_token_from_connection_string(raw).as_deref(),
            Some("tok-raw")
        );
        assert_eq!(
            extract_base_url_from_connection_string(raw).as_deref(),
            Some("https://erp.example.com")
        );
        assert!(extract_warehouse_id_from_connection_string(raw).is_none());
    }

    #[test]
    #[serial]
    fn test_init_from_file_roundtrip() {
        reset_store();
        let path = std::env::temp_dir().join(format!(
            "sellus-bridge-test-{}.json",
            uuid::Uuid::new_v4()
        ));

        // Missing file starts empty but remembers the path for writes.
        init_from_file(&path).unwrap();
        set_setting(KEY_WAREHOUSE_ID, "wh-5").unwrap();

        // A fresh load sees the persisted value.
        reset_store();
        init_from_file(&path).unwrap();
        assert_eq!(get_setting(KEY_WAREHOUSE_ID).as_deref(), Some("wh-5"));

        let _ = std::fs::remove_file(&path);
        reset_store();
    }

    #[test]
    #[serial]
    fn test_full_config_masks_token() {
        reset_store();
        set_setting(KEY_API_TOKEN, "tok-12345-abcdef").unwrap();
        let cfg = get_full_config();
        let masked = cfg.get("api_token").and_then(Value::as_str).unwrap();
        assert!(!masked.contains("12345"));
        assert!(masked.starts_with("tok-"));
        reset_store();
    }
}
