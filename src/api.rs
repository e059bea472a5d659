//! Sellus ERP API gateway.
//!
//! Single chokepoint for all outbound calls to the ERP. Adds the bearer
//! credential, serializes JSON, measures duration, and returns a uniform
//! success/failure value instead of raising — callers branch on the result
//! and log outcomes to the sync ledger themselves.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default timeout for ERP requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the ERP base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Percent-encode a string for use inside a query parameter.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach Sellus at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid Sellus base URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API token is invalid or expired".to_string(),
        403 => "Warehouse not authorized for this Sellus instance".to_string(),
        404 => "Sellus endpoint not found".to_string(),
        405 => "Method not allowed by Sellus endpoint".to_string(),
        s if s >= 500 => format!("Sellus server error (HTTP {s})"),
        s => format!("Unexpected response from Sellus (HTTP {s})"),
    }
}

/// True when the error text indicates the endpoint rejected the HTTP verb.
/// The stock update endpoint accepts POST on most deployments and PUT on
/// some older ones, so callers retry once with PUT on this class of error.
pub fn is_method_not_allowed_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("http 405") || lower.contains("method not allowed")
}

/// True when the error text indicates an authentication problem rather than
/// a data problem.
pub fn is_auth_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("http 401")
        || lower.contains("http 403")
        || lower.contains("token is invalid")
        || lower.contains("not authorized")
}

// ---------------------------------------------------------------------------
// Gateway result
// ---------------------------------------------------------------------------

/// Uniform result of a gateway call. HTTP-level failures (4xx/5xx) and
/// network errors land in the failure variant of this value; the gateway
/// never raises for them.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RemoteResponse {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RemoteResponse {
    fn ok(data: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration_ms,
        }
    }

    fn fail(error: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn error_text(&self) -> String {
        self.error.clone().unwrap_or_else(|| "unknown error".into())
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Test connectivity to the ERP with a lightweight item-count probe.
pub async fn test_connectivity(base_url: &str, token: &str) -> ConnectivityResult {
    let base = normalize_base_url(base_url);
    let probe_url = format!("{base}/api/health");

    let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Failed to create HTTP client: {e}")),
            };
        }
    };

    let start = Instant::now();

    let resp = match client
        .get(&probe_url)
        .bearer_auth(token)
        .header("Accept", "application/json")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&base, &e)),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();

    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status)),
        }
    }
}

// ---------------------------------------------------------------------------
// Generic authenticated call
// ---------------------------------------------------------------------------

/// Perform an authenticated request against the Sellus REST API.
///
/// `endpoint` should include the leading slash, e.g. `/items/full`.
/// `method` is an HTTP verb string: "GET", "POST", "PUT", "PATCH", "DELETE".
/// A body (and `Content-Type`) is only attached for verbs that carry one.
pub async fn call(
    base_url: &str,
    token: &str,
    endpoint: &str,
    method: &str,
    body: Option<Value>,
) -> RemoteResponse {
    let base = normalize_base_url(base_url);
    let full_url = format!("{base}/api{endpoint}");
    let start = Instant::now();

    let http_method: Method = match method.to_uppercase().parse() {
        Ok(m) => m,
        Err(_) => {
            return RemoteResponse::fail(format!("Invalid HTTP method: {method}"), 0);
        }
    };

    let client = match Client::builder().timeout(DEFAULT_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return RemoteResponse::fail(format!("Failed to create HTTP client: {e}"), 0);
        }
    };

    let carries_body = matches!(http_method, Method::POST | Method::PUT | Method::PATCH);

    let mut req = client
        .request(http_method, &full_url)
        .bearer_auth(token)
        .header("Accept", "application/json");

    if carries_body {
        let resolved = match body {
            // A pre-serialized body arrives as Value::String containing JSON;
            // parse it back to avoid double-serialization by .json().
            Some(Value::String(ref s)) => {
                serde_json::from_str::<Value>(s).unwrap_or(Value::String(s.clone()))
            }
            Some(b) => b,
            None => Value::Null,
        };
        req = req.header("Content-Type", "application/json").json(&resolved);
    }

    debug!(method, endpoint, "calling Sellus");

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let elapsed = start.elapsed().as_millis() as u64;
            return RemoteResponse::fail(friendly_error(&base, &e), elapsed);
        }
    };

    let status = resp.status();

    if !status.is_success() {
        // 401 responses may advertise the expected auth scheme; surface it
        // so misconfigured tokens are diagnosable from the ledger alone.
        let auth_hint = if status.as_u16() == 401 {
            resp.headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        } else {
            None
        };

        let body_text = resp.text().await.unwrap_or_default();
        let elapsed = start.elapsed().as_millis() as u64;

        let mut detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_error(status));
            format!("{message} (HTTP {})", status.as_u16())
        } else if !body_text.trim().is_empty() {
            format!(
                "{} (HTTP {}): {}",
                status_error(status),
                status.as_u16(),
                body_text.trim()
            )
        } else {
            format!("{} (HTTP {})", status_error(status), status.as_u16())
        };

        if let Some(hint) = auth_hint {
            detail = format!("{detail} [server expects: {hint}]");
        }

        return RemoteResponse::fail(detail, elapsed);
    }

    // Parse the JSON body; empty 204 responses become null.
    let body_text = resp.text().await.unwrap_or_default();
    let elapsed = start.elapsed().as_millis() as u64;

    if body_text.is_empty() {
        return RemoteResponse::ok(Value::Null, elapsed);
    }
    match serde_json::from_str(&body_text) {
        Ok(json) => RemoteResponse::ok(json, elapsed),
        Err(e) => RemoteResponse::fail(format!("Invalid JSON from Sellus: {e}"), elapsed),
    }
}

/// [`call`] using the credentials from the engine config store. Returns a
/// failure value (not an error) when the engine is unconfigured, so workflow
/// code has a single result shape to branch on.
pub async fn call_configured(endpoint: &str, method: &str, body: Option<Value>) -> RemoteResponse {
    match crate::config::remote_credentials() {
        Some((base_url, token)) => call(&base_url, &token, endpoint, method, body).await,
        None => RemoteResponse::fail("Sellus connection not configured".to_string(), 0),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
