//! Admin backend HTTP transport.
//!
//! Every collaborator call the settlement core makes (ledger, orders,
//! tables, zones) goes through the [`Transport`] trait. [`ApiClient`] is
//! the production implementation over `reqwest`; tests script a mock.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One request against the admin backend. Errors are user-facing strings.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, String>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // "/api/" leaves a slash behind
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

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

pub fn extract_api_token_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| crate::value_str(&v, &["key", "token"]))
        .filter(|s| !s.is_empty())
}

pub fn extract_base_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| crate::value_str(&v, &["url"]).map(|u| normalize_admin_url(&u)))
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API token is invalid or expired".to_string(),
        403 => "Not authorized for this operation".to_string(),
        404 => "Admin backend endpoint not found".to_string(),
        405 => "Method not allowed by admin backend".to_string(),
        s if s >= 500 => "Admin backend server error".to_string(),
        _ => "Unexpected response from admin backend".to_string(),
    }
}

/// Build the message for a non-2xx response, preferring whatever the server
/// said in its JSON error body.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let message = crate::value_str(&json, &["error", "message", "detail"])
            .unwrap_or_else(|| status_error(status));
        let details = json.get("details").or_else(|| json.get("errors")).cloned();
        if let Some(details) = details {
            return format!("{message} (HTTP {}): {}", status.as_u16(), details);
        }
        return format!("{message} (HTTP {})", status.as_u16());
    }
    if !trimmed.is_empty() {
        return format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            trimmed
        );
    }
    format!("{} (HTTP {})", status_error(status), status.as_u16())
}

/// Unwrap a list response: either a bare array or a paginated object with
/// a `results` array.
pub fn list_from(value: &Value) -> Vec<Value> {
    if let Some(results) = value.get("results").and_then(Value::as_array) {
        return results.clone();
    }
    value.as_array().cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Authenticated client for the admin backend.
pub struct ApiClient {
    base_url: String,
    api_token: String,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self, String> {
        let base_url = normalize_admin_url(base_url);
        if base_url.is_empty() {
            return Err("Admin backend URL is not configured".into());
        }
        let api_token = extract_api_token_from_connection_string(api_token)
            .unwrap_or_else(|| api_token.trim().to_string());
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url,
            api_token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for ApiClient {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, String> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %full_url, "admin request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(error_detail(status, &body_text));
        }

        // Empty 204 responses come back as null.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| format!("Invalid JSON from admin backend: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_admin_url() {
        assert_eq!(normalize_admin_url("admin.example.com/"), "https://admin.example.com");
        assert_eq!(normalize_admin_url("localhost:8000/api/"), "http://localhost:8000");
        assert_eq!(
            normalize_admin_url(" https://crm.example.com/api "),
            "https://crm.example.com"
        );
        assert_eq!(normalize_admin_url("   "), "");
    }

    #[test]
    fn test_connection_string_plain_json() {
        let raw = r#"{"url":"crm.example.com/api","key":"tok-123"}"#;
        assert_eq!(
            extract_api_token_from_connection_string(raw).as_deref(),
            Some("tok-123")
        );
        assert_eq!(
            extract_base_url_from_connection_string(raw).as_deref(),
            Some("https://crm.example.com")
        );
    }

    #[test]
    fn test_connection_string_base64url() {
        let payload = json!({ "url": "https://crm.example.com", "key": "secret-token" });
        let encoded = BASE64_STANDARD
            .encode(payload.to_string())
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string();
        assert_eq!(
            extract_api_token_from_connection_string(&encoded).as_deref(),
            Some("secret-token")
        );
    }

    #[test]
    fn test_plain_token_is_not_a_connection_string() {
        assert!(extract_api_token_from_connection_string("abc").is_none());
    }

    #[test]
    fn test_error_detail_prefers_server_message() {
        let msg = error_detail(StatusCode::BAD_REQUEST, r#"{"detail":"Cashbox is closed"}"#);
        assert_eq!(msg, "Cashbox is closed (HTTP 400)");

        let msg = error_detail(StatusCode::METHOD_NOT_ALLOWED, "");
        assert_eq!(msg, "Method not allowed by admin backend (HTTP 405)");

        let msg = error_detail(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(msg, "Admin backend server error (HTTP 502): upstream down");
    }

    #[test]
    fn test_list_from_accepts_both_shapes() {
        assert_eq!(list_from(&json!([{ "id": 1 }])).len(), 1);
        assert_eq!(list_from(&json!({ "count": 2, "results": [{}, {}] })).len(), 2);
        assert!(list_from(&json!({ "detail": "x" })).is_empty());
    }
}
