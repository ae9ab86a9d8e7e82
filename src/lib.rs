//! The Small POS - table settlement core
//!
//! Pays off every open order on a table in one go: records the ledger
//! movement, marks the orders paid, frees the table and brings the local
//! view back in line with the admin backend. The backend's accepted request
//! shapes are probed at runtime rather than hard-coded (see [`variants`]).

pub mod aggregate;
pub mod api;
pub mod backend;
pub mod config;
pub mod logging;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod reconcile;
pub mod variants;

#[cfg(test)]
mod test_support;

pub use aggregate::{aggregate, SettlementGroup};
pub use backend::Backend;
pub use config::{ConfigError, SettlementConfig};
pub use notifier::{Notifier, SettlementEvent, Subscription, Topic};
pub use orchestrator::{SettlementError, SettlementOrchestrator, SettlementOutcome};
pub use reconcile::{OptimisticPatch, Reconciler};
pub use variants::{ProbeError, Resolved, VariantResolver};

// ---------------------------------------------------------------------------
// JSON field helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
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

/// Identifier that may arrive as a string or a number.
pub(crate) fn value_id(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string())
            }
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Finite number from a JSON number or a numeric string ("12,5" accepted).
pub(crate) fn value_number(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        let parsed = match v.get(*key) {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        };
        if let Some(n) = parsed.filter(|n| n.is_finite()) {
            return Some(n);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_str_skips_blank() {
        let v = json!({ "a": "  ", "b": " x " });
        assert_eq!(value_str(&v, &["a", "b"]).as_deref(), Some("x"));
        assert_eq!(value_str(&v, &["c"]), None);
    }

    #[test]
    fn test_value_id_accepts_numbers() {
        let v = json!({ "id": 42, "uuid": "u-1" });
        assert_eq!(value_id(&v, &["id"]).as_deref(), Some("42"));
        assert_eq!(value_id(&v, &["missing", "uuid"]).as_deref(), Some("u-1"));
        assert_eq!(value_id(&json!({ "id": null }), &["id"]), None);
    }

    #[test]
    fn test_value_number_parses_strings() {
        let v = json!({ "a": "12,5", "b": "abc", "c": 3 });
        assert_eq!(value_number(&v, &["a"]), Some(12.5));
        assert_eq!(value_number(&v, &["b", "c"]), Some(3.0));
        assert_eq!(value_number(&json!({ "a": "inf" }), &["a"]), None);
    }
}
