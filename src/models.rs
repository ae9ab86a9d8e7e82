//! Backend records the settlement core works with.
//!
//! Records arrive as loosely-shaped JSON (ids as numbers or strings,
//! references either as ids or embedded objects), so each type is parsed
//! field-by-field from a `serde_json::Value` rather than derived.

use serde::Serialize;
use serde_json::Value;

use crate::{value_id, value_str};

/// Read a reference that may be a bare id or an embedded `{ "id": .. }` object.
pub(crate) fn value_ref(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Object(_)) => {
                if let Some(id) = value_id(&v[*key], &["id", "uuid"]) {
                    return Some(id);
                }
            }
            Some(_) => {
                if let Some(id) = value_id(v, &[*key]) {
                    return Some(id);
                }
            }
            None => {}
        }
    }
    None
}

/// A customer order awaiting (or past) settlement.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: String,
    /// Owning shared resource, e.g. the table id.
    pub resource_id: Option<String>,
    pub status: Option<String>,
    pub items: Vec<Value>,
    #[serde(skip)]
    pub raw: Value,
}

impl Transaction {
    pub fn from_value(v: &Value) -> Option<Self> {
        let id = value_id(v, &["id", "uuid"])?;
        Some(Self {
            id,
            resource_id: value_ref(v, &["table", "table_id"]),
            status: value_str(v, &["status"]),
            items: v
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            raw: v.clone(),
        })
    }

    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    /// Merge a detail record over this summary record (detail fields win).
    pub fn merged_with(&self, detail: &Value) -> Self {
        let mut raw = self.raw.clone();
        if let (Value::Object(base), Value::Object(extra)) = (&mut raw, detail) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        Self::from_value(&raw).unwrap_or_else(|| self.clone())
    }
}

/// A shared resource transactions are grouped under (a table).
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub zone_id: Option<String>,
    pub zone_title: Option<String>,
    pub capacity: Option<i64>,
    #[serde(skip)]
    pub raw: Value,
}

impl Resource {
    pub fn from_value(v: &Value) -> Option<Self> {
        let id = value_id(v, &["id", "uuid"])?;
        let zone_title = v
            .get("zone")
            .filter(|z| z.is_object())
            .and_then(|z| value_str(z, &["title", "name"]));
        Some(Self {
            id,
            number: value_id(v, &["number"]),
            status: value_str(v, &["status"]),
            zone_id: value_ref(v, &["zone"]),
            zone_title,
            capacity: crate::value_number(v, &["places", "capacity"]).map(|n| n as i64),
            raw: v.clone(),
        })
    }

    pub fn is_free(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("free"))
            .unwrap_or(false)
    }

    /// Full-replace body: every known field carried forward, status set free.
    pub fn release_payload(&self) -> Value {
        serde_json::json!({
            "number": self.raw.get("number").cloned().unwrap_or(Value::Null),
            "zone": self.zone_id.clone().map(Value::String).unwrap_or(Value::Null),
            "places": self.raw.get("places").cloned().unwrap_or(Value::Null),
            "status": "free",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Zone {
    pub id: String,
    pub title: Option<String>,
}

impl Zone {
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: value_id(v, &["id", "uuid"])?,
            title: value_str(v, &["title", "name"]),
        })
    }
}

/// A ledger (cash box / till) entries are recorded into.
#[derive(Debug, Clone, Serialize)]
pub struct Ledger {
    pub id: String,
    pub name: Option<String>,
}

impl Ledger {
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            id: value_id(v, &["id", "uuid"])?,
            name: value_str(v, &["department_name", "name"]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Income,
    Expense,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Income => "income",
            Direction::Expense => "expense",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Option<String>,
    pub ledger_id: String,
    pub direction: Direction,
    pub label: String,
    pub amount: f64,
}

impl LedgerEntry {
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "cashbox": self.ledger_id,
            "type": self.direction.as_str(),
            "name": self.label,
            "amount": format_amount(self.amount),
        })
    }
}

/// Render an amount the way the ledger endpoint expects it: a decimal
/// string with at most two fractional digits and no trailing zeros.
pub fn format_amount(amount: f64) -> String {
    if !amount.is_finite() {
        return "0".into();
    }
    let rounded = (amount * 100.0).round() / 100.0;
    let text = format!("{rounded:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".into()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transaction_accepts_numeric_ids_and_embedded_table() {
        let t = Transaction::from_value(&json!({
            "id": 17,
            "table": { "id": "t-3", "number": 3 },
            "status": " New ",
        }))
        .unwrap();
        assert_eq!(t.id, "17");
        assert_eq!(t.resource_id.as_deref(), Some("t-3"));
        assert_eq!(t.status.as_deref(), Some("New"));
        assert!(!t.has_items());
    }

    #[test]
    fn test_transaction_without_id_is_rejected() {
        assert!(Transaction::from_value(&json!({ "table": "t1" })).is_none());
    }

    #[test]
    fn test_merged_with_detail_brings_items() {
        let t = Transaction::from_value(&json!({ "id": "o1", "table": "t1" })).unwrap();
        let merged = t.merged_with(&json!({ "items": [{ "price": 10, "quantity": 1 }] }));
        assert_eq!(merged.items.len(), 1);
        assert_eq!(merged.resource_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_resource_release_payload_carries_fields() {
        let r = Resource::from_value(&json!({
            "id": "t1",
            "number": 5,
            "zone": { "id": "z1", "title": "Terrace" },
            "places": 4,
            "status": "busy",
        }))
        .unwrap();
        assert_eq!(r.zone_id.as_deref(), Some("z1"));
        assert_eq!(r.zone_title.as_deref(), Some("Terrace"));
        assert_eq!(r.capacity, Some(4));
        assert!(!r.is_free());
        assert_eq!(
            r.release_payload(),
            json!({ "number": 5, "zone": "z1", "places": 4, "status": "free" })
        );
    }

    #[test]
    fn test_ledger_entry_payload() {
        let entry = LedgerEntry {
            id: None,
            ledger_id: "box-1".into(),
            direction: Direction::Income,
            label: "Payment table 4".into(),
            amount: 1250.0,
        };
        assert_eq!(
            entry.to_payload(),
            json!({ "cashbox": "box-1", "type": "income", "name": "Payment table 4", "amount": "1250" })
        );
    }

    #[test]
    fn test_expense_entry_payload() {
        let entry = LedgerEntry {
            id: None,
            ledger_id: "box-2".into(),
            direction: Direction::Expense,
            label: "Refund table 2".into(),
            amount: 12.5,
        };
        assert_eq!(entry.to_payload()["type"], json!("expense"));
        assert_eq!(entry.to_payload()["amount"], json!("12.5"));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1250.0), "1250");
        assert_eq!(format_amount(12.5), "12.5");
        assert_eq!(format_amount(0.1 + 0.2), "0.3");
        assert_eq!(format_amount(f64::NAN), "0");
        assert_eq!(format_amount(-0.001), "0");
    }
}
