//! Settlement grouping.
//!
//! Pure functions: classify which transactions still need paying, derive
//! each one's amount, and group them by the resource they belong to.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{Resource, Transaction};
use crate::value_number;

/// Status tokens (two vocabularies) meaning the transaction no longer
/// needs paying. Anything else, including tokens the backend may add
/// later, counts as not settled.
const SETTLED_STATUSES: &[&str] = &[
    "paid",
    "оплачен",
    "оплачено",
    "canceled",
    "cancelled",
    "отменён",
    "отменен",
    "closed",
    "done",
    "completed",
];

const TOTAL_FIELDS: &[&str] = &["total", "total_amount", "sum", "amount"];
const ITEM_PRICE_FIELDS: &[&str] = &["menu_item_price", "price"];

pub fn is_settled_status(status: Option<&str>) -> bool {
    let normalized = status.unwrap_or_default().trim().to_lowercase();
    SETTLED_STATUSES.contains(&normalized.as_str())
}

/// The first of `keys` present with a non-null value.
fn first_present<'k>(v: &Value, keys: &[&'k str]) -> Option<&'k str> {
    keys.iter()
        .copied()
        .find(|key| v.get(*key).map_or(false, |x| !x.is_null()))
}

fn line_item_total(item: &Value) -> f64 {
    // A present but unreadable price counts as 0; it does not fall through.
    let price = first_present(item, ITEM_PRICE_FIELDS)
        .and_then(|key| value_number(item, &[key]))
        .unwrap_or(0.0);
    let quantity = value_number(item, &["quantity"]).unwrap_or(0.0);
    price * quantity
}

/// Amount owed for one transaction. The first total-like field present
/// decides: if it holds a positive number that is the amount, otherwise
/// the line items are summed.
pub fn derived_amount(transaction: &Transaction) -> f64 {
    let total = first_present(&transaction.raw, TOTAL_FIELDS)
        .and_then(|key| value_number(&transaction.raw, &[key]));
    match total {
        Some(total) if total > 0.0 => total,
        _ => transaction.items.iter().map(line_item_total).sum(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementLine {
    pub transaction: Transaction,
    pub amount: f64,
}

/// Unsettled transactions sharing one resource, with their total.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementGroup {
    pub resource_id: String,
    pub resource: Option<Resource>,
    pub total: f64,
    pub lines: Vec<SettlementLine>,
}

impl SettlementGroup {
    pub fn transaction_ids(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.transaction.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Display number of the resource, falling back to its id.
    pub fn resource_label(&self) -> String {
        self.resource
            .as_ref()
            .and_then(|r| r.number.clone())
            .unwrap_or_else(|| self.resource_id.clone())
    }

    pub fn with_resource(mut self, resource: Option<Resource>) -> Self {
        self.resource = resource;
        self
    }
}

/// Group unsettled, resource-bound transactions by resource. Groups and the
/// transactions within them keep first-seen order.
pub fn aggregate(transactions: &[Transaction]) -> Vec<SettlementGroup> {
    let mut groups: Vec<SettlementGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for transaction in transactions {
        if is_settled_status(transaction.status.as_deref()) {
            continue;
        }
        let Some(resource_id) = transaction.resource_id.clone() else {
            continue;
        };

        let amount = derived_amount(transaction);
        let slot = *index.entry(resource_id.clone()).or_insert_with(|| {
            groups.push(SettlementGroup {
                resource_id,
                resource: None,
                total: 0.0,
                lines: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.total += amount;
        group.lines.push(SettlementLine {
            transaction: transaction.clone(),
            amount,
        });
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(v: Value) -> Transaction {
        Transaction::from_value(&v).expect("transaction")
    }

    #[test]
    fn test_settled_classifier_is_a_blocklist() {
        assert!(is_settled_status(Some("paid")));
        assert!(is_settled_status(Some("  PAID ")));
        assert!(is_settled_status(Some("Оплачен")));
        assert!(is_settled_status(Some("отменён")));
        assert!(is_settled_status(Some("completed")));
        assert!(!is_settled_status(Some("new")));
        assert!(!is_settled_status(Some("awaiting_refund")));
        assert!(!is_settled_status(Some("")));
        assert!(!is_settled_status(None));
    }

    #[test]
    fn test_direct_total_fields_in_priority_order() {
        let t = tx(json!({ "id": 1, "total": "500", "amount": 9 }));
        assert_eq!(derived_amount(&t), 500.0);

        let t = tx(json!({ "id": 2, "total": null, "total_amount": 750.5 }));
        assert_eq!(derived_amount(&t), 750.5);

        let t = tx(json!({ "id": 3, "sum": "12,5" }));
        assert_eq!(derived_amount(&t), 12.5);
    }

    #[test]
    fn test_first_present_total_decides() {
        // A zero total goes to the line items, not to the next total field.
        let t = tx(json!({
            "id": 1,
            "total": 0,
            "amount": 999,
            "items": [{ "price": 100, "quantity": 2 }],
        }));
        assert_eq!(derived_amount(&t), 200.0);

        let t = tx(json!({ "id": 2, "total": "n/a", "sum": 40, "items": [] }));
        assert_eq!(derived_amount(&t), 0.0);

        let t = tx(json!({ "id": 3, "total": -5, "amount": 10 }));
        assert_eq!(derived_amount(&t), 0.0);
    }

    #[test]
    fn test_unreadable_menu_price_counts_zero() {
        let t = tx(json!({
            "id": 1,
            "items": [
                { "menu_item_price": "free", "price": 50, "quantity": 2 },
                { "menu_item_price": null, "price": 30, "quantity": 1 },
            ],
        }));
        assert_eq!(derived_amount(&t), 30.0);
    }

    #[test]
    fn test_line_items_when_no_total() {
        let t = tx(json!({
            "id": 1,
            "items": [
                { "menu_item_price": "300", "price": 1, "quantity": 2 },
                { "price": 100, "quantity": 1 },
            ],
        }));
        assert_eq!(derived_amount(&t), 700.0);
    }

    #[test]
    fn test_line_items_missing_quantity_count_zero() {
        let t = tx(json!({
            "id": 1,
            "total": null,
            "items": [{ "price": 100 }, { "price": "abc", "quantity": 3 }],
        }));
        assert_eq!(derived_amount(&t), 0.0);
    }

    #[test]
    fn test_aggregate_groups_by_resource_in_first_seen_order() {
        let groups = aggregate(&[
            tx(json!({ "id": "a", "table": "t2", "total": 500, "status": "new" })),
            tx(json!({ "id": "b", "table": "t1", "total": 10 })),
            tx(json!({ "id": "c", "table": "t2", "total": 750 })),
            tx(json!({ "id": "d", "table": "t2", "total": 99, "status": "paid" })),
            tx(json!({ "id": "e", "total": 40 })),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].resource_id, "t2");
        assert_eq!(groups[0].transaction_ids(), vec!["a", "c"]);
        assert_eq!(groups[0].total, 1250.0);
        assert_eq!(groups[1].resource_id, "t1");
        assert_eq!(groups[1].total, 10.0);
    }

    #[test]
    fn test_group_total_equals_sum_of_line_amounts() {
        let groups = aggregate(&[
            tx(json!({ "id": 1, "table": "t", "total": 19.99 })),
            tx(json!({ "id": 2, "table": "t", "items": [{ "price": 2.5, "quantity": 3 }] })),
            tx(json!({ "id": 3, "table": "t", "amount": "0.01" })),
        ]);
        let group = &groups[0];
        let sum: f64 = group.lines.iter().map(|l| derived_amount(&l.transaction)).sum();
        assert_eq!(sum, group.total);
        assert_eq!(group.len(), 3);
    }

    #[test]
    fn test_resource_label_falls_back_to_id() {
        let group = aggregate(&[tx(json!({ "id": 1, "table": "t9", "total": 1 }))]).remove(0);
        assert_eq!(group.resource_label(), "t9");
        let resource = Resource::from_value(&json!({ "id": "t9", "number": 4 }));
        assert_eq!(group.with_resource(resource).resource_label(), "4");
    }
}
