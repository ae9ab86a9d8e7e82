//! Collaborator services of the settlement core: ledger, orders and
//! tables, all over one [`Transport`].
//!
//! Operations whose accepted request shape differs between backend
//! deployments go through the shared [`VariantResolver`].

use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::aggregate::is_settled_status;
use crate::api::{list_from, Transport};
use crate::config::Endpoints;
use crate::models::{Ledger, LedgerEntry, Resource, Transaction, Zone};
use crate::value_id;
use crate::variants::{ProbeError, RequestVariant, Resolved, VariantResolver};

pub const OP_SETTLE_TRANSACTION: &str = "settle-transaction";
pub const OP_RELEASE_RESOURCE: &str = "release-resource";
pub const OP_LOOKUP_RESOURCE: &str = "lookup-resource";

/// Settled status token in the backend's primary vocabulary.
const STATUS_PAID: &str = "paid";
/// The same status in the alternate vocabulary some deployments expect.
const STATUS_PAID_ALT: &str = "оплачен";
const STATUS_FREE: &str = "free";
const RELEASE_REPLACE: &str = "replace";

/// The four shapes of "mark this order paid", in probing order.
pub fn settle_variants(endpoints: &Endpoints, id: &str) -> Vec<RequestVariant> {
    let item = endpoints.order(id);
    vec![
        RequestVariant::new("pay-action", Method::POST, format!("{item}pay/")),
        RequestVariant::new("patch-status", Method::PATCH, item.clone())
            .with_body(json!({ "status": STATUS_PAID })),
        RequestVariant::new("patch-status-alt", Method::PATCH, item.clone())
            .with_body(json!({ "status": STATUS_PAID_ALT })),
        RequestVariant::new("replace", Method::PUT, item).with_body(json!({ "status": STATUS_PAID })),
    ]
}

/// Partial update to free, then a full replace. Without a known record the
/// replace carries no body yet; it is filled from a lookup when reached.
pub fn release_variants(
    endpoints: &Endpoints,
    id: &str,
    resource: Option<&Resource>,
) -> Vec<RequestVariant> {
    let item = endpoints.table(id);
    let mut replace = RequestVariant::new(RELEASE_REPLACE, Method::PUT, item.clone());
    replace.body = resource.map(Resource::release_payload);
    vec![
        RequestVariant::new("partial", Method::PATCH, item).with_body(json!({ "status": STATUS_FREE })),
        replace,
    ]
}

fn lookup_variants(endpoints: &Endpoints, id: &str) -> Vec<RequestVariant> {
    vec![
        RequestVariant::new("detail", Method::GET, endpoints.table(id)),
        RequestVariant::new("list", Method::GET, endpoints.tables.clone()),
    ]
}

#[derive(Clone)]
pub struct Backend {
    transport: Arc<dyn Transport>,
    resolver: Arc<VariantResolver>,
    endpoints: Endpoints,
}

impl Backend {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<VariantResolver>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            transport,
            resolver,
            endpoints,
        }
    }

    pub fn resolver(&self) -> &Arc<VariantResolver> {
        &self.resolver
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub async fn execute(&self, variant: &RequestVariant) -> Result<Value, String> {
        self.transport
            .send(variant.method.clone(), &variant.path, variant.body.clone())
            .await
    }

    /// Resolve `operation` over `candidates`, sending each as-is.
    async fn probe(
        &self,
        operation: &str,
        candidates: &[RequestVariant],
    ) -> Result<Resolved<Value>, ProbeError> {
        self.resolver
            .resolve(operation, candidates, |variant: &RequestVariant| {
                let backend = self.clone();
                let variant = variant.clone();
                async move { backend.execute(&variant).await }
            })
            .await
    }

    async fn get_list(&self, path: &str) -> Result<Vec<Value>, String> {
        let body = self.transport.send(Method::GET, path, None).await?;
        Ok(list_from(&body))
    }

    // -----------------------------------------------------------------------
    // Ledger
    // -----------------------------------------------------------------------

    pub async fn list_ledgers(&self) -> Result<Vec<Ledger>, String> {
        let rows = self.get_list(&self.endpoints.ledgers).await?;
        Ok(rows.iter().filter_map(Ledger::from_value).collect())
    }

    /// Record one ledger entry; the returned copy carries the new id.
    pub async fn create_ledger_entry(&self, entry: &LedgerEntry) -> Result<LedgerEntry, String> {
        let created = self
            .transport
            .send(
                Method::POST,
                &self.endpoints.ledger_entries,
                Some(entry.to_payload()),
            )
            .await?;
        let mut recorded = entry.clone();
        recorded.id = value_id(&created, &["id", "uuid"]);
        Ok(recorded)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub async fn list_transactions(&self) -> Result<Vec<Transaction>, String> {
        let rows = self.get_list(&self.endpoints.orders).await?;
        Ok(rows.iter().filter_map(Transaction::from_value).collect())
    }

    /// Unsettled transactions, optionally only those owned by `owner`.
    pub async fn list_unsettled(&self, owner: Option<&str>) -> Result<Vec<Transaction>, String> {
        let all = self.list_transactions().await?;
        Ok(all
            .into_iter()
            .filter(|t| !is_settled_status(t.status.as_deref()))
            .filter(|t| owner.map_or(true, |o| t.resource_id.as_deref() == Some(o)))
            .collect())
    }

    pub async fn fetch_transaction(&self, id: &str) -> Result<Value, String> {
        self.transport
            .send(Method::GET, &self.endpoints.order(id), None)
            .await
    }

    pub async fn settle_transaction(&self, id: &str) -> Result<Resolved<Value>, ProbeError> {
        let candidates = settle_variants(&self.endpoints, id);
        self.probe(OP_SETTLE_TRANSACTION, &candidates).await
    }

    pub async fn delete_transaction(&self, id: &str) -> Result<(), String> {
        self.transport
            .send(Method::DELETE, &self.endpoints.order(id), None)
            .await
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub async fn list_resources(&self) -> Result<Vec<Resource>, String> {
        let rows = self.get_list(&self.endpoints.tables).await?;
        Ok(rows.iter().filter_map(Resource::from_value).collect())
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>, String> {
        let rows = self.get_list(&self.endpoints.zones).await?;
        Ok(rows.iter().filter_map(Zone::from_value).collect())
    }

    /// Fetch one resource record, from its detail endpoint or, failing
    /// that, by scanning the collection.
    pub async fn lookup_resource(&self, id: &str) -> Result<Resolved<Resource>, ProbeError> {
        let candidates = lookup_variants(&self.endpoints, id);
        self.resolver
            .resolve(OP_LOOKUP_RESOURCE, &candidates, |variant: &RequestVariant| {
                let backend = self.clone();
                let variant = variant.clone();
                let wanted = id.to_string();
                async move {
                    let body = backend.execute(&variant).await?;
                    let found = if variant.label == "list" {
                        list_from(&body)
                            .iter()
                            .filter_map(Resource::from_value)
                            .find(|r| r.id == wanted)
                    } else {
                        Resource::from_value(&body).filter(|r| r.id == wanted)
                    };
                    found.ok_or_else(|| format!("Resource {wanted} not found via {}", variant.label))
                }
            })
            .await
    }

    pub async fn release_resource(
        &self,
        id: &str,
        resource: Option<&Resource>,
    ) -> Result<Resolved<Value>, ProbeError> {
        let candidates = release_variants(&self.endpoints, id, resource);
        debug!(resource_id = id, known = resource.is_some(), "releasing resource");
        self.resolver
            .resolve(OP_RELEASE_RESOURCE, &candidates, |variant: &RequestVariant| {
                let backend = self.clone();
                let mut variant = variant.clone();
                let id = id.to_string();
                async move {
                    if variant.label == RELEASE_REPLACE && variant.body.is_none() {
                        let found = backend
                            .lookup_resource(&id)
                            .await
                            .map_err(|e| e.to_string())?;
                        variant.body = Some(found.value.release_payload());
                    }
                    backend.execute(&variant).await
                }
            })
            .await
    }
}
