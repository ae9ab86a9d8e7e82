//! Local cache of tables, zones, ledgers and unsettled orders.
//!
//! Settlement patches this cache optimistically while its network calls
//! are still settling; [`Reconciler::reconcile_full`] then replaces the
//! whole cache with a fresh read. There is no incremental merge: whichever
//! refetch finishes last wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::aggregate::{aggregate, is_settled_status, SettlementGroup};
use crate::backend::Backend;
use crate::models::{Ledger, Resource, Transaction, Zone};

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub resources: Vec<Resource>,
    pub zones: Vec<Zone>,
    pub ledgers: Vec<Ledger>,
    /// Resource-bound transactions not yet settled.
    pub unsettled: Vec<Transaction>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// A local edit applied ahead of the authoritative refetch.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticPatch {
    RemoveTransactions(Vec<String>),
    SetResourceStatus { resource_id: String, status: String },
}

pub struct Reconciler {
    backend: Backend,
    state: RwLock<Snapshot>,
}

impl Reconciler {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: RwLock::new(Snapshot::default()),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn apply_optimistic(&self, patch: OptimisticPatch) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match patch {
            OptimisticPatch::RemoveTransactions(ids) => {
                state.unsettled.retain(|t| !ids.contains(&t.id));
            }
            OptimisticPatch::SetResourceStatus {
                resource_id,
                status,
            } => {
                if let Some(resource) = state.resources.iter_mut().find(|r| r.id == resource_id) {
                    resource.status = Some(status);
                }
            }
        }
    }

    /// Fill in line items for transactions listed without them. A failed
    /// detail fetch keeps the summary record.
    async fn hydrate_items(&self, transactions: Vec<Transaction>) -> Vec<Transaction> {
        let mut set = tokio::task::JoinSet::new();
        for t in transactions.iter().filter(|t| !t.has_items()) {
            let backend = self.backend.clone();
            let id = t.id.clone();
            set.spawn(async move {
                let detail = backend.fetch_transaction(&id).await;
                (id, detail)
            });
        }

        let mut details = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(detail))) => {
                    details.insert(id, detail);
                }
                Ok((id, Err(e))) => {
                    warn!(transaction_id = %id, error = %e, "order detail fetch failed");
                }
                Err(e) => warn!(error = %e, "order detail task failed"),
            }
        }

        transactions
            .into_iter()
            .map(|t| match details.get(&t.id) {
                Some(detail) => t.merged_with(detail),
                None => t,
            })
            .collect()
    }

    /// Refetch everything and replace local state wholesale. On failure the
    /// current (possibly optimistic) state is left in place.
    pub async fn reconcile_full(&self) -> Result<(), String> {
        let (resources, zones, transactions, ledgers) = tokio::join!(
            self.backend.list_resources(),
            self.backend.list_zones(),
            self.backend.list_transactions(),
            self.backend.list_ledgers(),
        );

        let (resources, zones, transactions) = match (resources, zones, transactions) {
            (Ok(r), Ok(z), Ok(t)) => (r, z, t),
            (r, z, t) => {
                let error = [r.err(), z.err(), t.err()]
                    .into_iter()
                    .flatten()
                    .next()
                    .unwrap_or_default();
                warn!(error = %error, "reconcile refetch failed, keeping local state");
                return Err(error);
            }
        };
        // Ledgers are optional: no ledger list just means nothing to pay into.
        let ledgers = ledgers.unwrap_or_else(|e| {
            warn!(error = %e, "ledger list unavailable");
            Vec::new()
        });

        let unsettled: Vec<Transaction> = transactions
            .into_iter()
            .filter(|t| t.resource_id.is_some() && !is_settled_status(t.status.as_deref()))
            .collect();
        let unsettled = self.hydrate_items(unsettled).await;

        let fresh = Snapshot {
            resources,
            zones,
            ledgers,
            unsettled,
            fetched_at: Some(Utc::now()),
        };
        info!(
            resources = fresh.resources.len(),
            zones = fresh.zones.len(),
            ledgers = fresh.ledgers.len(),
            unsettled = fresh.unsettled.len(),
            "local state reconciled"
        );
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    /// Settlement groups for the current unsettled set, joined with their
    /// resource records.
    pub fn groups(&self) -> Vec<SettlementGroup> {
        let state = self.snapshot();
        aggregate(&state.unsettled)
            .into_iter()
            .map(|g| {
                let resource = state
                    .resources
                    .iter()
                    .find(|r| r.id == g.resource_id)
                    .cloned();
                g.with_resource(resource)
            })
            .collect()
    }

    pub fn group_for(&self, resource_id: &str) -> Option<SettlementGroup> {
        self.groups()
            .into_iter()
            .find(|g| g.resource_id == resource_id)
    }

    /// The ledger payments go into when the caller names none: the first.
    pub fn default_ledger(&self) -> Option<String> {
        self.snapshot().ledgers.first().map(|l| l.id.clone())
    }

    pub fn zone_title(&self, resource: &Resource) -> Option<String> {
        if resource.zone_title.is_some() {
            return resource.zone_title.clone();
        }
        let zone_id = resource.zone_id.as_deref()?;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .zones
            .iter()
            .find(|z| z.id == zone_id)
            .and_then(|z| z.title.clone())
            .or_else(|| Some(zone_id.to_string()))
    }
}
