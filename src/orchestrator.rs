//! Table settlement.
//!
//! Settling a table touches four backend resources with no transaction
//! spanning them, so it runs as a saga without compensation:
//!
//! 1. record one ledger entry for the group total (critical: any failure
//!    aborts before anything else is touched)
//! 2. mark every order paid, concurrently
//! 3. delete each order that was marked paid (optional)
//! 4. release the table
//! 5. publish `settlement:completed`
//!
//! and finally a full reconcile, whatever happened in steps 2 to 5. Only the
//! step 1 failure is returned as an error; everything after it is collected
//! into the [`SettlementOutcome`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::SettlementGroup;
use crate::api::ApiClient;
use crate::backend::Backend;
use crate::config::SettlementConfig;
use crate::models::{Direction, LedgerEntry};
use crate::notifier::{Notifier, SettlementEvent, Topic};
use crate::reconcile::{OptimisticPatch, Reconciler};
use crate::variants::VariantResolver;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// The ledger entry could not be recorded; nothing else was attempted.
    #[error("{0}")]
    LedgerEntry(String),
    #[error("No cash box available to record the payment")]
    NoLedger,
    #[error("Table {0} is already being settled")]
    AlreadyInFlight(String),
    #[error("Table {0} has no open orders")]
    NoOpenTransactions(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SettlementPhase {
    Idle,
    LedgerPending,
    Aborted,
    TransactionsPending,
    ReleasePending,
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub run_id: Uuid,
    pub resource_id: String,
    /// Always true: a run whose ledger entry failed returns an error instead.
    pub ledger_recorded: bool,
    pub ledger_entry: LedgerEntry,
    /// Orders marked paid, in group order.
    pub settled: Vec<String>,
    pub failed: Vec<TransitionFailure>,
    /// Orders marked paid whose deletion failed; they stay visible as paid.
    pub not_deleted: Vec<String>,
    pub resource_released: bool,
    pub reconciled: bool,
    pub phases: Vec<SettlementPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SettlementOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Short user-facing note about orders left unpaid, if any.
    pub fn summary(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        Some(format!(
            "{} of {} transactions could not be marked settled",
            self.failed.len(),
            self.failed.len() + self.settled.len()
        ))
    }
}

/// Per-order result of steps 2 and 3.
struct TransitionReport {
    position: usize,
    id: String,
    settled: Result<usize, String>,
    deleted: Option<Result<(), String>>,
}

/// Holds the in-flight marker for one table; cleared on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    resource_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.resource_id);
    }
}

pub struct SettlementOrchestrator {
    backend: Backend,
    reconciler: Arc<Reconciler>,
    notifier: Arc<Notifier>,
    delete_settled: bool,
    label_prefix: String,
    in_flight: Mutex<HashSet<String>>,
}

impl SettlementOrchestrator {
    pub fn new(
        backend: Backend,
        reconciler: Arc<Reconciler>,
        notifier: Arc<Notifier>,
        delete_settled: bool,
        label_prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            reconciler,
            notifier,
            delete_settled,
            label_prefix: label_prefix.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Wire the HTTP client, resolver, reconciler and notifier from config.
    pub fn from_config(config: &SettlementConfig) -> Result<Self, String> {
        let client = ApiClient::new(
            &config.base_url,
            &config.api_token,
            config.request_timeout(),
        )?;
        let backend = Backend::new(
            Arc::new(client),
            Arc::new(VariantResolver::new(config.cached_variant_failure_limit)),
            config.endpoints.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(backend.clone()));
        Ok(Self::new(
            backend,
            reconciler,
            Notifier::new(),
            config.delete_settled,
            config.ledger_label_prefix.clone(),
        ))
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    fn claim(&self, resource_id: &str) -> Result<InFlight<'_>, SettlementError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(resource_id.to_string()) {
            return Err(SettlementError::AlreadyInFlight(resource_id.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            resource_id: resource_id.to_string(),
        })
    }

    fn ledger_label(&self, group: &SettlementGroup) -> String {
        format!("{} {}", self.label_prefix, group.resource_label())
    }

    /// Settle the reconciler's current group for `resource_id`.
    pub async fn settle_resource(
        &self,
        resource_id: &str,
        ledger_ref: Option<&str>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let group = self
            .reconciler
            .group_for(resource_id)
            .ok_or_else(|| SettlementError::NoOpenTransactions(resource_id.to_string()))?;
        self.settle(&group, ledger_ref).await
    }

    /// Run the settlement saga for one group. `ledger_ref` defaults to the
    /// first known cash box.
    pub async fn settle(
        &self,
        group: &SettlementGroup,
        ledger_ref: Option<&str>,
    ) -> Result<SettlementOutcome, SettlementError> {
        if group.is_empty() {
            return Err(SettlementError::NoOpenTransactions(group.resource_id.clone()));
        }
        let _guard = self.claim(&group.resource_id)?;
        let ledger_id = match ledger_ref {
            Some(id) => id.to_string(),
            None => self
                .reconciler
                .default_ledger()
                .ok_or(SettlementError::NoLedger)?,
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut phases = vec![SettlementPhase::Idle];
        let mut enter = |phase: SettlementPhase| {
            debug!(%run_id, ?phase, "settlement phase");
            phases.push(phase);
        };

        // ---- Step 1: ledger entry (critical) ----
        enter(SettlementPhase::LedgerPending);
        let entry = LedgerEntry {
            id: None,
            ledger_id,
            direction: Direction::Income,
            label: self.ledger_label(group),
            amount: group.total,
        };
        let ledger_entry = match self.backend.create_ledger_entry(&entry).await {
            Ok(recorded) => recorded,
            Err(e) => {
                enter(SettlementPhase::Aborted);
                error!(%run_id, resource_id = %group.resource_id, error = %e, "ledger entry failed, settlement aborted");
                return Err(SettlementError::LedgerEntry(e));
            }
        };
        info!(
            %run_id,
            resource_id = %group.resource_id,
            amount = entry.amount,
            entry_id = ?ledger_entry.id,
            "ledger entry recorded"
        );

        // ---- Steps 2 and 3: mark paid, then delete (fan-out) ----
        enter(SettlementPhase::TransactionsPending);
        let ids = group.transaction_ids();
        let mut set = tokio::task::JoinSet::new();
        for (position, id) in ids.iter().cloned().enumerate() {
            let backend = self.backend.clone();
            let delete = self.delete_settled;
            set.spawn(async move {
                let settled = backend
                    .settle_transaction(&id)
                    .await
                    .map(|resolved| resolved.index)
                    .map_err(|e| e.to_string());
                let deleted = match (&settled, delete) {
                    (Ok(_), true) => Some(backend.delete_transaction(&id).await),
                    _ => None,
                };
                TransitionReport {
                    position,
                    id,
                    settled,
                    deleted,
                }
            });
        }

        // ---- Step 4: release, issued once the transitions are dispatched ----
        enter(SettlementPhase::ReleasePending);
        let (reports, resource_released) =
            tokio::join!(collect_reports(set, ids.len()), self.release(group));

        let mut settled = Vec::new();
        let mut failed = Vec::new();
        let mut not_deleted = Vec::new();
        for (position, report) in reports.into_iter().enumerate() {
            let Some(report) = report else {
                failed.push(TransitionFailure {
                    id: ids[position].clone(),
                    error: "Settlement task stopped unexpectedly".into(),
                });
                continue;
            };
            match report.settled {
                Ok(variant) => {
                    debug!(%run_id, transaction_id = %report.id, variant, "order marked paid");
                    if let Some(Err(e)) = &report.deleted {
                        warn!(%run_id, transaction_id = %report.id, error = %e, "paid order could not be deleted");
                        not_deleted.push(report.id.clone());
                    }
                    settled.push(report.id);
                }
                Err(e) => {
                    warn!(%run_id, transaction_id = %report.id, error = %e, "order could not be marked paid");
                    failed.push(TransitionFailure {
                        id: report.id,
                        error: e,
                    });
                }
            }
        }

        self.reconciler
            .apply_optimistic(OptimisticPatch::RemoveTransactions(settled.clone()));
        if resource_released {
            self.reconciler
                .apply_optimistic(OptimisticPatch::SetResourceStatus {
                    resource_id: group.resource_id.clone(),
                    status: "free".into(),
                });
        }

        // ---- Step 5: notify ----
        let event = SettlementEvent {
            resource_id: group.resource_id.clone(),
            transaction_ids: settled.clone(),
            settled_at: Utc::now(),
        };
        let delivered = self.notifier.publish(Topic::SettlementCompleted, &event);
        debug!(%run_id, delivered, "settlement event published");

        // ---- Reconcile (always) ----
        enter(SettlementPhase::Reconciling);
        let reconciled = match self.reconciler.reconcile_full().await {
            Ok(()) => true,
            Err(e) => {
                error!(%run_id, error = %e, "post-settlement reconcile failed, local state may be stale");
                false
            }
        };
        enter(SettlementPhase::Idle);

        let outcome = SettlementOutcome {
            run_id,
            resource_id: group.resource_id.clone(),
            ledger_recorded: true,
            ledger_entry,
            settled,
            failed,
            not_deleted,
            resource_released,
            reconciled,
            phases,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            resource_id = %outcome.resource_id,
            settled = outcome.settled.len(),
            failed = outcome.failed.len(),
            released = outcome.resource_released,
            "settlement finished"
        );
        Ok(outcome)
    }

    /// Step 4. A table without a known record is only looked up if the
    /// partial update is refused and the full replace needs its fields.
    async fn release(&self, group: &SettlementGroup) -> bool {
        match self
            .backend
            .release_resource(&group.resource_id, group.resource.as_ref())
            .await
        {
            Ok(resolved) => {
                info!(resource_id = %group.resource_id, variant = resolved.index, "table released");
                true
            }
            Err(e) => {
                warn!(resource_id = %group.resource_id, error = %e, "table could not be released");
                false
            }
        }
    }
}

/// Drain the fan-out, placing each report at its group position. A task
/// that panicked leaves its slot empty.
async fn collect_reports(
    mut set: tokio::task::JoinSet<TransitionReport>,
    len: usize,
) -> Vec<Option<TransitionReport>> {
    let mut reports: Vec<Option<TransitionReport>> = (0..len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => {
                let position = report.position;
                reports[position] = Some(report);
            }
            Err(e) => warn!(error = %e, "settlement task failed"),
        }
    }
    reports
}
