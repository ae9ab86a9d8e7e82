//! Request-shape resolution against a backend whose accepted shape is not
//! known up front.
//!
//! A logical operation (e.g. "mark order paid") can be expressed several
//! ways. [`VariantResolver::resolve`] tries the candidates in order, returns
//! the first success and remembers which one worked, so later calls go
//! straight to it. A remembered variant that keeps failing is evicted after
//! `failure_limit` consecutive failed calls.

use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tracing::debug;

/// One concrete request encoding for a logical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestVariant {
    pub label: &'static str,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl RequestVariant {
    pub fn new(label: &'static str, method: Method, path: impl Into<String>) -> Self {
        Self {
            label,
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("{operation}: no request shapes to try")]
    NoCandidates { operation: String },
    #[error("{last}")]
    Exhausted {
        operation: String,
        attempts: usize,
        last: String,
    },
}

impl ProbeError {
    /// Error text of the last attempt made.
    pub fn last_error(&self) -> &str {
        match self {
            ProbeError::NoCandidates { operation } => operation,
            ProbeError::Exhausted { last, .. } => last,
        }
    }
}

/// A successful resolution: which candidate won and what it returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub index: usize,
    pub attempts: usize,
    pub value: T,
}

#[derive(Debug, Clone, Copy)]
struct Accepted {
    index: usize,
    consecutive_failures: u32,
}

/// Remembers the accepted variant per operation key for the lifetime of
/// the resolver. Shared by reference; never holds its lock across a call.
pub struct VariantResolver {
    accepted: Mutex<HashMap<String, Accepted>>,
    failure_limit: u32,
}

impl Default for VariantResolver {
    fn default() -> Self {
        Self::new(3)
    }
}

impl VariantResolver {
    /// `failure_limit` of 0 keeps accepted variants until [`forget`](Self::forget).
    pub fn new(failure_limit: u32) -> Self {
        Self {
            accepted: Mutex::new(HashMap::new()),
            failure_limit,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Accepted>> {
        self.accepted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Index of the accepted variant for `operation`, if one is cached.
    pub fn accepted(&self, operation: &str) -> Option<usize> {
        self.table().get(operation).map(|a| a.index)
    }

    pub fn forget(&self, operation: &str) {
        self.table().remove(operation);
    }

    fn record_success(&self, operation: &str, index: usize) {
        self.table().insert(
            operation.to_string(),
            Accepted {
                index,
                consecutive_failures: 0,
            },
        );
    }

    /// Count a call in which the cached variant and every other candidate
    /// failed. The key is shared by every record the operation touches, so
    /// calls failing for record-specific reasons count too; any success in
    /// between resets the count, and an eviction only costs the next call a
    /// probe from the first candidate.
    fn record_cached_failure(&self, operation: &str, index: usize) {
        let mut table = self.table();
        let Some(entry) = table.get_mut(operation) else {
            return;
        };
        // Another call may have replaced the entry meanwhile.
        if entry.index != index {
            return;
        }
        entry.consecutive_failures += 1;
        if self.failure_limit > 0 && entry.consecutive_failures >= self.failure_limit {
            debug!(
                operation,
                index,
                failures = entry.consecutive_failures,
                "evicting accepted variant"
            );
            table.remove(operation);
        }
    }

    /// Try `candidates` in order (the accepted one first, if cached) and
    /// return the first success. When every candidate fails, the error of
    /// the last attempt is returned and the accepted variant is kept.
    pub async fn resolve<C, T, F, Fut>(
        &self,
        operation: &str,
        candidates: &[C],
        mut apply: F,
    ) -> Result<Resolved<T>, ProbeError>
    where
        F: FnMut(&C) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        if candidates.is_empty() {
            return Err(ProbeError::NoCandidates {
                operation: operation.to_string(),
            });
        }

        let cached = self.accepted(operation).filter(|i| *i < candidates.len());
        let mut attempts = 0;
        let mut last_error = String::new();

        if let Some(index) = cached {
            attempts += 1;
            match apply(&candidates[index]).await {
                Ok(value) => {
                    self.record_success(operation, index);
                    return Ok(Resolved {
                        index,
                        attempts,
                        value,
                    });
                }
                Err(e) => {
                    debug!(operation, index, error = %e, "accepted variant failed, re-probing");
                    last_error = e;
                }
            }
        }

        for (index, candidate) in candidates.iter().enumerate() {
            if Some(index) == cached {
                continue;
            }
            attempts += 1;
            match apply(candidate).await {
                Ok(value) => {
                    debug!(operation, index, attempts, "variant accepted");
                    self.record_success(operation, index);
                    return Ok(Resolved {
                        index,
                        attempts,
                        value,
                    });
                }
                Err(e) => {
                    debug!(operation, index, error = %e, "variant rejected");
                    last_error = e;
                }
            }
        }

        if let Some(index) = cached {
            self.record_cached_failure(operation, index);
        }
        Err(ProbeError::Exhausted {
            operation: operation.to_string(),
            attempts,
            last: last_error,
        })
    }
}
