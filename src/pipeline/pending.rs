//! In-memory store of generated queries awaiting a decision.
//!
//! Every state transition happens under the store's lock, and the lock is
//! never held across an `.await`. Claiming a query for execution moves it to
//! `Executing`, so a second `execute` for the same id sees a non-claimable
//! state and fails with `NotFound`.
//!
//! Finished queries stay readable for a while; past a fixed number of
//! terminal entries the oldest ones are evicted, so a long-lived pipeline's
//! map stays bounded by its live queries plus that retention.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::safety::{Classification, OperationKind, RiskLevel};

/// Lifecycle of a pending query.
///
/// `Generated -> (Confirmed | Cancelled) -> Executing -> (Executed | Failed)`.
/// A query that needs no confirmation goes straight from `Generated` to
/// `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Generated,
    Confirmed,
    Cancelled,
    Executing,
    Executed,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "GENERATED",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Executed | Self::Failed)
    }

    /// States from which a query may still be executed.
    fn is_claimable(&self) -> bool {
        matches!(self, Self::Generated | Self::Confirmed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified statement held between generation and execution.
///
/// Only `state` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuery {
    pub id: Uuid,
    pub question: String,
    pub sql: String,
    pub kind: OperationKind,
    pub risk: RiskLevel,
    pub explanation: String,
    pub estimated_impact: String,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub actor: Option<String>,
    pub state: LifecycleState,
    pub requires_confirmation: bool,
}

impl PendingQuery {
    pub fn classification(&self) -> Classification {
        Classification::new(self.kind, self.risk)
    }
}

/// Options checked when claiming a query for execution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimPolicy {
    pub confirmed: bool,
    pub admin_enabled: bool,
}

/// Terminal queries kept for lookups before the oldest are evicted.
const TERMINAL_RETENTION: usize = 1000;

/// Id-keyed map of pending queries.
#[derive(Debug)]
pub(crate) struct PendingStore {
    queries: Mutex<HashMap<Uuid, PendingQuery>>,
    terminal_retention: usize,
}

impl Default for PendingStore {
    fn default() -> Self {
        Self::with_terminal_retention(TERMINAL_RETENTION)
    }
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminal_retention(terminal_retention: usize) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            terminal_retention,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, PendingQuery>>> {
        self.queries
            .lock()
            .map_err(|_| GatewayError::internal("pending query lock poisoned"))
    }

    pub fn insert(&self, query: PendingQuery) -> Result<()> {
        self.lock()?.insert(query.id, query);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<PendingQuery>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    /// Moves a claimable query to `Executing` and returns a snapshot of it.
    ///
    /// Confirmation and admin checks leave the state untouched on failure.
    /// A query already `Confirmed` counts as confirmed.
    pub fn claim(&self, id: Uuid, policy: ClaimPolicy) -> Result<PendingQuery> {
        let mut queries = self.lock()?;
        let query = claimable(&mut queries, id)?;

        let confirmed = policy.confirmed || query.state == LifecycleState::Confirmed;
        if query.requires_confirmation && !confirmed {
            return Err(GatewayError::confirmation_required(format!(
                "{} query {} must be confirmed before it runs",
                query.kind, id
            )));
        }
        if query.kind == OperationKind::Admin && !policy.admin_enabled {
            return Err(GatewayError::operation_disabled(
                "Administrative operations are disabled. Set ENABLE_ADMIN_OPERATIONS=true to allow them.",
            ));
        }

        query.state = LifecycleState::Executing;
        Ok(query.clone())
    }

    /// Records the outcome of a claimed query.
    pub fn finish(&self, id: Uuid, success: bool) -> Result<()> {
        let mut queries = self.lock()?;
        let query = queries
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found(format!("Query {} not found", id)))?;
        if query.state != LifecycleState::Executing {
            return Err(GatewayError::internal(format!(
                "Query {} finished from state {}",
                id, query.state
            )));
        }
        query.state = if success {
            LifecycleState::Executed
        } else {
            LifecycleState::Failed
        };
        evict_terminal(&mut queries, self.terminal_retention);
        Ok(())
    }

    /// `Generated -> Confirmed`. A query that is already confirmed stays so.
    pub fn confirm(&self, id: Uuid) -> Result<PendingQuery> {
        let mut queries = self.lock()?;
        let query = claimable(&mut queries, id)?;
        query.state = LifecycleState::Confirmed;
        Ok(query.clone())
    }

    /// `Generated | Confirmed -> Cancelled`.
    pub fn cancel(&self, id: Uuid) -> Result<PendingQuery> {
        let mut queries = self.lock()?;
        let query = claimable(&mut queries, id)?;
        query.state = LifecycleState::Cancelled;
        let cancelled = query.clone();
        evict_terminal(&mut queries, self.terminal_retention);
        Ok(cancelled)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

/// Drops the oldest terminal entries beyond `retention`.
fn evict_terminal(queries: &mut HashMap<Uuid, PendingQuery>, retention: usize) {
    let mut terminal: Vec<(DateTime<Utc>, Uuid)> = queries
        .values()
        .filter(|q| q.state.is_terminal())
        .map(|q| (q.created_at, q.id))
        .collect();
    if terminal.len() <= retention {
        return;
    }
    terminal.sort_unstable();
    let excess = terminal.len() - retention;
    for (_, id) in terminal.into_iter().take(excess) {
        queries.remove(&id);
    }
}

fn claimable(
    queries: &mut HashMap<Uuid, PendingQuery>,
    id: Uuid,
) -> Result<&mut PendingQuery> {
    match queries.get_mut(&id) {
        Some(query) if query.state.is_claimable() => Ok(query),
        Some(query) => Err(GatewayError::not_found(format!(
            "Query {} is already {}",
            id, query.state
        ))),
        None => Err(GatewayError::not_found(format!("Query {} not found", id))),
    }
}
