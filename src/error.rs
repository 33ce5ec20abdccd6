//! Error taxonomy (spec §7). Component-boundary functions return
//! `anyhow::Result<T>` the way the teacher crate does; `IngestError` is the
//! typed discriminant carried inside that `anyhow::Error` so the orchestrator
//! can classify a failure without re-parsing a message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Connect/timeout/5xx against the upstream API. Retriable.
    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    /// 4xx from the upstream API. Terminal for that poll.
    #[error("upstream client error (status {status}): {body}")]
    UpstreamClient { status: u16, body: String },

    /// Payload missing required fields or the wrong shape. Terminal.
    #[error("validation failure: {fields:?}")]
    Validation { fields: Vec<String> },

    /// Transient store error (best-effort retried at the row level by the caller).
    #[error("persistence transient error: {0}")]
    PersistenceTransient(String),

    /// Referenced entrant missing for a money-flow row. Terminal for that row.
    #[error("persistence integrity error: {0}")]
    PersistenceIntegrity(String),

    /// Non-fatal data-quality observation (hold% sum out of tolerance, unknown
    /// pool product type, negative incremental). Logged, never aborts.
    #[error("logic invariant warning: {0}")]
    LogicInvariant(String),
}

impl IngestError {
    /// Per spec §4.1: network errors, timeouts and 5xx are retriable; 4xx and
    /// schema-validation failures are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IngestError::UpstreamNetwork(_) | IngestError::PersistenceTransient(_)
        )
    }
}

/// Per-race, per-phase failure recorded by the batch orchestrator (spec §4.8/§7).
#[derive(Debug, Clone)]
pub struct PhaseError {
    pub race_id: String,
    pub phase: &'static str,
    pub message: String,
}
