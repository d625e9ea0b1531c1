//! Error taxonomy for the intelligence layer.
//!
//! Errors are values returned to callers; only invariant violations halt the
//! calling job. Transient kinds are retried by the dispatcher, permanent
//! kinds surface as uncertainty strands so the learning loop can see them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CilError {
    /// Rejected at an ingestion or append boundary; the producer must fix.
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Attempt to patch a field outside the mutable subset.
    #[error("immutable field: {0}")]
    ImmutableField(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Historical context could not be retrieved; predictions degrade to
    /// code-only.
    #[error("context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    #[error("llm timed out after {0}ms")]
    LlmTimeout(u64),

    /// LLM responded but the payload failed the numeric contract.
    #[error("llm output malformed: {0}")]
    LlmMalformed(String),

    /// Never recovered; the source job is quarantined.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A resonance update would leave the configured bounds; the value is
    /// clamped and the event flagged.
    #[error("bound exceeded: {field} = {value}")]
    BoundExceeded { field: &'static str, value: f64 },
}

pub type CilResult<T> = Result<T, CilError>;

impl CilError {
    /// Transient errors are retried with backoff; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CilError::StoreUnavailable(_)
                | CilError::ContextUnavailable(_)
                | CilError::LlmUnavailable(_)
                | CilError::LlmTimeout(_)
                | CilError::LlmMalformed(_)
        )
    }
}

impl From<rusqlite::Error> for CilError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => CilError::NotFound("no rows".to_string()),
            other => CilError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CilError {
    fn from(e: serde_json::Error) -> Self {
        CilError::ValidationFailure(format!("payload encode/decode: {e}"))
    }
}
