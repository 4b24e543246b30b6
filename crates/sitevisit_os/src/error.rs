#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::permit::PermitGateOutcome;
use sitevisit_kernel_contracts::site_visit::VisitStatus;
use sitevisit_kernel_contracts::visit_session::CompletionBlocked;
use sitevisit_kernel_contracts::ContractViolation;
use sitevisit_storage::local_cache::CacheError;
use sitevisit_storage::store::StorageError;

/// Typed failure for every coordinator and collector command. No variant implies a partial
/// write: each is returned before the store or session is touched, or reports the store's own
/// refusal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(ContractViolation),
    #[error("{command} is not allowed from {from:?} (record {record_id})")]
    InvalidTransition {
        record_id: String,
        command: &'static str,
        from: VisitStatus,
    },
    #[error("record {record_id} is blocked by permits: {}", gate.as_str())]
    PermitRequired {
        record_id: String,
        gate: PermitGateOutcome,
    },
    #[error("store rejected the operation: {0}")]
    Store(StorageError),
    #[error("a visit session is already open for record {record_id}")]
    SessionAlreadyOpen { record_id: String },
    #[error("no visit session is open")]
    NoOpenSession,
    #[error("visit cannot be completed yet: {0}")]
    CompletionBlocked(CompletionBlocked),
    #[error("local cache failed: {0}")]
    Cache(CacheError),
    #[error("bulk selection matched no records")]
    EmptySelection,
}

impl From<ContractViolation> for WorkflowError {
    fn from(v: ContractViolation) -> Self {
        WorkflowError::Validation(v)
    }
}

impl From<StorageError> for WorkflowError {
    fn from(e: StorageError) -> Self {
        WorkflowError::Store(e)
    }
}

impl From<CacheError> for WorkflowError {
    fn from(e: CacheError) -> Self {
        WorkflowError::Cache(e)
    }
}

impl WorkflowError {
    /// Short stable label for transports and bulk failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "VALIDATION_ERROR",
            WorkflowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            WorkflowError::PermitRequired { .. } => "PERMIT_REQUIRED",
            WorkflowError::Store(_) => "STORE_ERROR",
            WorkflowError::SessionAlreadyOpen { .. } => "SESSION_ALREADY_OPEN",
            WorkflowError::NoOpenSession => "NO_OPEN_SESSION",
            WorkflowError::CompletionBlocked(_) => "COMPLETION_BLOCKED",
            WorkflowError::Cache(_) => "CACHE_ERROR",
            WorkflowError::EmptySelection => "EMPTY_SELECTION",
        }
    }
}
