#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::common::validate_optional_text;
use sitevisit_kernel_contracts::site_visit::{ActorId, RecordId, VisitStatus};
use sitevisit_kernel_contracts::{ContractViolation, ReasonCodeId, SchemaVersion, Validate, WallTimeNs};

use crate::store::{SiteVisitStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AuditAction {
    Ingested,
    PermitsAttached,
    Verified,
    Rejected,
    Approved,
    Completed,
    LocalityOverrideApplied,
    StatePermitUploaded,
    StatePermitVerified,
    LocalityPermitUploaded,
}

/// Byte limit on the free-text detail of one audit row.
pub const AUDIT_DETAIL_MAX_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventInput {
    pub record_id: Option<RecordId>,
    pub action: AuditAction,
    pub from_status: Option<VisitStatus>,
    pub to_status: Option<VisitStatus>,
    pub actor: ActorId,
    pub at: WallTimeNs,
    pub reason_code: ReasonCodeId,
    pub detail: Option<String>,
}

impl AuditEventInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        record_id: Option<RecordId>,
        action: AuditAction,
        from_status: Option<VisitStatus>,
        to_status: Option<VisitStatus>,
        actor: ActorId,
        at: WallTimeNs,
        reason_code: ReasonCodeId,
        detail: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let ev = Self {
            record_id,
            action,
            from_status,
            to_status,
            actor,
            at,
            reason_code,
            detail,
        };
        ev.validate()?;
        Ok(ev)
    }
}

impl Validate for AuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(id) = &self.record_id {
            id.validate()?;
        }
        self.actor.validate()?;
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.reason_code",
                reason: "must be > 0",
            });
        }
        validate_optional_text(
            "audit_event_input.detail",
            self.detail.as_deref(),
            AUDIT_DETAIL_MAX_LEN,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuditEventRecord {
    pub schema_version: SchemaVersion,
    pub event_id: u64,
    pub record_id: Option<RecordId>,
    pub action: AuditAction,
    pub from_status: Option<VisitStatus>,
    pub to_status: Option<VisitStatus>,
    pub actor: ActorId,
    pub at: WallTimeNs,
    pub reason_code: ReasonCodeId,
    pub detail: Option<String>,
}

/// Append-only writer into the store's audit ledger.
#[derive(Debug, Default)]
pub struct AuditWriter;

impl AuditWriter {
    pub fn emit(store: &mut SiteVisitStore, input: AuditEventInput) -> Result<u64, StorageError> {
        store.append_audit_event(input)
    }
}
