#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use sitevisit_kernel_contracts::common::same_place;
use sitevisit_kernel_contracts::permit::{LocalityKey, LocalityPermit, PermitFacts, StatePermit};
use sitevisit_kernel_contracts::site_visit::{RecordId, SiteVisitRecord, VisitStatus};
use sitevisit_kernel_contracts::{ContractViolation, SchemaVersion, Validate, WallTimeNs};

use crate::audit::{AuditEventInput, AuditEventRecord};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table}: version conflict on {key} (expected {expected}, found {found})")]
    VersionConflict {
        table: &'static str,
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RecordChangeKind {
    Inserted,
    Updated,
    PermitLedgerChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordChangeEvent {
    pub seq: u64,
    pub record_id: Option<RecordId>,
    pub kind: RecordChangeKind,
    pub at: WallTimeNs,
}

/// In-memory record store: the single source of truth for visit records and permit facts.
///
/// Writes are last-write-wins unless the caller passes the version it read, in which case a
/// stale write is refused with `VersionConflict`.
#[derive(Debug, Default, Clone)]
pub struct SiteVisitStore {
    records: BTreeMap<RecordId, SiteVisitRecord>,
    state_permits: Vec<StatePermit>,
    locality_permits: Vec<LocalityPermit>,
    audit_events: Vec<AuditEventRecord>,
    next_audit_event_id: u64,
    change_events: Vec<RecordChangeEvent>,
    next_change_seq: u64,
}

impl SiteVisitStore {
    pub fn new_in_memory() -> Self {
        Self {
            next_audit_event_id: 1,
            next_change_seq: 1,
            ..Self::default()
        }
    }

    pub fn insert_record(&mut self, record: SiteVisitRecord) -> Result<(), StorageError> {
        record.validate()?;
        if record.status != VisitStatus::Assigned {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "site_visit_store.insert_record.status",
                    reason: "ingested records must be ASSIGNED",
                },
            ));
        }
        if self.records.contains_key(&record.record_id) {
            return Err(StorageError::DuplicateKey {
                table: "site_visits.record_id",
                key: record.record_id.as_str().to_string(),
            });
        }
        let id = record.record_id.clone();
        let at = record.assigned_at;
        self.records.insert(id.clone(), record);
        self.push_change(Some(id), RecordChangeKind::Inserted, at);
        Ok(())
    }

    pub fn record(&self, record_id: &RecordId) -> Option<&SiteVisitRecord> {
        self.records.get(record_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SiteVisitRecord> {
        self.records.values()
    }

    /// Writes `record` over the stored row and bumps its version.
    ///
    /// With `expected_version = Some(v)` the write only lands if the stored row is still at `v`.
    pub fn put_record(
        &mut self,
        mut record: SiteVisitRecord,
        expected_version: Option<u64>,
        at: WallTimeNs,
    ) -> Result<SiteVisitRecord, StorageError> {
        record.validate()?;
        let current = self
            .records
            .get(&record.record_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "site_visits.record_id",
                key: record.record_id.as_str().to_string(),
            })?;
        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(StorageError::VersionConflict {
                    table: "site_visits",
                    key: record.record_id.as_str().to_string(),
                    expected,
                    found: current.version,
                });
            }
        }
        record.version = current.version.saturating_add(1);
        let id = record.record_id.clone();
        self.records.insert(id.clone(), record.clone());
        self.push_change(Some(id), RecordChangeKind::Updated, at);
        Ok(record)
    }

    pub fn append_state_permit(&mut self, permit: StatePermit) -> Result<(), StorageError> {
        permit.validate()?;
        let at = permit.uploaded_at;
        self.state_permits.push(permit);
        self.push_change(None, RecordChangeKind::PermitLedgerChanged, at);
        Ok(())
    }

    /// Refused while the state's permit is unverified: a locality permit carries no weight
    /// without one.
    pub fn append_locality_permit(&mut self, permit: LocalityPermit) -> Result<(), StorageError> {
        permit.validate()?;
        if !self.state_permit_verified(&permit.state) {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "locality_permits.state",
                    reason: "state permit must be verified first",
                },
            ));
        }
        let at = permit.uploaded_at;
        self.locality_permits.push(permit);
        self.push_change(None, RecordChangeKind::PermitLedgerChanged, at);
        Ok(())
    }

    pub fn state_permits(&self) -> &[StatePermit] {
        &self.state_permits
    }

    pub fn locality_permits(&self) -> &[LocalityPermit] {
        &self.locality_permits
    }

    pub(crate) fn append_audit_event(
        &mut self,
        input: AuditEventInput,
    ) -> Result<u64, StorageError> {
        input.validate()?;
        let event_id = self.next_audit_event_id;
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);
        self.audit_events.push(AuditEventRecord {
            schema_version: SchemaVersion(1),
            event_id,
            record_id: input.record_id,
            action: input.action,
            from_status: input.from_status,
            to_status: input.to_status,
            actor: input.actor,
            at: input.at,
            reason_code: input.reason_code,
            detail: input.detail,
        });
        Ok(event_id)
    }

    pub fn audit_events(&self) -> &[AuditEventRecord] {
        &self.audit_events
    }

    pub fn audit_events_for_record(&self, record_id: &RecordId) -> Vec<&AuditEventRecord> {
        self.audit_events
            .iter()
            .filter(|e| e.record_id.as_ref() == Some(record_id))
            .collect()
    }

    pub fn changes_since(&self, cursor: u64) -> &[RecordChangeEvent] {
        let start = self.change_events.partition_point(|e| e.seq <= cursor);
        &self.change_events[start..]
    }

    pub fn last_change_seq(&self) -> u64 {
        self.change_events.last().map(|e| e.seq).unwrap_or(0)
    }

    fn push_change(&mut self, record_id: Option<RecordId>, kind: RecordChangeKind, at: WallTimeNs) {
        let seq = self.next_change_seq;
        self.next_change_seq = self.next_change_seq.saturating_add(1);
        self.change_events.push(RecordChangeEvent {
            seq,
            record_id,
            kind,
            at,
        });
    }
}

impl PermitFacts for SiteVisitStore {
    fn state_permit_verified(&self, state: &str) -> bool {
        self.state_permits
            .iter()
            .any(|p| p.verified && same_place(&p.state, state))
    }

    fn locality_permit_present(&self, state: &str, locality: &str) -> bool {
        let want = LocalityKey::new(state, locality);
        self.locality_permits
            .iter()
            .any(|p| LocalityKey::new(&p.state, &p.locality) == want)
    }
}
