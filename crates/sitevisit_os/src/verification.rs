#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use sitevisit_engines::permit_gate::PermitGate;
use sitevisit_kernel_contracts::common::{same_place, validate_optional_text, validate_text};
use sitevisit_kernel_contracts::permit::{
    LocalityPermit, PermitDemand, PermitGateOutcome, StatePermit,
};
use sitevisit_kernel_contracts::site_visit::{
    ActionStamp, ActorId, CompletionStamp, LocalityOverride, RecordId, RejectionStamp,
    SiteVisitIngest, SiteVisitRecord, VisitStatus, VisitWindow,
};
use sitevisit_kernel_contracts::{ContractViolation, ReasonCodeId, Validate, WallTimeNs};
use sitevisit_storage::audit::{AuditAction, AuditEventInput, AuditWriter, AUDIT_DETAIL_MAX_LEN};
use sitevisit_storage::store::{SiteVisitStore, StorageError};

use crate::error::WorkflowError;
use crate::notify::{Notification, NotificationSink, TracingNotificationSink};

pub mod reason_codes {
    use sitevisit_kernel_contracts::ReasonCodeId;

    // Site-visit workflow reason-code namespace ("SV").
    pub const SV_OK_INGEST: ReasonCodeId = ReasonCodeId(0x5356_0001);
    pub const SV_OK_ATTACH_PERMIT: ReasonCodeId = ReasonCodeId(0x5356_0002);
    pub const SV_OK_VERIFY: ReasonCodeId = ReasonCodeId(0x5356_0003);
    pub const SV_OK_REJECT: ReasonCodeId = ReasonCodeId(0x5356_0004);
    pub const SV_OK_APPROVE: ReasonCodeId = ReasonCodeId(0x5356_0005);
    pub const SV_OK_COMPLETE: ReasonCodeId = ReasonCodeId(0x5356_0006);
    pub const SV_OK_LOCALITY_OVERRIDE: ReasonCodeId = ReasonCodeId(0x5356_0007);
    pub const SV_OK_STATE_PERMIT_UPLOAD: ReasonCodeId = ReasonCodeId(0x5356_0010);
    pub const SV_OK_STATE_PERMIT_VERIFY: ReasonCodeId = ReasonCodeId(0x5356_0011);
    pub const SV_OK_LOCALITY_PERMIT_UPLOAD: ReasonCodeId = ReasonCodeId(0x5356_0012);
}

const NOTES_MAX_LEN: usize = 2048;
const REJECTION_REASON_MAX_LEN: usize = 2048;

/// Who is acting, when, and optionally which record version they last read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMeta {
    pub actor: ActorId,
    pub now: WallTimeNs,
    pub expected_version: Option<u64>,
}

impl CommandMeta {
    pub fn new(actor: ActorId, now: WallTimeNs) -> Self {
        Self {
            actor,
            now,
            expected_version: None,
        }
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyParams {
    pub expected_date: Option<NaiveDate>,
    pub expected_window: Option<VisitWindow>,
    pub notes: Option<String>,
}

impl VerifyParams {
    pub fn on(date: NaiveDate) -> Self {
        Self {
            expected_date: Some(date),
            ..Self::default()
        }
    }

    pub fn within(mut self, window: VisitWindow) -> Self {
        self.expected_window = Some(window);
        self
    }
}

/// Coordinator-side lifecycle commands. Every command validates and checks its source status
/// before touching the store, so a refused command leaves the record as it was.
#[derive(Clone)]
pub struct VerificationRuntime {
    gate: PermitGate,
    notifier: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for VerificationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationRuntime").finish_non_exhaustive()
    }
}

impl Default for VerificationRuntime {
    fn default() -> Self {
        Self::new(Arc::new(TracingNotificationSink))
    }
}

impl VerificationRuntime {
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            gate: PermitGate,
            notifier,
        }
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.notifier
    }

    pub fn ingest(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        input: SiteVisitIngest,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        let record = SiteVisitRecord::from_ingest(input)?;
        store.insert_record(record.clone())?;
        self.audit_transition(
            store,
            meta,
            Some(&record.record_id),
            AuditAction::Ingested,
            None,
            Some(VisitStatus::Assigned),
            reason_codes::SV_OK_INGEST,
            None,
        )?;
        tracing::debug!(record_id = record.record_id.as_str(), "site visit ingested");
        Ok(record)
    }

    pub fn gate_outcome(
        &self,
        store: &SiteVisitStore,
        record_id: &RecordId,
    ) -> Result<PermitGateOutcome, WorkflowError> {
        let record = load(store, record_id)?;
        Ok(self.gate.evaluate(record, &*store))
    }

    pub fn pending_demand(&self, store: &SiteVisitStore) -> PermitDemand {
        self.gate.pending_demand(store.records(), &*store)
    }

    /// ASSIGNED -> PERMITS_ATTACHED once the gate is clear. Repeating the command on a record
    /// that already has permits attached is a no-op.
    pub fn attach_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        meta.actor.validate()?;
        let record = load(store, record_id)?;
        match record.status {
            VisitStatus::PermitsAttached => return Ok(record.clone()),
            VisitStatus::Assigned => {}
            from => return Err(invalid_transition(record_id, "attach_permit", from)),
        }
        let gate = self.gate.evaluate(record, &*store);
        if gate != PermitGateOutcome::Clear {
            return Err(WorkflowError::PermitRequired {
                record_id: record_id.as_str().to_string(),
                gate,
            });
        }

        let mut next = record.clone();
        next.status = VisitStatus::PermitsAttached;
        next.permits_attached = Some(ActionStamp {
            actor: meta.actor.clone(),
            at: meta.now,
            notes: None,
        });
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::PermitsAttached,
            VisitStatus::Assigned,
            reason_codes::SV_OK_ATTACH_PERMIT,
            None,
        )?;
        self.notifier
            .notify(Notification::info(Some(record_id), "permits attached"));
        Ok(saved)
    }

    /// PERMITS_ATTACHED or REJECTED -> VERIFIED. A rejected record re-enters here without
    /// re-running the permit gate.
    pub fn verify(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
        params: &VerifyParams,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        meta.actor.validate()?;
        let record = load(store, record_id)?;
        let from = record.status;
        if !matches!(from, VisitStatus::PermitsAttached | VisitStatus::Rejected) {
            return Err(invalid_transition(record_id, "verify", from));
        }
        let date = params.expected_date.ok_or(ContractViolation::InvalidValue {
            field: "verify.expected_date",
            reason: "an expected visit date is required",
        })?;
        if let Some(w) = &params.expected_window {
            w.validate()?;
            if !w.contains(date) {
                return Err(WorkflowError::Validation(ContractViolation::InvalidValue {
                    field: "verify.expected_date",
                    reason: "must fall inside the expected visit window",
                }));
            }
        } else if record.requires_visit_window() {
            return Err(WorkflowError::Validation(ContractViolation::InvalidValue {
                field: "verify.expected_window",
                reason: "distribution activities require an expected visit window",
            }));
        }
        validate_optional_text("verify.notes", params.notes.as_deref(), NOTES_MAX_LEN)?;

        let mut next = record.clone();
        next.status = VisitStatus::Verified;
        next.visit_date = Some(date);
        next.verification = Some(ActionStamp {
            actor: meta.actor.clone(),
            at: meta.now,
            notes: params.notes.clone(),
        });
        next.extensions.expected_window = params.expected_window;
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::Verified,
            from,
            reason_codes::SV_OK_VERIFY,
            Some(format!("visit_date={date}")),
        )?;
        self.notifier.notify(Notification::info(
            Some(record_id),
            format!("visit verified for {date}"),
        ));
        Ok(saved)
    }

    pub fn reject(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
        reason: &str,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        meta.actor.validate()?;
        let record = load(store, record_id)?;
        let from = record.status;
        if !matches!(
            from,
            VisitStatus::Assigned | VisitStatus::PermitsAttached | VisitStatus::Verified
        ) {
            return Err(invalid_transition(record_id, "reject", from));
        }
        validate_text("reject.reason", reason, REJECTION_REASON_MAX_LEN)?;

        let mut next = record.clone();
        next.status = VisitStatus::Rejected;
        next.rejection = Some(RejectionStamp {
            actor: meta.actor.clone(),
            at: meta.now,
            reason: reason.trim().to_string(),
        });
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::Rejected,
            from,
            reason_codes::SV_OK_REJECT,
            Some(truncate_detail(reason)),
        )?;
        self.notifier.notify(Notification::warning(
            Some(record_id),
            format!("visit rejected: {}", reason.trim()),
        ));
        Ok(saved)
    }

    pub fn approve(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
        notes: Option<&str>,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        meta.actor.validate()?;
        let record = load(store, record_id)?;
        if record.status != VisitStatus::Verified {
            return Err(invalid_transition(record_id, "approve", record.status));
        }
        validate_optional_text("approve.notes", notes, NOTES_MAX_LEN)?;

        let mut next = record.clone();
        next.status = VisitStatus::Approved;
        next.approval = Some(ActionStamp {
            actor: meta.actor.clone(),
            at: meta.now,
            notes: notes.map(str::to_string),
        });
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::Approved,
            VisitStatus::Verified,
            reason_codes::SV_OK_APPROVE,
            None,
        )?;
        self.notifier
            .notify(Notification::info(Some(record_id), "visit approved"));
        Ok(saved)
    }

    /// APPROVED -> COMPLETED. Only reachable through a visit session that has passed the
    /// completion gate.
    pub(crate) fn complete(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
        stamp: CompletionStamp,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        let record = load(store, record_id)?;
        if record.status != VisitStatus::Approved {
            return Err(invalid_transition(record_id, "complete", record.status));
        }
        stamp.validate()?;
        let detail = format!(
            "photos={} distance_m={:.1}",
            stamp.photo_count, stamp.distance_m
        );

        let mut next = record.clone();
        next.status = VisitStatus::Completed;
        next.completion = Some(stamp);
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::Completed,
            VisitStatus::Approved,
            reason_codes::SV_OK_COMPLETE,
            Some(detail),
        )?;
        self.notifier
            .notify(Notification::info(Some(record_id), "visit completed"));
        Ok(saved)
    }

    /// Marks an ASSIGNED record as cleared to proceed without a locality permit. The state
    /// permit requirement still applies.
    pub fn proceed_without_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: &RecordId,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        meta.actor.validate()?;
        let record = load(store, record_id)?;
        if record.status != VisitStatus::Assigned {
            return Err(invalid_transition(
                record_id,
                "proceed_without_permit",
                record.status,
            ));
        }
        if record.has_locality_override() {
            return Ok(record.clone());
        }

        let mut next = record.clone();
        next.extensions.locality_override = Some(LocalityOverride {
            applied_by: meta.actor.clone(),
            applied_at: meta.now,
        });
        let saved = self.commit(
            store,
            meta,
            next,
            AuditAction::LocalityOverrideApplied,
            VisitStatus::Assigned,
            reason_codes::SV_OK_LOCALITY_OVERRIDE,
            None,
        )?;
        tracing::info!(
            record_id = record_id.as_str(),
            actor = meta.actor.as_str(),
            "locality permit requirement overridden"
        );
        Ok(saved)
    }

    pub fn upload_state_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        state: &str,
    ) -> Result<StatePermit, WorkflowError> {
        let permit = StatePermit::v1(state.trim().to_string(), meta.now, meta.actor.clone(), false)?;
        store.append_state_permit(permit.clone())?;
        self.audit_transition(
            store,
            meta,
            None,
            AuditAction::StatePermitUploaded,
            None,
            None,
            reason_codes::SV_OK_STATE_PERMIT_UPLOAD,
            Some(truncate_detail(&format!("state={}", permit.state))),
        )?;
        tracing::info!(state = permit.state.as_str(), "state permit uploaded");
        Ok(permit)
    }

    /// Appends a verified entry for `state`; earlier unverified entries stay in the ledger.
    pub fn verify_state_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        state: &str,
    ) -> Result<StatePermit, WorkflowError> {
        let uploaded = store
            .state_permits()
            .iter()
            .any(|p| same_place(&p.state, state));
        if !uploaded {
            return Err(WorkflowError::Store(StorageError::NotFound {
                table: "state_permits.state",
                key: state.trim().to_string(),
            }));
        }
        let permit = StatePermit::v1(state.trim().to_string(), meta.now, meta.actor.clone(), true)?;
        store.append_state_permit(permit.clone())?;
        self.audit_transition(
            store,
            meta,
            None,
            AuditAction::StatePermitVerified,
            None,
            None,
            reason_codes::SV_OK_STATE_PERMIT_VERIFY,
            Some(truncate_detail(&format!("state={}", permit.state))),
        )?;
        self.notifier.notify(Notification::info(
            None,
            format!("state permit verified for {}", permit.state),
        ));
        Ok(permit)
    }

    pub fn upload_locality_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        state: &str,
        locality: &str,
    ) -> Result<LocalityPermit, WorkflowError> {
        let permit = LocalityPermit::v1(
            state.trim().to_string(),
            locality.trim().to_string(),
            meta.now,
            meta.actor.clone(),
        )?;
        store.append_locality_permit(permit.clone())?;
        self.audit_transition(
            store,
            meta,
            None,
            AuditAction::LocalityPermitUploaded,
            None,
            None,
            reason_codes::SV_OK_LOCALITY_PERMIT_UPLOAD,
            Some(truncate_detail(&format!(
                "state={} locality={}",
                permit.state, permit.locality
            ))),
        )?;
        tracing::info!(
            state = permit.state.as_str(),
            locality = permit.locality.as_str(),
            "locality permit uploaded"
        );
        Ok(permit)
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        next: SiteVisitRecord,
        action: AuditAction,
        from: VisitStatus,
        reason_code: ReasonCodeId,
        detail: Option<String>,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        let to = next.status;
        // Audit row is built first; a record write never lands without one.
        let ev = AuditEventInput::v1(
            Some(next.record_id.clone()),
            action,
            Some(from),
            Some(to),
            meta.actor.clone(),
            meta.now,
            reason_code,
            detail,
        )?;
        let saved = store.put_record(next, meta.expected_version, meta.now)?;
        AuditWriter::emit(store, ev)?;
        tracing::info!(
            record_id = saved.record_id.as_str(),
            from = from.as_str(),
            to = to.as_str(),
            version = saved.version,
            actor = meta.actor.as_str(),
            "site visit transition"
        );
        Ok(saved)
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_transition(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        record_id: Option<&RecordId>,
        action: AuditAction,
        from: Option<VisitStatus>,
        to: Option<VisitStatus>,
        reason_code: ReasonCodeId,
        detail: Option<String>,
    ) -> Result<(), StorageError> {
        let ev = AuditEventInput::v1(
            record_id.cloned(),
            action,
            from,
            to,
            meta.actor.clone(),
            meta.now,
            reason_code,
            detail,
        )
        .map_err(StorageError::ContractViolation)?;
        AuditWriter::emit(store, ev)?;
        Ok(())
    }
}

fn load<'s>(
    store: &'s SiteVisitStore,
    record_id: &RecordId,
) -> Result<&'s SiteVisitRecord, WorkflowError> {
    store.record(record_id).ok_or_else(|| {
        WorkflowError::Store(StorageError::NotFound {
            table: "site_visits.record_id",
            key: record_id.as_str().to_string(),
        })
    })
}

fn invalid_transition(record_id: &RecordId, command: &'static str, from: VisitStatus) -> WorkflowError {
    WorkflowError::InvalidTransition {
        record_id: record_id.as_str().to_string(),
        command,
        from,
    }
}

/// Cuts `s` to at most `AUDIT_DETAIL_MAX_LEN` bytes on a char boundary.
fn truncate_detail(s: &str) -> String {
    let s = s.trim();
    let end = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|end| *end <= AUDIT_DETAIL_MAX_LEN)
        .last()
        .unwrap_or(0);
    s[..end].to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sitevisit_kernel_contracts::geo::GeoPoint;

    pub(crate) fn t(ms: u64) -> WallTimeNs {
        WallTimeNs::from_ms(ms)
    }

    pub(crate) fn coordinator() -> ActorId {
        ActorId::new("coord_1").unwrap()
    }

    pub(crate) fn meta(ms: u64) -> CommandMeta {
        CommandMeta::new(coordinator(), t(ms))
    }

    pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn ingest(
        id: &str,
        state: &str,
        locality: &str,
        activity: &str,
        assigned_ms: u64,
    ) -> SiteVisitIngest {
        SiteVisitIngest {
            record_id: RecordId::new(id).unwrap(),
            site_code: format!("SC-{id}"),
            site_name: format!("Site {id}"),
            state: state.to_string(),
            locality: locality.to_string(),
            hub_office: "El Fasher Hub".to_string(),
            activity: activity.to_string(),
            main_activity: None,
            site_coordinates: Some(GeoPoint::new(13.63, 25.35).unwrap()),
            assigned_to: Some(ActorId::new("collector_1").unwrap()),
            assigned_at: t(assigned_ms),
        }
    }

    fn seeded() -> (SiteVisitStore, VerificationRuntime, RecordId) {
        let mut store = SiteVisitStore::new_in_memory();
        let rt = VerificationRuntime::default();
        let rec = rt
            .ingest(
                &mut store,
                &meta(1),
                ingest("r1", "North Darfur", "Kutum", "Market monitoring", 1),
            )
            .unwrap();
        (store, rt, rec.record_id)
    }

    fn clear_permits(store: &mut SiteVisitStore, rt: &VerificationRuntime) {
        rt.upload_state_permit(store, &meta(2), "North Darfur").unwrap();
        rt.verify_state_permit(store, &meta(3), "North Darfur").unwrap();
        rt.upload_locality_permit(store, &meta(4), "North Darfur", "Kutum")
            .unwrap();
    }

    #[test]
    fn attach_permit_is_blocked_until_both_permits_exist() {
        let (mut store, rt, id) = seeded();
        let err = rt.attach_permit(&mut store, &meta(10), &id).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::PermitRequired {
                gate: PermitGateOutcome::StatePermitRequired,
                ..
            }
        ));

        rt.upload_state_permit(&mut store, &meta(11), "North Darfur").unwrap();
        rt.verify_state_permit(&mut store, &meta(12), "north darfur").unwrap();
        let err = rt.attach_permit(&mut store, &meta(13), &id).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::PermitRequired {
                gate: PermitGateOutcome::LocalPermitRequired,
                ..
            }
        ));
        assert_eq!(store.record(&id).unwrap().status, VisitStatus::Assigned);

        rt.upload_locality_permit(&mut store, &meta(14), "North Darfur", "Kutum")
            .unwrap();
        let rec = rt.attach_permit(&mut store, &meta(15), &id).unwrap();
        assert_eq!(rec.status, VisitStatus::PermitsAttached);
    }

    #[test]
    fn attach_permit_twice_is_a_noop() {
        let (mut store, rt, id) = seeded();
        clear_permits(&mut store, &rt);
        let first = rt.attach_permit(&mut store, &meta(10), &id).unwrap();
        let audit_len = store.audit_events().len();
        let second = rt.attach_permit(&mut store, &meta(11), &id).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.audit_events().len(), audit_len);
    }

    #[test]
    fn override_clears_locality_but_not_state_requirement() {
        let (mut store, rt, id) = seeded();
        rt.proceed_without_permit(&mut store, &meta(5), &id).unwrap();
        assert_eq!(
            rt.gate_outcome(&store, &id).unwrap(),
            PermitGateOutcome::StatePermitRequired
        );
        rt.upload_state_permit(&mut store, &meta(6), "North Darfur").unwrap();
        rt.verify_state_permit(&mut store, &meta(7), "North Darfur").unwrap();
        assert_eq!(
            rt.gate_outcome(&store, &id).unwrap(),
            PermitGateOutcome::Clear
        );
    }

    #[test]
    fn verify_state_permit_requires_an_upload() {
        let (mut store, rt, _) = seeded();
        let err = rt
            .verify_state_permit(&mut store, &meta(2), "Blue Nile")
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Store(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn locality_upload_refused_before_state_permit_verified() {
        let (mut store, rt, _) = seeded();
        rt.upload_state_permit(&mut store, &meta(2), "North Darfur").unwrap();
        let err = rt
            .upload_locality_permit(&mut store, &meta(3), "North Darfur", "Kutum")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert!(store.locality_permits().is_empty());
    }

    #[test]
    fn verify_requires_date_and_sets_visit_date() {
        let (mut store, rt, id) = seeded();
        clear_permits(&mut store, &rt);
        rt.attach_permit(&mut store, &meta(10), &id).unwrap();

        let err = rt
            .verify(&mut store, &meta(11), &id, &VerifyParams::default())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(store.record(&id).unwrap().visit_date, None);

        let rec = rt
            .verify(&mut store, &meta(12), &id, &VerifyParams::on(date(2025, 3, 9)))
            .unwrap();
        assert_eq!(rec.status, VisitStatus::Verified);
        assert_eq!(rec.visit_date, Some(date(2025, 3, 9)));
    }

    #[test]
    fn distribution_activity_needs_window_containing_date() {
        let mut store = SiteVisitStore::new_in_memory();
        let rt = VerificationRuntime::default();
        clear_permits(&mut store, &rt);
        let id = rt
            .ingest(
                &mut store,
                &meta(5),
                ingest("d1", "North Darfur", "Kutum", "Cash distribution", 5),
            )
            .unwrap()
            .record_id;
        rt.attach_permit(&mut store, &meta(6), &id).unwrap();

        let before = store.record(&id).unwrap().clone();
        let err = rt
            .verify(&mut store, &meta(7), &id, &VerifyParams::on(date(2025, 3, 9)))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        let window = VisitWindow::v1(date(2025, 3, 1), date(2025, 3, 5)).unwrap();
        let err = rt
            .verify(
                &mut store,
                &meta(8),
                &id,
                &VerifyParams::on(date(2025, 3, 9)).within(window),
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(store.record(&id).unwrap(), &before);

        let rec = rt
            .verify(
                &mut store,
                &meta(9),
                &id,
                &VerifyParams::on(date(2025, 3, 5)).within(window),
            )
            .unwrap();
        assert_eq!(rec.extensions.expected_window, Some(window));
    }

    #[test]
    fn illegal_transitions_leave_record_untouched() {
        let (mut store, rt, id) = seeded();
        let before = store.record(&id).unwrap().clone();
        assert!(matches!(
            rt.approve(&mut store, &meta(5), &id, None),
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            rt.verify(&mut store, &meta(5), &id, &VerifyParams::on(date(2025, 1, 1))),
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert_eq!(store.record(&id).unwrap(), &before);
    }

    #[test]
    fn reject_requires_reason_and_reverify_skips_gate() {
        let (mut store, rt, id) = seeded();
        assert!(matches!(
            rt.reject(&mut store, &meta(5), &id, "   "),
            Err(WorkflowError::Validation(_))
        ));
        let rec = rt
            .reject(&mut store, &meta(6), &id, "wrong locality")
            .unwrap();
        assert_eq!(rec.status, VisitStatus::Rejected);
        assert_eq!(rec.rejection.as_ref().unwrap().reason, "wrong locality");

        // No permits exist, yet re-verification from REJECTED succeeds.
        let rec = rt
            .verify(&mut store, &meta(7), &id, &VerifyParams::on(date(2025, 4, 1)))
            .unwrap();
        assert_eq!(rec.status, VisitStatus::Verified);
    }

    #[test]
    fn long_multibyte_reason_is_audited_within_byte_limit() {
        let (mut store, rt, id) = seeded();
        let reason = "موقع".repeat(75);
        assert!(reason.len() > AUDIT_DETAIL_MAX_LEN);

        let rec = rt.reject(&mut store, &meta(5), &id, &reason).unwrap();
        assert_eq!(rec.status, VisitStatus::Rejected);
        assert_eq!(rec.rejection.as_ref().unwrap().reason, reason);

        let events = store.audit_events_for_record(&id);
        let last = events.last().unwrap();
        assert_eq!(last.action, AuditAction::Rejected);
        let detail = last.detail.as_deref().unwrap();
        assert!(detail.len() <= AUDIT_DETAIL_MAX_LEN);
        assert!(reason.starts_with(detail));
        assert!(!detail.is_empty());
    }

    #[test]
    fn truncate_detail_cuts_on_char_boundary() {
        let s = "é".repeat(AUDIT_DETAIL_MAX_LEN);
        let cut = truncate_detail(&s);
        assert_eq!(cut.len(), AUDIT_DETAIL_MAX_LEN);
        assert_eq!(truncate_detail("  short  "), "short");
        let odd = format!("a{}", "é".repeat(AUDIT_DETAIL_MAX_LEN));
        assert_eq!(truncate_detail(&odd).len(), AUDIT_DETAIL_MAX_LEN - 1);
    }

    #[test]
    fn verify_twice_is_an_invalid_transition() {
        let (mut store, rt, id) = seeded();
        clear_permits(&mut store, &rt);
        rt.attach_permit(&mut store, &meta(10), &id).unwrap();
        rt.verify(&mut store, &meta(11), &id, &VerifyParams::on(date(2025, 3, 9)))
            .unwrap();
        let before = store.record(&id).unwrap().clone();
        let err = rt
            .verify(&mut store, &meta(12), &id, &VerifyParams::on(date(2025, 3, 10)))
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidTransition {
                from: VisitStatus::Verified,
                ..
            }
        ));
        assert_eq!(store.record(&id).unwrap(), &before);
    }

    #[test]
    fn stale_expected_version_is_refused() {
        let (mut store, rt, id) = seeded();
        clear_permits(&mut store, &rt);
        let read_version = store.record(&id).unwrap().version;
        rt.proceed_without_permit(&mut store, &meta(9), &id).unwrap();
        let err = rt
            .attach_permit(&mut store, &meta(10).expecting_version(read_version), &id)
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Store(StorageError::VersionConflict { .. })
        ));
    }

    #[test]
    fn every_transition_is_audited() {
        let (mut store, rt, id) = seeded();
        clear_permits(&mut store, &rt);
        rt.attach_permit(&mut store, &meta(10), &id).unwrap();
        rt.verify(&mut store, &meta(11), &id, &VerifyParams::on(date(2025, 3, 9)))
            .unwrap();
        rt.approve(&mut store, &meta(12), &id, Some("ok")).unwrap();
        let actions: Vec<AuditAction> = store
            .audit_events_for_record(&id)
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Ingested,
                AuditAction::PermitsAttached,
                AuditAction::Verified,
                AuditAction::Approved
            ]
        );
    }
}
