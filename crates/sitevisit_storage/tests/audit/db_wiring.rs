#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::site_visit::{ActorId, RecordId, VisitStatus};
use sitevisit_kernel_contracts::{ReasonCodeId, WallTimeNs};
use sitevisit_storage::audit::{AuditAction, AuditEventInput, AuditWriter, AUDIT_DETAIL_MAX_LEN};
use sitevisit_storage::store::SiteVisitStore;

fn transition(record: &str, from: VisitStatus, to: VisitStatus, at: u64) -> AuditEventInput {
    AuditEventInput::v1(
        Some(RecordId::new(record).unwrap()),
        AuditAction::Verified,
        Some(from),
        Some(to),
        ActorId::new("coord_1").unwrap(),
        WallTimeNs(at),
        ReasonCodeId(0x5356_0003),
        None,
    )
    .unwrap()
}

#[test]
fn at_audit_db_01_event_ids_are_monotonic_and_scoped_per_record() {
    let mut s = SiteVisitStore::new_in_memory();
    let a = AuditWriter::emit(
        &mut s,
        transition(
            "sv_1",
            VisitStatus::PermitsAttached,
            VisitStatus::Verified,
            10,
        ),
    )
    .unwrap();
    let b = AuditWriter::emit(
        &mut s,
        transition(
            "sv_2",
            VisitStatus::PermitsAttached,
            VisitStatus::Verified,
            11,
        ),
    )
    .unwrap();
    assert!(b > a);

    let rows = s.audit_events_for_record(&RecordId::new("sv_1").unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].to_status, Some(VisitStatus::Verified));
    assert_eq!(s.audit_events().len(), 2);
}

#[test]
fn at_audit_db_02_oversized_detail_is_never_appended() {
    let mut s = SiteVisitStore::new_in_memory();
    let input = AuditEventInput::v1(
        Some(RecordId::new("sv_1").unwrap()),
        AuditAction::Rejected,
        Some(VisitStatus::Verified),
        Some(VisitStatus::Rejected),
        ActorId::new("coord_1").unwrap(),
        WallTimeNs(10),
        ReasonCodeId(0x5356_0004),
        Some("x".repeat(AUDIT_DETAIL_MAX_LEN + 1)),
    );
    assert!(input.is_err());
    assert!(s.audit_events().is_empty());

    let at_limit = AuditEventInput::v1(
        Some(RecordId::new("sv_1").unwrap()),
        AuditAction::Rejected,
        Some(VisitStatus::Verified),
        Some(VisitStatus::Rejected),
        ActorId::new("coord_1").unwrap(),
        WallTimeNs(10),
        ReasonCodeId(0x5356_0004),
        Some("x".repeat(AUDIT_DETAIL_MAX_LEN)),
    )
    .unwrap();
    AuditWriter::emit(&mut s, at_limit).unwrap();
    assert_eq!(s.audit_events().len(), 1);
}

#[test]
fn at_audit_db_03_zero_reason_code_is_rejected() {
    let input = AuditEventInput::v1(
        None,
        AuditAction::StatePermitUploaded,
        None,
        None,
        ActorId::new("coord_1").unwrap(),
        WallTimeNs(1),
        ReasonCodeId(0),
        None,
    );
    assert!(input.is_err());
}
