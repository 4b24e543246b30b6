#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::geo::GeoPoint;
use sitevisit_kernel_contracts::site_visit::{
    ActionStamp, ActorId, RecordId, SiteVisitIngest, SiteVisitRecord, VisitStatus,
};
use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_storage::store::{RecordChangeKind, SiteVisitStore, StorageError};

fn ingest(id: &str, locality: &str) -> SiteVisitRecord {
    SiteVisitRecord::from_ingest(SiteVisitIngest {
        record_id: RecordId::new(id).unwrap(),
        site_code: format!("ND-{id}"),
        site_name: format!("Site {id}"),
        state: "North Darfur".to_string(),
        locality: locality.to_string(),
        hub_office: "El Fasher".to_string(),
        activity: "Site Assessment".to_string(),
        main_activity: None,
        site_coordinates: Some(GeoPoint::new(13.5, 25.35).unwrap()),
        assigned_to: Some(ActorId::new("collector_1").unwrap()),
        assigned_at: WallTimeNs(100),
    })
    .unwrap()
}

#[test]
fn at_site_visit_db_01_ingest_only_accepts_assigned_rows() {
    let mut s = SiteVisitStore::new_in_memory();
    s.insert_record(ingest("sv_1", "Kutum")).unwrap();

    let mut advanced = ingest("sv_2", "Kutum");
    advanced.status = VisitStatus::PermitsAttached;
    advanced.permits_attached = Some(ActionStamp {
        actor: ActorId::new("coord_1").unwrap(),
        at: WallTimeNs(101),
        notes: None,
    });
    assert!(matches!(
        s.insert_record(advanced),
        Err(StorageError::ContractViolation(_))
    ));
    assert_eq!(s.records().count(), 1);
}

#[test]
fn at_site_visit_db_02_invalid_row_is_never_written() {
    let mut s = SiteVisitStore::new_in_memory();
    s.insert_record(ingest("sv_1", "Kutum")).unwrap();
    let id = RecordId::new("sv_1").unwrap();

    let mut bad = s.record(&id).unwrap().clone();
    bad.visit_date = chrono::NaiveDate::from_ymd_opt(2026, 4, 1);
    assert!(s.put_record(bad, None, WallTimeNs(102)).is_err());

    let row = s.record(&id).unwrap();
    assert!(row.visit_date.is_none());
    assert_eq!(row.version, 0);
}

#[test]
fn at_site_visit_db_03_versions_increase_per_write_and_feed_records_updates() {
    let mut s = SiteVisitStore::new_in_memory();
    s.insert_record(ingest("sv_1", "Kutum")).unwrap();
    let id = RecordId::new("sv_1").unwrap();

    for expected in 0..3u64 {
        let row = s.record(&id).unwrap().clone();
        let written = s
            .put_record(row, Some(expected), WallTimeNs(200 + expected))
            .unwrap();
        assert_eq!(written.version, expected + 1);
    }

    let feed = s.changes_since(0);
    assert_eq!(feed.len(), 4);
    assert_eq!(feed[0].kind, RecordChangeKind::Inserted);
    assert!(feed[1..].iter().all(|e| e.kind == RecordChangeKind::Updated));
    assert!(feed.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn at_site_visit_db_04_unknown_record_update_is_not_found() {
    let mut s = SiteVisitStore::new_in_memory();
    let r = ingest("sv_missing", "Kutum");
    assert!(matches!(
        s.put_record(r, None, WallTimeNs(1)),
        Err(StorageError::NotFound { .. })
    ));
}
