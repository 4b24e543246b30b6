#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::permit::{LocalityPermit, PermitFacts, StatePermit};
use sitevisit_kernel_contracts::site_visit::ActorId;
use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_storage::store::{SiteVisitStore, StorageError};

fn coordinator() -> ActorId {
    ActorId::new("coord_1").unwrap()
}

#[test]
fn at_permit_db_01_locality_permit_needs_verified_state_permit() {
    let mut s = SiteVisitStore::new_in_memory();
    s.append_state_permit(
        StatePermit::v1("North Darfur".to_string(), WallTimeNs(1), coordinator(), false).unwrap(),
    )
    .unwrap();
    let locality = LocalityPermit::v1(
        "North Darfur".to_string(),
        "Kutum".to_string(),
        WallTimeNs(2),
        coordinator(),
    )
    .unwrap();
    assert!(matches!(
        s.append_locality_permit(locality),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(s.locality_permits().is_empty());
    assert_eq!(s.state_permits().len(), 1);
    assert!(!s.state_permits()[0].verified);
}

#[test]
fn at_permit_db_02_verification_is_a_new_entry() {
    let mut s = SiteVisitStore::new_in_memory();
    s.append_state_permit(
        StatePermit::v1("North Darfur".to_string(), WallTimeNs(1), coordinator(), false).unwrap(),
    )
    .unwrap();
    s.append_state_permit(
        StatePermit::v1("North Darfur".to_string(), WallTimeNs(2), coordinator(), true).unwrap(),
    )
    .unwrap();

    let rows = s.state_permits();
    assert_eq!(rows.len(), 2);
    assert!(!rows[0].verified);
    assert!(rows[1].verified);
    assert!(s.state_permit_verified("North Darfur"));
}

#[test]
fn at_permit_db_03_locality_permit_scoped_to_its_state() {
    let mut s = SiteVisitStore::new_in_memory();
    for state in ["North Darfur", "South Darfur"] {
        s.append_state_permit(
            StatePermit::v1(state.to_string(), WallTimeNs(1), coordinator(), true).unwrap(),
        )
        .unwrap();
    }
    s.append_locality_permit(
        LocalityPermit::v1(
            "North Darfur".to_string(),
            "Kutum".to_string(),
            WallTimeNs(2),
            coordinator(),
        )
        .unwrap(),
    )
    .unwrap();

    assert!(s.locality_permit_present("North Darfur", "Kutum"));
    assert!(!s.locality_permit_present("South Darfur", "Kutum"));
    assert_eq!(s.locality_permits().len(), 1);
}
