#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use sitevisit_kernel_contracts::permit::{
    LocalityKey, LocalityPermitDemand, PermitDemand, PermitFacts, PermitGateOutcome,
    StatePermitDemand,
};
use sitevisit_kernel_contracts::common::place_key;
use sitevisit_kernel_contracts::site_visit::{SiteVisitRecord, VisitStatus};

#[derive(Debug, Default, Clone)]
pub struct PermitGate;

impl PermitGate {
    /// Classifies a pending record. Records already past ASSIGNED are `Clear`: the gate only
    /// blocks work that has not yet had permits attached.
    pub fn evaluate(&self, record: &SiteVisitRecord, facts: &dyn PermitFacts) -> PermitGateOutcome {
        if record.status != VisitStatus::Assigned {
            return PermitGateOutcome::Clear;
        }
        if !facts.state_permit_verified(&record.state) {
            return PermitGateOutcome::StatePermitRequired;
        }
        if !facts.locality_permit_present(&record.state, &record.locality)
            && !record.has_locality_override()
        {
            return PermitGateOutcome::LocalPermitRequired;
        }
        PermitGateOutcome::Clear
    }

    pub fn pending_demand<'a, I>(&self, records: I, facts: &dyn PermitFacts) -> PermitDemand
    where
        I: IntoIterator<Item = &'a SiteVisitRecord>,
    {
        let mut states: BTreeMap<String, StatePermitDemand> = BTreeMap::new();
        let mut localities: BTreeMap<LocalityKey, LocalityPermitDemand> = BTreeMap::new();

        for record in records {
            match self.evaluate(record, facts) {
                PermitGateOutcome::StatePermitRequired => {
                    let entry = states
                        .entry(place_key(&record.state))
                        .or_insert_with(|| StatePermitDemand {
                            state: record.state.clone(),
                            pending_count: 0,
                        });
                    entry.pending_count = entry.pending_count.saturating_add(1);
                }
                PermitGateOutcome::LocalPermitRequired => {
                    let entry = localities
                        .entry(LocalityKey::new(&record.state, &record.locality))
                        .or_insert_with(|| LocalityPermitDemand {
                            state: record.state.clone(),
                            locality: record.locality.clone(),
                            pending_count: 0,
                        });
                    entry.pending_count = entry.pending_count.saturating_add(1);
                }
                PermitGateOutcome::Clear => {}
            }
        }

        PermitDemand {
            states: states.into_values().collect(),
            localities: localities.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use sitevisit_kernel_contracts::site_visit::{
        ActorId, LocalityOverride, RecordId, SiteVisitIngest,
    };
    use sitevisit_kernel_contracts::WallTimeNs;

    #[derive(Default)]
    struct Facts {
        verified_states: BTreeSet<String>,
        localities: BTreeSet<LocalityKey>,
    }

    impl PermitFacts for Facts {
        fn state_permit_verified(&self, state: &str) -> bool {
            self.verified_states.contains(&place_key(state))
        }

        fn locality_permit_present(&self, state: &str, locality: &str) -> bool {
            self.localities.contains(&LocalityKey::new(state, locality))
        }
    }

    fn record(id: &str, state: &str, locality: &str) -> SiteVisitRecord {
        SiteVisitRecord::from_ingest(SiteVisitIngest {
            record_id: RecordId::new(id).unwrap(),
            site_code: format!("SC-{id}"),
            site_name: format!("Site {id}"),
            state: state.to_string(),
            locality: locality.to_string(),
            hub_office: "El Fasher".to_string(),
            activity: "Site Assessment".to_string(),
            main_activity: None,
            site_coordinates: None,
            assigned_to: None,
            assigned_at: WallTimeNs(1),
        })
        .unwrap()
    }

    #[test]
    fn gate_is_hierarchical_state_then_locality() {
        let gate = PermitGate;
        let r1 = record("r1", "North Darfur", "Kutum");
        let mut facts = Facts::default();
        assert_eq!(
            gate.evaluate(&r1, &facts),
            PermitGateOutcome::StatePermitRequired
        );

        facts.verified_states.insert("north darfur".to_string());
        assert_eq!(
            gate.evaluate(&r1, &facts),
            PermitGateOutcome::LocalPermitRequired
        );

        facts
            .localities
            .insert(LocalityKey::new("North Darfur", "Kutum"));
        assert_eq!(gate.evaluate(&r1, &facts), PermitGateOutcome::Clear);
    }

    #[test]
    fn locality_override_clears_only_its_own_records() {
        let gate = PermitGate;
        let mut facts = Facts::default();
        facts.verified_states.insert("north darfur".to_string());

        let mut kutum = record("r1", "North Darfur", "Kutum");
        kutum.extensions.locality_override = Some(LocalityOverride {
            applied_by: ActorId::new("coord_1").unwrap(),
            applied_at: WallTimeNs(5),
        });
        let tawila = record("r2", "North Darfur", "Tawila");

        assert_eq!(gate.evaluate(&kutum, &facts), PermitGateOutcome::Clear);
        assert_eq!(
            gate.evaluate(&tawila, &facts),
            PermitGateOutcome::LocalPermitRequired
        );
    }

    #[test]
    fn demand_excludes_localities_without_assigned_records() {
        let gate = PermitGate;
        let mut facts = Facts::default();
        facts.verified_states.insert("north darfur".to_string());

        let pending = record("r1", "North Darfur", "Kutum");
        let mut done = record("r2", "North Darfur", "Tawila");
        done.status = VisitStatus::Rejected;
        done.rejection = Some(sitevisit_kernel_contracts::site_visit::RejectionStamp {
            actor: ActorId::new("coord_1").unwrap(),
            at: WallTimeNs(2),
            reason: "duplicate".to_string(),
        });
        let unverified_state = record("r3", "South Darfur", "Nyala");

        let demand = gate.pending_demand([&pending, &done, &unverified_state], &facts);
        assert_eq!(demand.localities.len(), 1);
        assert_eq!(demand.localities[0].locality, "Kutum");
        assert_eq!(demand.localities[0].pending_count, 1);
        assert_eq!(demand.states.len(), 1);
        assert_eq!(demand.states[0].state, "South Darfur");
        assert_eq!(gate.evaluate(&done, &facts), PermitGateOutcome::Clear);
    }
}
