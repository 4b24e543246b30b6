#![forbid(unsafe_code)]

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::common::{same_place, validate_id, validate_optional_text, validate_text};
use crate::geo::GeoPoint;
use crate::{ContractViolation, SchemaVersion, Validate, WallTimeNs};

pub const SITE_VISIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const SITE_VISIT_EXTENSIONS_VERSION: SchemaVersion = SchemaVersion(1);

/// Activity names that need an expected visit window at verification, compared case-insensitively.
pub const DISTRIBUTION_ACTIVITY_NAMES: &[&str] = &[
    "distribution monitoring",
    "general food distribution",
    "gfd",
    "post distribution monitoring",
    "post-distribution monitoring",
    "pdm",
    "cash distribution",
];

pub fn is_distribution_activity(name: &str) -> bool {
    let needle = name.trim().to_ascii_lowercase();
    DISTRIBUTION_ACTIVITY_NAMES.iter().any(|n| *n == needle)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RecordId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("record_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ActorId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("actor_id", &self.0, 128)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VisitStatus {
    Assigned,
    PermitsAttached,
    Verified,
    Approved,
    Completed,
    Rejected,
}

impl VisitStatus {
    pub const ALL: [VisitStatus; 6] = [
        VisitStatus::Assigned,
        VisitStatus::PermitsAttached,
        VisitStatus::Verified,
        VisitStatus::Approved,
        VisitStatus::Completed,
        VisitStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VisitStatus::Assigned => "ASSIGNED",
            VisitStatus::PermitsAttached => "PERMITS_ATTACHED",
            VisitStatus::Verified => "VERIFIED",
            VisitStatus::Approved => "APPROVED",
            VisitStatus::Completed => "COMPLETED",
            VisitStatus::Rejected => "REJECTED",
        }
    }

    /// True for statuses in which the visit date must stay unset.
    pub fn precedes_verified(self) -> bool {
        matches!(self, VisitStatus::Assigned | VisitStatus::PermitsAttached)
    }
}

/// Inclusive expected-visit window at day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl VisitWindow {
    pub fn v1(start: NaiveDate, end: NaiveDate) -> Result<Self, ContractViolation> {
        let w = Self { start, end };
        w.validate()?;
        Ok(w)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl Validate for VisitWindow {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.end < self.start {
            return Err(ContractViolation::InvalidValue {
                field: "visit_window.end",
                reason: "must be >= start",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityOverride {
    pub applied_by: ActorId,
    pub applied_at: WallTimeNs,
}

/// Typed replacement for the free-form record metadata bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteVisitExtensions {
    pub schema_version: SchemaVersion,
    pub locality_override: Option<LocalityOverride>,
    pub expected_window: Option<VisitWindow>,
}

impl Default for SiteVisitExtensions {
    fn default() -> Self {
        Self {
            schema_version: SITE_VISIT_EXTENSIONS_VERSION,
            locality_override: None,
            expected_window: None,
        }
    }
}

impl Validate for SiteVisitExtensions {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SITE_VISIT_EXTENSIONS_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "site_visit_extensions.schema_version",
                reason: "must match SITE_VISIT_EXTENSIONS_VERSION",
            });
        }
        if let Some(o) = &self.locality_override {
            o.applied_by.validate()?;
        }
        if let Some(w) = &self.expected_window {
            w.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStamp {
    pub actor: ActorId,
    pub at: WallTimeNs,
    pub notes: Option<String>,
}

impl Validate for ActionStamp {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.actor.validate()?;
        validate_optional_text("action_stamp.notes", self.notes.as_deref(), 2048)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionStamp {
    pub actor: ActorId,
    pub at: WallTimeNs,
    pub reason: String,
}

impl Validate for RejectionStamp {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.actor.validate()?;
        validate_text("rejection_stamp.reason", &self.reason, 2048)
    }
}

/// Byte limit on collector notes carried into the completion stamp.
pub const COMPLETION_NOTES_MAX_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStamp {
    pub collector: ActorId,
    pub at: WallTimeNs,
    pub photo_count: u32,
    pub distance_m: f64,
    pub final_position: GeoPoint,
    pub notes: Option<String>,
}

impl Validate for CompletionStamp {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.collector.validate()?;
        self.final_position.validate()?;
        if self.photo_count == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "completion_stamp.photo_count",
                reason: "must be >= 1",
            });
        }
        if !self.distance_m.is_finite() || self.distance_m < 0.0 {
            return Err(ContractViolation::NotFinite {
                field: "completion_stamp.distance_m",
            });
        }
        validate_optional_text(
            "completion_stamp.notes",
            self.notes.as_deref(),
            COMPLETION_NOTES_MAX_LEN,
        )
    }
}

/// Fields supplied when a record is ingested; ingestion itself happens elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteVisitIngest {
    pub record_id: RecordId,
    pub site_code: String,
    pub site_name: String,
    pub state: String,
    pub locality: String,
    pub hub_office: String,
    pub activity: String,
    pub main_activity: Option<String>,
    pub site_coordinates: Option<GeoPoint>,
    pub assigned_to: Option<ActorId>,
    pub assigned_at: WallTimeNs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteVisitRecord {
    pub schema_version: SchemaVersion,
    pub record_id: RecordId,
    pub site_code: String,
    pub site_name: String,
    pub state: String,
    pub locality: String,
    pub hub_office: String,
    pub activity: String,
    pub main_activity: Option<String>,
    pub site_coordinates: Option<GeoPoint>,
    pub status: VisitStatus,
    pub assigned_at: WallTimeNs,
    pub assigned_to: Option<ActorId>,
    pub visit_date: Option<NaiveDate>,
    pub permits_attached: Option<ActionStamp>,
    pub verification: Option<ActionStamp>,
    pub approval: Option<ActionStamp>,
    pub rejection: Option<RejectionStamp>,
    pub completion: Option<CompletionStamp>,
    pub extensions: SiteVisitExtensions,
    /// Bumped on every store write; compared on conditional writes.
    pub version: u64,
}

impl SiteVisitRecord {
    pub fn from_ingest(input: SiteVisitIngest) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: SITE_VISIT_CONTRACT_VERSION,
            record_id: input.record_id,
            site_code: input.site_code,
            site_name: input.site_name,
            state: input.state,
            locality: input.locality,
            hub_office: input.hub_office,
            activity: input.activity,
            main_activity: input.main_activity,
            site_coordinates: input.site_coordinates,
            status: VisitStatus::Assigned,
            assigned_at: input.assigned_at,
            assigned_to: input.assigned_to,
            visit_date: None,
            permits_attached: None,
            verification: None,
            approval: None,
            rejection: None,
            completion: None,
            extensions: SiteVisitExtensions::default(),
            version: 0,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn requires_visit_window(&self) -> bool {
        is_distribution_activity(&self.activity)
            || self
                .main_activity
                .as_deref()
                .map(is_distribution_activity)
                .unwrap_or(false)
    }

    pub fn has_locality_override(&self) -> bool {
        self.extensions.locality_override.is_some()
    }

    pub fn matches_locality(&self, state: &str, locality: &str) -> bool {
        same_place(&self.state, state) && same_place(&self.locality, locality)
    }
}

impl Validate for SiteVisitRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SITE_VISIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "site_visit_record.schema_version",
                reason: "must match SITE_VISIT_CONTRACT_VERSION",
            });
        }
        self.record_id.validate()?;
        validate_text("site_visit_record.site_code", &self.site_code, 64)?;
        validate_text("site_visit_record.site_name", &self.site_name, 256)?;
        validate_text("site_visit_record.state", &self.state, 128)?;
        validate_text("site_visit_record.locality", &self.locality, 128)?;
        validate_text("site_visit_record.hub_office", &self.hub_office, 128)?;
        validate_text("site_visit_record.activity", &self.activity, 256)?;
        validate_optional_text(
            "site_visit_record.main_activity",
            self.main_activity.as_deref(),
            256,
        )?;
        if let Some(p) = &self.site_coordinates {
            p.validate()?;
        }
        if let Some(a) = &self.assigned_to {
            a.validate()?;
        }
        for stamp in [
            &self.permits_attached,
            &self.verification,
            &self.approval,
        ]
        .into_iter()
        .flatten()
        {
            stamp.validate()?;
        }
        if let Some(r) = &self.rejection {
            r.validate()?;
        }
        if let Some(c) = &self.completion {
            c.validate()?;
        }
        self.extensions.validate()?;

        if self.status.precedes_verified() && self.visit_date.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "site_visit_record.visit_date",
                reason: "must be unset before VERIFIED",
            });
        }
        match self.status {
            VisitStatus::Verified | VisitStatus::Approved | VisitStatus::Completed => {
                if self.visit_date.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "site_visit_record.visit_date",
                        reason: "must be set from VERIFIED onward",
                    });
                }
                if self.verification.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "site_visit_record.verification",
                        reason: "must be set from VERIFIED onward",
                    });
                }
            }
            VisitStatus::Rejected => {
                if self.rejection.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "site_visit_record.rejection",
                        reason: "must be set when REJECTED",
                    });
                }
            }
            VisitStatus::Assigned | VisitStatus::PermitsAttached => {}
        }
        if matches!(self.status, VisitStatus::Approved | VisitStatus::Completed)
            && self.approval.is_none()
        {
            return Err(ContractViolation::InvalidValue {
                field: "site_visit_record.approval",
                reason: "must be set from APPROVED onward",
            });
        }
        if (self.status == VisitStatus::Completed) != self.completion.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "site_visit_record.completion",
                reason: "must be set exactly when COMPLETED",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(activity: &str) -> SiteVisitIngest {
        SiteVisitIngest {
            record_id: RecordId::new("sv_1").unwrap(),
            site_code: "ND-KTM-001".to_string(),
            site_name: "Kutum Central".to_string(),
            state: "North Darfur".to_string(),
            locality: "Kutum".to_string(),
            hub_office: "El Fasher".to_string(),
            activity: activity.to_string(),
            main_activity: None,
            site_coordinates: Some(GeoPoint::new(13.5, 25.35).unwrap()),
            assigned_to: Some(ActorId::new("collector_1").unwrap()),
            assigned_at: WallTimeNs(1),
        }
    }

    #[test]
    fn locality_match_ignores_padding_and_case() {
        let r = SiteVisitRecord::from_ingest(ingest("Site Assessment")).unwrap();
        assert!(r.matches_locality(" north darfur ", "KUTUM"));
        assert!(!r.matches_locality("North Darfur", "Kutum Rural"));
    }

    #[test]
    fn ingested_record_starts_assigned_without_visit_date() {
        let r = SiteVisitRecord::from_ingest(ingest("Site Assessment")).unwrap();
        assert_eq!(r.status, VisitStatus::Assigned);
        assert!(r.visit_date.is_none());
        assert_eq!(r.version, 0);
    }

    #[test]
    fn visit_date_before_verified_is_a_violation() {
        let mut r = SiteVisitRecord::from_ingest(ingest("Site Assessment")).unwrap();
        r.visit_date = NaiveDate::from_ymd_opt(2026, 3, 1);
        assert!(matches!(
            r.validate(),
            Err(ContractViolation::InvalidValue {
                field: "site_visit_record.visit_date",
                ..
            })
        ));
    }

    #[test]
    fn distribution_activity_matching_is_case_insensitive() {
        assert!(is_distribution_activity("  GFD "));
        assert!(is_distribution_activity("Post Distribution Monitoring"));
        assert!(!is_distribution_activity("Market Monitoring"));

        let mut i = ingest("Market Monitoring");
        i.main_activity = Some("PDM".to_string());
        let r = SiteVisitRecord::from_ingest(i).unwrap();
        assert!(r.requires_visit_window());
    }

    #[test]
    fn visit_window_is_inclusive_at_both_ends() {
        let s = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let e = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let w = VisitWindow::v1(s, e).unwrap();
        assert!(w.contains(s));
        assert!(w.contains(e));
        assert!(!w.contains(NaiveDate::from_ymd_opt(2026, 3, 6).unwrap()));
        assert!(VisitWindow::v1(e, s).is_err());
    }

    #[test]
    fn record_round_trips_through_json() {
        let r = SiteVisitRecord::from_ingest(ingest("GFD")).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: SiteVisitRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
