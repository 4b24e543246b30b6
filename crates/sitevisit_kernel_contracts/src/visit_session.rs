#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_optional_text;
use crate::geo::{GeoPoint, PositionFix};
use crate::site_visit::{ActorId, RecordId, COMPLETION_NOTES_MAX_LEN};
use crate::{ContractViolation, SchemaVersion, Validate, WallTimeNs};

pub const VISIT_SESSION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Closed interval upper bound for completion proximity, in meters.
pub const COMPLETION_RADIUS_M: f64 = 25.0;

/// Session notes end up in the completion stamp, so they share its limit.
pub const VISIT_SESSION_NOTES_MAX_LEN: usize = COMPLETION_NOTES_MAX_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Paused,
}

/// Persisted state of the one in-progress visit on this device.
///
/// Elapsed time is derived from `started_at` and the accumulated paused span, never stored as a
/// running counter, so a restored snapshot resumes with the correct value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveVisitSessionSnapshot {
    pub schema_version: SchemaVersion,
    pub record_id: RecordId,
    pub collector_id: ActorId,
    pub started_at: WallTimeNs,
    pub paused_at: Option<WallTimeNs>,
    pub paused_total_ns: u64,
    pub status: SessionStatus,
    pub current_fix: Option<PositionFix>,
    pub target: Option<GeoPoint>,
    pub gps_active: bool,
    pub permission_denied: bool,
    pub photo_count: u32,
    pub notes: String,
    pub displayed_elapsed_ms: u64,
}

impl ActiveVisitSessionSnapshot {
    pub fn v1(
        record_id: RecordId,
        collector_id: ActorId,
        started_at: WallTimeNs,
        target: Option<GeoPoint>,
    ) -> Result<Self, ContractViolation> {
        let s = Self {
            schema_version: VISIT_SESSION_CONTRACT_VERSION,
            record_id,
            collector_id,
            started_at,
            paused_at: None,
            paused_total_ns: 0,
            status: SessionStatus::Active,
            current_fix: None,
            target,
            gps_active: false,
            permission_denied: false,
            photo_count: 0,
            notes: String::new(),
            displayed_elapsed_ms: 0,
        };
        s.validate()?;
        Ok(s)
    }

    pub fn elapsed_ns(&self, now: WallTimeNs) -> u64 {
        let until = self.paused_at.unwrap_or(now);
        until
            .saturating_since(self.started_at)
            .saturating_sub(self.paused_total_ns)
    }

    pub fn elapsed_ms(&self, now: WallTimeNs) -> u64 {
        self.elapsed_ns(now) / 1_000_000
    }
}

impl Validate for ActiveVisitSessionSnapshot {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != VISIT_SESSION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "active_visit_session.schema_version",
                reason: "must match VISIT_SESSION_CONTRACT_VERSION",
            });
        }
        self.record_id.validate()?;
        self.collector_id.validate()?;
        if self.started_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "active_visit_session.started_at",
                reason: "must be > 0",
            });
        }
        if (self.status == SessionStatus::Paused) != self.paused_at.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "active_visit_session.paused_at",
                reason: "must be set exactly while PAUSED",
            });
        }
        if let Some(f) = &self.current_fix {
            f.validate()?;
        }
        if let Some(t) = &self.target {
            t.validate()?;
        }
        validate_optional_text(
            "active_visit_session.notes",
            Some(self.notes.as_str()),
            VISIT_SESSION_NOTES_MAX_LEN,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum CompletionBlocked {
    #[error("at least one photo is required before completing the visit")]
    NoEvidence,
    #[error("current or target location is unavailable")]
    LocationUnavailable,
    #[error("{distance_m:.1} m from the site; move within 25 m to complete")]
    TooFar { distance_m: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionReadiness {
    pub photo_count: u32,
    pub distance_m: Option<f64>,
    pub blocked: Option<CompletionBlocked>,
}

impl CompletionReadiness {
    pub fn is_ready(&self) -> bool {
        self.blocked.is_none()
    }
}
