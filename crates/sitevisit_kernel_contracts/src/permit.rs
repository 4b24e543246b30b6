#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{place_key, validate_text};
use crate::site_visit::ActorId;
use crate::{ContractViolation, SchemaVersion, Validate, WallTimeNs};

pub const PERMIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// State-level permit entry. Entries are appended, never edited; verification appends a new
/// entry with `verified = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePermit {
    pub schema_version: SchemaVersion,
    pub state: String,
    pub uploaded_at: WallTimeNs,
    pub uploaded_by: ActorId,
    pub verified: bool,
}

impl StatePermit {
    pub fn v1(
        state: String,
        uploaded_at: WallTimeNs,
        uploaded_by: ActorId,
        verified: bool,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            schema_version: PERMIT_CONTRACT_VERSION,
            state,
            uploaded_at,
            uploaded_by,
            verified,
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for StatePermit {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PERMIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "state_permit.schema_version",
                reason: "must match PERMIT_CONTRACT_VERSION",
            });
        }
        validate_text("state_permit.state", &self.state, 128)?;
        self.uploaded_by.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityPermit {
    pub schema_version: SchemaVersion,
    pub state: String,
    pub locality: String,
    pub uploaded_at: WallTimeNs,
    pub uploaded_by: ActorId,
}

impl LocalityPermit {
    pub fn v1(
        state: String,
        locality: String,
        uploaded_at: WallTimeNs,
        uploaded_by: ActorId,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            schema_version: PERMIT_CONTRACT_VERSION,
            state,
            locality,
            uploaded_at,
            uploaded_by,
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for LocalityPermit {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PERMIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "locality_permit.schema_version",
                reason: "must match PERMIT_CONTRACT_VERSION",
            });
        }
        validate_text("locality_permit.state", &self.state, 128)?;
        validate_text("locality_permit.locality", &self.locality, 128)?;
        self.uploaded_by.validate()?;
        Ok(())
    }
}

/// Read-only permit facts the gate classifies against.
pub trait PermitFacts {
    fn state_permit_verified(&self, state: &str) -> bool;
    fn locality_permit_present(&self, state: &str, locality: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermitGateOutcome {
    StatePermitRequired,
    LocalPermitRequired,
    Clear,
}

impl PermitGateOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PermitGateOutcome::StatePermitRequired => "STATE_PERMIT_REQUIRED",
            PermitGateOutcome::LocalPermitRequired => "LOCAL_PERMIT_REQUIRED",
            PermitGateOutcome::Clear => "CLEAR",
        }
    }
}

/// Case-insensitive `(state, locality)` key; stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalityKey {
    pub state: String,
    pub locality: String,
}

impl LocalityKey {
    pub fn new(state: &str, locality: &str) -> Self {
        Self {
            state: place_key(state),
            locality: place_key(locality),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePermitDemand {
    pub state: String,
    pub pending_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalityPermitDemand {
    pub state: String,
    pub locality: String,
    pub pending_count: u32,
}

/// Outstanding permit work, counted over ASSIGNED records only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitDemand {
    pub states: Vec<StatePermitDemand>,
    pub localities: Vec<LocalityPermitDemand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_key_folds_case_and_whitespace() {
        assert_eq!(
            LocalityKey::new(" North Darfur", "KUTUM "),
            LocalityKey::new("north darfur", "Kutum")
        );
    }

    #[test]
    fn state_permit_requires_state_name() {
        let actor = ActorId::new("coord_1").unwrap();
        assert!(StatePermit::v1("".to_string(), WallTimeNs(1), actor.clone(), false).is_err());
        assert!(StatePermit::v1("North Darfur".to_string(), WallTimeNs(1), actor, true).is_ok());
    }
}
