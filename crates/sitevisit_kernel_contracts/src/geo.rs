#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_finite_range;
use crate::{ContractViolation, Validate, WallTimeNs};

/// WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Result<Self, ContractViolation> {
        let p = Self { lat, lon };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for GeoPoint {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_finite_range("geo_point.lat", self.lat, -90.0, 90.0)?;
        validate_finite_range("geo_point.lon", self.lon, -180.0, 180.0)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub point: GeoPoint,
    pub accuracy_m: f64,
    pub captured_at: WallTimeNs,
}

impl PositionFix {
    pub fn v1(
        point: GeoPoint,
        accuracy_m: f64,
        captured_at: WallTimeNs,
    ) -> Result<Self, ContractViolation> {
        let f = Self {
            point,
            accuracy_m,
            captured_at,
        };
        f.validate()?;
        Ok(f)
    }
}

impl Validate for PositionFix {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.point.validate()?;
        validate_finite_range("position_fix.accuracy_m", self.accuracy_m, 0.0, 1.0e7)?;
        if self.captured_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "position_fix.captured_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationPermission {
    Granted,
    Prompt,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeoWatchErrorKind {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoWatchOptions {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub max_age_ms: u64,
}

impl Validate for GeoWatchOptions {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.timeout_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "geo_watch_options.timeout_ms",
                reason: "must be bounded and > 0",
            });
        }
        Ok(())
    }
}
