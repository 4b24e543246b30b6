#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

/// Wall-clock instant, nanoseconds since the Unix epoch.
///
/// Session origins are persisted in this unit so elapsed time stays correct across restarts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WallTimeNs(pub u64);

impl WallTimeNs {
    pub fn from_ms(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    pub fn saturating_since(self, earlier: WallTimeNs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms.saturating_mul(1_000_000)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field}: {got} outside [{min}, {max}]")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
    #[error("{field}: must be finite")]
    NotFinite { field: &'static str },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

/// Canonical form of a state, locality or hub name, used for every place comparison and key.
pub fn place_key(s: &str) -> String {
    s.trim().to_lowercase()
}

pub fn same_place(a: &str, b: &str) -> bool {
    place_key(a) == place_key(b)
}

pub fn validate_id(field: &'static str, s: &str, max_len: usize) -> Result<(), ContractViolation> {
    if s.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if s.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        });
    }
    if !s.is_ascii() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be ASCII",
        });
    }
    Ok(())
}

pub fn validate_text(field: &'static str, s: &str, max_len: usize) -> Result<(), ContractViolation> {
    if s.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if s.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        });
    }
    Ok(())
}

pub fn validate_optional_text(
    field: &'static str,
    s: Option<&str>,
    max_len: usize,
) -> Result<(), ContractViolation> {
    match s {
        Some(v) if v.len() > max_len => Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        }),
        _ => Ok(()),
    }
}

pub fn validate_finite_range(
    field: &'static str,
    v: f64,
    min: f64,
    max: f64,
) -> Result<(), ContractViolation> {
    if !v.is_finite() {
        return Err(ContractViolation::NotFinite { field });
    }
    if v < min || v > max {
        return Err(ContractViolation::InvalidRange {
            field,
            min,
            max,
            got: v,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_must_be_ascii_and_bounded() {
        assert!(validate_id("id", "sv_001", 8).is_ok());
        assert!(validate_id("id", "   ", 8).is_err());
        assert!(validate_id("id", "sv_000000001", 8).is_err());
        assert!(validate_id("id", "كتم", 32).is_err());
    }

    #[test]
    fn text_allows_unicode_but_not_blank() {
        assert!(validate_text("locality", "كتم", 64).is_ok());
        assert!(validate_text("locality", "", 64).is_err());
    }

    #[test]
    fn place_names_compare_trimmed_and_caseless() {
        assert!(same_place(" North Darfur ", "north darfur"));
        assert!(same_place("ÉL GENEINA", "él geneina"));
        assert!(!same_place("Kutum", "Kutum Rural"));
        assert_eq!(place_key("  KUTUM"), "kutum");
    }

    #[test]
    fn finite_range_rejects_nan() {
        assert_eq!(
            validate_finite_range("lat", f64::NAN, -90.0, 90.0),
            Err(ContractViolation::NotFinite { field: "lat" })
        );
        assert!(validate_finite_range("lat", 90.5, -90.0, 90.0).is_err());
        assert!(validate_finite_range("lat", -90.0, -90.0, 90.0).is_ok());
    }

    #[test]
    fn wall_time_since_saturates() {
        let a = WallTimeNs::from_ms(5);
        let b = a.plus_ms(3);
        assert_eq!(b.saturating_since(a), 3_000_000);
        assert_eq!(a.saturating_since(b), 0);
    }
}
