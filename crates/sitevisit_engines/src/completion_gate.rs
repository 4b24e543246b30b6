#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::geo::GeoPoint;
use sitevisit_kernel_contracts::visit_session::{
    CompletionBlocked, CompletionReadiness, COMPLETION_RADIUS_M,
};

use crate::geo_math::haversine_m;

/// Evidence is checked before distance, so a session with no photos reports `NoEvidence` no
/// matter where the collector stands. Missing coordinates fail closed.
pub fn evaluate(
    photo_count: u32,
    current: Option<GeoPoint>,
    target: Option<GeoPoint>,
) -> CompletionReadiness {
    let distance_m = match (current, target) {
        (Some(c), Some(t)) => Some(haversine_m(c, t)),
        _ => None,
    };
    evaluate_distance(photo_count, distance_m)
}

pub fn evaluate_distance(photo_count: u32, distance_m: Option<f64>) -> CompletionReadiness {
    let blocked = if photo_count == 0 {
        Some(CompletionBlocked::NoEvidence)
    } else {
        match distance_m {
            Some(d) if d.is_finite() && (0.0..=COMPLETION_RADIUS_M).contains(&d) => None,
            Some(d) if d.is_finite() => Some(CompletionBlocked::TooFar { distance_m: d }),
            _ => Some(CompletionBlocked::LocationUnavailable),
        }
    };
    CompletionReadiness {
        photo_count,
        distance_m,
        blocked,
    }
}
