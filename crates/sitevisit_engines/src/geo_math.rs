#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::geo::GeoPoint;

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 points, haversine formula.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lon - a.lon).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards asin against rounding just above 1.0 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

/// Point `meters` due north of `origin`. Used for building fixtures at known distances.
#[cfg(any(test, feature = "test-support"))]
pub fn offset_north(origin: GeoPoint, meters: f64) -> GeoPoint {
    GeoPoint {
        lat: origin.lat + (meters / EARTH_RADIUS_M).to_degrees(),
        lon: origin.lon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon).unwrap()
    }

    #[test]
    fn identical_points_are_zero_apart() {
        assert_eq!(haversine_m(p(13.5, 25.35), p(13.5, 25.35)), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = p(13.5, 25.35);
        let b = p(13.62, 24.91);
        assert!((haversine_m(a, b) - haversine_m(b, a)).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_m(p(0.0, 0.0), p(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn offset_north_round_trips_through_haversine() {
        let origin = p(13.5, 25.35);
        for meters in [0.5, 24.9, 25.0, 25.1, 250.0] {
            let d = haversine_m(origin, offset_north(origin, meters));
            assert!((d - meters).abs() < 1e-6, "{meters} -> {d}");
        }
    }

    #[test]
    fn antipodal_points_do_not_produce_nan() {
        let d = haversine_m(p(0.0, 0.0), p(0.0, 180.0));
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }
}
