//! Geodesic helpers - distance, bearing, heading differences

pub mod zone;

pub use zone::{zone_key, zone_label, Zone};

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance to another point in meters
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_m(self.lat, self.lon, other.lat, other.lon)
    }
}

/// Haversine great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Wrap any angle in degrees into [0, 360)
pub fn normalize_heading(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Minimal angular difference between two headings, in [0, 180]
pub fn angle_diff(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_offset() {
        // 0.001 degrees of latitude is ~111 m everywhere
        let d = haversine_m(37.0, -122.0, 37.001, -122.0);
        assert!((d - 111.19).abs() < 0.5, "got {d}");
        assert_eq!(haversine_m(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn angle_diff_is_commutative_and_bounded() {
        let mut a = 0.0;
        while a < 360.0 {
            let mut b = 0.0;
            while b < 360.0 {
                let d = angle_diff(a, b);
                assert_eq!(d, angle_diff(b, a));
                assert!((0.0..=180.0).contains(&d), "angle_diff({a}, {b}) = {d}");
                b += 7.5;
            }
            a += 11.25;
        }
    }

    #[test]
    fn angle_diff_wraps_through_north() {
        assert_eq!(angle_diff(350.0, 10.0), 20.0);
        assert_eq!(angle_diff(0.0, 180.0), 180.0);
        assert_eq!(angle_diff(90.0, 90.0), 0.0);
    }

    #[test]
    fn normalize_heading_wraps_negative_and_large() {
        assert_eq!(normalize_heading(-90.0), 270.0);
        assert_eq!(normalize_heading(720.0), 0.0);
        assert_eq!(normalize_heading(359.5), 359.5);
    }
}
