//! Coarse spatial buckets for "same area" grouping
//!
//! Coordinates are quantized to 1/1000 of a degree (~100 m cells). Points
//! that differ only at the 4th decimal or beyond can share a bucket, which
//! is acceptable: zones group nearby players, they do not identify them.

use serde::Serialize;

use super::GeoPoint;

/// Grid resolution: cells per degree
const CELLS_PER_DEGREE: f64 = 1000.0;

/// Number of cosmetic rings used by zone labels
const LABEL_RINGS: i64 = 9;

/// Zone key and label for one location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Zone {
    pub key: String,
    pub label: String,
}

impl Zone {
    pub fn of(point: &GeoPoint) -> Self {
        Self {
            key: zone_key(point),
            label: zone_label(point),
        }
    }
}

fn quantize(deg: f64) -> i64 {
    (deg * CELLS_PER_DEGREE).round() as i64
}

/// Composite grid cell key, e.g. `37775:-122419`
pub fn zone_key(point: &GeoPoint) -> String {
    format!("{}:{}", quantize(point.lat), quantize(point.lon))
}

/// Human-facing ring label `GRID-1` .. `GRID-9`
///
/// Distant cells collide on purpose; the label is cosmetic.
pub fn zone_label(point: &GeoPoint) -> String {
    let ring = (quantize(point.lat).abs() + quantize(point.lon).abs()) % LABEL_RINGS + 1;
    format!("GRID-{}", ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let p = GeoPoint::new(37.77493, -122.41942);
        assert_eq!(zone_key(&p), zone_key(&p));
        assert_eq!(zone_key(&p), "37775:-122419");
    }

    #[test]
    fn nearby_points_share_a_bucket() {
        let a = GeoPoint::new(37.77493, -122.41942);
        let b = GeoPoint::new(37.77511, -122.41901);
        assert_eq!(zone_key(&a), zone_key(&b));
    }

    #[test]
    fn distant_points_get_distinct_keys() {
        let a = GeoPoint::new(37.7749, -122.4194);
        let b = GeoPoint::new(37.7849, -122.4194);
        assert_ne!(zone_key(&a), zone_key(&b));
    }

    #[test]
    fn label_stays_in_ring_range() {
        for i in 0..200 {
            let p = GeoPoint::new(-45.0 + i as f64 * 0.37, 170.0 - i as f64 * 1.3);
            let label = zone_label(&p);
            let ring: i64 = label
                .strip_prefix("GRID-")
                .and_then(|n| n.parse().ok())
                .unwrap();
            assert!((1..=9).contains(&ring), "{label}");
        }
    }

    #[test]
    fn zone_bundles_key_and_label() {
        let p = GeoPoint::new(0.001, 0.002);
        let zone = Zone::of(&p);
        assert_eq!(zone.key, "1:2");
        assert_eq!(zone.label, "GRID-4");
    }
}
