//! GPS <-> local tracking space conversion
//!
//! Local axes: +X is east, +Z is north, Y is vertical and handled by
//! grounding. Offsets come from great-circle distance and initial bearing on
//! a sphere of radius [`EARTH_RADIUS_M`], so the forward and inverse
//! conversions are exact inverses of each other. Valid for treasure-hunt
//! ranges; poles and antimeridian crossings are not special-cased.

use crate::core::{GeoPoint, OriginBinding, EARTH_RADIUS_M};
use nalgebra::Vector3;

/// Great-circle distance between two points (meters, haversine)
pub fn distance_m(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let phi1 = from.latitude.to_radians();
    let phi2 = to.latitude.to_radians();
    let d_phi = (to.latitude - from.latitude).to_radians();
    let d_lambda = (to.longitude - from.longitude).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push a fraction past 1 for antipodal inputs
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let distance = EARTH_RADIUS_M * c;
    if distance.is_finite() { distance } else { 0.0 }
}

/// Initial bearing from `from` to `to`, degrees clockwise from north in [0, 360)
pub fn initial_bearing_deg(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let phi1 = from.latitude.to_radians();
    let phi2 = to.latitude.to_radians();
    let d_lambda = (to.longitude - from.longitude).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

    normalize_bearing(y.atan2(x).to_degrees())
}

/// Point reached travelling `distance` meters from `origin` along `bearing_deg`
///
/// Altitude is carried over from the origin.
pub fn destination_point(origin: &GeoPoint, bearing_deg: f64, distance: f64) -> GeoPoint {
    if !distance.is_finite() || !bearing_deg.is_finite() || distance == 0.0 {
        return *origin;
    }

    let delta = distance / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = origin.latitude.to_radians();
    let lambda1 = origin.longitude.to_radians();

    let sin_phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).clamp(-1.0, 1.0);
    let phi2 = sin_phi2.asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * sin_phi2);

    GeoPoint {
        latitude: phi2.to_degrees(),
        longitude: lambda2.to_degrees(),
        altitude: origin.altitude,
    }
}

/// Horizontal local offset `(dx, dz)` of `target` from the binding's origin
pub fn gps_to_local_offset(target: &GeoPoint, origin: &OriginBinding) -> (f64, f64) {
    let origin_gps = &origin.origin_gps;
    if !target.latitude.is_finite()
        || !target.longitude.is_finite()
        || !origin_gps.latitude.is_finite()
        || !origin_gps.longitude.is_finite()
    {
        return (0.0, 0.0);
    }

    let distance = distance_m(origin_gps, target);
    if distance == 0.0 {
        return (0.0, 0.0);
    }

    let bearing = initial_bearing_deg(origin_gps, target).to_radians();
    let dx = distance * bearing.sin();
    let dz = distance * bearing.cos();

    if dx.is_finite() && dz.is_finite() {
        (dx, dz)
    } else {
        (0.0, 0.0)
    }
}

/// GPS coordinate of the horizontal local offset `(dx, dz)` from the binding's origin
pub fn local_offset_to_gps(dx: f64, dz: f64, origin: &OriginBinding) -> GeoPoint {
    if !dx.is_finite() || !dz.is_finite() {
        return origin.origin_gps;
    }

    let distance = dx.hypot(dz);
    let bearing = normalize_bearing(dx.atan2(dz).to_degrees());
    destination_point(&origin.origin_gps, bearing, distance)
}

/// GPS coordinate of a full local position; Y is added to the origin altitude when known
pub fn local_position_to_gps(position: &Vector3<f64>, origin: &OriginBinding) -> GeoPoint {
    let mut point = local_offset_to_gps(position.x, position.z, origin);
    if let Some(altitude) = origin.origin_gps.altitude {
        if position.y.is_finite() {
            point.altitude = Some(altitude + position.y);
        }
    }
    point
}

pub fn normalize_bearing(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn san_francisco() -> OriginBinding {
        OriginBinding::new(GeoPoint::new(37.7749, -122.4194), "session-a", 0)
    }

    #[test]
    fn test_fifty_meters_east() {
        let origin = san_francisco();
        let target = destination_point(&origin.origin_gps, 90.0, 50.0);

        let (dx, dz) = gps_to_local_offset(&target, &origin);
        assert!((dx - 50.0).abs() < 1e-6, "dx = {}", dx);
        assert!(dz.abs() < 1e-6, "dz = {}", dz);

        let back = local_offset_to_gps(dx, dz, &origin);
        assert!((back.latitude - target.latitude).abs() < 1e-9);
        assert!((back.longitude - target.longitude).abs() < 1e-9);
    }

    #[test]
    fn test_origin_maps_to_zero_offset() {
        let origin = san_francisco();
        let (dx, dz) = gps_to_local_offset(&origin.origin_gps, &origin);
        assert_eq!((dx, dz), (0.0, 0.0));

        let back = local_offset_to_gps(0.0, 0.0, &origin);
        assert_eq!(back, origin.origin_gps);
    }

    #[test]
    fn test_offset_round_trip_sub_millimeter() {
        let origin = san_francisco();
        let offsets = [
            (0.3, -0.2),
            (12.5, 40.0),
            (-250.0, 1800.0),
            (3000.0, -2500.0),
            (-4200.0, -900.0),
        ];

        for (dx, dz) in offsets {
            let gps = local_offset_to_gps(dx, dz, &origin);
            let (rx, rz) = gps_to_local_offset(&gps, &origin);
            assert!((rx - dx).abs() < 1e-3, "dx {} -> {}", dx, rx);
            assert!((rz - dz).abs() < 1e-3, "dz {} -> {}", dz, rz);
        }
    }

    #[test]
    fn test_gps_round_trip_within_micro_degree() {
        let origin = OriginBinding::new(GeoPoint::new(-33.8688, 151.2093), "session-b", 0);
        let targets = [
            GeoPoint::new(-33.8700, 151.2100),
            GeoPoint::new(-33.8400, 151.2300),
            GeoPoint::new(-33.9000, 151.1800),
        ];

        for target in targets {
            let (dx, dz) = gps_to_local_offset(&target, &origin);
            let back = local_offset_to_gps(dx, dz, &origin);
            assert!((back.latitude - target.latitude).abs() < 1e-6);
            assert!((back.longitude - target.longitude).abs() < 1e-6);
        }
    }

    #[test]
    fn test_north_is_positive_z() {
        let origin = san_francisco();
        let target = GeoPoint::new(37.7759, -122.4194);
        let (dx, dz) = gps_to_local_offset(&target, &origin);
        assert!(dx.abs() < 1e-6);
        // ~111 m per 0.001 degree of latitude
        assert!((dz - 111.19).abs() < 0.1);
    }

    #[test]
    fn test_degenerate_inputs_do_not_produce_nan() {
        let origin = san_francisco();
        let (dx, dz) = gps_to_local_offset(&GeoPoint::new(f64::NAN, 0.0), &origin);
        assert_eq!((dx, dz), (0.0, 0.0));

        let gps = local_offset_to_gps(f64::NAN, 1.0, &origin);
        assert_eq!(gps, origin.origin_gps);
    }

    #[test]
    fn test_bearing_normalized() {
        let a = GeoPoint::new(0.0, 0.0);
        let west = GeoPoint::new(0.0, -0.01);
        let bearing = initial_bearing_deg(&a, &west);
        assert!((bearing - 270.0).abs() < 1e-9);
        assert!((0.0..360.0).contains(&bearing));
    }

    #[test]
    fn test_local_position_carries_altitude() {
        let origin = OriginBinding::new(GeoPoint::new(37.7749, -122.4194).with_altitude(12.0), "s", 0);
        let gps = local_position_to_gps(&Vector3::new(5.0, 1.5, -5.0), &origin);
        assert_eq!(gps.altitude, Some(13.5));
    }
}
