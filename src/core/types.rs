//! Core data types shared by every anchoring component

use crate::core::constants::DEFAULT_AREA_KEY;
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock is before it
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// GPS coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above the reference ellipsoid (meters), when the fix has one
    pub altitude: Option<f64>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    /// Latitude and longitude are finite and inside their valid ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.altitude.map_or(true, f64::is_finite)
    }
}

/// Rigid transform in a session's local tracking space
///
/// Meaningless outside its session unless paired with the anchor's
/// [`OriginBinding`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalTransform {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl Default for LocalTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl LocalTransform {
    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }

    pub fn from_position(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Vector3::new(x, y, z),
            orientation: UnitQuaternion::identity(),
        }
    }

    pub fn with_orientation(mut self, orientation: UnitQuaternion<f64>) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            position: iso.translation.vector,
            orientation: iso.rotation,
        }
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }

    /// Distance in the horizontal (X/Z) plane, ignoring height
    pub fn horizontal_distance_to(&self, other: &LocalTransform) -> f64 {
        let dx = self.position.x - other.position.x;
        let dz = self.position.z - other.position.z;
        (dx * dx + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.orientation.coords.iter().all(|v| v.is_finite())
    }
}

/// Ties local-space (0,0,0) of one session to a real-world GPS point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginBinding {
    pub origin_gps: GeoPoint,
    pub session_id: String,
    /// When the fix was bound (milliseconds since epoch)
    pub bound_at_ms: u64,
    /// Derived from a placement target rather than a real GPS fix
    #[serde(default)]
    pub provisional: bool,
}

impl OriginBinding {
    pub fn new(origin_gps: GeoPoint, session_id: impl Into<String>, bound_at_ms: u64) -> Self {
        Self {
            origin_gps,
            session_id: session_id.into(),
            bound_at_ms,
            provisional: false,
        }
    }

    /// Binding used before the session has a usable GPS fix
    pub fn provisional(origin_gps: GeoPoint, session_id: impl Into<String>, bound_at_ms: u64) -> Self {
        Self {
            provisional: true,
            ..Self::new(origin_gps, session_id, bound_at_ms)
        }
    }

    /// Whether two bindings describe the same local frame
    pub fn same_frame(&self, other: &OriginBinding) -> bool {
        self.session_id == other.session_id
            && self.provisional == other.provisional
            && self.origin_gps.latitude == other.origin_gps.latitude
            && self.origin_gps.longitude == other.origin_gps.longitude
    }
}

/// A virtual object's placement, valid only under its origin binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Object identifier, stable across sessions and devices
    pub object_id: String,
    pub local_transform: LocalTransform,
    pub origin_binding: OriginBinding,
    /// Placement confidence in [0, 1]
    pub quality_score: f64,
    pub created_at_ms: u64,
    pub last_verified_at_ms: u64,
    pub source_device_id: String,
    /// Physical area the anchor belongs to (capacity is counted per area)
    #[serde(default = "default_area_key")]
    pub area_key: String,
}

fn default_area_key() -> String {
    DEFAULT_AREA_KEY.to_string()
}

impl Anchor {
    pub fn new(
        object_id: impl Into<String>,
        local_transform: LocalTransform,
        origin_binding: OriginBinding,
        quality_score: f64,
        source_device_id: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            local_transform,
            origin_binding,
            quality_score: quality_score.clamp(0.0, 1.0),
            created_at_ms: now_ms,
            last_verified_at_ms: now_ms,
            source_device_id: source_device_id.into(),
            area_key: default_area_key(),
        }
    }

    pub fn in_area(mut self, area_key: impl Into<String>) -> Self {
        self.area_key = area_key.into();
        self
    }

    /// Copy of this anchor moved into another frame; transform and binding change together
    pub fn rebound(&self, local_transform: LocalTransform, origin_binding: OriginBinding, now_ms: u64) -> Self {
        Self {
            local_transform,
            origin_binding,
            last_verified_at_ms: now_ms,
            ..self.clone()
        }
    }
}

/// Object size class, controls the fallback grounding offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Small,
    Large,
}

/// A horizontal plane hit reported by the tracking session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceHit {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SurfaceHit {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Where a resolved ground height came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundSource {
    /// A detected horizontal surface
    Surface,
    /// Class default below the observer
    Fallback,
}

/// Cached grounding result for one grid cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceSample {
    pub local_x: f64,
    pub local_z: f64,
    pub resolved_y: f64,
    pub source: GroundSource,
    pub sampled_at: std::time::Instant,
}

/// Live tracking quality inputs for snapshot scoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingQualitySignals {
    /// Raw feature points tracked this frame
    pub point_count: u32,
    /// Detected planes
    pub plane_count: u32,
    /// Feature points per square meter of observed area, normalized by the session
    pub feature_density: f64,
    /// Positions of tracked reference points/planes
    pub reference_positions: Vec<Vector3<f64>>,
}

/// Opaque tracking-space capture for one physical area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub blob: Vec<u8>,
    pub quality_score: f64,
    pub captured_at_ms: u64,
    pub area_key: String,
}

/// Anchors and optional snapshot exchanged with a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBundle {
    pub anchors: Vec<Anchor>,
    pub snapshot: Option<WorldSnapshot>,
    pub sender_device_id: String,
    pub timestamp_ms: u64,
    #[serde(default = "default_area_key")]
    pub area_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> OriginBinding {
        OriginBinding::new(GeoPoint::new(37.7749, -122.4194), "session-a", 1000)
    }

    #[test]
    fn test_anchor_quality_is_clamped() {
        let anchor = Anchor::new("chest", LocalTransform::identity(), binding(), 1.7, "dev-1", 10);
        assert_eq!(anchor.quality_score, 1.0);
        assert_eq!(anchor.area_key, DEFAULT_AREA_KEY);
    }

    #[test]
    fn test_rebound_replaces_transform_and_binding_together() {
        let anchor = Anchor::new("chest", LocalTransform::from_position(1.0, 0.0, 2.0), binding(), 0.6, "dev-1", 10);
        let other = OriginBinding::new(GeoPoint::new(37.0, -122.0), "session-b", 2000);
        let moved = anchor.rebound(LocalTransform::from_position(3.0, 0.0, 4.0), other.clone(), 50);

        assert_eq!(moved.origin_binding, other);
        assert_eq!(moved.local_transform.position, Vector3::new(3.0, 0.0, 4.0));
        assert_eq!(moved.created_at_ms, 10);
        assert_eq!(moved.last_verified_at_ms, 50);
    }

    #[test]
    fn test_same_frame() {
        let a = binding();
        let mut b = binding();
        assert!(a.same_frame(&b));
        b.session_id = "session-b".to_string();
        assert!(!a.same_frame(&b));

        let provisional = OriginBinding::provisional(a.origin_gps, a.session_id.clone(), a.bound_at_ms);
        assert!(!a.same_frame(&provisional));
    }

    #[test]
    fn test_binding_without_provisional_field_parses() {
        let json = r#"{"origin_gps":{"latitude":1.0,"longitude":2.0,"altitude":null},"session_id":"s","bound_at_ms":3}"#;
        let parsed: OriginBinding = serde_json::from_str(json).unwrap();
        assert!(!parsed.provisional);
        assert_eq!(parsed.origin_gps, GeoPoint::new(1.0, 2.0));
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(37.7749, -122.4194).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_isometry_round_trip() {
        let rotation = UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0);
        let transform = LocalTransform::from_position(1.0, 2.0, 3.0).with_orientation(rotation);
        let back = LocalTransform::from_isometry(&transform.to_isometry());
        assert!((back.position - transform.position).norm() < 1e-12);
        assert!(back.orientation.angle_to(&transform.orientation) < 1e-12);
    }
}
