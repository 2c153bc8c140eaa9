use crate::core::ObjectClass;
use crate::validation::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// System-wide configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchoringConfig {
    pub grounding: GroundingConfig,
    pub store: StoreConfig,
    pub snapshot: SnapshotConfig,
    pub drift: DriftConfig,
    pub sync: SyncConfig,
    pub session: SessionConfig,
}

/// Surface grounding parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    /// Edge length of a cache grid cell (meters)
    pub cell_size_m: f64,
    /// Cached results younger than this are returned without querying (milliseconds)
    pub cache_ttl_ms: u64,
    /// Minimum interval between real surface queries across all callers (milliseconds)
    pub min_query_interval_ms: u64,
    /// Ray origin height above the observer (meters)
    pub ray_start_margin_m: f64,
    /// Surfaces at or above observer height minus this are treated as ceilings (meters)
    pub ceiling_margin_m: f64,
    /// Offset of the cross-pattern retry rays (meters)
    pub neighbor_offset_m: f64,
    /// Horizontal distance within which a surface counts as directly under the object (meters)
    pub on_surface_tolerance_m: f64,
    /// Second-chance horizontal tolerance for the nearest candidate (meters)
    pub expanded_tolerance_m: f64,
    /// Fallback offset below the observer for small objects (meters)
    pub small_object_offset_m: f64,
    /// Fallback offset below the observer for large objects (meters)
    pub large_object_offset_m: f64,
}

/// Anchor table parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum anchors held per area key
    pub max_anchors_per_area: usize,
    /// An incoming lower-quality anchor wins only if newer by more than this (milliseconds)
    pub conflict_grace_period_ms: u64,
}

/// World snapshot capture and restore parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshots scoring below this are never persisted
    pub min_quality: f64,
    /// Weight of the tracked reference count term
    pub reference_count_weight: f64,
    /// Weight of the spatial distribution term
    pub distribution_weight: f64,
    /// Weight of the feature density term
    pub density_weight: f64,
    /// Reference points/planes at which the count term saturates
    pub reference_saturation: u32,
    /// Tracked feature points at which the count term saturates
    pub point_saturation: u32,
    /// Share of the count term taken by the feature point count
    pub point_count_share: f64,
    /// Mean distance from centroid at which the distribution term saturates (meters)
    pub spread_saturation_m: f64,
    /// Feature density at which the density term saturates
    pub density_saturation: f64,
    /// Quality gain that counts as materially better
    pub improvement_margin: f64,
    /// Retained snapshots older than this are superseded regardless of quality (milliseconds)
    pub max_snapshot_age_ms: u64,
    /// Bound on a relocalization attempt (milliseconds)
    pub relocalization_timeout_ms: u64,
    /// Bound on a capture made at session end (milliseconds)
    pub capture_timeout_ms: u64,
}

/// Drift correction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Discrepancies at or below this are left alone (meters)
    pub drift_threshold_m: f64,
    /// Discrepancies above this are flagged instead of corrected (meters)
    pub max_correction_m: f64,
}

/// Peer sync parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Peer snapshot must beat the local one by this much to replace it
    pub snapshot_improvement_margin: f64,
    /// Upper bound on accepted bundle payload size (bytes)
    pub max_bundle_bytes: usize,
    /// Maximum queued inbound bundles; older ones are dropped first
    pub max_inbox_len: usize,
}

/// Session lifecycle parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Area key used by placement, capture and export
    pub area_key: String,
    /// GPS fixes less accurate than this are not used as the session origin (meters)
    pub max_origin_fix_accuracy_m: f64,
    /// Quality multiplier for anchors resting on the class fallback instead of a surface
    pub fallback_quality_factor: f64,
    /// Quality multiplier for anchors placed before the origin was bound
    pub provisional_quality_factor: f64,
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            grounding: GroundingConfig::default(),
            store: StoreConfig::default(),
            snapshot: SnapshotConfig::default(),
            drift: DriftConfig::default(),
            sync: SyncConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            cell_size_m: 0.5,
            cache_ttl_ms: 500,
            min_query_interval_ms: 100, // 10 queries per second
            ray_start_margin_m: 0.5,
            ceiling_margin_m: 0.1,
            neighbor_offset_m: 0.5,
            on_surface_tolerance_m: 0.3,
            expanded_tolerance_m: 1.0,
            small_object_offset_m: 1.4,
            large_object_offset_m: 1.6,
        }
    }
}

impl GroundingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn min_query_interval(&self) -> Duration {
        Duration::from_millis(self.min_query_interval_ms)
    }

    /// Fallback grounding offset below the observer for an object class
    pub fn fallback_offset(&self, class: ObjectClass) -> f64 {
        match class {
            ObjectClass::Small => self.small_object_offset_m,
            ObjectClass::Large => self.large_object_offset_m,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_anchors_per_area: 256,
            conflict_grace_period_ms: 5_000,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            min_quality: 0.3,
            reference_count_weight: 0.4,
            distribution_weight: 0.3,
            density_weight: 0.3,
            reference_saturation: 12,
            point_saturation: 500,
            point_count_share: 0.5,
            spread_saturation_m: 2.0,
            density_saturation: 1.0,
            improvement_margin: 0.1,
            max_snapshot_age_ms: 7 * 24 * 60 * 60 * 1000, // one week
            relocalization_timeout_ms: 5_000,
            capture_timeout_ms: 10_000,
        }
    }
}

impl SnapshotConfig {
    pub fn relocalization_timeout(&self) -> Duration {
        Duration::from_millis(self.relocalization_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            drift_threshold_m: 0.5,
            max_correction_m: 2.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_improvement_margin: 0.1,
            max_bundle_bytes: 16 * 1024 * 1024,
            max_inbox_len: 32,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            area_key: crate::core::DEFAULT_AREA_KEY.to_string(),
            max_origin_fix_accuracy_m: 15.0,
            fallback_quality_factor: 0.6,
            provisional_quality_factor: 0.25,
        }
    }
}

impl AnchoringConfig {
    /// Load and validate a JSON configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            message: format!("failed to read {}: {}", path.as_ref().display(), e),
        })?;

        let config: AnchoringConfig = serde_json::from_str(&content).map_err(|e| ConfigError::Serialization {
            message: e.to_string(),
        })?;

        let errors = config.validate();
        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(config),
        }
    }

    /// Save as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialization {
            message: e.to_string(),
        })?;

        fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            message: format!("failed to write {}: {}", path.as_ref().display(), e),
        })
    }

    /// Every invalid parameter, empty when the configuration is usable
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let g = &self.grounding;

        positive(&mut errors, "grounding.cell_size_m", g.cell_size_m);
        positive(&mut errors, "grounding.cache_ttl_ms", g.cache_ttl_ms as f64);
        non_negative(&mut errors, "grounding.ray_start_margin_m", g.ray_start_margin_m);
        non_negative(&mut errors, "grounding.ceiling_margin_m", g.ceiling_margin_m);
        positive(&mut errors, "grounding.neighbor_offset_m", g.neighbor_offset_m);
        non_negative(&mut errors, "grounding.on_surface_tolerance_m", g.on_surface_tolerance_m);
        non_negative(&mut errors, "grounding.small_object_offset_m", g.small_object_offset_m);
        non_negative(&mut errors, "grounding.large_object_offset_m", g.large_object_offset_m);
        if g.expanded_tolerance_m < g.on_surface_tolerance_m {
            errors.push(invalid(
                "grounding.expanded_tolerance_m",
                g.expanded_tolerance_m,
                "must not be smaller than on_surface_tolerance_m",
            ));
        }

        if self.store.max_anchors_per_area == 0 {
            errors.push(invalid("store.max_anchors_per_area", 0, "must be at least 1"));
        }

        let s = &self.snapshot;
        unit_interval(&mut errors, "snapshot.min_quality", s.min_quality);
        unit_interval(&mut errors, "snapshot.improvement_margin", s.improvement_margin);
        let weight_sum = s.reference_count_weight + s.distribution_weight + s.density_weight;
        if (weight_sum - 1.0).abs() > 1e-6
            || s.reference_count_weight < 0.0
            || s.distribution_weight < 0.0
            || s.density_weight < 0.0
        {
            errors.push(invalid(
                "snapshot weights",
                weight_sum,
                "must be non-negative and sum to 1.0",
            ));
        }
        if s.reference_saturation == 0 {
            errors.push(invalid("snapshot.reference_saturation", 0, "must be at least 1"));
        }
        if s.point_saturation == 0 {
            errors.push(invalid("snapshot.point_saturation", 0, "must be at least 1"));
        }
        unit_interval(&mut errors, "snapshot.point_count_share", s.point_count_share);
        positive(&mut errors, "snapshot.spread_saturation_m", s.spread_saturation_m);
        positive(&mut errors, "snapshot.density_saturation", s.density_saturation);
        positive(&mut errors, "snapshot.relocalization_timeout_ms", s.relocalization_timeout_ms as f64);
        positive(&mut errors, "snapshot.capture_timeout_ms", s.capture_timeout_ms as f64);

        let d = &self.drift;
        non_negative(&mut errors, "drift.drift_threshold_m", d.drift_threshold_m);
        if d.max_correction_m < d.drift_threshold_m {
            errors.push(invalid(
                "drift.max_correction_m",
                d.max_correction_m,
                "must not be smaller than drift_threshold_m",
            ));
        }

        unit_interval(&mut errors, "sync.snapshot_improvement_margin", self.sync.snapshot_improvement_margin);
        if self.sync.max_bundle_bytes == 0 {
            errors.push(invalid("sync.max_bundle_bytes", 0, "must be at least 1"));
        }
        if self.sync.max_inbox_len == 0 {
            errors.push(invalid("sync.max_inbox_len", 0, "must be at least 1"));
        }

        if self.session.area_key.trim().is_empty() {
            errors.push(invalid("session.area_key", "\"\"", "must not be empty"));
        }
        positive(&mut errors, "session.max_origin_fix_accuracy_m", self.session.max_origin_fix_accuracy_m);
        unit_interval(&mut errors, "session.fallback_quality_factor", self.session.fallback_quality_factor);
        unit_interval(&mut errors, "session.provisional_quality_factor", self.session.provisional_quality_factor);

        errors
    }
}

fn invalid(parameter: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn positive(errors: &mut Vec<ConfigError>, parameter: &str, value: f64) {
    if !(value.is_finite() && value > 0.0) {
        errors.push(invalid(parameter, value, "must be positive"));
    }
}

fn non_negative(errors: &mut Vec<ConfigError>, parameter: &str, value: f64) {
    if !(value.is_finite() && value >= 0.0) {
        errors.push(invalid(parameter, value, "must be non-negative"));
    }
}

fn unit_interval(errors: &mut Vec<ConfigError>, parameter: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(invalid(parameter, value, "must be within [0, 1]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnchoringConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.grounding.fallback_offset(ObjectClass::Small), 1.4);
        assert_eq!(config.grounding.fallback_offset(ObjectClass::Large), 1.6);
    }

    #[test]
    fn test_invalid_weights_reported() {
        let mut config = AnchoringConfig::default();
        config.snapshot.density_weight = 0.5;
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_all_errors_collected() {
        let mut config = AnchoringConfig::default();
        config.grounding.cell_size_m = 0.0;
        config.drift.max_correction_m = 0.1;
        config.store.max_anchors_per_area = 0;
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn test_config_file_round_trip() {
        let path = std::env::temp_dir().join(format!("geoanchor-config-{}.json", std::process::id()));
        let mut config = AnchoringConfig::default();
        config.drift.drift_threshold_m = 0.75;
        config.session.area_key = "plaza".to_string();

        config.save_to_file(&path).unwrap();
        let loaded = AnchoringConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AnchoringConfig =
            serde_json::from_str(r#"{ "drift": { "max_correction_m": 3.0 } }"#).unwrap();
        assert_eq!(config.drift.max_correction_m, 3.0);
        assert_eq!(config.drift.drift_threshold_m, 0.5);
        assert_eq!(config.grounding.cache_ttl_ms, 500);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let path = std::env::temp_dir().join(format!("geoanchor-bad-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "store": { "max_anchors_per_area": 0 } }"#).unwrap();
        assert!(matches!(
            AnchoringConfig::load_from_file(&path),
            Err(ConfigError::InvalidParameter { .. })
        ));
        let _ = fs::remove_file(&path);
    }
}
