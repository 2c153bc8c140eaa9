//! Structural validation for anchors and sync bundles
//!
//! Checks run before any mutation so rejected input leaves state untouched.

use crate::core::{Anchor, SyncBundle, WorldSnapshot};
use std::collections::HashSet;

/// Validation failure for a single record
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub object_id: String,
    pub reason: String,
}

impl ValidationIssue {
    fn new(object_id: &str, reason: impl Into<String>) -> Self {
        Self {
            object_id: object_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Validator for anchor records and bundles received from peers or storage
pub struct DataValidator;

impl DataValidator {
    /// Check a single anchor for values no component can interpret
    pub fn validate_anchor(anchor: &Anchor) -> Result<(), ValidationIssue> {
        let id = anchor.object_id.as_str();

        if id.trim().is_empty() {
            return Err(ValidationIssue::new(id, "empty object id"));
        }
        if anchor.source_device_id.trim().is_empty() {
            return Err(ValidationIssue::new(id, "empty source device id"));
        }
        if anchor.area_key.trim().is_empty() {
            return Err(ValidationIssue::new(id, "empty area key"));
        }
        if !anchor.quality_score.is_finite() || !(0.0..=1.0).contains(&anchor.quality_score) {
            return Err(ValidationIssue::new(
                id,
                format!("quality {} outside [0, 1]", anchor.quality_score),
            ));
        }
        if !anchor.local_transform.is_finite() {
            return Err(ValidationIssue::new(id, "non-finite local transform"));
        }
        if !anchor.origin_binding.origin_gps.is_valid() {
            return Err(ValidationIssue::new(id, "invalid origin GPS coordinate"));
        }
        if anchor.origin_binding.session_id.trim().is_empty() {
            return Err(ValidationIssue::new(id, "origin binding without session id"));
        }
        if anchor.last_verified_at_ms < anchor.created_at_ms {
            return Err(ValidationIssue::new(id, "verified before it was created"));
        }

        Ok(())
    }

    pub fn validate_snapshot(snapshot: &WorldSnapshot) -> Result<(), String> {
        if snapshot.area_key.trim().is_empty() {
            return Err("snapshot without area key".to_string());
        }
        if !snapshot.quality_score.is_finite() || !(0.0..=1.0).contains(&snapshot.quality_score) {
            return Err(format!("snapshot quality {} outside [0, 1]", snapshot.quality_score));
        }
        if snapshot.blob.is_empty() {
            return Err("snapshot with empty blob".to_string());
        }
        Ok(())
    }

    /// Validate a whole bundle; the first problem rejects it entirely
    pub fn validate_bundle(bundle: &SyncBundle) -> Result<(), String> {
        if bundle.sender_device_id.trim().is_empty() {
            return Err("bundle without sender device id".to_string());
        }
        if bundle.area_key.trim().is_empty() {
            return Err("bundle without area key".to_string());
        }

        let mut seen = HashSet::new();
        for anchor in &bundle.anchors {
            Self::validate_anchor(anchor)
                .map_err(|issue| format!("anchor {}: {}", issue.object_id, issue.reason))?;
            if anchor.area_key != bundle.area_key {
                return Err(format!(
                    "anchor {} belongs to area {}, bundle is for {}",
                    anchor.object_id, anchor.area_key, bundle.area_key
                ));
            }
            if !seen.insert(anchor.object_id.as_str()) {
                return Err(format!("duplicate anchor {}", anchor.object_id));
            }
        }

        if let Some(snapshot) = &bundle.snapshot {
            Self::validate_snapshot(snapshot)?;
            if snapshot.area_key != bundle.area_key {
                return Err(format!(
                    "snapshot for area {} in bundle for {}",
                    snapshot.area_key, bundle.area_key
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GeoPoint, LocalTransform, OriginBinding, DEFAULT_AREA_KEY};

    fn anchor(id: &str) -> Anchor {
        let binding = OriginBinding::new(GeoPoint::new(48.8584, 2.2945), "s1", 0);
        Anchor::new(id, LocalTransform::from_position(1.0, 0.0, 1.0), binding, 0.7, "dev-1", 100)
    }

    fn bundle(anchors: Vec<Anchor>) -> SyncBundle {
        SyncBundle {
            anchors,
            snapshot: None,
            sender_device_id: "dev-1".to_string(),
            timestamp_ms: 200,
            area_key: DEFAULT_AREA_KEY.to_string(),
        }
    }

    #[test]
    fn test_valid_anchor_passes() {
        assert!(DataValidator::validate_anchor(&anchor("a")).is_ok());
    }

    #[test]
    fn test_out_of_range_quality_rejected() {
        let mut bad = anchor("a");
        bad.quality_score = 1.5;
        let issue = DataValidator::validate_anchor(&bad).unwrap_err();
        assert_eq!(issue.object_id, "a");
    }

    #[test]
    fn test_non_finite_transform_rejected() {
        let mut bad = anchor("a");
        bad.local_transform.position.x = f64::INFINITY;
        assert!(DataValidator::validate_anchor(&bad).is_err());
    }

    #[test]
    fn test_duplicate_ids_reject_bundle() {
        let b = bundle(vec![anchor("a"), anchor("a")]);
        assert!(DataValidator::validate_bundle(&b).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_area_mismatch_rejects_bundle() {
        let b = bundle(vec![anchor("a").in_area("basement")]);
        assert!(DataValidator::validate_bundle(&b).is_err());
    }

    #[test]
    fn test_empty_sender_rejects_bundle() {
        let mut b = bundle(vec![anchor("a")]);
        b.sender_device_id = String::new();
        assert!(DataValidator::validate_bundle(&b).is_err());
    }
}
