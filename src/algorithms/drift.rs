//! Drift detection and bounded correction for anchors from other frames
//!
//! An anchor recorded under a previous origin binding carries an implied GPS
//! position. Projecting that position into the current frame gives where the
//! anchor should be now; when the recorded position has drifted from it by
//! more than the threshold, the anchor is moved and re-bound. Discrepancies
//! beyond the maximum correction are only flagged, except for anchors placed
//! under a provisional binding.

use crate::algorithms::geodesy::{gps_to_local_offset, local_offset_to_gps};
use crate::core::{Anchor, LocalTransform, OriginBinding};
use crate::persistence::AnchorStore;
use crate::utils::DriftConfig;
use nalgebra::Vector3;
use tracing::{debug, info, warn};

/// What the corrector decided for one anchor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftVerdict {
    /// Already bound to the current frame
    SameFrame,
    WithinTolerance,
    Correct,
    /// Beyond the maximum correction, left untouched
    Flagged,
    /// Degenerate transform or GPS, nothing to compare
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftAssessment {
    pub object_id: String,
    pub recorded_position: Vector3<f64>,
    /// Position implied by the anchor's GPS in the current frame
    pub expected_position: Vector3<f64>,
    /// Horizontal distance between recorded and expected positions
    pub discrepancy_m: f64,
    pub verdict: DriftVerdict,
}

/// Outcome of one correction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftReport {
    pub corrected: Vec<String>,
    pub flagged: Vec<String>,
    pub within_tolerance: usize,
    pub same_frame: usize,
    pub skipped: usize,
    pub max_discrepancy_m: f64,
}

impl DriftReport {
    pub fn examined(&self) -> usize {
        self.corrected.len() + self.flagged.len() + self.within_tolerance + self.same_frame + self.skipped
    }
}

pub struct DriftCorrector {
    config: DriftConfig,
}

impl DriftCorrector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Compare an anchor's recorded position with its GPS-implied position in `current`
    pub fn assess(&self, anchor: &Anchor, current: &OriginBinding) -> DriftAssessment {
        let recorded = anchor.local_transform.position;
        let mut assessment = DriftAssessment {
            object_id: anchor.object_id.clone(),
            recorded_position: recorded,
            expected_position: recorded,
            discrepancy_m: 0.0,
            verdict: DriftVerdict::SameFrame,
        };

        if anchor.origin_binding.same_frame(current) {
            return assessment;
        }
        if !anchor.local_transform.is_finite()
            || !anchor.origin_binding.origin_gps.is_valid()
            || !current.origin_gps.is_valid()
        {
            assessment.verdict = DriftVerdict::Skipped;
            return assessment;
        }

        let implied_gps = local_offset_to_gps(recorded.x, recorded.z, &anchor.origin_binding);
        let (dx, dz) = gps_to_local_offset(&implied_gps, current);
        let expected = Vector3::new(dx, recorded.y, dz);
        let discrepancy = (expected.x - recorded.x).hypot(expected.z - recorded.z);

        assessment.expected_position = expected;
        assessment.discrepancy_m = discrepancy;
        assessment.verdict = if !discrepancy.is_finite() {
            DriftVerdict::Skipped
        } else if discrepancy <= self.config.drift_threshold_m {
            DriftVerdict::WithinTolerance
        } else if discrepancy <= self.config.max_correction_m || anchor.origin_binding.provisional {
            // Provisional anchors are reconciled at any distance
            DriftVerdict::Correct
        } else {
            DriftVerdict::Flagged
        };
        assessment
    }

    /// Assess every stored anchor and re-bind the ones within the correction bound
    ///
    /// Corrections go through the store's conflict rule as local updates.
    /// Never fails: an anchor that cannot be rewritten is counted as skipped.
    pub fn check_and_correct(&self, store: &mut AnchorStore, current: &OriginBinding, now_ms: u64) -> DriftReport {
        let mut report = DriftReport::default();

        for anchor in store.all() {
            let assessment = self.assess(&anchor, current);
            if assessment.discrepancy_m.is_finite() {
                report.max_discrepancy_m = report.max_discrepancy_m.max(assessment.discrepancy_m);
            }

            match assessment.verdict {
                DriftVerdict::SameFrame => report.same_frame += 1,
                DriftVerdict::Skipped => {
                    debug!(object_id = %anchor.object_id, "drift check skipped, degenerate anchor");
                    report.skipped += 1;
                }
                DriftVerdict::WithinTolerance => report.within_tolerance += 1,
                DriftVerdict::Flagged => {
                    warn!(
                        object_id = %anchor.object_id,
                        discrepancy_m = assessment.discrepancy_m,
                        max_correction_m = self.config.max_correction_m,
                        "drift beyond correction bound, anchor left in place"
                    );
                    report.flagged.push(anchor.object_id.clone());
                }
                DriftVerdict::Correct => {
                    let transform = LocalTransform {
                        position: assessment.expected_position,
                        orientation: anchor.local_transform.orientation,
                    };
                    match store.rebind(&anchor.object_id, transform, current.clone(), now_ms) {
                        Ok(Some(_)) => {
                            info!(
                                object_id = %anchor.object_id,
                                discrepancy_m = assessment.discrepancy_m,
                                "drift corrected"
                            );
                            report.corrected.push(anchor.object_id.clone());
                        }
                        Ok(None) => report.skipped += 1,
                        Err(e) => {
                            warn!(object_id = %anchor.object_id, error = %e, "drift correction rejected by store");
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        if !report.corrected.is_empty() || !report.flagged.is_empty() {
            info!(
                corrected = report.corrected.len(),
                flagged = report.flagged.len(),
                within_tolerance = report.within_tolerance,
                "drift pass complete"
            );
        }
        report
    }
}
