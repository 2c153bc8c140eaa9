//! Geometry and anchoring algorithms

pub mod drift;
pub mod geodesy;
pub mod grounding;

pub use drift::{DriftAssessment, DriftCorrector, DriftReport, DriftVerdict};
pub use geodesy::{
    destination_point, distance_m, gps_to_local_offset, initial_bearing_deg, local_offset_to_gps,
    local_position_to_gps, normalize_bearing,
};
pub use grounding::{GroundResolution, GroundingStatistics, SurfaceGroundingEngine};
