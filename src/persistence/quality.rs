//! Relocalization quality score for the live tracking map

use crate::core::TrackingQualitySignals;
use crate::utils::SnapshotConfig;
use nalgebra::Vector3;

/// Per-term breakdown of a quality score, each term in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    pub reference_count: f64,
    pub distribution: f64,
    pub density: f64,
    pub score: f64,
}

/// Weighted composite of reference count, spatial spread and feature density
///
/// The count term blends planes plus reference positions with the tracked
/// feature point count, split by `point_count_share`.
pub fn assess_quality(signals: &TrackingQualitySignals, config: &SnapshotConfig) -> QualityBreakdown {
    let references = signals.plane_count as f64 + signals.reference_positions.len() as f64;
    let reference_term = saturate(references, config.reference_saturation as f64);
    let point_term = saturate(signals.point_count as f64, config.point_saturation as f64);
    let share = config.point_count_share;
    let reference_count = (1.0 - share) * reference_term + share * point_term;
    let distribution = saturate(mean_spread(&signals.reference_positions), config.spread_saturation_m);
    let density = saturate(signals.feature_density, config.density_saturation);

    let score = config.reference_count_weight * reference_count
        + config.distribution_weight * distribution
        + config.density_weight * density;

    QualityBreakdown {
        reference_count,
        distribution,
        density,
        score: if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 },
    }
}

/// Mean distance of the points from their centroid; 0 for fewer than two points
pub fn mean_spread(points: &[Vector3<f64>]) -> f64 {
    let finite: Vec<&Vector3<f64>> = points.iter().filter(|p| p.iter().all(|v| v.is_finite())).collect();
    if finite.len() < 2 {
        return 0.0;
    }

    let centroid = finite.iter().fold(Vector3::zeros(), |acc, p| acc + **p) / finite.len() as f64;
    finite.iter().map(|p| (**p - centroid).norm()).sum::<f64>() / finite.len() as f64
}

fn saturate(value: f64, saturation: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 || saturation <= 0.0 {
        return 0.0;
    }
    (value / saturation).min(1.0)
}
