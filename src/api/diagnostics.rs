//! Read-only diagnostics for UI display

use crate::algorithms::GroundingStatistics;
use crate::persistence::RelocalizationOutcome;
use crate::sync::PeerSyncState;
use serde::Serialize;
use std::fmt;

/// Snapshot of session counters; not authoritative
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub device_id: String,
    pub session_id: String,
    pub origin_bound: bool,
    pub anchor_count: usize,
    pub anchors_in_area: usize,
    pub provisional_anchors: usize,
    pub mean_anchor_quality: Option<f64>,
    /// Quality of the live tracking map
    pub live_map_quality: f64,
    /// `(area_key, quality)` of retained snapshots
    pub snapshot_qualities: Vec<(String, f64)>,
    pub capture_in_flight: bool,
    pub last_relocalization: Option<RelocalizationOutcome>,
    pub grounding: GroundingStatistics,
    pub peers: Vec<(String, PeerSyncState)>,
    pub pending_inbound: usize,
    pub dropped_inbound: usize,
}

impl Diagnostics {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {} on {}", self.session_id, self.device_id)?;
        writeln!(f, "  Origin: {}", if self.origin_bound { "bound" } else { "waiting for GPS fix" })?;
        write!(f, "  Anchors: {} ({} in area", self.anchor_count, self.anchors_in_area)?;
        if self.provisional_anchors > 0 {
            write!(f, ", {} provisional", self.provisional_anchors)?;
        }
        writeln!(f, ")")?;
        if let Some(quality) = self.mean_anchor_quality {
            writeln!(f, "  Mean anchor quality: {:.2}", quality)?;
        }
        writeln!(f, "  Live map quality: {:.2}", self.live_map_quality)?;
        for (area, quality) in &self.snapshot_qualities {
            writeln!(f, "  Snapshot {}: {:.2}", area, quality)?;
        }
        if let Some(outcome) = self.last_relocalization {
            writeln!(f, "  Last relocalization: {:?}", outcome)?;
        }

        let g = &self.grounding;
        let lookups = g.cache_hits + g.cache_misses;
        let hit_rate = if lookups > 0 { g.cache_hits as f64 / lookups as f64 * 100.0 } else { 0.0 };
        writeln!(
            f,
            "  Grounding: {} queries, {:.1}% cache hits, {} throttled, {} fallbacks",
            g.surface_queries, hit_rate, g.throttled, g.fallbacks
        )?;

        for (peer, state) in &self.peers {
            writeln!(f, "  Peer {}: {:?}", peer, state)?;
        }
        write!(f, "  Inbox: {} pending, {} dropped", self.pending_inbound, self.dropped_inbound)
    }
}
