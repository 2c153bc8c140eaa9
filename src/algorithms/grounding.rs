//! Surface grounding for placed objects
//!
//! Resolves the height an object rests at for a local X/Z position. Called
//! from the per-frame path, so every call returns in bounded time: cached
//! cells answer immediately, real surface queries are rate limited, and
//! every path ends in a concrete height.

use crate::core::{GroundSource, SurfaceHit};
use crate::platform::TrackingSurfaceQuery;
use crate::processing::SurfaceCache;
use crate::utils::GroundingConfig;
use nalgebra::Vector3;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Resolved height and where it came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundResolution {
    pub y: f64,
    pub source: GroundSource,
    /// Answered from the cache or the throttle path without a new query
    pub from_cache: bool,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroundingStatistics {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub throttled: usize,
    pub surface_queries: usize,
    pub fallbacks: usize,
    pub cached_cells: usize,
}

/// Owned grounding context with its own cache and rate limiter
///
/// Independent instances never share state, so separate rooms or tests do
/// not interfere with each other.
pub struct SurfaceGroundingEngine {
    query: Arc<dyn TrackingSurfaceQuery>,
    config: GroundingConfig,
    cache: SurfaceCache,
    last_query_at: Option<Instant>,
    last_known_y: Option<f64>,
    throttled: usize,
    surface_queries: usize,
    fallbacks: usize,
}

impl SurfaceGroundingEngine {
    pub fn new(query: Arc<dyn TrackingSurfaceQuery>, config: GroundingConfig) -> Self {
        let cache = SurfaceCache::new(config.cell_size_m, config.cache_ttl());
        Self {
            query,
            config,
            cache,
            last_query_at: None,
            last_known_y: None,
            throttled: 0,
            surface_queries: 0,
            fallbacks: 0,
        }
    }

    /// Height an object at (x, z) should rest at; never fails
    pub fn resolve_ground_height(&mut self, x: f64, z: f64, observer_y: f64, fallback_offset: f64) -> f64 {
        self.resolve_ground_height_at(x, z, observer_y, fallback_offset, Instant::now())
    }

    pub fn resolve_ground_height_at(
        &mut self,
        x: f64,
        z: f64,
        observer_y: f64,
        fallback_offset: f64,
        now: Instant,
    ) -> f64 {
        self.resolve_detailed(x, z, observer_y, fallback_offset, now).y
    }

    pub fn resolve_detailed(
        &mut self,
        x: f64,
        z: f64,
        observer_y: f64,
        fallback_offset: f64,
        now: Instant,
    ) -> GroundResolution {
        let observer_y = if observer_y.is_finite() { observer_y } else { 0.0 };
        let fallback_offset = if fallback_offset.is_finite() { fallback_offset } else { 0.0 };
        let default_y = observer_y - fallback_offset;

        if !x.is_finite() || !z.is_finite() {
            warn!(x, z, "non-finite grounding position, using class default height");
            self.fallbacks += 1;
            return GroundResolution {
                y: default_y,
                source: GroundSource::Fallback,
                from_cache: false,
            };
        }

        if let Some(sample) = self.cache.get_fresh(x, z, now) {
            return GroundResolution {
                y: sample.resolved_y,
                source: sample.source,
                from_cache: true,
            };
        }

        if let Some(last) = self.last_query_at {
            if now.saturating_duration_since(last) < self.config.min_query_interval() {
                self.throttled += 1;
                return self.throttled_answer(x, z, default_y);
            }
        }

        self.last_query_at = Some(now);
        let resolution = match self.query_surfaces(x, z, observer_y) {
            Some(y) => GroundResolution {
                y,
                source: GroundSource::Surface,
                from_cache: false,
            },
            None => {
                warn!(x, z, observer_y, fallback_offset, "no surface found, using class default height");
                self.fallbacks += 1;
                GroundResolution {
                    y: default_y,
                    source: GroundSource::Fallback,
                    from_cache: false,
                }
            }
        };

        self.cache.insert(x, z, resolution.y, resolution.source, now);
        if resolution.source == GroundSource::Surface {
            self.last_known_y = Some(resolution.y);
        }
        resolution
    }

    /// Answer while rate limited: stale value for this cell, then last known surface, then default
    fn throttled_answer(&self, x: f64, z: f64, default_y: f64) -> GroundResolution {
        if let Some(stale) = self.cache.get_any(x, z) {
            debug!(x, z, y = stale.resolved_y, "grounding throttled, using stale cell value");
            return GroundResolution {
                y: stale.resolved_y,
                source: stale.source,
                from_cache: true,
            };
        }
        match self.last_known_y {
            Some(y) => {
                debug!(x, z, y, "grounding throttled, using last known surface");
                GroundResolution {
                    y,
                    source: GroundSource::Surface,
                    from_cache: true,
                }
            }
            None => {
                debug!(x, z, y = default_y, "grounding throttled, using class default height");
                GroundResolution {
                    y: default_y,
                    source: GroundSource::Fallback,
                    from_cache: true,
                }
            }
        }
    }

    /// Query the ray under (x, z), then a cross of neighbors if nothing qualifies
    fn query_surfaces(&mut self, x: f64, z: f64, observer_y: f64) -> Option<f64> {
        let ceiling = observer_y - self.config.ceiling_margin_m;

        let mut candidates = self.raycast(x, z, observer_y, ceiling);
        if candidates.is_empty() {
            let offset = self.config.neighbor_offset_m;
            for (ox, oz) in [(offset, 0.0), (-offset, 0.0), (0.0, offset), (0.0, -offset)] {
                candidates.extend(self.raycast(x + ox, z + oz, observer_y, ceiling));
            }
        }

        let chosen = self.select_candidate(x, z, &candidates);
        if let Some(y) = chosen {
            debug!(x, z, y, candidates = candidates.len(), "grounded on surface");
        }
        chosen
    }

    fn raycast(&mut self, x: f64, z: f64, observer_y: f64, ceiling: f64) -> Vec<SurfaceHit> {
        self.surface_queries += 1;
        let origin = Vector3::new(x, observer_y + self.config.ray_start_margin_m, z);
        let down = Vector3::new(0.0, -1.0, 0.0);

        self.query
            .raycast_horizontal_surfaces(origin, down)
            .into_iter()
            .filter(|hit| hit.x.is_finite() && hit.y.is_finite() && hit.z.is_finite())
            .filter(|hit| hit.y < ceiling)
            .collect()
    }

    /// Topmost surface within tolerance, else nearest within the expanded tolerance, else the floor
    fn select_candidate(&self, x: f64, z: f64, candidates: &[SurfaceHit]) -> Option<f64> {
        let horizontal = |hit: &SurfaceHit| ((hit.x - x).powi(2) + (hit.z - z).powi(2)).sqrt();

        let on_surface = candidates
            .iter()
            .filter(|hit| horizontal(hit) <= self.config.on_surface_tolerance_m)
            .map(|hit| hit.y)
            .fold(None, |best: Option<f64>, y| Some(best.map_or(y, |b| b.max(y))));
        if on_surface.is_some() {
            return on_surface;
        }

        let nearest = candidates
            .iter()
            .map(|hit| (horizontal(hit), hit.y))
            .filter(|(d, _)| *d <= self.config.expanded_tolerance_m)
            .min_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((_, y)) = nearest {
            return Some(y);
        }

        candidates.iter().map(|hit| hit.y).min_by(|a, b| a.total_cmp(b))
    }

    pub fn statistics(&self) -> GroundingStatistics {
        let (cache_hits, cache_misses, _) = self.cache.get_statistics();
        GroundingStatistics {
            cache_hits,
            cache_misses,
            throttled: self.throttled,
            surface_queries: self.surface_queries,
            fallbacks: self.fallbacks,
            cached_cells: self.cache.len(),
        }
    }

    pub fn config(&self) -> &GroundingConfig {
        &self.config
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.last_known_y = None;
    }
}
