use crate::core::{GroundSource, SurfaceSample};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Grid cell index over the local X/Z plane
pub type CellKey = (i64, i64);

/// Time-limited cache of grounding results keyed by grid cell
pub struct SurfaceCache {
    /// Cached samples by grid cell
    samples: HashMap<CellKey, SurfaceSample>,
    /// Edge length of a grid cell (meters)
    cell_size_m: f64,
    /// Entries younger than this are trusted
    ttl: Duration,
    /// Last prune pass
    last_prune: Option<Instant>,
    /// Cache hit count for statistics
    hit_count: usize,
    /// Cache miss count for statistics
    miss_count: usize,
}

impl Default for SurfaceCache {
    fn default() -> Self {
        Self::new(0.5, Duration::from_millis(500))
    }
}

impl SurfaceCache {
    pub fn new(cell_size_m: f64, ttl: Duration) -> Self {
        Self {
            samples: HashMap::new(),
            cell_size_m: if cell_size_m > 0.0 { cell_size_m } else { 0.5 },
            ttl,
            last_prune: None,
            hit_count: 0,
            miss_count: 0,
        }
    }

    /// Quantize a local position to its grid cell
    pub fn cell_key(&self, x: f64, z: f64) -> CellKey {
        let quantize = |v: f64| {
            let cell = (v / self.cell_size_m).floor();
            // Non-finite coordinates all share one cell
            if cell.is_finite() { cell as i64 } else { i64::MIN }
        };
        (quantize(x), quantize(z))
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size_m
    }

    /// Fresh sample for the cell containing (x, z), counted as hit or miss
    pub fn get_fresh(&mut self, x: f64, z: f64, now: Instant) -> Option<SurfaceSample> {
        let key = self.cell_key(x, z);
        match self.samples.get(&key) {
            Some(sample) if now.saturating_duration_since(sample.sampled_at) < self.ttl => {
                self.hit_count += 1;
                Some(*sample)
            }
            _ => {
                self.miss_count += 1;
                None
            }
        }
    }

    /// Sample for the cell regardless of age
    pub fn get_any(&self, x: f64, z: f64) -> Option<SurfaceSample> {
        self.samples.get(&self.cell_key(x, z)).copied()
    }

    /// Store a result for the cell containing (x, z) and prune if due
    pub fn insert(&mut self, x: f64, z: f64, resolved_y: f64, source: GroundSource, now: Instant) {
        let key = self.cell_key(x, z);
        self.samples.insert(
            key,
            SurfaceSample {
                local_x: x,
                local_z: z,
                resolved_y,
                source,
                sampled_at: now,
            },
        );
        self.prune_if_needed(now);
    }

    /// Drop entries older than twice the TTL, at most once per that interval
    fn prune_if_needed(&mut self, now: Instant) {
        let horizon = self.ttl * 2;
        let due = match self.last_prune {
            Some(last) => now.saturating_duration_since(last) >= horizon,
            None => true,
        };
        if !due {
            return;
        }

        self.samples
            .retain(|_, sample| now.saturating_duration_since(sample.sampled_at) < horizon);
        self.last_prune = Some(now);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Get cache statistics (hits, misses, hit rate)
    pub fn get_statistics(&self) -> (usize, usize, f64) {
        let total = self.hit_count + self.miss_count;
        let hit_rate = if total > 0 {
            self.hit_count as f64 / total as f64
        } else {
            0.0
        };

        (self.hit_count, self.miss_count, hit_rate)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_prune = None;
    }
}
