//! Anchor table with quality/recency conflict resolution
//!
//! Every write, local or from a peer, goes through [`AnchorStore::put`] or
//! its batch form, so the final state never depends on which writer ran
//! first for a strictly better anchor.

use crate::core::{Anchor, LocalTransform, OriginBinding, ANCHOR_TABLE_KEY};
use crate::platform::PersistentKv;
use crate::utils::StoreConfig;
use crate::validation::{DataValidator, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a `put` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
    /// Existing anchor was better; incoming dropped
    Kept,
}

/// Summary of an applied batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
}

/// On-disk form of the anchor table
#[derive(Debug, Serialize, Deserialize)]
struct AnchorTable {
    version: u32,
    saved_at_ms: u64,
    anchors: Vec<Anchor>,
}

const TABLE_VERSION: u32 = 1;

/// In-memory anchor table backed by a [`PersistentKv`]
pub struct AnchorStore {
    anchors: HashMap<String, Anchor>,
    storage: Arc<dyn PersistentKv>,
    config: StoreConfig,
}

impl AnchorStore {
    pub fn new(storage: Arc<dyn PersistentKv>, config: StoreConfig) -> Self {
        Self {
            anchors: HashMap::new(),
            storage,
            config,
        }
    }

    /// Decide whether `incoming` should replace `existing`
    ///
    /// Same device always wins. Otherwise higher quality wins; a lower
    /// quality anchor wins only when it is newer than the existing one by
    /// more than the grace period. Equal quality resolves to the later
    /// verification time, then the greater device id, so peers converge
    /// regardless of arrival order.
    pub fn should_replace(&self, existing: &Anchor, incoming: &Anchor) -> bool {
        if existing.source_device_id == incoming.source_device_id {
            return true;
        }

        match incoming.quality_score.partial_cmp(&existing.quality_score) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => {
                match incoming.last_verified_at_ms.cmp(&existing.last_verified_at_ms) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => incoming.source_device_id > existing.source_device_id,
                }
            }
            _ => {
                incoming.last_verified_at_ms
                    > existing.last_verified_at_ms.saturating_add(self.config.conflict_grace_period_ms)
            }
        }
    }

    /// Insert or conflict-resolve a single anchor
    pub fn put(&mut self, anchor: Anchor) -> StoreResult<PutOutcome> {
        DataValidator::validate_anchor(&anchor).map_err(|issue| StoreError::InvalidAnchor {
            object_id: issue.object_id,
            reason: issue.reason,
        })?;

        match self.anchors.get(&anchor.object_id) {
            Some(existing) => {
                let replace = self.should_replace(existing, &anchor);
                if replace && existing.area_key != anchor.area_key {
                    // Moving areas needs room in the destination area
                    self.check_capacity(&anchor.area_key, 1)?;
                }
                if replace {
                    debug!(object_id = %anchor.object_id, quality = anchor.quality_score, "anchor replaced");
                    self.anchors.insert(anchor.object_id.clone(), anchor);
                    Ok(PutOutcome::Replaced)
                } else {
                    debug!(
                        object_id = %anchor.object_id,
                        incoming = anchor.quality_score,
                        existing = existing.quality_score,
                        "incoming anchor lost conflict"
                    );
                    Ok(PutOutcome::Kept)
                }
            }
            None => {
                self.check_capacity(&anchor.area_key, 1)?;
                debug!(object_id = %anchor.object_id, area = %anchor.area_key, "anchor inserted");
                self.anchors.insert(anchor.object_id.clone(), anchor);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    /// Apply many anchors all-or-nothing
    ///
    /// Validation and capacity are checked for the whole batch before the
    /// first write; a rejected batch leaves the table untouched.
    pub fn put_batch(&mut self, anchors: Vec<Anchor>) -> StoreResult<BatchOutcome> {
        for anchor in &anchors {
            DataValidator::validate_anchor(anchor).map_err(|issue| StoreError::InvalidAnchor {
                object_id: issue.object_id,
                reason: issue.reason,
            })?;
        }

        // Net new anchors per area, counting only those that would win their conflict
        let mut additions: HashMap<&str, usize> = HashMap::new();
        let mut seen: HashMap<&str, &Anchor> = HashMap::new();
        for anchor in &anchors {
            let current = seen
                .get(anchor.object_id.as_str())
                .copied()
                .or_else(|| self.anchors.get(&anchor.object_id));
            match current {
                None => *additions.entry(anchor.area_key.as_str()).or_insert(0) += 1,
                Some(existing) => {
                    if existing.area_key != anchor.area_key && self.should_replace(existing, anchor) {
                        *additions.entry(anchor.area_key.as_str()).or_insert(0) += 1;
                    } else if !self.should_replace(existing, anchor) {
                        continue;
                    }
                }
            }
            seen.insert(anchor.object_id.as_str(), anchor);
        }
        for (area, count) in &additions {
            self.check_capacity(area, *count)?;
        }

        let mut outcome = BatchOutcome::default();
        for anchor in anchors {
            match self.put(anchor)? {
                PutOutcome::Inserted => outcome.inserted += 1,
                PutOutcome::Replaced => outcome.replaced += 1,
                PutOutcome::Kept => outcome.kept += 1,
            }
        }
        Ok(outcome)
    }

    /// Local update that moves an anchor into a new frame
    ///
    /// Transform and binding are replaced together. The anchor keeps its
    /// source device, so the write replaces the stored copy through the
    /// same-device rule.
    pub fn rebind(
        &mut self,
        object_id: &str,
        local_transform: LocalTransform,
        origin_binding: OriginBinding,
        now_ms: u64,
    ) -> StoreResult<Option<Anchor>> {
        let Some(existing) = self.anchors.get(object_id) else {
            return Ok(None);
        };
        let updated = existing.rebound(local_transform, origin_binding, now_ms);
        self.put(updated.clone())?;
        Ok(Some(updated))
    }

    pub fn get(&self, object_id: &str) -> Option<&Anchor> {
        self.anchors.get(object_id)
    }

    pub fn remove(&mut self, object_id: &str) -> Option<Anchor> {
        let removed = self.anchors.remove(object_id);
        if removed.is_some() {
            debug!(object_id, "anchor removed");
        }
        removed
    }

    /// All anchors ordered by object id
    pub fn all(&self) -> Vec<Anchor> {
        let mut anchors: Vec<Anchor> = self.anchors.values().cloned().collect();
        anchors.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        anchors
    }

    pub fn in_area(&self, area_key: &str) -> Vec<Anchor> {
        let mut anchors: Vec<Anchor> = self
            .anchors
            .values()
            .filter(|a| a.area_key == area_key)
            .cloned()
            .collect();
        anchors.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        anchors
    }

    pub fn count_in_area(&self, area_key: &str) -> usize {
        self.anchors.values().filter(|a| a.area_key == area_key).count()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn mean_quality(&self) -> Option<f64> {
        if self.anchors.is_empty() {
            return None;
        }
        let total: f64 = self.anchors.values().map(|a| a.quality_score).sum();
        Some(total / self.anchors.len() as f64)
    }

    /// Persist the whole table under [`ANCHOR_TABLE_KEY`]
    pub fn save_all(&self, now_ms: u64) -> StoreResult<()> {
        let table = AnchorTable {
            version: TABLE_VERSION,
            saved_at_ms: now_ms,
            anchors: self.all(),
        };
        let bytes = serde_json::to_vec(&table).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;

        self.storage.save(ANCHOR_TABLE_KEY, &bytes)?;
        info!(count = table.anchors.len(), "anchor table saved");
        Ok(())
    }

    /// Replace the in-memory table with the persisted one
    ///
    /// Returns the number of anchors loaded. Nothing persisted yet loads an
    /// empty table; a corrupt record is an error and keeps memory unchanged.
    pub fn load_all(&mut self) -> StoreResult<usize> {
        let Some(bytes) = self.storage.load(ANCHOR_TABLE_KEY)? else {
            info!("no persisted anchor table");
            return Ok(0);
        };

        let table: AnchorTable = serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;

        let mut loaded = HashMap::with_capacity(table.anchors.len());
        let mut per_area: HashMap<String, usize> = HashMap::new();
        for anchor in table.anchors {
            if let Err(issue) = DataValidator::validate_anchor(&anchor) {
                warn!(object_id = %issue.object_id, reason = %issue.reason, "skipping invalid persisted anchor");
                continue;
            }
            let count = per_area.entry(anchor.area_key.clone()).or_insert(0);
            if *count >= self.config.max_anchors_per_area {
                warn!(object_id = %anchor.object_id, area = %anchor.area_key, "persisted anchor over capacity, skipped");
                continue;
            }
            *count += 1;
            loaded.insert(anchor.object_id.clone(), anchor);
        }

        let count = loaded.len();
        self.anchors = loaded;
        info!(count, "anchor table loaded");
        Ok(count)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn check_capacity(&self, area_key: &str, additional: usize) -> StoreResult<()> {
        let current = self.count_in_area(area_key);
        let limit = self.config.max_anchors_per_area;
        if current + additional > limit {
            warn!(area = area_key, current, limit, "anchor capacity exceeded");
            return Err(StoreError::CapacityExceeded {
                area_key: area_key.to_string(),
                current,
                limit,
            });
        }
        Ok(())
    }
}
