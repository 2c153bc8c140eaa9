//! World snapshot capture, persistence and relocalization
//!
//! One snapshot is retained per area key. Capture is gated on the assessed
//! quality of the live map, and only one capture runs at a time: a request
//! made while another is in flight is coalesced into it.

use crate::core::{WorldSnapshot, TrackingQualitySignals, SNAPSHOT_KEY_PREFIX};
use crate::persistence::quality::{assess_quality, QualityBreakdown};
use crate::platform::{PersistentKv, TrackingSession};
use crate::utils::SnapshotConfig;
use crate::validation::{DataValidator, PlatformError, SnapshotError, SnapshotResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of feeding a snapshot to the tracking session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocalizationOutcome {
    Relocalized,
    /// Session reported that the map did not match its surroundings
    Failed,
    /// Attempt abandoned after the timeout
    TimedOut { timeout_ms: u64 },
}

impl RelocalizationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelocalizationOutcome::Relocalized)
    }
}

/// Where a background capture stands with respect to its waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureClaim {
    Pending,
    /// Worker persisted its snapshot; the result is on its way
    Committed,
    /// Waiter gave up; the worker must not persist anything
    Abandoned,
}

/// Pending background capture
pub struct CaptureTicket {
    area_key: String,
    receiver: Receiver<SnapshotResult<Option<WorldSnapshot>>>,
    claim: Arc<Mutex<CaptureClaim>>,
}

impl CaptureTicket {
    pub fn area_key(&self) -> &str {
        &self.area_key
    }

    /// Result if the capture has finished, without blocking
    pub fn try_result(&self) -> Option<SnapshotResult<Option<WorldSnapshot>>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SnapshotError::WorkerLost)),
        }
    }

    /// Block up to `timeout`
    ///
    /// An expired wait abandons the capture: the worker keeps running until
    /// the session hands back its blob, then discards it without persisting.
    pub fn wait(self, timeout: Duration) -> SnapshotResult<Option<WorldSnapshot>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut claim = lock(&self.claim);
                if *claim == CaptureClaim::Committed {
                    drop(claim);
                    // Commit finished while the wait expired; the send follows it
                    return self.receiver.recv().unwrap_or(Err(SnapshotError::WorkerLost));
                }
                *claim = CaptureClaim::Abandoned;
                warn!(area = %self.area_key, timeout_ms = timeout.as_millis() as u64, "background capture abandoned");
                Err(SnapshotError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SnapshotError::WorkerLost),
        }
    }
}

/// Everything a capture needs, shareable with a worker thread
#[derive(Clone)]
struct CaptureContext {
    session: Arc<dyn TrackingSession>,
    storage: Arc<dyn PersistentKv>,
    config: SnapshotConfig,
    retained: Arc<Mutex<HashMap<String, WorldSnapshot>>>,
}

/// Clears the in-flight flag when the capture ends, however it ends
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Captures, scores, persists and restores tracking-space snapshots
pub struct WorldSnapshotService {
    context: CaptureContext,
    capture_in_flight: Arc<AtomicBool>,
    last_relocalization: Option<RelocalizationOutcome>,
}

impl WorldSnapshotService {
    pub fn new(session: Arc<dyn TrackingSession>, storage: Arc<dyn PersistentKv>, config: SnapshotConfig) -> Self {
        Self {
            context: CaptureContext {
                session,
                storage,
                config,
                retained: Arc::new(Mutex::new(HashMap::new())),
            },
            capture_in_flight: Arc::new(AtomicBool::new(false)),
            last_relocalization: None,
        }
    }

    pub fn storage_key(area_key: &str) -> String {
        format!("{}{}", SNAPSHOT_KEY_PREFIX, area_key)
    }

    /// Score a set of tracking signals
    pub fn assess_quality(&self, signals: &TrackingQualitySignals) -> f64 {
        assess_quality(signals, &self.context.config).score
    }

    pub fn assess_breakdown(&self, signals: &TrackingQualitySignals) -> QualityBreakdown {
        assess_quality(signals, &self.context.config)
    }

    /// Score the live session's current map
    pub fn current_quality(&self) -> f64 {
        self.assess_quality(&self.context.session.current_tracking_quality_signals())
    }

    /// Capture and persist a snapshot for `area_key` if the live map is good enough
    ///
    /// `Ok(None)` means nothing was persisted: quality below the minimum, not
    /// materially better than the retained snapshot, or another capture in
    /// flight.
    pub fn capture(&self, area_key: &str, now_ms: u64) -> SnapshotResult<Option<WorldSnapshot>> {
        let Some(_guard) = InFlightGuard::acquire(&self.capture_in_flight) else {
            debug!(area = area_key, "capture already in flight, coalesced");
            return Ok(None);
        };
        capture_into(&self.context, area_key, now_ms, None)
    }

    /// `capture` bounded by `timeout`; an expired capture is abandoned
    ///
    /// The in-flight flag stays set until the abandoned worker returns, so
    /// later requests coalesce into it rather than piling up.
    pub fn capture_within(&self, area_key: &str, now_ms: u64, timeout: Duration) -> SnapshotResult<Option<WorldSnapshot>> {
        match self.request_background_capture(area_key, now_ms) {
            Some(ticket) => ticket.wait(timeout),
            None => Ok(None),
        }
    }

    /// Run a capture on a worker thread; `None` if one is already in flight
    pub fn request_background_capture(&self, area_key: &str, now_ms: u64) -> Option<CaptureTicket> {
        let Some(guard) = InFlightGuard::acquire(&self.capture_in_flight) else {
            debug!(area = area_key, "background capture coalesced into the running one");
            return None;
        };

        let (sender, receiver) = mpsc::channel();
        let claim = Arc::new(Mutex::new(CaptureClaim::Pending));
        let context = self.context.clone();
        let area = area_key.to_string();
        let worker_claim = Arc::clone(&claim);
        thread::spawn(move || {
            let _guard = guard;
            let result = capture_into(&context, &area, now_ms, Some(&worker_claim));
            // Receiver may have given up waiting
            let _ = sender.send(result);
        });

        Some(CaptureTicket {
            area_key: area_key.to_string(),
            receiver,
            claim,
        })
    }

    pub fn capture_in_flight(&self) -> bool {
        self.capture_in_flight.load(Ordering::Acquire)
    }

    /// Load the persisted snapshot for `area_key` and retain it
    pub fn restore(&self, area_key: &str) -> SnapshotResult<Option<WorldSnapshot>> {
        let Some(bytes) = self.context.storage.load(&Self::storage_key(area_key))? else {
            info!(area = area_key, "no persisted world snapshot");
            return Ok(None);
        };

        let snapshot: WorldSnapshot = serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Serialization {
            area_key: area_key.to_string(),
            message: e.to_string(),
        })?;
        DataValidator::validate_snapshot(&snapshot).map_err(|message| SnapshotError::Serialization {
            area_key: area_key.to_string(),
            message,
        })?;

        info!(area = area_key, quality = snapshot.quality_score, "world snapshot restored");
        lock(&self.context.retained).insert(area_key.to_string(), snapshot.clone());
        Ok(Some(snapshot))
    }

    /// Hand a snapshot to the session and wait, bounded, for relocalization
    pub fn apply_to_session(&mut self, snapshot: &WorldSnapshot) -> RelocalizationOutcome {
        let timeout = self.context.config.relocalization_timeout();
        self.apply_to_session_within(snapshot, timeout)
    }

    pub fn apply_to_session_within(&mut self, snapshot: &WorldSnapshot, timeout: Duration) -> RelocalizationOutcome {
        let (sender, receiver) = mpsc::channel();
        self.context.session.apply_snapshot_blob(
            snapshot.blob.clone(),
            Box::new(move |relocalized| {
                let _ = sender.send(relocalized);
            }),
        );

        let outcome = match receiver.recv_timeout(timeout) {
            Ok(true) => RelocalizationOutcome::Relocalized,
            Ok(false) => RelocalizationOutcome::Failed,
            Err(RecvTimeoutError::Timeout) => RelocalizationOutcome::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            },
            // Session dropped the completion without answering
            Err(RecvTimeoutError::Disconnected) => RelocalizationOutcome::Failed,
        };

        match outcome {
            RelocalizationOutcome::Relocalized => {
                info!(area = %snapshot.area_key, "relocalized against world snapshot")
            }
            _ => warn!(area = %snapshot.area_key, ?outcome, "relocalization did not complete"),
        }
        self.last_relocalization = Some(outcome);
        outcome
    }

    /// Adopt a peer's snapshot if it beats the retained one by `margin`
    ///
    /// The in-memory replacement cannot fail; persisting it is best effort.
    pub fn offer_peer_snapshot(&self, snapshot: WorldSnapshot, margin: f64) -> bool {
        if let Err(reason) = DataValidator::validate_snapshot(&snapshot) {
            warn!(area = %snapshot.area_key, %reason, "peer snapshot rejected");
            return false;
        }

        let mut retained = lock(&self.context.retained);
        if let Some(local) = retained.get(&snapshot.area_key) {
            if snapshot.quality_score <= local.quality_score + margin {
                debug!(
                    area = %snapshot.area_key,
                    peer = snapshot.quality_score,
                    local = local.quality_score,
                    "peer snapshot not materially better"
                );
                return false;
            }
        }

        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = self.context.storage.save(&Self::storage_key(&snapshot.area_key), &bytes) {
                    warn!(area = %snapshot.area_key, error = %e, "failed to persist peer snapshot");
                }
            }
            Err(e) => warn!(area = %snapshot.area_key, error = %e, "failed to encode peer snapshot"),
        }

        info!(area = %snapshot.area_key, quality = snapshot.quality_score, "adopted peer world snapshot");
        retained.insert(snapshot.area_key.clone(), snapshot);
        true
    }

    /// Retained snapshot for an area
    pub fn current(&self, area_key: &str) -> Option<WorldSnapshot> {
        lock(&self.context.retained).get(area_key).cloned()
    }

    /// `(area_key, quality)` of every retained snapshot, sorted by area
    pub fn retained_qualities(&self) -> Vec<(String, f64)> {
        let mut qualities: Vec<(String, f64)> = lock(&self.context.retained)
            .iter()
            .map(|(area, snapshot)| (area.clone(), snapshot.quality_score))
            .collect();
        qualities.sort_by(|a, b| a.0.cmp(&b.0));
        qualities
    }

    pub fn last_relocalization(&self) -> Option<RelocalizationOutcome> {
        self.last_relocalization
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.context.config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether a capture of `quality` should replace `existing`
fn supersedes(existing: Option<&WorldSnapshot>, quality: f64, now_ms: u64, config: &SnapshotConfig) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    let materially_better = quality >= existing.quality_score + config.improvement_margin;
    let expired = now_ms.saturating_sub(existing.captured_at_ms) > config.max_snapshot_age_ms;
    materially_better || expired
}

fn capture_into(
    context: &CaptureContext,
    area_key: &str,
    now_ms: u64,
    claim: Option<&Mutex<CaptureClaim>>,
) -> SnapshotResult<Option<WorldSnapshot>> {
    let config = &context.config;
    let quality = assess_quality(&context.session.current_tracking_quality_signals(), config).score;

    if quality < config.min_quality {
        info!(area = area_key, quality, minimum = config.min_quality, "map quality too low, snapshot not captured");
        return Ok(None);
    }

    if !supersedes(lock(&context.retained).get(area_key), quality, now_ms, config) {
        debug!(area = area_key, quality, "retained snapshot still preferred");
        return Ok(None);
    }

    let blob = context.session.capture_snapshot_blob()?;
    if blob.is_empty() {
        return Err(PlatformError::CaptureFailed {
            reason: "session returned an empty snapshot".to_string(),
        }
        .into());
    }

    let snapshot = WorldSnapshot {
        blob,
        quality_score: quality,
        captured_at_ms: now_ms,
        area_key: area_key.to_string(),
    };
    let bytes = serde_json::to_vec(&snapshot).map_err(|e| SnapshotError::Serialization {
        area_key: area_key.to_string(),
        message: e.to_string(),
    })?;

    // Claim before retained; the waiter only ever takes the claim
    let mut claim = claim.map(lock);
    if claim.as_deref() == Some(&CaptureClaim::Abandoned) {
        warn!(area = area_key, quality, "capture finished after its waiter gave up, discarded");
        return Ok(None);
    }

    // The retained snapshot may have changed while the blob was captured
    let mut retained = lock(&context.retained);
    if !supersedes(retained.get(area_key), quality, now_ms, config) {
        debug!(area = area_key, quality, "snapshot adopted during capture is preferred, discarded");
        return Ok(None);
    }

    context.storage.save(&WorldSnapshotService::storage_key(area_key), &bytes)?;
    retained.insert(area_key.to_string(), snapshot.clone());
    if let Some(claim) = claim.as_deref_mut() {
        *claim = CaptureClaim::Committed;
    }

    info!(area = area_key, quality, bytes = bytes.len(), "world snapshot persisted");
    Ok(Some(snapshot))
}
