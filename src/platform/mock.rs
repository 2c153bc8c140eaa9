//! Mock collaborators for testing and development

use crate::core::{LocalTransform, SurfaceHit, TrackingQualitySignals};
use crate::platform::{ReceiveHandler, RelocalizationCallback, TrackingSession, TrackingSurfaceQuery, Transport};
use crate::validation::{PlatformError, PlatformResult};
use nalgebra::Vector3;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Scripted horizontal surfaces
///
/// A ray hits every surface whose horizontal distance from the ray's X/Z is
/// within `reach_m`, and that lies below the ray origin.
pub struct MockSurfaceQuery {
    surfaces: Mutex<Vec<SurfaceHit>>,
    reach_m: f64,
    query_count: AtomicUsize,
}

impl MockSurfaceQuery {
    pub fn new(surfaces: Vec<SurfaceHit>) -> Self {
        Self::with_reach(surfaces, 0.2)
    }

    pub fn with_reach(surfaces: Vec<SurfaceHit>, reach_m: f64) -> Self {
        Self {
            surfaces: Mutex::new(surfaces),
            reach_m,
            query_count: AtomicUsize::new(0),
        }
    }

    /// No surfaces at all
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn set_surfaces(&self, surfaces: Vec<SurfaceHit>) {
        *self.surfaces.lock().unwrap_or_else(|e| e.into_inner()) = surfaces;
    }

    /// Number of raycasts issued so far
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }
}

impl TrackingSurfaceQuery for MockSurfaceQuery {
    fn raycast_horizontal_surfaces(&self, origin: Vector3<f64>, _direction: Vector3<f64>) -> Vec<SurfaceHit> {
        self.query_count.fetch_add(1, Ordering::SeqCst);

        self.surfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|hit| {
                let dx = hit.x - origin.x;
                let dz = hit.z - origin.z;
                (dx * dx + dz * dz).sqrt() <= self.reach_m && hit.y <= origin.y
            })
            .copied()
            .collect()
    }
}

/// How the mock session answers `apply_snapshot_blob`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelocalizationBehavior {
    Succeed,
    Fail,
    /// Hold the completion and never call it
    NeverComplete,
}

/// Tracking session with settable pose and quality signals
pub struct MockTrackingSession {
    pose: Mutex<LocalTransform>,
    signals: Mutex<TrackingQualitySignals>,
    blob: Mutex<Vec<u8>>,
    capture_error: Mutex<Option<PlatformError>>,
    behavior: Mutex<RelocalizationBehavior>,
    applied_blobs: Mutex<Vec<Vec<u8>>>,
    pending_completions: Mutex<Vec<RelocalizationCallback>>,
    capture_count: AtomicUsize,
    /// While true, `capture_snapshot_blob` blocks after counting the call
    capture_hold: (Mutex<bool>, Condvar),
}

impl MockTrackingSession {
    pub fn new() -> Self {
        Self {
            pose: Mutex::new(LocalTransform::from_position(0.0, 1.6, 0.0)),
            signals: Mutex::new(TrackingQualitySignals::default()),
            blob: Mutex::new(b"mock-world-map".to_vec()),
            capture_error: Mutex::new(None),
            behavior: Mutex::new(RelocalizationBehavior::Succeed),
            applied_blobs: Mutex::new(Vec::new()),
            pending_completions: Mutex::new(Vec::new()),
            capture_count: AtomicUsize::new(0),
            capture_hold: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Session whose signals score highly under the default weights
    pub fn well_mapped() -> Self {
        let session = Self::new();
        session.set_signals(TrackingQualitySignals {
            point_count: 1200,
            plane_count: 6,
            feature_density: 1.0,
            reference_positions: (0..8)
                .map(|i| {
                    let angle = i as f64 * std::f64::consts::FRAC_PI_4;
                    Vector3::new(3.0 * angle.cos(), 0.0, 3.0 * angle.sin())
                })
                .collect(),
        });
        session
    }

    pub fn set_pose(&self, pose: LocalTransform) {
        *self.pose.lock().unwrap_or_else(|e| e.into_inner()) = pose;
    }

    pub fn set_signals(&self, signals: TrackingQualitySignals) {
        *self.signals.lock().unwrap_or_else(|e| e.into_inner()) = signals;
    }

    pub fn set_blob(&self, blob: Vec<u8>) {
        *self.blob.lock().unwrap_or_else(|e| e.into_inner()) = blob;
    }

    pub fn set_capture_error(&self, error: Option<PlatformError>) {
        *self.capture_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn set_relocalization(&self, behavior: RelocalizationBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Blobs handed to `apply_snapshot_blob`, in call order
    pub fn applied_blobs(&self) -> Vec<Vec<u8>> {
        self.applied_blobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn capture_count(&self) -> usize {
        self.capture_count.load(Ordering::SeqCst)
    }

    /// Make subsequent captures block until `release_captures`
    pub fn hold_captures(&self) {
        *self.capture_hold.0.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn release_captures(&self) {
        let (held, wake) = &self.capture_hold;
        *held.lock().unwrap_or_else(|e| e.into_inner()) = false;
        wake.notify_all();
    }
}

impl Default for MockTrackingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingSession for MockTrackingSession {
    fn current_observer_pose(&self) -> LocalTransform {
        *self.pose.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_tracking_quality_signals(&self) -> TrackingQualitySignals {
        self.signals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn capture_snapshot_blob(&self) -> PlatformResult<Vec<u8>> {
        self.capture_count.fetch_add(1, Ordering::SeqCst);
        let (held, wake) = &self.capture_hold;
        let mut blocked = held.lock().unwrap_or_else(|e| e.into_inner());
        while *blocked {
            blocked = wake.wait(blocked).unwrap_or_else(|e| e.into_inner());
        }
        drop(blocked);

        if let Some(error) = self.capture_error.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(error);
        }
        Ok(self.blob.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn apply_snapshot_blob(&self, blob: Vec<u8>, completion: RelocalizationCallback) {
        self.applied_blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(blob);

        let behavior = *self.behavior.lock().unwrap_or_else(|e| e.into_inner());
        match behavior {
            RelocalizationBehavior::Succeed => completion(true),
            RelocalizationBehavior::Fail => completion(false),
            RelocalizationBehavior::NeverComplete => self
                .pending_completions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(completion),
        }
    }
}

/// In-process transport; `deliver` simulates an inbound message
pub struct LoopbackTransport {
    handler: Mutex<Option<ReceiveHandler>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    unreachable: Mutex<HashSet<String>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    /// Make sends to `peer_id` fail until cleared
    pub fn set_unreachable(&self, peer_id: &str, unreachable: bool) {
        let mut peers = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        if unreachable {
            peers.insert(peer_id.to_string());
        } else {
            peers.remove(peer_id);
        }
    }

    /// Messages sent so far as `(peer_id, payload)`
    pub fn sent_messages(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Hand a payload to the registered handler; returns false if none is registered
    pub fn deliver(&self, from_peer: &str, payload: Vec<u8>) -> bool {
        match self.handler.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(handler) => {
                handler(from_peer, payload);
                true
            }
            None => false,
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, peer_id: &str, payload: &[u8]) -> PlatformResult<()> {
        if self.unreachable.lock().unwrap_or_else(|e| e.into_inner()).contains(peer_id) {
            return Err(PlatformError::PeerUnreachable {
                peer_id: peer_id.to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((peer_id.to_string(), payload.to_vec()));
        Ok(())
    }

    fn on_receive(&self, handler: ReceiveHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }
}
