//! Session facade tying the anchoring components together

use crate::algorithms::{gps_to_local_offset, local_offset_to_gps, DriftCorrector, DriftReport, SurfaceGroundingEngine};
use crate::api::diagnostics::Diagnostics;
use crate::api::types::{Collaborators, SessionEndReport, SessionStartReport};
use crate::core::{current_timestamp_ms, Anchor, GeoPoint, GroundSource, LocalTransform, ObjectClass, OriginBinding, SyncBundle, WorldSnapshot};
use crate::persistence::{AnchorStore, CaptureTicket, WorldSnapshotService};
use crate::platform::{TrackingSession, Transport};
use crate::sync::{AnchorSyncCoordinator, ImportReport, SyncContext};
use crate::utils::AnchoringConfig;
use crate::validation::{SessionError, SessionResult, SnapshotResult, SyncResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One AR session on one device
pub struct AnchoringSession {
    config: AnchoringConfig,
    device_id: String,
    session_id: String,
    tracking: Arc<dyn TrackingSession>,
    grounding: SurfaceGroundingEngine,
    store: AnchorStore,
    snapshots: WorldSnapshotService,
    drift: DriftCorrector,
    sync: AnchorSyncCoordinator,
    origin: Option<OriginBinding>,
    pending_capture: Option<CaptureTicket>,
}

impl AnchoringSession {
    /// Build a session; the configuration is validated first
    pub fn new(config: AnchoringConfig, device_id: impl Into<String>, collaborators: Collaborators) -> SessionResult<Self> {
        if let Some(error) = config.validate().into_iter().next() {
            return Err(error.into());
        }

        let device_id = device_id.into();
        let session_id = format!("{}-{}", device_id, current_timestamp_ms());

        Ok(Self {
            grounding: SurfaceGroundingEngine::new(collaborators.surface_query, config.grounding.clone()),
            store: AnchorStore::new(collaborators.anchor_storage, config.store.clone()),
            snapshots: WorldSnapshotService::new(
                Arc::clone(&collaborators.tracking),
                collaborators.snapshot_storage,
                config.snapshot.clone(),
            ),
            drift: DriftCorrector::new(config.drift.clone()),
            sync: AnchorSyncCoordinator::new(device_id.clone(), config.sync.clone()),
            tracking: collaborators.tracking,
            origin: None,
            pending_capture: None,
            config,
            device_id,
            session_id,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &AnchoringConfig {
        &self.config
    }

    pub fn origin(&self) -> Option<&OriginBinding> {
        self.origin.as_ref()
    }

    pub fn store(&self) -> &AnchorStore {
        &self.store
    }

    pub fn snapshots(&self) -> &WorldSnapshotService {
        &self.snapshots
    }

    pub fn sync(&self) -> &AnchorSyncCoordinator {
        &self.sync
    }

    pub fn grounding(&self) -> &SurfaceGroundingEngine {
        &self.grounding
    }

    /// Offer a GPS fix as the session origin
    ///
    /// The first fix within the accuracy limit becomes the origin for the
    /// rest of the session; later fixes are ignored. Binding runs drift
    /// correction so loaded and provisional anchors move into this frame.
    pub fn bind_origin(&mut self, gps: GeoPoint, accuracy_m: f64, now_ms: u64) -> Option<DriftReport> {
        if self.origin.is_some() {
            return None;
        }
        if !gps.is_valid() || !accuracy_m.is_finite() || accuracy_m > self.config.session.max_origin_fix_accuracy_m {
            debug!(accuracy_m, limit = self.config.session.max_origin_fix_accuracy_m, "GPS fix not usable as origin");
            return None;
        }

        let binding = OriginBinding::new(gps, self.session_id.clone(), now_ms);
        info!(
            latitude = gps.latitude,
            longitude = gps.longitude,
            accuracy_m,
            session = %self.session_id,
            "session origin bound"
        );
        let report = self.drift.check_and_correct(&mut self.store, &binding, now_ms);
        self.origin = Some(binding);
        Some(report)
    }

    /// Place an object at a GPS coordinate, resting on the nearest surface
    pub fn place_object(&mut self, object_id: &str, gps: GeoPoint, class: ObjectClass) -> SessionResult<Anchor> {
        self.place_object_at(object_id, gps, class, current_timestamp_ms(), Instant::now())
    }

    /// [`place_object`] with explicit wall-clock and monotonic time
    ///
    /// Without a bound origin the object is placed provisionally at the
    /// observer's position, under a binding derived from the target
    /// coordinate; binding the origin later moves it to the target.
    ///
    /// [`place_object`]: AnchoringSession::place_object
    pub fn place_object_at(
        &mut self,
        object_id: &str,
        gps: GeoPoint,
        class: ObjectClass,
        now_ms: u64,
        now: Instant,
    ) -> SessionResult<Anchor> {
        let observer = self.tracking.current_observer_pose().position;
        let observer_y = if observer.y.is_finite() { observer.y } else { 0.0 };
        let offset = self.config.grounding.fallback_offset(class);

        let (x, z, binding, mut quality) = match &self.origin {
            Some(origin) => {
                let (dx, dz) = gps_to_local_offset(&gps, origin);
                (dx, dz, origin.clone(), self.placement_quality())
            }
            None => {
                let (ox, oz) = if observer.x.is_finite() && observer.z.is_finite() {
                    (observer.x, observer.z)
                } else {
                    (0.0, 0.0)
                };
                // Local (ox, oz) maps to the target coordinate under this binding
                let target = OriginBinding::new(gps, self.session_id.clone(), now_ms);
                let origin_gps = local_offset_to_gps(-ox, -oz, &target);
                let binding = OriginBinding::provisional(origin_gps, format!("{}-provisional", self.session_id), now_ms);
                let quality = self.placement_quality() * self.config.session.provisional_quality_factor;
                info!(object_id, "no origin yet, placing provisionally at the observer");
                (ox, oz, binding, quality)
            }
        };

        let ground = self.grounding.resolve_detailed(x, z, observer_y, offset, now);
        if ground.source == GroundSource::Fallback {
            quality *= self.config.session.fallback_quality_factor;
        }

        let transform = LocalTransform::from_position(x, ground.y, z);
        let anchor = Anchor::new(object_id, transform, binding, quality, self.device_id.clone(), now_ms)
            .in_area(self.config.session.area_key.clone());
        let outcome = self.store.put(anchor.clone())?;
        debug!(object_id, ?outcome, x, y = ground.y, z, quality, "object placed");

        Ok(self.store.get(object_id).cloned().unwrap_or(anchor))
    }

    /// Base placement quality from the live map, in [0.5, 1.0]
    fn placement_quality(&self) -> f64 {
        0.5 + 0.5 * self.snapshots.current_quality()
    }

    pub fn remove_object(&mut self, object_id: &str) -> SessionResult<Anchor> {
        self.store.remove(object_id).ok_or_else(|| SessionError::UnknownObject {
            object_id: object_id.to_string(),
        })
    }

    /// Restore the area's snapshot and relocalize, then load anchors and correct drift
    ///
    /// Never fails: each step that cannot complete is recorded in the
    /// report and the session continues as a fresh one.
    pub fn on_session_start(&mut self) -> SessionStartReport {
        let mut report = SessionStartReport::default();
        let area = self.config.session.area_key.clone();

        match self.snapshots.restore(&area) {
            Ok(Some(snapshot)) => {
                report.snapshot_restored = true;
                report.relocalization = Some(self.snapshots.apply_to_session(&snapshot));
            }
            Ok(None) => {}
            Err(e) => warn!(area = %area, error = %e, "world snapshot could not be restored"),
        }

        match self.store.load_all() {
            Ok(count) => report.anchors_loaded = count,
            Err(e) => {
                warn!(error = %e, "anchor table could not be loaded, starting empty");
                report.load_error = Some(e.to_string());
            }
        }

        if let Some(origin) = &self.origin {
            report.drift = Some(self.drift.check_and_correct(&mut self.store, origin, current_timestamp_ms()));
        }

        info!(
            snapshot_restored = report.snapshot_restored,
            relocalized = report.relocalized(),
            anchors = report.anchors_loaded,
            "session started"
        );
        report
    }

    /// Persist anchors and capture a snapshot if the map is good enough
    ///
    /// The capture is bounded by `snapshot.capture_timeout_ms`; one that runs
    /// over is abandoned and reported in `capture_error`.
    pub fn on_session_end(&mut self) -> SessionResult<SessionEndReport> {
        self.on_session_end_at(current_timestamp_ms())
    }

    pub fn on_session_end_at(&mut self, now_ms: u64) -> SessionResult<SessionEndReport> {
        self.store.save_all(now_ms)?;
        let mut report = SessionEndReport {
            anchors_saved: self.store.len(),
            ..SessionEndReport::default()
        };

        let timeout = self.snapshots.config().capture_timeout();
        match self.snapshots.capture_within(&self.config.session.area_key, now_ms, timeout) {
            Ok(snapshot) => report.snapshot_quality = snapshot.map(|s| s.quality_score),
            Err(e) => {
                warn!(error = %e, "snapshot capture at session end failed");
                report.capture_error = Some(e.to_string());
            }
        }

        info!(anchors = report.anchors_saved, snapshot_quality = ?report.snapshot_quality, "session ended");
        Ok(report)
    }

    /// Start a snapshot capture off the calling thread; false if one is already running
    pub fn request_snapshot_capture(&mut self, now_ms: u64) -> bool {
        if self.pending_capture.is_some() {
            return false;
        }
        self.pending_capture = self
            .snapshots
            .request_background_capture(&self.config.session.area_key, now_ms);
        self.pending_capture.is_some()
    }

    /// Result of the background capture once it has finished
    pub fn poll_snapshot_capture(&mut self) -> Option<SnapshotResult<Option<WorldSnapshot>>> {
        let result = self.pending_capture.as_ref()?.try_result()?;
        self.pending_capture = None;
        Some(result)
    }

    pub fn export_bundle(&self, now_ms: u64) -> SyncBundle {
        self.sync
            .export_bundle(&self.store, &self.snapshots, &self.config.session.area_key, now_ms)
    }

    pub fn import_bundle(&mut self, peer_id: &str, bundle: SyncBundle, now_ms: u64) -> SyncResult<ImportReport> {
        let mut ctx = SyncContext {
            store: &mut self.store,
            snapshots: &self.snapshots,
            drift: &self.drift,
            current_origin: self.origin.as_ref(),
            now_ms,
        };
        self.sync.import_bundle(peer_id, bundle, &mut ctx)
    }

    pub fn attach_transport(&mut self, transport: Arc<dyn Transport>) {
        self.sync.attach_transport(transport);
    }

    /// Export this area and send it to a peer
    pub fn push_to_peer(&mut self, peer_id: &str, now_ms: u64) -> SyncResult<()> {
        let bundle = self.export_bundle(now_ms);
        self.sync.push_to_peer(peer_id, &bundle)
    }

    /// Apply everything received from peers since the last call
    pub fn process_inbox(&mut self, now_ms: u64) -> Vec<SyncResult<ImportReport>> {
        let mut ctx = SyncContext {
            store: &mut self.store,
            snapshots: &self.snapshots,
            drift: &self.drift,
            current_origin: self.origin.as_ref(),
            now_ms,
        };
        self.sync.process_inbox(&mut ctx)
    }

    pub fn reset_peer(&mut self, peer_id: &str) {
        self.sync.reset_peer(peer_id);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let area = &self.config.session.area_key;
        Diagnostics {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            origin_bound: self.origin.is_some(),
            anchor_count: self.store.len(),
            anchors_in_area: self.store.count_in_area(area),
            provisional_anchors: self
                .store
                .all()
                .iter()
                .filter(|anchor| anchor.origin_binding.provisional)
                .count(),
            mean_anchor_quality: self.store.mean_quality(),
            live_map_quality: self.snapshots.current_quality(),
            snapshot_qualities: self.snapshots.retained_qualities(),
            capture_in_flight: self.snapshots.capture_in_flight(),
            last_relocalization: self.snapshots.last_relocalization(),
            grounding: self.grounding.statistics(),
            peers: self.sync.peer_states(),
            pending_inbound: self.sync.pending_inbound(),
            dropped_inbound: self.sync.dropped_inbound(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::destination_point;
    use crate::core::SurfaceHit;
    use crate::persistence::RelocalizationOutcome;
    use crate::platform::{MemoryKv, MockSurfaceQuery, MockTrackingSession};
    use crate::validation::{ConfigError, StoreError};
    use std::time::Duration;

    const ORIGIN: (f64, f64) = (37.7749, -122.4194);

    struct Rig {
        surfaces: Arc<MockSurfaceQuery>,
        tracking: Arc<MockTrackingSession>,
        storage: Arc<MemoryKv>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                surfaces: Arc::new(MockSurfaceQuery::empty()),
                tracking: Arc::new(MockTrackingSession::new()),
                storage: Arc::new(MemoryKv::new()),
            }
        }

        fn session(&self, device: &str) -> AnchoringSession {
            self.session_with(device, AnchoringConfig::default())
        }

        fn session_with(&self, device: &str, config: AnchoringConfig) -> AnchoringSession {
            let collaborators = Collaborators::new(self.surfaces.clone(), self.tracking.clone(), self.storage.clone());
            AnchoringSession::new(config, device, collaborators).unwrap()
        }
    }

    fn origin() -> GeoPoint {
        GeoPoint::new(ORIGIN.0, ORIGIN.1)
    }

    #[test]
    fn test_place_object_on_detected_surface() {
        let rig = Rig::new();
        rig.surfaces.set_surfaces(vec![SurfaceHit::new(50.0, 0.25, 0.0)]);
        let mut session = rig.session("device-a");
        assert!(session.bind_origin(origin(), 5.0, 1_000).is_some());

        let target = destination_point(&origin(), 90.0, 50.0);
        let anchor = session
            .place_object_at("chest", target, ObjectClass::Small, 2_000, Instant::now())
            .unwrap();

        let p = anchor.local_transform.position;
        assert!((p.x - 50.0).abs() < 1e-3);
        assert!(p.z.abs() < 1e-3);
        assert_eq!(p.y, 0.25);
        assert_eq!(anchor.quality_score, 0.5);
        assert_eq!(anchor.origin_binding, *session.origin().unwrap());
        assert_eq!(session.store().get("chest"), Some(&anchor));
    }

    #[test]
    fn test_place_object_without_surface_uses_class_default() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");
        session.bind_origin(origin(), 5.0, 1_000);

        let start = Instant::now();
        let small = session
            .place_object_at("small", origin(), ObjectClass::Small, 2_000, start)
            .unwrap();
        let large = session
            .place_object_at("large", destination_point(&origin(), 0.0, 10.0), ObjectClass::Large, 2_000, start + Duration::from_millis(200))
            .unwrap();

        assert!((small.local_transform.position.y - 0.2).abs() < 1e-9);
        assert!((large.local_transform.position.y - 0.0).abs() < 1e-9);
        assert!((small.quality_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_origin_binds_once_at_accurate_fix() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");

        assert!(session.bind_origin(origin(), 40.0, 1_000).is_none());
        assert!(session.origin().is_none());
        assert!(session.bind_origin(GeoPoint::new(f64::NAN, 0.0), 3.0, 1_000).is_none());

        assert!(session.bind_origin(origin(), 8.0, 2_000).is_some());
        assert!(session.bind_origin(GeoPoint::new(0.0, 0.0), 1.0, 3_000).is_none());
        assert_eq!(session.origin().unwrap().origin_gps, origin());
        assert_eq!(session.origin().unwrap().bound_at_ms, 2_000);
    }

    #[test]
    fn test_provisional_placement_reconciled_on_fix() {
        let rig = Rig::new();
        rig.tracking.set_pose(LocalTransform::from_position(1.0, 1.6, 2.0));
        let mut session = rig.session("device-a");

        let target = destination_point(&origin(), 0.0, 30.0);
        let provisional = session.place_object("flag", target, ObjectClass::Small).unwrap();
        assert!(provisional.origin_binding.provisional);
        assert_eq!(provisional.local_transform.position.x, 1.0);
        assert_eq!(provisional.local_transform.position.z, 2.0);
        assert!((provisional.quality_score - 0.5 * 0.25 * 0.6).abs() < 1e-9);
        assert_eq!(session.diagnostics().provisional_anchors, 1);

        let report = session.bind_origin(origin(), 5.0, 10_000).unwrap();
        assert_eq!(report.corrected, vec!["flag".to_string()]);

        let settled = session.store().get("flag").unwrap();
        assert!(!settled.origin_binding.provisional);
        assert!(settled.local_transform.position.x.abs() < 1e-2);
        assert!((settled.local_transform.position.z - 30.0).abs() < 1e-2);
        assert_eq!(session.diagnostics().provisional_anchors, 0);
    }

    #[test]
    fn test_remove_object() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");
        session.bind_origin(origin(), 5.0, 1_000);
        session.place_object("gem", origin(), ObjectClass::Small).unwrap();

        assert_eq!(session.remove_object("gem").unwrap().object_id, "gem");
        assert!(matches!(
            session.remove_object("gem"),
            Err(SessionError::UnknownObject { .. })
        ));
    }

    #[test]
    fn test_session_end_then_start_restores_state() {
        let rig = Rig::new();
        rig.tracking.set_signals(MockTrackingSession::well_mapped().current_tracking_quality_signals());

        let mut first = rig.session("device-a");
        first.bind_origin(origin(), 5.0, 1_000);
        first.place_object("chest", destination_point(&origin(), 45.0, 12.0), ObjectClass::Large).unwrap();
        let end = first.on_session_end_at(5_000).unwrap();
        assert_eq!(end.anchors_saved, 1);
        assert_eq!(end.snapshot_quality, Some(1.0));
        assert!(rig.storage.contains("anchors/table"));
        assert!(rig.storage.contains("world_snapshot/current"));

        let mut second = rig.session("device-a");
        let start = second.on_session_start();
        assert!(start.snapshot_restored);
        assert_eq!(start.relocalization, Some(RelocalizationOutcome::Relocalized));
        assert_eq!(start.anchors_loaded, 1);
        assert!(start.drift.is_none());
        assert_eq!(rig.tracking.applied_blobs().len(), 1);
        assert_eq!(second.store().get("chest"), first.store().get("chest"));
    }

    #[test]
    fn test_poor_map_not_captured_at_session_end() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");
        session.bind_origin(origin(), 5.0, 1_000);

        let end = session.on_session_end_at(5_000).unwrap();
        assert_eq!(end.snapshot_quality, None);
        assert!(!rig.storage.contains("world_snapshot/current"));
    }

    #[test]
    fn test_session_end_save_failure_skips_capture() {
        let rig = Rig::new();
        rig.tracking.set_signals(MockTrackingSession::well_mapped().current_tracking_quality_signals());
        let mut session = rig.session("device-a");
        session.bind_origin(origin(), 5.0, 1_000);
        session.place_object("chest", origin(), ObjectClass::Large).unwrap();

        rig.storage.set_fail_saves(true);
        assert!(matches!(
            session.on_session_end_at(5_000),
            Err(SessionError::Store(StoreError::Storage(_)))
        ));
        assert_eq!(rig.tracking.capture_count(), 0);
        assert_eq!(rig.storage.save_count(), 0);
    }

    #[test]
    fn test_session_end_capture_bounded() {
        let rig = Rig::new();
        rig.tracking.set_signals(MockTrackingSession::well_mapped().current_tracking_quality_signals());
        let mut config = AnchoringConfig::default();
        config.snapshot.capture_timeout_ms = 20;
        let mut session = rig.session_with("device-a", config);
        session.bind_origin(origin(), 5.0, 1_000);
        session.place_object("chest", origin(), ObjectClass::Large).unwrap();

        rig.tracking.hold_captures();
        let end = session.on_session_end_at(5_000).unwrap();
        assert_eq!(end.anchors_saved, 1);
        assert_eq!(end.snapshot_quality, None);
        assert!(end.capture_error.is_some());

        rig.tracking.release_captures();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.snapshots().capture_in_flight() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(rig.storage.contains("anchors/table"));
        assert!(!rig.storage.contains("world_snapshot/current"));
    }

    #[test]
    fn test_fresh_start_without_persisted_state() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");
        let start = session.on_session_start();
        assert!(!start.snapshot_restored);
        assert!(!start.relocalized());
        assert_eq!(start.anchors_loaded, 0);
        assert!(start.load_error.is_none());
    }

    #[test]
    fn test_background_capture_through_session() {
        let rig = Rig::new();
        rig.tracking.set_signals(MockTrackingSession::well_mapped().current_tracking_quality_signals());
        let mut session = rig.session("device-a");

        assert!(session.request_snapshot_capture(1_000));
        assert!(!session.request_snapshot_capture(1_001));

        let mut result = None;
        for _ in 0..500 {
            result = session.poll_snapshot_capture();
            if result.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let snapshot = result.unwrap().unwrap().unwrap();
        assert_eq!(snapshot.captured_at_ms, 1_000);
    }

    #[test]
    fn test_two_devices_converge_through_bundles() {
        let rig_a = Rig::new();
        let rig_b = Rig::new();
        let mut a = rig_a.session("device-a");
        let mut b = rig_b.session("device-b");
        a.bind_origin(origin(), 5.0, 1_000);
        b.bind_origin(origin(), 5.0, 1_000);

        a.place_object("shared", origin(), ObjectClass::Small).unwrap();
        let report = b.import_bundle("device-a", a.export_bundle(2_000), 2_000).unwrap();
        assert_eq!(report.anchors.inserted, 1);
        assert_eq!(b.store().get("shared").unwrap().source_device_id, "device-a");
        assert_eq!(b.diagnostics().peers.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let rig = Rig::new();
        let mut config = AnchoringConfig::default();
        config.grounding.cell_size_m = 0.0;
        let collaborators = Collaborators::new(rig.surfaces.clone(), rig.tracking.clone(), rig.storage.clone());

        assert!(matches!(
            AnchoringSession::new(config, "device-a", collaborators),
            Err(SessionError::Config(ConfigError::InvalidParameter { .. }))
        ));
    }

    #[test]
    fn test_diagnostics_report() {
        let rig = Rig::new();
        let mut session = rig.session("device-a");
        session.bind_origin(origin(), 5.0, 1_000);
        session.place_object("gem", origin(), ObjectClass::Small).unwrap();

        let diagnostics = session.diagnostics();
        assert!(diagnostics.origin_bound);
        assert_eq!(diagnostics.anchor_count, 1);
        assert_eq!(diagnostics.anchors_in_area, 1);
        assert_eq!(diagnostics.grounding.fallbacks, 1);

        let text = diagnostics.to_string();
        assert!(text.contains("Anchors: 1 (1 in area)"));
        assert!(diagnostics.to_json().contains("\"anchor_count\": 1"));
    }
}
