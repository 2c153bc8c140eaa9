//! Anchor exchange between concurrent observers
//!
//! Sharing is quality-wins with a recency tie-break, not a consensus
//! protocol: peers converge once they have seen each other's bundles.

use crate::algorithms::{DriftCorrector, DriftReport};
use crate::core::{Anchor, OriginBinding, SyncBundle};
use crate::persistence::{AnchorStore, BatchOutcome, WorldSnapshotService};
use crate::platform::Transport;
use crate::sync::bundle::{decode_bundle, encode_bundle};
use crate::utils::SyncConfig;
use crate::validation::{DataValidator, PlatformError, SyncError, SyncResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Per-peer connection state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PeerSyncState {
    Idle,
    Syncing,
    Synced { at_ms: u64 },
    Failed { reason: String, retryable: bool },
}

/// Result of applying one peer bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub peer_id: String,
    pub anchors: BatchOutcome,
    /// Relayed copies of this device's own anchors that were older than ours
    pub stale_echoes: usize,
    pub snapshot_adopted: bool,
    pub drift: Option<DriftReport>,
}

/// Components an import writes into
pub struct SyncContext<'a> {
    pub store: &'a mut AnchorStore,
    pub snapshots: &'a WorldSnapshotService,
    pub drift: &'a DriftCorrector,
    /// Live origin of this session, if bound; drift correction is skipped without one
    pub current_origin: Option<&'a OriginBinding>,
    pub now_ms: u64,
}

#[derive(Debug, Clone)]
struct InboundPayload {
    peer_id: String,
    payload: Vec<u8>,
}

pub struct AnchorSyncCoordinator {
    device_id: String,
    config: SyncConfig,
    peers: HashMap<String, PeerSyncState>,
    transport: Option<Arc<dyn Transport>>,
    inbox: Arc<Mutex<VecDeque<InboundPayload>>>,
    dropped_inbound: Arc<AtomicUsize>,
}

impl AnchorSyncCoordinator {
    pub fn new(device_id: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            peers: HashMap::new(),
            transport: None,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            dropped_inbound: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Package the area's anchors and retained snapshot
    pub fn export_bundle(
        &self,
        store: &AnchorStore,
        snapshots: &WorldSnapshotService,
        area_key: &str,
        now_ms: u64,
    ) -> SyncBundle {
        let bundle = SyncBundle {
            anchors: store.in_area(area_key),
            snapshot: snapshots.current(area_key),
            sender_device_id: self.device_id.clone(),
            timestamp_ms: now_ms,
            area_key: area_key.to_string(),
        };
        debug!(
            area = area_key,
            anchors = bundle.anchors.len(),
            with_snapshot = bundle.snapshot.is_some(),
            "bundle exported"
        );
        bundle
    }

    pub fn encode_bundle(&self, bundle: &SyncBundle) -> SyncResult<Vec<u8>> {
        encode_bundle(bundle, self.config.max_bundle_bytes)
    }

    pub fn decode_bundle(&self, payload: &[u8]) -> SyncResult<SyncBundle> {
        decode_bundle(payload, self.config.max_bundle_bytes)
    }

    /// Merge a peer bundle; a rejected bundle leaves the store untouched
    pub fn import_bundle(
        &mut self,
        peer_id: &str,
        bundle: SyncBundle,
        ctx: &mut SyncContext<'_>,
    ) -> SyncResult<ImportReport> {
        self.set_state(peer_id, PeerSyncState::Syncing);
        let result = self.apply_bundle(peer_id, bundle, ctx);
        self.record_result(peer_id, ctx.now_ms, result.as_ref().err());
        result
    }

    fn apply_bundle(&self, peer_id: &str, bundle: SyncBundle, ctx: &mut SyncContext<'_>) -> SyncResult<ImportReport> {
        DataValidator::validate_bundle(&bundle).map_err(|reason| SyncError::MalformedBundle { reason })?;
        if bundle.sender_device_id == self.device_id {
            return Err(SyncError::MalformedBundle {
                reason: "bundle was sent by this device".to_string(),
            });
        }

        // Our own anchors relayed back by a peer only count if they are newer than ours
        let (anchors, stale_echoes) = self.drop_stale_echoes(bundle.anchors, &*ctx.store);
        let outcome = ctx.store.put_batch(anchors)?;

        let snapshot_adopted = match bundle.snapshot {
            Some(snapshot) => ctx
                .snapshots
                .offer_peer_snapshot(snapshot, self.config.snapshot_improvement_margin),
            None => false,
        };

        let changed = outcome.inserted + outcome.replaced > 0;
        let drift = match ctx.current_origin {
            Some(origin) if changed => Some(ctx.drift.check_and_correct(ctx.store, origin, ctx.now_ms)),
            _ => None,
        };

        info!(
            peer = peer_id,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            kept = outcome.kept,
            snapshot_adopted,
            "peer bundle imported"
        );

        Ok(ImportReport {
            peer_id: peer_id.to_string(),
            anchors: outcome,
            stale_echoes,
            snapshot_adopted,
            drift,
        })
    }

    fn drop_stale_echoes(&self, anchors: Vec<Anchor>, store: &AnchorStore) -> (Vec<Anchor>, usize) {
        let before = anchors.len();
        let kept: Vec<Anchor> = anchors
            .into_iter()
            .filter(|anchor| {
                if anchor.source_device_id != self.device_id {
                    return true;
                }
                match store.get(&anchor.object_id) {
                    Some(local) => anchor.last_verified_at_ms > local.last_verified_at_ms,
                    None => true,
                }
            })
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }

    /// Encode and send a bundle to one peer
    pub fn push_to_peer(&mut self, peer_id: &str, bundle: &SyncBundle) -> SyncResult<()> {
        self.set_state(peer_id, PeerSyncState::Syncing);
        let result = self.send_bundle(peer_id, bundle);
        self.record_result(peer_id, bundle.timestamp_ms, result.as_ref().err());
        result
    }

    fn send_bundle(&self, peer_id: &str, bundle: &SyncBundle) -> SyncResult<()> {
        let transport = self.transport.as_ref().ok_or_else(|| PlatformError::SendFailed {
            peer_id: peer_id.to_string(),
            reason: "no transport attached".to_string(),
        })?;
        let payload = self.encode_bundle(bundle)?;
        transport.send(peer_id, &payload)?;
        debug!(peer = peer_id, bytes = payload.len(), "bundle sent");
        Ok(())
    }

    /// Use `transport` for pushes and queue everything it receives
    ///
    /// Received payloads wait in a bounded inbox until [`process_inbox`]
    /// runs; when full, the oldest payload is dropped.
    ///
    /// [`process_inbox`]: AnchorSyncCoordinator::process_inbox
    pub fn attach_transport(&mut self, transport: Arc<dyn Transport>) {
        let inbox = Arc::clone(&self.inbox);
        let dropped = Arc::clone(&self.dropped_inbound);
        let limit = self.config.max_inbox_len.max(1);

        transport.on_receive(Box::new(move |peer_id: &str, payload: Vec<u8>| {
            let mut queue = inbox.lock().unwrap_or_else(|e| e.into_inner());
            while queue.len() >= limit {
                queue.pop_front();
                dropped.fetch_add(1, Ordering::Relaxed);
                warn!(peer = peer_id, "sync inbox full, oldest bundle dropped");
            }
            queue.push_back(InboundPayload {
                peer_id: peer_id.to_string(),
                payload,
            });
        }));
        self.transport = Some(transport);
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped_inbound(&self) -> usize {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    /// Decode and import every queued payload, oldest first
    pub fn process_inbox(&mut self, ctx: &mut SyncContext<'_>) -> Vec<SyncResult<ImportReport>> {
        let queued: Vec<InboundPayload> = {
            let mut queue = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };

        queued
            .into_iter()
            .map(|inbound| match self.decode_bundle(&inbound.payload) {
                Ok(bundle) => self.import_bundle(&inbound.peer_id, bundle, ctx),
                Err(e) => {
                    self.record_result(&inbound.peer_id, ctx.now_ms, Some(&e));
                    Err(e)
                }
            })
            .collect()
    }

    pub fn peer_state(&self, peer_id: &str) -> PeerSyncState {
        self.peers.get(peer_id).cloned().unwrap_or(PeerSyncState::Idle)
    }

    /// Peers and their states, sorted by peer id
    pub fn peer_states(&self) -> Vec<(String, PeerSyncState)> {
        let mut states: Vec<(String, PeerSyncState)> =
            self.peers.iter().map(|(peer, state)| (peer.clone(), state.clone())).collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Return a peer to idle so it can be retried
    pub fn reset_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    fn set_state(&mut self, peer_id: &str, state: PeerSyncState) {
        self.peers.insert(peer_id.to_string(), state);
    }

    fn record_result(&mut self, peer_id: &str, now_ms: u64, error: Option<&SyncError>) {
        let state = match error {
            None => PeerSyncState::Synced { at_ms: now_ms },
            Some(e) => {
                warn!(peer = peer_id, error = %e, retryable = e.is_retryable(), "peer sync failed");
                PeerSyncState::Failed {
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };
        self.set_state(peer_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::local_offset_to_gps;
    use crate::core::{GeoPoint, LocalTransform, WorldSnapshot};
    use crate::platform::{LoopbackTransport, MemoryKv, MockTrackingSession};
    use crate::utils::{DriftConfig, SnapshotConfig, StoreConfig};
    use crate::validation::StoreError;

    struct Fixture {
        store: AnchorStore,
        snapshots: WorldSnapshotService,
        drift: DriftCorrector,
        origin: OriginBinding,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_store_config(StoreConfig::default())
        }

        fn with_store_config(config: StoreConfig) -> Self {
            Self {
                store: AnchorStore::new(Arc::new(MemoryKv::new()), config),
                snapshots: WorldSnapshotService::new(
                    Arc::new(MockTrackingSession::new()),
                    Arc::new(MemoryKv::new()),
                    SnapshotConfig::default(),
                ),
                drift: DriftCorrector::new(DriftConfig::default()),
                origin: OriginBinding::new(GeoPoint::new(51.5007, -0.1246), "local-session", 0),
            }
        }

        fn ctx(&mut self, now_ms: u64) -> SyncContext<'_> {
            SyncContext {
                store: &mut self.store,
                snapshots: &self.snapshots,
                drift: &self.drift,
                current_origin: Some(&self.origin),
                now_ms,
            }
        }
    }

    fn anchor(id: &str, quality: f64, device: &str, binding: &OriginBinding, at_ms: u64) -> Anchor {
        Anchor::new(id, LocalTransform::from_position(2.0, 0.0, 2.0), binding.clone(), quality, device, at_ms)
    }

    fn bundle_from(sender: &str, anchors: Vec<Anchor>) -> SyncBundle {
        SyncBundle {
            anchors,
            snapshot: None,
            sender_device_id: sender.to_string(),
            timestamp_ms: 100,
            area_key: "current".to_string(),
        }
    }

    #[test]
    fn test_import_respects_conflict_rule() {
        let mut fx = Fixture::new();
        let origin = fx.origin.clone();
        fx.store.put(anchor("better-local", 0.9, "me", &origin, 10)).unwrap();
        fx.store.put(anchor("worse-local", 0.2, "me", &origin, 10)).unwrap();

        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        let bundle = bundle_from(
            "peer",
            vec![
                anchor("better-local", 0.5, "peer", &origin, 20),
                anchor("worse-local", 0.8, "peer", &origin, 20),
                anchor("new", 0.6, "peer", &origin, 20),
            ],
        );

        let report = sync.import_bundle("peer", bundle, &mut fx.ctx(1_000)).unwrap();
        assert_eq!(report.anchors, BatchOutcome { inserted: 1, replaced: 1, kept: 1 });
        assert_eq!(fx.store.get("better-local").unwrap().quality_score, 0.9);
        assert_eq!(fx.store.get("worse-local").unwrap().source_device_id, "peer");
        assert!(fx.store.get("new").is_some());
        assert_eq!(sync.peer_state("peer"), PeerSyncState::Synced { at_ms: 1_000 });
    }

    #[test]
    fn test_malformed_bundle_rejected_wholesale() {
        let mut fx = Fixture::new();
        let origin = fx.origin.clone();
        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());

        let mut broken = anchor("b", 0.5, "peer", &origin, 20);
        broken.quality_score = 1.5;
        let bundle = bundle_from("peer", vec![anchor("a", 0.6, "peer", &origin, 20), broken]);

        let err = sync.import_bundle("peer", bundle, &mut fx.ctx(1_000)).unwrap_err();
        assert!(matches!(err, SyncError::MalformedBundle { .. }));
        assert!(fx.store.is_empty());
        assert!(matches!(
            sync.peer_state("peer"),
            PeerSyncState::Failed { retryable: false, .. }
        ));

        let duplicate = bundle_from(
            "peer",
            vec![anchor("a", 0.6, "peer", &origin, 20), anchor("a", 0.7, "peer", &origin, 21)],
        );
        assert!(sync.import_bundle("peer", duplicate, &mut fx.ctx(1_000)).is_err());
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_capacity_failure_does_not_partially_apply() {
        let mut fx = Fixture::with_store_config(StoreConfig {
            max_anchors_per_area: 2,
            ..StoreConfig::default()
        });
        let origin = fx.origin.clone();
        fx.store.put(anchor("existing", 0.5, "me", &origin, 10)).unwrap();

        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        let bundle = bundle_from(
            "peer",
            vec![anchor("x", 0.6, "peer", &origin, 20), anchor("y", 0.6, "peer", &origin, 20)],
        );
        let err = sync.import_bundle("peer", bundle, &mut fx.ctx(1_000)).unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::CapacityExceeded { .. })));
        assert_eq!(fx.store.len(), 1);
    }

    #[test]
    fn test_import_triggers_drift_correction() {
        let mut fx = Fixture::new();
        let peer_origin = OriginBinding::new(local_offset_to_gps(0.8, 0.0, &fx.origin), "peer-session", 0);
        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());

        let bundle = bundle_from("peer", vec![anchor("relic", 0.7, "peer", &peer_origin, 20)]);
        let report = sync.import_bundle("peer", bundle, &mut fx.ctx(2_000)).unwrap();

        let drift = report.drift.unwrap();
        assert_eq!(drift.corrected, vec!["relic".to_string()]);
        let relic = fx.store.get("relic").unwrap();
        assert_eq!(relic.origin_binding, fx.origin);
        assert!((relic.local_transform.position.x - 2.8).abs() < 1e-3);
    }

    #[test]
    fn test_peer_snapshot_adopted_only_when_materially_better() {
        let mut fx = Fixture::new();
        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        let snapshot = |quality: f64| WorldSnapshot {
            blob: vec![4, 2],
            quality_score: quality,
            captured_at_ms: 50,
            area_key: "current".to_string(),
        };

        let mut first = bundle_from("peer", Vec::new());
        first.snapshot = Some(snapshot(0.5));
        assert!(sync.import_bundle("peer", first, &mut fx.ctx(1)).unwrap().snapshot_adopted);

        let mut marginal = bundle_from("peer", Vec::new());
        marginal.snapshot = Some(snapshot(0.55));
        let report = sync.import_bundle("peer", marginal, &mut fx.ctx(2)).unwrap();
        assert!(!report.snapshot_adopted);
        assert!(report.drift.is_none());
        assert_eq!(fx.snapshots.current("current").unwrap().quality_score, 0.5);
    }

    #[test]
    fn test_stale_echo_of_own_anchor_ignored() {
        let mut fx = Fixture::new();
        let origin = fx.origin.clone();
        fx.store.put(anchor("mine", 0.4, "me", &origin, 500)).unwrap();

        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        let echo = anchor("mine", 0.9, "me", &origin, 100);
        let report = sync.import_bundle("peer", bundle_from("peer", vec![echo]), &mut fx.ctx(600)).unwrap();

        assert_eq!(report.stale_echoes, 1);
        assert_eq!(fx.store.get("mine").unwrap().quality_score, 0.4);
    }

    #[test]
    fn test_own_bundle_rejected() {
        let mut fx = Fixture::new();
        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        assert!(sync.import_bundle("loop", bundle_from("me", Vec::new()), &mut fx.ctx(1)).is_err());
    }

    #[test]
    fn test_push_failure_is_retryable() {
        let mut fx = Fixture::new();
        let origin = fx.origin.clone();
        fx.store.put(anchor("a", 0.6, "me", &origin, 10)).unwrap();

        let transport = Arc::new(LoopbackTransport::new());
        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());

        let bundle = sync.export_bundle(&fx.store, &fx.snapshots, "current", 42);
        assert!(sync.push_to_peer("peer", &bundle).is_err());

        sync.attach_transport(transport.clone());
        transport.set_unreachable("peer", true);
        let err = sync.push_to_peer("peer", &bundle).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(sync.peer_state("peer"), PeerSyncState::Failed { retryable: true, .. }));

        sync.reset_peer("peer");
        assert_eq!(sync.peer_state("peer"), PeerSyncState::Idle);

        transport.set_unreachable("peer", false);
        sync.push_to_peer("peer", &bundle).unwrap();
        assert_eq!(sync.peer_state("peer"), PeerSyncState::Synced { at_ms: 42 });

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sync.decode_bundle(&sent[0].1).unwrap(), bundle);
    }

    #[test]
    fn test_inbox_processes_received_bundles() {
        let mut fx = Fixture::new();
        let origin = fx.origin.clone();
        let transport = Arc::new(LoopbackTransport::new());

        let sender = AnchorSyncCoordinator::new("peer", SyncConfig::default());
        let payload = sender
            .encode_bundle(&bundle_from("peer", vec![anchor("gift", 0.6, "peer", &origin, 5)]))
            .unwrap();

        let mut sync = AnchorSyncCoordinator::new("me", SyncConfig::default());
        sync.attach_transport(transport.clone());
        assert!(transport.deliver("peer", payload));
        assert!(transport.deliver("noisy", b"junk".to_vec()));
        assert_eq!(sync.pending_inbound(), 2);

        let results = sync.process_inbox(&mut fx.ctx(77));
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(fx.store.get("gift").is_some());
        assert_eq!(sync.pending_inbound(), 0);
        assert!(matches!(sync.peer_state("noisy"), PeerSyncState::Failed { .. }));
        assert_eq!(sync.peer_states().len(), 2);
    }

    #[test]
    fn test_inbox_drops_oldest_when_full() {
        let transport = Arc::new(LoopbackTransport::new());
        let mut sync = AnchorSyncCoordinator::new(
            "me",
            SyncConfig {
                max_inbox_len: 2,
                ..SyncConfig::default()
            },
        );
        sync.attach_transport(transport.clone());

        for i in 0..4u8 {
            transport.deliver("peer", vec![i]);
        }
        assert_eq!(sync.pending_inbound(), 2);
        assert_eq!(sync.dropped_inbound(), 2);
    }
}
