//! Durable state: the anchor table and world snapshots

pub mod anchor_store;
pub mod quality;
pub mod world_snapshot;

pub use anchor_store::{AnchorStore, BatchOutcome, PutOutcome};
pub use quality::{assess_quality, QualityBreakdown};
pub use world_snapshot::{CaptureTicket, RelocalizationOutcome, WorldSnapshotService};
