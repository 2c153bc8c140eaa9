//! Physical constants and system parameters

/// Mean Earth radius used by the spherical geodesy formulas (m)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Area key used when the caller does not distinguish physical areas
pub const DEFAULT_AREA_KEY: &str = "current";

/// Storage key for the persisted anchor table
pub const ANCHOR_TABLE_KEY: &str = "anchors/table";

/// Storage key prefix for persisted world snapshots
pub const SNAPSHOT_KEY_PREFIX: &str = "world_snapshot/";
