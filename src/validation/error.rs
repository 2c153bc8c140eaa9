//! Error taxonomy for the anchoring system
//!
//! Degraded-but-functional paths (grounding, drift correction) never surface
//! an error; everything here is either retryable later or a rejected input.

use thiserror::Error;

/// Failures from a [`PersistentKv`](crate::platform::PersistentKv) backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("storage I/O failed for key {key}: {message}")]
    Io { key: String, message: String },
    #[error("storage backend unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures reported by tracking-session or transport collaborators
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlatformError {
    #[error("tracking session not running")]
    SessionNotRunning,
    #[error("snapshot blob capture failed: {reason}")]
    CaptureFailed { reason: String },
    #[error("transport send to peer {peer_id} failed: {reason}")]
    SendFailed { peer_id: String, reason: String },
    #[error("peer {peer_id} is not connected")]
    PeerUnreachable { peer_id: String },
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Anchor table errors; all are rejected before any mutation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("anchor capacity exceeded for area {area_key}: {current} stored, limit {limit}")]
    CapacityExceeded { area_key: String, current: usize, limit: usize },
    #[error("invalid anchor {object_id}: {reason}")]
    InvalidAnchor { object_id: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("anchor table serialization failed: {message}")]
    Serialization { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// World snapshot capture/restore failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("snapshot operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("snapshot record for area {area_key} is corrupt: {message}")]
    Serialization { area_key: String, message: String },
    #[error("snapshot capture worker exited without a result")]
    WorkerLost,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Anchor sync failures; never leave the anchor store partially updated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("malformed sync bundle: {reason}")]
    MalformedBundle { reason: String },
    #[error("bundle could not be applied: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] PlatformError),
    #[error("bundle serialization failed: {message}")]
    Serialization { message: String },
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether resending or re-requesting the same bundle may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Serialization { .. } => true,
            SyncError::Store(StoreError::Storage(_)) => true,
            SyncError::Store(_) => false,
            SyncError::MalformedBundle { .. } => false,
        }
    }
}

/// Configuration validation and file errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {parameter} = {value}: {reason}")]
    InvalidParameter { parameter: String, value: String, reason: String },
    #[error("configuration file error: {message}")]
    Io { message: String },
    #[error("configuration parse error: {message}")]
    Serialization { message: String },
}

/// Errors surfaced by the session facade
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no anchor for object {object_id}")]
    UnknownObject { object_id: String },
}

pub type SessionResult<T> = Result<T, SessionError>;
