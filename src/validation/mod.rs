//! Data validation and the error taxonomy

pub mod data;
pub mod error;

pub use data::{DataValidator, ValidationIssue};
pub use error::{
    ConfigError, PlatformError, PlatformResult, SessionError, SessionResult, SnapshotError,
    SnapshotResult, StorageError, StorageResult, StoreError, StoreResult, SyncError, SyncResult,
};
