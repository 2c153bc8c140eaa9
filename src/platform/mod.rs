//! Collaborator interfaces consumed by the anchoring core
//!
//! The live tracking session, durable storage and the peer transport are
//! implemented outside this crate. These traits are the narrow seams the
//! core talks through, plus in-memory and mock implementations for tests
//! and single-device use.

pub mod tracking;
pub mod storage;
pub mod transport;
pub mod mock;

pub use tracking::{RelocalizationCallback, TrackingSession, TrackingSurfaceQuery};
pub use storage::{FileKv, MemoryKv, PersistentKv};
pub use transport::{ReceiveHandler, Transport};
pub use mock::{LoopbackTransport, MockSurfaceQuery, MockTrackingSession, RelocalizationBehavior};
