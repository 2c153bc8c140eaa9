//! Application-facing session API
//!
//! [`AnchoringSession`] composes geodesy, grounding, the anchor store,
//! world snapshots, drift correction and peer sync behind the handful of
//! calls an AR app makes: place, remove, start, end and inspect.

pub mod diagnostics;
pub mod session;
pub mod types;

pub use diagnostics::Diagnostics;
pub use session::AnchoringSession;
pub use types::{Collaborators, SessionEndReport, SessionStartReport};
