//! Supporting data processing for the per-frame path

pub mod cache;

pub use cache::{CellKey, SurfaceCache};
