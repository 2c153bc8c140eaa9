//! Peer transport interface

use crate::validation::PlatformResult;

/// Handler invoked with `(peer_id, payload)` for every received message
pub type ReceiveHandler = Box<dyn Fn(&str, Vec<u8>) + Send + Sync>;

/// Carries serialized sync bundles between devices; framing is the implementor's concern
pub trait Transport: Send + Sync {
    fn send(&self, peer_id: &str, payload: &[u8]) -> PlatformResult<()>;

    /// Register the receive handler, replacing any previous one
    fn on_receive(&self, handler: ReceiveHandler);
}
