//! Wire form of a sync bundle
//!
//! Transport framing is the carrier's concern; this is only the payload.

use crate::core::SyncBundle;
use crate::validation::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct BundleEnvelope {
    version: u32,
    bundle: SyncBundle,
}

/// Serialize a bundle, refusing payloads larger than `max_bytes`
pub fn encode_bundle(bundle: &SyncBundle, max_bytes: usize) -> SyncResult<Vec<u8>> {
    let envelope = BundleEnvelope {
        version: BUNDLE_FORMAT_VERSION,
        bundle: bundle.clone(),
    };
    let bytes = serde_json::to_vec(&envelope).map_err(|e| SyncError::Serialization { message: e.to_string() })?;
    if bytes.len() > max_bytes {
        return Err(SyncError::MalformedBundle {
            reason: format!("encoded bundle is {} bytes, limit {}", bytes.len(), max_bytes),
        });
    }
    Ok(bytes)
}

/// Parse a received payload; anything unreadable is a malformed bundle
pub fn decode_bundle(payload: &[u8], max_bytes: usize) -> SyncResult<SyncBundle> {
    if payload.len() > max_bytes {
        return Err(SyncError::MalformedBundle {
            reason: format!("payload is {} bytes, limit {}", payload.len(), max_bytes),
        });
    }

    let envelope: BundleEnvelope = serde_json::from_slice(payload).map_err(|e| SyncError::MalformedBundle {
        reason: format!("unreadable payload: {}", e),
    })?;
    if envelope.version != BUNDLE_FORMAT_VERSION {
        return Err(SyncError::MalformedBundle {
            reason: format!("unsupported bundle version {}", envelope.version),
        });
    }
    Ok(envelope.bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Anchor, GeoPoint, LocalTransform, OriginBinding, WorldSnapshot};

    fn bundle() -> SyncBundle {
        let binding = OriginBinding::new(GeoPoint::new(37.7749, -122.4194).with_altitude(12.0), "s1", 5);
        let anchor = Anchor::new("gem", LocalTransform::from_position(1.25, -0.4, 3.5), binding, 0.72, "dev-b", 10);
        SyncBundle {
            anchors: vec![anchor],
            snapshot: Some(WorldSnapshot {
                blob: vec![0, 255, 17],
                quality_score: 0.64,
                captured_at_ms: 9,
                area_key: "current".to_string(),
            }),
            sender_device_id: "dev-b".to_string(),
            timestamp_ms: 11,
            area_key: "current".to_string(),
        }
    }

    #[test]
    fn test_decoded_bundle_matches_sent() {
        let original = bundle();
        let bytes = encode_bundle(&original, 1 << 20).unwrap();
        assert_eq!(decode_bundle(&bytes, 1 << 20).unwrap(), original);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let bytes = encode_bundle(&bundle(), 1 << 20).unwrap();
        assert!(matches!(
            decode_bundle(&bytes, bytes.len() - 1),
            Err(SyncError::MalformedBundle { .. })
        ));
        assert!(matches!(encode_bundle(&bundle(), 16), Err(SyncError::MalformedBundle { .. })));
    }

    #[test]
    fn test_garbage_and_unknown_version_rejected() {
        assert!(matches!(decode_bundle(b"{not json", 1024), Err(SyncError::MalformedBundle { .. })));

        let mut value: serde_json::Value = serde_json::from_slice(&encode_bundle(&bundle(), 1 << 20).unwrap()).unwrap();
        value["version"] = serde_json::json!(99);
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = decode_bundle(&bytes, 1 << 20).unwrap_err();
        assert!(err.to_string().contains("version 99"));
        assert!(!err.is_retryable());
    }
}
