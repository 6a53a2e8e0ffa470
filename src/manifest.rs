//! Firmware manifest: metadata describing an available image.

use log::{info, warn};
use serde_json::Value;

/// Parsed manifest. `valid` is true only when version, hash, and a positive
/// size are all present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareManifest {
    pub version: String,
    pub size: u32,
    /// Full-image SHA-256, hex.
    pub hash: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub valid: bool,
}

impl FirmwareManifest {
    /// Extract a manifest from the cloud response
    /// `{fota:{manifest:{version,size,hash,chunk_size}}}`.
    ///
    /// A response without the `fota` or `manifest` key means "no update
    /// available" and yields `None`, not an error.
    pub fn from_response(response: &Value) -> Option<Self> {
        let manifest = response.get("fota")?.get("manifest")?;

        let version = manifest
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let size = manifest.get("size").and_then(Value::as_u64).unwrap_or(0) as u32;
        let hash = manifest
            .get("hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let chunk_size = manifest
            .get("chunk_size")
            .and_then(Value::as_u64)
            .unwrap_or(1024) as u32;

        let total_chunks = if size > 0 && chunk_size > 0 {
            size.div_ceil(chunk_size)
        } else {
            warn!("fota: invalid manifest dimensions: size={size}, chunk_size={chunk_size}");
            0
        };

        let valid = !version.is_empty() && size > 0 && !hash.is_empty();
        if valid {
            info!(
                "fota: manifest loaded: version={version}, size={size}, chunks={total_chunks}"
            );
        }

        Some(Self {
            version,
            size,
            hash,
            chunk_size,
            total_chunks,
            valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_arithmetic_rounds_up() {
        let exact = FirmwareManifest::from_response(&json!({
            "fota": {"manifest": {"version": "2.0", "size": 10240, "hash": "ab", "chunk_size": 1024}}
        }))
        .unwrap();
        assert_eq!(exact.total_chunks, 10);

        let remainder = FirmwareManifest::from_response(&json!({
            "fota": {"manifest": {"version": "2.0", "size": 10241, "hash": "ab", "chunk_size": 1024}}
        }))
        .unwrap();
        assert_eq!(remainder.total_chunks, 11);
    }

    #[test]
    fn missing_fota_or_manifest_key_is_no_update() {
        assert!(FirmwareManifest::from_response(&json!({})).is_none());
        assert!(FirmwareManifest::from_response(&json!({"fota": {}})).is_none());
    }

    #[test]
    fn incomplete_manifest_is_invalid() {
        let no_hash = FirmwareManifest::from_response(&json!({
            "fota": {"manifest": {"version": "2.0", "size": 1024}}
        }))
        .unwrap();
        assert!(!no_hash.valid);

        let zero_size = FirmwareManifest::from_response(&json!({
            "fota": {"manifest": {"version": "2.0", "size": 0, "hash": "ab"}}
        }))
        .unwrap();
        assert!(!zero_size.valid);
        assert_eq!(zero_size.total_chunks, 0);
    }

    #[test]
    fn chunk_size_defaults_to_1024() {
        let m = FirmwareManifest::from_response(&json!({
            "fota": {"manifest": {"version": "2.0", "size": 3072, "hash": "ab"}}
        }))
        .unwrap();
        assert_eq!(m.chunk_size, 1024);
        assert_eq!(m.total_chunks, 3);
    }
}
