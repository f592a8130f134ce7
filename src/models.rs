//! Shared models and types
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub bus_connected: bool,
    pub store_healthy: bool,
    pub device_count: usize,
}

/// Command/OTA acceptance result; failures carry a reason instead of a body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Accepted {
    pub fn yes() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// OTA update descriptor published to `home/system/<device_id>/update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaManifest {
    /// Source-tree revision the URLs resolve against
    pub r#ref: String,
    /// Sorted by device-relative `path`
    pub files: Vec<ManifestFile>,
}

/// One downloadable file in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Fully-qualified fetchable address
    pub url: String,
    /// Device-relative destination, e.g. `app/main.py`
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serializes_with_ref_key() {
        let manifest = OtaManifest {
            r#ref: "main".to_string(),
            files: vec![ManifestFile {
                url: "https://example.test/main/shared/a.py".to_string(),
                path: "shared/a.py".to_string(),
            }],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["ref"], "main");
        assert_eq!(json["files"][0]["path"], "shared/a.py");
    }
}
