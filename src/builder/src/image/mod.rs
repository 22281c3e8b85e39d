//! In-memory container image model.
//!
//! An image is an ordered list of layers plus a container config; the two
//! serialize to the registry wire format through [`manifest`] and [`config`].
//! Model values are frozen snapshots: builders produce them once per build
//! and nothing mutates them afterwards.

pub mod config;
pub mod manifest;

pub use config::{ContainerConfig, ExecutionConfig, HistoryEntry, Port, Protocol, RootFs};
pub use manifest::{
    Descriptor, ImageManifest, ManifestList, PlatformDescriptor, PulledManifest, Schema1Manifest,
};

use serde::{Deserialize, Serialize};

use crate::blob::Digest;

/// Target platform `(os, architecture)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// The overwhelmingly common default.
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Output manifest flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// Docker v2.2 manifest + Docker config media types
    Docker,
    /// OCI image manifest + OCI config media types
    Oci,
}

/// A layer ready to appear in a manifest: both identities plus size.
///
/// Produced by the layer builder or resolved from a pulled base image; the
/// compressed bytes themselves live in the cache and are re-resolved by
/// digest when needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLayer {
    /// Digest of the compressed (gzipped) blob.
    pub digest: Digest,
    /// Digest of the uncompressed tar.
    pub diff_id: Digest,
    /// Compressed size in bytes.
    pub size: u64,
    pub media_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::linux_amd64().to_string(), "linux/amd64");
        assert_eq!(Platform::new("linux", "arm64").to_string(), "linux/arm64");
    }

    #[test]
    fn test_platform_equality() {
        assert_eq!(Platform::linux_amd64(), Platform::new("linux", "amd64"));
        assert_ne!(Platform::linux_amd64(), Platform::new("linux", "arm64"));
    }
}
