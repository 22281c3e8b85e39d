//! Manifest documents: Docker v2.2, OCI, schema 1 (read-only), and
//! manifest lists / OCI indexes.
//!
//! Pulled manifests arrive in four flavors discriminated by the top-level
//! `schemaVersion` and media type, modeled as [`PulledManifest`]. Writes are
//! always v2.2 or OCI image manifests; lists and schema 1 are never written.

use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};

use super::{Platform, TargetFormat};
use crate::blob::{BlobDescriptor, Digest};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// Every media type advertised on manifest pulls, in preference order.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_MANIFEST,
    DOCKER_MANIFEST,
    OCI_INDEX,
    DOCKER_MANIFEST_LIST,
    SCHEMA1,
    SCHEMA1_SIGNED,
];

/// A content descriptor as embedded in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

impl From<&Descriptor> for BlobDescriptor {
    fn from(d: &Descriptor) -> Self {
        BlobDescriptor {
            digest: d.digest,
            size: d.size,
            media_type: Some(d.media_type.clone()),
        }
    }
}

/// A Docker v2.2 or OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Build a writable manifest for the given output format.
    pub fn build(
        format: TargetFormat,
        config: BlobDescriptor,
        layers: Vec<BlobDescriptor>,
    ) -> Self {
        let (manifest_type, config_type, layer_type) = match format {
            TargetFormat::Docker => (DOCKER_MANIFEST, DOCKER_CONFIG, DOCKER_LAYER),
            TargetFormat::Oci => (OCI_MANIFEST, OCI_CONFIG, OCI_LAYER),
        };
        ImageManifest {
            schema_version: 2,
            media_type: Some(manifest_type.to_string()),
            config: Descriptor {
                media_type: config_type.to_string(),
                digest: config.digest,
                size: config.size,
            },
            layers: layers
                .into_iter()
                .map(|layer| Descriptor {
                    media_type: layer.media_type.unwrap_or_else(|| layer_type.to_string()),
                    digest: layer.digest,
                    size: layer.size,
                })
                .collect(),
        }
    }

    pub fn content_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(DOCKER_MANIFEST)
    }

    /// Serialize to the exact bytes pushed to the registry.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A platform entry inside a manifest list / index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformFields>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFields {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A Docker manifest list or OCI image index. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<PlatformDescriptor>,
}

impl ManifestList {
    /// Select the entry matching the requested platform.
    ///
    /// Fails with a diagnostic listing the platforms present when nothing
    /// matches.
    pub fn select(&self, platform: &Platform) -> Result<&PlatformDescriptor> {
        self.manifests
            .iter()
            .find(|entry| {
                entry.platform.as_ref().is_some_and(|p| {
                    p.os == platform.os && p.architecture == platform.architecture
                })
            })
            .ok_or_else(|| {
                let present: Vec<String> = self
                    .manifests
                    .iter()
                    .filter_map(|entry| entry.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                StrataError::ManifestNotFound {
                    reference: format!(
                        "no manifest for platform {} (present: {})",
                        platform,
                        present.join(", ")
                    ),
                }
            })
    }
}

/// A legacy schema 1 manifest. Read-only, for old base images.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<Schema1FsLayer>,
    #[serde(default)]
    pub history: Vec<Schema1History>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema1FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema1History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

impl Schema1Manifest {
    /// Layer digests oldest-first (schema 1 lists them newest-first).
    pub fn layer_digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self.fs_layers.iter().map(|l| l.blob_sum).collect();
        digests.reverse();
        digests
    }
}

/// A manifest as pulled from a registry, discriminated by schema version and
/// media type.
#[derive(Debug, Clone, PartialEq)]
pub enum PulledManifest {
    Schema1(Schema1Manifest),
    Image(ImageManifest),
    List(ManifestList),
}

impl PulledManifest {
    /// Parse raw manifest bytes, using the response `Content-Type` as a hint
    /// when the body omits `mediaType`.
    pub fn parse(bytes: &[u8], content_type: Option<&str>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;

        let schema_version = value
            .get("schemaVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StrataError::Serialization("manifest missing schemaVersion".into()))?;

        if schema_version == 1 {
            return Ok(PulledManifest::Schema1(serde_json::from_value(value)?));
        }
        if schema_version != 2 {
            return Err(StrataError::Serialization(format!(
                "unsupported manifest schemaVersion {schema_version}"
            )));
        }

        let media_type = value
            .get("mediaType")
            .and_then(|v| v.as_str())
            .or(content_type);
        let is_list = match media_type {
            Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX) => true,
            Some(_) => false,
            // No media type anywhere: discriminate on the field set
            None => value.get("manifests").is_some(),
        };

        if is_list {
            Ok(PulledManifest::List(serde_json::from_value(value)?))
        } else {
            Ok(PulledManifest::Image(serde_json::from_value(value)?))
        }
    }
}
