//! Container configuration JSON.
//!
//! The serialized form is bit-exact with what registries store: Docker's
//! capitalized `config` keys, `rootfs.type = "layers"`, and history entries
//! parallel to the layers. Maps are `BTreeMap` so repeated serialization of
//! the same model is byte-identical.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::error::{Result, StrataError};

use crate::blob::Digest;

/// A port exposed by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Port {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Udp,
        }
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.number, protocol)
    }
}

/// The `config` object: execution parameters for the container.
///
/// Field names follow the Docker wire format (capitalized).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Map of `"<port>/<protocol>"` to empty objects.
    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub exposed_ports: BTreeMap<String, Empty>,

    /// Ordered `KEY=value` strings.
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// Map of volume mount points to empty objects.
    #[serde(
        rename = "Volumes",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub volumes: BTreeMap<String, Empty>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The `{}` value used by `ExposedPorts` and `Volumes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// One history record. Parallel to layers (except `empty_layer` entries).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// The `rootfs` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Complete container configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    pub architecture: String,
    pub os: String,

    #[serde(default)]
    pub config: ExecutionConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,

    #[serde(default)]
    pub rootfs: RootFs,
}

impl ContainerConfig {
    /// Parse a pulled container config, verifying the required shape.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let config: ContainerConfig =
            serde_json::from_slice(bytes).map_err(|e| StrataError::BadContainerConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.architecture.is_empty() || self.os.is_empty() {
            return Err(StrataError::BadContainerConfig {
                message: "missing architecture or os".to_string(),
            });
        }
        if self.rootfs.fs_type != "layers" {
            return Err(StrataError::BadContainerConfig {
                message: format!("unsupported rootfs type '{}'", self.rootfs.fs_type),
            });
        }
        Ok(())
    }

    /// Serialize to the exact bytes pushed to the registry.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Add an exposed port.
    pub fn expose(&mut self, port: Port) {
        self.config.exposed_ports.insert(port.to_string(), Empty {});
    }

    /// Add a volume mount point.
    pub fn add_volume(&mut self, path: impl Into<String>) {
        self.config.volumes.insert(path.into(), Empty {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ContainerConfig {
        let mut config = ContainerConfig {
            created: Some("1970-01-01T00:00:00Z".to_string()),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            ..Default::default()
        };
        config.config.entrypoint = Some(vec!["java".to_string(), "-jar".to_string()]);
        config.config.env = vec!["PATH=/usr/bin".to_string(), "MODE=prod".to_string()];
        config.expose(Port::tcp(8080));
        config
            .rootfs
            .diff_ids
            .push(Digest::of_bytes(b"layer one"));
        config.history.push(HistoryEntry {
            created: Some("1970-01-01T00:00:00Z".to_string()),
            created_by: Some("strata".to_string()),
            ..Default::default()
        });
        config
    }

    #[test]
    fn test_port_display() {
        assert_eq!(Port::tcp(8080).to_string(), "8080/tcp");
        assert_eq!(Port::udp(53).to_string(), "53/udp");
    }

    #[test]
    fn test_serialization_shape() {
        let bytes = sample_config().to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["architecture"], "amd64");
        assert_eq!(value["os"], "linux");
        assert_eq!(value["rootfs"]["type"], "layers");
        assert_eq!(value["config"]["Entrypoint"][0], "java");
        assert_eq!(value["config"]["Env"][0], "PATH=/usr/bin");
        assert!(value["config"]["ExposedPorts"]["8080/tcp"].is_object());
        // unset fields are absent, not null
        assert!(value["config"].get("Cmd").is_none());
        assert!(value["config"].get("User").is_none());
    }

    #[test]
    fn test_serialization_deterministic() {
        let a = sample_config().to_bytes().unwrap();
        let b = sample_config().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_layer_serialized_only_when_true() {
        let entry = HistoryEntry {
            empty_layer: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("empty_layer"));

        let entry = HistoryEntry::default();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("empty_layer"));
    }

    #[test]
    fn test_round_trip() {
        let config = sample_config();
        let bytes = config.to_bytes().unwrap();
        let back = ContainerConfig::from_slice(&bytes).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_from_slice_rejects_missing_fields() {
        let err = ContainerConfig::from_slice(br#"{"config": {}}"#).unwrap_err();
        assert!(matches!(err, StrataError::BadContainerConfig { .. }));
    }

    #[test]
    fn test_from_slice_rejects_wrong_rootfs_type() {
        let json = br#"{
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "overlay", "diff_ids": []}
        }"#;
        let err = ContainerConfig::from_slice(json).unwrap_err();
        assert!(err.to_string().contains("overlay"));
    }

    #[test]
    fn test_parses_real_world_config() {
        // Shape as produced by docker, with fields we do not model
        let json = br#"{
            "architecture": "arm64",
            "os": "linux",
            "created": "2023-08-07T10:00:00Z",
            "config": {
                "Env": ["PATH=/usr/local/bin"],
                "Cmd": ["/bin/sh"],
                "WorkingDir": "/",
                "OnBuild": null
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:0000000000000000000000000000000000000000000000000000000000000000"]
            },
            "history": [
                {"created": "2023-08-07T10:00:00Z", "created_by": "/bin/sh -c #(nop) CMD"}
            ]
        }"#;
        let config = ContainerConfig::from_slice(json).unwrap();
        assert_eq!(config.architecture, "arm64");
        assert_eq!(config.config.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(config.rootfs.diff_ids.len(), 1);
    }
}
