//! Docker config file (`config.json`) credential sources.
//!
//! The file lives at `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`
//! and carries three credential surfaces: per-registry `credHelpers`, the
//! global `credsStore`, and inline `auths` entries with base64
//! `user:password` (or an `identitytoken` refresh token).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use strata_core::error::{Result, StrataError};

use super::{fetch_from_helper, Credential, CredentialRetriever};

/// Parsed Docker config file (the fields we read).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,

    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,

    #[serde(rename = "credsStore", default)]
    creds_store: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

impl DockerConfigFile {
    /// Load from `$DOCKER_CONFIG/config.json` or the platform default.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load(&default_config_path())
    }

    /// Load from an explicit path. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&raw)?;
        Ok(Some(config))
    }

    /// The helper configured for `registry`: a `credHelpers` entry wins over
    /// the global `credsStore`.
    pub fn helper_for(&self, registry: &str) -> Option<String> {
        for alias in registry_aliases(registry) {
            if let Some(helper) = self.cred_helpers.get(alias.as_str()) {
                return Some(helper.clone());
            }
        }
        self.creds_store.clone()
    }

    /// The inline `auths` credential for `registry`, if any.
    pub fn auth_for(&self, registry: &str) -> Result<Option<Credential>> {
        for alias in registry_aliases(registry) {
            let Some(entry) = self.auths.get(alias.as_str()) else {
                continue;
            };

            if let Some(token) = &entry.identitytoken {
                return Ok(Some(Credential::refresh_token(token.clone())));
            }
            if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
                return Ok(Some(Credential::basic(username.clone(), password.clone())));
            }
            if let Some(auth) = &entry.auth {
                return decode_auth(auth).map(Some);
            }
        }
        Ok(None)
    }
}

/// Decode a base64 `user:password` auth string.
fn decode_auth(auth: &str) -> Result<Credential> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| StrataError::Serialization(format!("invalid auths entry: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| StrataError::Serialization(format!("invalid auths entry: {e}")))?;
    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        StrataError::Serialization("auths entry is not user:password".to_string())
    })?;
    Ok(Credential::basic(username, password))
}

fn default_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir).join("config.json");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docker")
        .join("config.json")
}

/// The key spellings under which a registry may appear in the config file.
/// Docker Hub historically used the `https://index.docker.io/v1/` key.
fn registry_aliases(registry: &str) -> Vec<String> {
    let mut aliases = vec![registry.to_string(), format!("https://{registry}")];
    if matches!(
        registry,
        "registry-1.docker.io" | "index.docker.io" | "docker.io"
    ) {
        aliases.push("index.docker.io".to_string());
        aliases.push("docker.io".to_string());
        aliases.push("https://index.docker.io/v1/".to_string());
    }
    aliases
}

/// Retriever 3: helpers named by the Docker config file.
#[derive(Default)]
pub struct ConfigHelperRetriever {
    /// Override for tests; `None` means the default location.
    pub config_path: Option<PathBuf>,
}

impl ConfigHelperRetriever {
    fn load(&self) -> Result<Option<DockerConfigFile>> {
        match &self.config_path {
            Some(path) => DockerConfigFile::load(path),
            None => DockerConfigFile::load_default(),
        }
    }
}

#[async_trait]
impl CredentialRetriever for ConfigHelperRetriever {
    fn description(&self) -> String {
        "credHelpers/credsStore from Docker config".to_string()
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        let Some(config) = self.load()? else {
            return Ok(None);
        };
        let Some(helper) = config.helper_for(registry) else {
            return Ok(None);
        };
        fetch_from_helper(&helper, registry).await
    }
}

/// Retriever 4: inline `auths` entries from the Docker config file.
#[derive(Default)]
pub struct ConfigAuthRetriever {
    pub config_path: Option<PathBuf>,
}

#[async_trait]
impl CredentialRetriever for ConfigAuthRetriever {
    fn description(&self) -> String {
        "auths from Docker config".to_string()
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        let config = match &self.config_path {
            Some(path) => DockerConfigFile::load(path)?,
            None => DockerConfigFile::load_default()?,
        };
        match config {
            Some(config) => config.auth_for(registry),
            None => Ok(None),
        }
    }
}
