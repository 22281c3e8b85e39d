//! Registry credential resolution.
//!
//! A credential retriever produces an optional `(username, secret)` pair for
//! a registry host. The resolver composes retrievers in a fixed priority
//! order; the first hit wins, and a retriever that errors is logged and
//! skipped rather than failing the build.

mod docker_config;
mod helper;

pub use docker_config::DockerConfigFile;
pub use helper::fetch_from_helper;

use async_trait::async_trait;
use strata_core::error::Result;

/// Username that marks the secret as an OAuth2 refresh token rather than a
/// password (the Docker credential-helper convention).
pub const TOKEN_USERNAME: &str = "<token>";

/// A `(username, secret)` pair for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl Credential {
    pub fn basic(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// A credential whose secret is an OAuth2 refresh token.
    pub fn refresh_token(token: impl Into<String>) -> Self {
        Self {
            username: TOKEN_USERNAME.to_string(),
            secret: token.into(),
        }
    }

    pub fn is_refresh_token(&self) -> bool {
        self.username == TOKEN_USERNAME
    }
}

/// A single source of credentials for a registry host.
#[async_trait]
pub trait CredentialRetriever: Send + Sync {
    /// Human-readable source name, used in skip/miss log lines.
    fn description(&self) -> String;

    /// Returns a credential for `registry`, or `None` when this source has
    /// nothing for it.
    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>>;
}

/// Ordered chain of credential retrievers.
pub struct CredentialResolver {
    retrievers: Vec<Box<dyn CredentialRetriever>>,
}

impl CredentialResolver {
    pub fn new(retrievers: Vec<Box<dyn CredentialRetriever>>) -> Self {
        Self { retrievers }
    }

    /// The standard chain:
    ///
    /// 1. explicit credential supplied for this image
    /// 2. named credential helper
    /// 3. `credHelpers` / `credsStore` from the Docker config file
    /// 4. inline `auths` from the same file
    /// 5. well-known platform keychain helpers
    pub fn default_chain(explicit: Option<Credential>, helper: Option<String>) -> Self {
        let mut retrievers: Vec<Box<dyn CredentialRetriever>> = Vec::new();
        if let Some(credential) = explicit {
            retrievers.push(Box::new(InlineRetriever { credential }));
        }
        if let Some(name) = helper {
            retrievers.push(Box::new(NamedHelperRetriever { name }));
        }
        retrievers.push(Box::new(docker_config::ConfigHelperRetriever::default()));
        retrievers.push(Box::new(docker_config::ConfigAuthRetriever::default()));
        retrievers.push(Box::new(WellKnownHelperRetriever));
        Self { retrievers }
    }

    /// Walks the chain; first hit wins. Errors are logged and skipped.
    pub async fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        for retriever in &self.retrievers {
            match retriever.retrieve(registry).await {
                Ok(Some(credential)) => {
                    tracing::debug!(
                        registry = %registry,
                        source = %retriever.description(),
                        "Resolved registry credential"
                    );
                    return Ok(Some(credential));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        registry = %registry,
                        source = %retriever.description(),
                        error = %e,
                        "Credential retriever failed, skipping"
                    );
                }
            }
        }
        tracing::debug!(registry = %registry, "No credential found, proceeding anonymously");
        Ok(None)
    }
}

/// Retriever 1: the credential the caller supplied for this image.
struct InlineRetriever {
    credential: Credential,
}

#[async_trait]
impl CredentialRetriever for InlineRetriever {
    fn description(&self) -> String {
        "inline credential".to_string()
    }

    async fn retrieve(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(Some(self.credential.clone()))
    }
}

/// Retriever 2: a credential helper named explicitly in the build plan.
struct NamedHelperRetriever {
    name: String,
}

#[async_trait]
impl CredentialRetriever for NamedHelperRetriever {
    fn description(&self) -> String {
        format!("credential helper docker-credential-{}", self.name)
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        fetch_from_helper(&self.name, registry).await
    }
}

/// Retriever 5: well-known platform keychain helpers, tried best-effort.
struct WellKnownHelperRetriever;

impl WellKnownHelperRetriever {
    fn candidates() -> &'static [&'static str] {
        if cfg!(target_os = "macos") {
            &["osxkeychain"]
        } else if cfg!(target_os = "windows") {
            &["wincred"]
        } else {
            &["secretservice", "pass"]
        }
    }
}

#[async_trait]
impl CredentialRetriever for WellKnownHelperRetriever {
    fn description(&self) -> String {
        "well-known keychain helpers".to_string()
    }

    async fn retrieve(&self, registry: &str) -> Result<Option<Credential>> {
        for name in Self::candidates() {
            if let Some(credential) = fetch_from_helper(name, registry).await? {
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }
}
