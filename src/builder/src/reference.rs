//! Image reference parsing.
//!
//! Parses references like `ghcr.io/acme/app:1.4` into structured components.

use strata_core::error::{Result, StrataError};

use crate::blob::Digest;

/// Default registry when none is specified (the Docker Hub v2 endpoint).
const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
///
/// Exactly one of `tag` / `digest` identifies the image; when both appear in
/// the input the digest wins for resolution and the tag is kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with port (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/alpine", "acme/app")
    pub repository: String,
    /// Tag (e.g. "latest", "1.4")
    pub tag: Option<String>,
    /// Digest, when pinned
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → registry-1.docker.io/library/alpine:latest
    /// - `alpine:3.18` → registry-1.docker.io/library/alpine:3.18
    /// - `acme/app` → registry-1.docker.io/acme/app:latest
    /// - `ghcr.io/acme/app:1.4`
    /// - `ghcr.io/acme/app@sha256:<hex>`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, 0, "empty reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest = Digest::parse(&reference[at_pos + 1..])
                    .map_err(|_| invalid(reference, at_pos + 1, "expected sha256:<64 hex>"))?;
                (&reference[..at_pos], Some(digest))
            }
            None => (reference, None),
        };

        // Split tag: the last colon after the last slash
        let (name, tag) = split_tag(name_tag);
        if let Some(ref t) = tag {
            validate_tag(reference, name.len() + 1, t)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        // Apply default tag if no tag and no digest
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether this reference points at Docker Hub (any alias).
    pub fn is_docker_hub(&self) -> bool {
        matches!(
            self.registry.as_str(),
            "registry-1.docker.io" | "index.docker.io" | "docker.io"
        )
    }

    /// The identifier used on manifest endpoints: digest if pinned, else tag.
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn invalid(reference: &str, position: usize, message: &str) -> StrataError {
    StrataError::InvalidImageReference {
        reference: reference.to_string(),
        position,
        message: message.to_string(),
    }
}

/// Split `name[:tag]`, treating a colon inside the first path component as a
/// registry port rather than a tag separator.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    match name_tag.rfind('/') {
        Some(slash_pos) => {
            let after_slash = &name_tag[slash_pos + 1..];
            match after_slash.rfind(':') {
                Some(colon_pos) => (
                    &name_tag[..slash_pos + 1 + colon_pos],
                    Some(after_slash[colon_pos + 1..].to_string()),
                ),
                None => (name_tag, None),
            }
        }
        None => match name_tag.rfind(':') {
            // A lone `host:1234` with an all-numeric suffix is a port
            Some(colon_pos) if name_tag[colon_pos + 1..].chars().all(|c| c.is_ascii_digit()) => {
                (name_tag, None)
            }
            Some(colon_pos) => (
                &name_tag[..colon_pos],
                Some(name_tag[colon_pos + 1..].to_string()),
            ),
            None => (name_tag, None),
        },
    }
}

fn validate_tag(reference: &str, position: usize, tag: &str) -> Result<()> {
    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid(reference, position, "invalid tag"));
    }
    Ok(())
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    // The first component is a registry hostname when it contains a dot or a
    // colon, or is "localhost".
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err(invalid(reference, slash_pos + 1, "empty repository"));
            }
            validate_repository(reference, slash_pos + 1, repo)?;
            return Ok((normalize_registry(first), repo.to_string()));
        }
    }

    if name.is_empty() {
        return Err(invalid(reference, 0, "empty repository"));
    }
    validate_repository(reference, 0, name)?;

    // No registry detected: Docker Hub, with `library/` implied for
    // single-segment repositories.
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn validate_repository(reference: &str, position: usize, repository: &str) -> Result<()> {
    for segment in repository.split('/') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
        {
            return Err(invalid(reference, position, "invalid repository segment"));
        }
    }
    Ok(())
}

/// Normalize Docker Hub aliases to the actual v2 endpoint.
fn normalize_registry(registry: &str) -> String {
    match registry {
        "docker.io" | "index.docker.io" => DEFAULT_REGISTRY.to_string(),
        other => other.to_string(),
    }
}
