//! Image export: `docker save`-style tar output and `docker load` piping.
//!
//! The tar layout is what `docker load` expects:
//!
//! ```text
//! config.json             # container configuration
//! <layer-hex>.tar.gz      # one per layer, in order
//! manifest.json           # [{"Config", "RepoTags", "Layers"}]
//! repositories            # legacy tag map
//! ```

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use strata_core::error::{Result, StrataError};

use crate::cache::CachedLayer;

/// Everything needed to serialize an image to a tarball.
#[derive(Debug, Clone)]
pub struct ExportImage {
    /// Serialized container config.
    pub config: Vec<u8>,
    /// Layers in manifest order; blobs are read from the cache.
    pub layers: Vec<CachedLayer>,
    /// `repository:tag` names to record.
    pub repo_tags: Vec<String>,
}

#[derive(Serialize)]
struct TarManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write the image tarball to `out`.
pub fn write_tar<W: Write>(image: &ExportImage, out: W) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    append_file(&mut builder, "config.json", &image.config)?;

    let mut layer_names = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        let name = format!("{}.tar.gz", layer.digest.hex());
        let contents = std::fs::read(&layer.blob_path)?;
        append_file(&mut builder, &name, &contents)?;
        layer_names.push(name);
    }

    let manifest = vec![TarManifestEntry {
        config: "config.json".to_string(),
        repo_tags: image.repo_tags.clone(),
        layers: layer_names,
    }];
    append_file(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    let repositories = repositories_json(image)?;
    append_file(&mut builder, "repositories", &repositories)?;

    builder.finish()?;
    Ok(())
}

/// Write the image tarball to a file path.
pub fn write_tar_file(image: &ExportImage, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    write_tar(image, file)?;
    tracing::info!(path = %path.display(), "Wrote image tarball");
    Ok(())
}

/// Stream the image tarball into `docker load`.
///
/// The tar is staged in a temp file so the subprocess reads a plain file
/// descriptor; the child's exit code propagates.
pub async fn load_into_docker(image: &ExportImage, docker_executable: &str) -> Result<()> {
    let staging = tempfile::NamedTempFile::new()?;
    write_tar(image, staging.as_file())?;
    staging.as_file().sync_all()?;

    let stdin = std::fs::File::open(staging.path())?;
    let output = tokio::process::Command::new(docker_executable)
        .arg("load")
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(
            status = output.status.code().unwrap_or(-1),
            stderr = %stderr.trim(),
            "docker load failed"
        );
        return Err(StrataError::DockerLoad {
            status: output.status.code().unwrap_or(-1),
        });
    }

    tracing::info!(
        tags = ?image.repo_tags,
        "Loaded image into local daemon"
    );
    Ok(())
}

/// Legacy `repositories` file: `{repo: {tag: <top layer hex>}}`.
fn repositories_json(image: &ExportImage) -> Result<Vec<u8>> {
    let top_layer = image
        .layers
        .last()
        .map(|layer| layer.digest.hex())
        .unwrap_or_default();

    let mut repos = serde_json::Map::new();
    for repo_tag in &image.repo_tags {
        let (repo, tag) = repo_tag
            .rsplit_once(':')
            .unwrap_or((repo_tag.as_str(), "latest"));
        repos
            .entry(repo.to_string())
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()
            .and_then(|tags| tags.insert(tag.to_string(), serde_json::json!(top_layer)));
    }
    Ok(serde_json::to_vec(&serde_json::Value::Object(repos))?)
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, contents: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(contents.len() as u64);
    builder.append_data(&mut header, name, contents)?;
    Ok(())
}
