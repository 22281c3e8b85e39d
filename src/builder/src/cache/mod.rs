//! Content-addressed layer cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   layers/<digest-hex>/        # immutable once present
//!     blob                      # gzipped layer
//!     diff-id                   # sha256:<hex> of the uncompressed tar
//!     size                      # decimal byte count of blob
//!   selectors/<selector-hex>    # one line: the layer digest
//!   manifests/<image-hex>/
//!     manifest.json
//!     config.json
//!   tmp/                        # in-flight writes, unique per writer
//! ```
//!
//! Writers stream into `tmp/` and rename into place, so readers observe
//! either a complete entry or none. When two writers race on one key the
//! first rename wins and the loser discards its temp files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use strata_core::error::{Result, StrataError};

use crate::blob::{CompressedBlob, Digest};
use crate::reference::ImageReference;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A layer resolved from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
    pub digest: Digest,
    pub diff_id: Digest,
    pub size: u64,
    /// Path of the gzipped blob; valid as long as the entry exists.
    pub blob_path: PathBuf,
}

/// An in-flight blob write under `tmp/`. Deleted on drop unless committed.
pub struct TempBlob {
    path: PathBuf,
    file: Option<fs::File>,
}

impl TempBlob {
    /// The open temp file to stream into.
    pub fn file(&mut self) -> &mut fs::File {
        self.file.as_mut().expect("temp blob already committed")
    }

    /// Path of the temp file, for re-reading what was streamed in.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempBlob {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.file.take();
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Content-addressed on-disk store for layer blobs and base-image metadata.
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["layers", "selectors", "manifests", "tmp"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start writing a blob. The caller streams compressed bytes into the
    /// returned temp file, then commits with [`LayerCache::commit_layer`].
    pub fn begin_write(&self) -> Result<TempBlob> {
        let name = format!(
            "write-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.root.join("tmp").join(name);
        let file = fs::File::create(&path)?;
        Ok(TempBlob {
            path,
            file: Some(file),
        })
    }

    /// Move a fully written temp blob into `layers/<digest>/`.
    ///
    /// If another writer already produced the entry, the temp file is
    /// discarded and the existing entry is authoritative.
    pub fn commit_layer(&self, mut temp: TempBlob, blob: &CompressedBlob) -> Result<CachedLayer> {
        let file = temp.file.take().expect("temp blob already committed");
        file.sync_all()?;
        drop(file);

        let layer_dir = self.layer_dir(&blob.digest);
        let blob_path = layer_dir.join("blob");

        if blob_path.exists() {
            // lost the race; existing entry wins
            let _ = fs::remove_file(&temp.path);
            return self.require_layer(&blob.digest);
        }

        fs::create_dir_all(&layer_dir)?;
        fs::rename(&temp.path, &blob_path)?;
        write_atomic(&layer_dir.join("diff-id"), blob.diff_id.to_string().as_bytes())?;
        write_atomic(&layer_dir.join("size"), blob.size.to_string().as_bytes())?;

        Ok(CachedLayer {
            digest: blob.digest,
            diff_id: blob.diff_id,
            size: blob.size,
            blob_path,
        })
    }

    /// Record that `selector` resolves to `layer_digest`.
    pub fn write_selector(&self, selector: &Digest, layer_digest: &Digest) -> Result<()> {
        write_atomic(
            &self.selector_path(selector),
            layer_digest.to_string().as_bytes(),
        )
    }

    /// Look up a layer by its blob digest.
    ///
    /// Returns `Ok(None)` when absent; `CacheCorrupted` when the entry is
    /// only partially present.
    pub fn layer_by_digest(&self, digest: &Digest) -> Result<Option<CachedLayer>> {
        let layer_dir = self.layer_dir(digest);
        let blob_path = layer_dir.join("blob");
        if !blob_path.exists() {
            return Ok(None);
        }

        let diff_id_raw = read_metadata(&layer_dir.join("diff-id"))?;
        let diff_id = Digest::parse(diff_id_raw.trim()).map_err(|_| corrupted(digest, "diff-id"))?;
        let size_raw = read_metadata(&layer_dir.join("size"))?;
        let size: u64 = size_raw
            .trim()
            .parse()
            .map_err(|_| corrupted(digest, "size"))?;

        Ok(Some(CachedLayer {
            digest: *digest,
            diff_id,
            size,
            blob_path,
        }))
    }

    /// Look up a layer by selector.
    ///
    /// A selector pointing at a missing layer is a corruption condition: the
    /// caller is expected to delete the selector and rebuild.
    pub fn layer_by_selector(&self, selector: &Digest) -> Result<Option<CachedLayer>> {
        let selector_path = self.selector_path(selector);
        let raw = match fs::read_to_string(&selector_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let digest = Digest::parse(raw.trim()).map_err(|_| StrataError::CacheCorrupted {
            message: format!("selector {} holds an invalid digest", selector.hex()),
        })?;

        match self.layer_by_digest(&digest)? {
            Some(layer) => Ok(Some(layer)),
            None => Err(StrataError::CacheCorrupted {
                message: format!(
                    "selector {} points at missing layer {}",
                    selector.hex(),
                    digest
                ),
            }),
        }
    }

    /// Delete a selector record (cache repair).
    pub fn remove_selector(&self, selector: &Digest) -> Result<()> {
        match fs::remove_file(self.selector_path(selector)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Store pulled base-image metadata (manifest + config) as one unit.
    ///
    /// Both files land via a temp directory rename, so a reader never sees
    /// one without the other.
    pub fn write_base_image(
        &self,
        reference: &ImageReference,
        platform: &str,
        manifest: &[u8],
        config: &[u8],
    ) -> Result<()> {
        let final_dir = self.manifest_dir(reference, platform);
        let temp_dir = self.root.join("tmp").join(format!(
            "manifest-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&temp_dir)?;
        fs::write(temp_dir.join("manifest.json"), manifest)?;
        fs::write(temp_dir.join("config.json"), config)?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        match fs::rename(&temp_dir, &final_dir) {
            Ok(()) => Ok(()),
            Err(_) if final_dir.exists() => {
                // concurrent writer got there first
                let _ = fs::remove_dir_all(&temp_dir);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load cached base-image metadata: `(manifest bytes, config bytes)`.
    ///
    /// Readable only when both halves are present.
    pub fn base_image(
        &self,
        reference: &ImageReference,
        platform: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let dir = self.manifest_dir(reference, platform);
        let manifest_path = dir.join("manifest.json");
        let config_path = dir.join("config.json");
        if !manifest_path.exists() || !config_path.exists() {
            return Ok(None);
        }
        Ok(Some((fs::read(manifest_path)?, fs::read(config_path)?)))
    }

    fn layer_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join("layers").join(digest.hex())
    }

    fn selector_path(&self, selector: &Digest) -> PathBuf {
        self.root.join("selectors").join(selector.hex())
    }

    /// Keyed by reference *and* platform: one tag can resolve to different
    /// manifests per platform via a list.
    fn manifest_dir(&self, reference: &ImageReference, platform: &str) -> PathBuf {
        let key = format!("{}#{}", reference.full_reference(), platform);
        self.root.join("manifests").join(Digest::of_bytes(key.as_bytes()).hex())
    }

    fn require_layer(&self, digest: &Digest) -> Result<CachedLayer> {
        self.layer_by_digest(digest)?.ok_or_else(|| {
            StrataError::CacheCorrupted {
                message: format!("layer {} vanished during commit", digest),
            }
        })
    }
}

fn corrupted(digest: &Digest, what: &str) -> StrataError {
    StrataError::CacheCorrupted {
        message: format!("layer {} has a missing or invalid {}", digest, what),
    }
}

fn read_metadata(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StrataError::CacheCorrupted {
                message: format!("missing metadata file {}", path.display()),
            }
        } else {
            e.into()
        }
    })
}

/// Write a small metadata file via temp + rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp = path.with_extension("tmp");
    let mut file = fs::File::create(&temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::gzip_compress;
    use tempfile::TempDir;

    fn write_layer(cache: &LayerCache, payload: &[u8]) -> (CompressedBlob, CachedLayer) {
        let mut temp = cache.begin_write().unwrap();
        let blob = gzip_compress(&mut &payload[..], temp.file()).unwrap();
        let layer = cache.commit_layer(temp, &blob).unwrap();
        (blob, layer)
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        LayerCache::open(&root).unwrap();
        assert!(root.join("layers").is_dir());
        assert!(root.join("selectors").is_dir());
        assert!(root.join("manifests").is_dir());
    }

    #[test]
    fn test_write_and_read_by_digest() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let (blob, layer) = write_layer(&cache, b"layer payload");
        assert_eq!(layer.digest, blob.digest);
        assert_eq!(layer.diff_id, blob.diff_id);
        assert_eq!(layer.size, blob.size);

        let found = cache.layer_by_digest(&blob.digest).unwrap().unwrap();
        assert_eq!(found, layer);
        assert_eq!(
            std::fs::metadata(&found.blob_path).unwrap().len(),
            blob.size
        );
    }

    #[test]
    fn test_missing_layer_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();
        let absent = Digest::of_bytes(b"never written");
        assert!(cache.layer_by_digest(&absent).unwrap().is_none());
    }

    #[test]
    fn test_selector_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let (blob, _) = write_layer(&cache, b"payload");
        let selector = Digest::of_bytes(b"inputs fingerprint");
        cache.write_selector(&selector, &blob.digest).unwrap();

        let found = cache.layer_by_selector(&selector).unwrap().unwrap();
        assert_eq!(found.digest, blob.digest);
    }

    #[test]
    fn test_unknown_selector_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();
        let selector = Digest::of_bytes(b"nothing here");
        assert!(cache.layer_by_selector(&selector).unwrap().is_none());
    }

    #[test]
    fn test_dangling_selector_is_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let selector = Digest::of_bytes(b"fingerprint");
        let missing = Digest::of_bytes(b"missing layer");
        cache.write_selector(&selector, &missing).unwrap();

        let err = cache.layer_by_selector(&selector).unwrap_err();
        assert!(matches!(err, StrataError::CacheCorrupted { .. }));

        // repair: drop the selector, then it reads as a miss
        cache.remove_selector(&selector).unwrap();
        assert!(cache.layer_by_selector(&selector).unwrap().is_none());
    }

    #[test]
    fn test_partial_metadata_is_corruption() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let (blob, layer) = write_layer(&cache, b"payload");
        std::fs::remove_file(layer.blob_path.parent().unwrap().join("diff-id")).unwrap();

        let err = cache.layer_by_digest(&blob.digest).unwrap_err();
        assert!(matches!(err, StrataError::CacheCorrupted { .. }));
    }

    #[test]
    fn test_duplicate_commit_keeps_existing() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let (_, first) = write_layer(&cache, b"same payload");
        let (_, second) = write_layer(&cache, b"same payload");
        assert_eq!(first, second);

        // no temp leftovers
        let leftovers: Vec<_> = std::fs::read_dir(cache.root().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_temp_blob_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        {
            let mut temp = cache.begin_write().unwrap();
            temp.file().write_all(b"abandoned").unwrap();
        }
        let leftovers: Vec<_> = std::fs::read_dir(cache.root().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_base_image_metadata_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();
        let reference = ImageReference::parse("alpine:3.18").unwrap();

        assert!(cache.base_image(&reference, "linux/amd64").unwrap().is_none());

        cache
            .write_base_image(&reference, "linux/amd64", b"{\"manifest\":1}", b"{\"config\":1}")
            .unwrap();
        let (manifest, config) = cache
            .base_image(&reference, "linux/amd64")
            .unwrap()
            .unwrap();
        assert_eq!(manifest, b"{\"manifest\":1}");
        assert_eq!(config, b"{\"config\":1}");
    }

    #[test]
    fn test_base_image_distinct_per_reference_and_platform() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::open(dir.path()).unwrap();

        let a = ImageReference::parse("alpine:3.18").unwrap();
        let b = ImageReference::parse("alpine:3.19").unwrap();
        cache
            .write_base_image(&a, "linux/amd64", b"ma", b"ca")
            .unwrap();

        assert!(cache.base_image(&b, "linux/amd64").unwrap().is_none());
        assert!(cache.base_image(&a, "linux/arm64").unwrap().is_none());
    }
}
