//! Application layer construction.
//!
//! Turns a [`LayerSpec`](super::LayerSpec) into a reproducible gzipped tar:
//! entries sorted by extraction path, synthesized parent directories, fixed
//! numeric owner, and default epoch+1 timestamps. The result is keyed in the
//! cache by a selector fingerprint over the layer's inputs, so identical
//! inputs reuse the stored blob and any change misses.

use std::collections::BTreeMap;
use std::io::Write;

use strata_core::error::{Result, StrataError};

use super::FileEntry;
use crate::blob::{CompressingWriter, Digest};
use crate::cache::{CachedLayer, LayerCache};

/// A layer produced for this build, with provenance for diagnostics.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub layer: CachedLayer,
    /// True when the cache already held the blob and nothing was rebuilt.
    pub from_cache: bool,
}

/// Compute the cache selector for a set of layer entries.
///
/// The fingerprint covers, per entry and sorted by extraction path:
/// `(extraction path, source content digest, permissions, modified time)`.
/// Any change to any field produces a different selector.
pub fn selector(entries: &[FileEntry]) -> Result<Digest> {
    let mut sorted: Vec<&FileEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.extraction_path.cmp(&b.extraction_path));

    let mut records = Vec::with_capacity(sorted.len());
    for entry in sorted {
        let is_directory = entry.source.is_dir();
        let content_digest = if is_directory {
            Digest::of_bytes(b"")
        } else {
            let mut file = std::fs::File::open(&entry.source)?;
            crate::blob::compute_digest(&mut file)?.digest
        };
        records.push(serde_json::json!([
            entry.extraction_path,
            content_digest.to_string(),
            format!("{:o}", entry.effective_permissions(is_directory)),
            entry.effective_modified_time(),
        ]));
    }

    let serialized = serde_json::to_vec(&records)?;
    Ok(Digest::of_bytes(&serialized))
}

/// Build (or reuse) the layer for `entries`.
///
/// Looks up the selector first; a corrupt cache entry is repaired by
/// dropping the selector and rebuilding, leaving the output unchanged from
/// a clean build.
pub fn build_layer(cache: &LayerCache, name: &str, entries: &[FileEntry]) -> Result<BuiltLayer> {
    validate_entries(entries)?;
    let selector = selector(entries)?;

    match cache.layer_by_selector(&selector) {
        Ok(Some(layer)) => {
            tracing::debug!(layer = %name, digest = %layer.digest, "Layer cache hit");
            return Ok(BuiltLayer {
                layer,
                from_cache: true,
            });
        }
        Ok(None) => {}
        Err(StrataError::CacheCorrupted { message }) => {
            tracing::warn!(layer = %name, %message, "Cache repaired");
            cache.remove_selector(&selector)?;
        }
        Err(e) => return Err(e),
    }

    let mut temp = cache.begin_write()?;
    let mut writer = CompressingWriter::new(temp.file());
    write_tar(&mut writer, entries)?;
    let (_, blob) = writer.finish()?;

    let layer = cache.commit_layer(temp, &blob)?;
    cache.write_selector(&selector, &layer.digest)?;

    tracing::info!(
        layer = %name,
        digest = %layer.digest,
        size = layer.size,
        "Built application layer"
    );
    Ok(BuiltLayer {
        layer,
        from_cache: false,
    })
}

fn validate_entries(entries: &[FileEntry]) -> Result<()> {
    for entry in entries {
        if !entry.extraction_path.starts_with('/') {
            return Err(StrataError::BadContainerConfig {
                message: format!(
                    "extraction path '{}' is not absolute",
                    entry.extraction_path
                ),
            });
        }
    }
    Ok(())
}

/// What one tar entry will be, after sorting and parent synthesis.
enum TarRecord<'a> {
    File(&'a FileEntry),
    Directory(&'a FileEntry),
    /// A parent directory not listed explicitly.
    SyntheticDirectory,
}

/// Write the layer tar: explicit entries plus synthesized parent
/// directories, all sorted by path, with uid/gid fixed to 0.
fn write_tar<W: Write>(out: &mut W, entries: &[FileEntry]) -> Result<()> {
    let mut records: BTreeMap<String, TarRecord> = BTreeMap::new();

    for entry in entries {
        // every ancestor gets a directory record unless something explicit
        // claims the path later
        let mut ancestor = entry.extraction_path.as_str();
        while let Some(slash) = ancestor.rfind('/') {
            ancestor = &ancestor[..slash];
            if ancestor.is_empty() {
                break;
            }
            records
                .entry(ancestor.to_string())
                .or_insert(TarRecord::SyntheticDirectory);
        }
    }
    for entry in entries {
        let record = if entry.source.is_dir() {
            TarRecord::Directory(entry)
        } else {
            TarRecord::File(entry)
        };
        records.insert(entry.extraction_path.clone(), record);
    }

    let mut builder = tar::Builder::new(out);
    for (path, record) in &records {
        let tar_path = path.trim_start_matches('/');
        match record {
            TarRecord::File(entry) => {
                let metadata = std::fs::metadata(&entry.source)?;
                let mut header = reproducible_header(
                    entry.effective_permissions(false),
                    entry.effective_modified_time(),
                );
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(metadata.len());
                let file = std::fs::File::open(&entry.source)?;
                builder.append_data(&mut header, tar_path, file)?;
            }
            TarRecord::Directory(entry) => {
                let mut header = reproducible_header(
                    entry.effective_permissions(true),
                    entry.effective_modified_time(),
                );
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{tar_path}/"), std::io::empty())?;
            }
            TarRecord::SyntheticDirectory => {
                let mut header = reproducible_header(
                    super::DEFAULT_DIRECTORY_PERMISSIONS,
                    super::DEFAULT_MODIFIED_TIME,
                );
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{tar_path}/"), std::io::empty())?;
            }
        }
    }
    builder.finish()?;
    Ok(())
}

/// A header with everything host-dependent pinned down.
fn reproducible_header(mode: u32, mtime: i64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mode(mode);
    header.set_mtime(mtime.max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// List the entry paths of a gzipped layer tar (test support for callers).
#[cfg(test)]
fn tar_entry_paths(blob_path: &std::path::Path) -> Vec<String> {
    let file = std::fs::File::open(blob_path).unwrap();
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(dir: &TempDir, name: &str, contents: &[u8], extraction: &str) -> FileEntry {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        FileEntry::new(path, extraction)
    }

    #[test]
    fn test_selector_is_stable() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            entry(&dir, "a.class", b"aaa", "/app/classes/a.class"),
            entry(&dir, "b.class", b"bbb", "/app/classes/b.class"),
        ];
        assert_eq!(selector(&entries).unwrap(), selector(&entries).unwrap());
    }

    #[test]
    fn test_selector_ignores_input_order() {
        let dir = TempDir::new().unwrap();
        let a = entry(&dir, "a.class", b"aaa", "/app/classes/a.class");
        let b = entry(&dir, "b.class", b"bbb", "/app/classes/b.class");
        let forward = selector(&[a.clone(), b.clone()]).unwrap();
        let backward = selector(&[b, a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_selector_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let before = selector(&[entry(&dir, "a", b"v1", "/app/a")]).unwrap();
        let after = selector(&[entry(&dir, "a", b"v2", "/app/a")]).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_selector_changes_with_permissions() {
        let dir = TempDir::new().unwrap();
        let base = entry(&dir, "a", b"x", "/app/a");
        let plain = selector(std::slice::from_ref(&base)).unwrap();
        let executable = selector(&[base.with_permissions(0o755)]).unwrap();
        assert_ne!(plain, executable);
    }

    #[test]
    fn test_selector_changes_with_mtime() {
        let dir = TempDir::new().unwrap();
        let base = entry(&dir, "a", b"x", "/app/a");
        let default_time = selector(std::slice::from_ref(&base)).unwrap();
        let overridden = selector(&[base.with_modified_time(42)]).unwrap();
        assert_ne!(default_time, overridden);
    }

    #[test]
    fn test_build_layer_and_cache_hit() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();

        let entries = vec![entry(&dir, "hello", b"hi\n", "/hello")];
        let first = build_layer(&cache, "app", &entries).unwrap();
        assert!(!first.from_cache);

        let second = build_layer(&cache, "app", &entries).unwrap();
        assert!(second.from_cache);
        assert_eq!(first.layer, second.layer);
    }

    #[test]
    fn test_build_layer_reproducible() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            entry(&dir, "one", b"1", "/app/lib/one.jar"),
            entry(&dir, "two", b"2", "/app/classes/Two.class"),
        ];

        let cache_a = TempDir::new().unwrap();
        let cache_b = TempDir::new().unwrap();
        let a = build_layer(&LayerCache::open(cache_a.path()).unwrap(), "l", &entries).unwrap();
        let b = build_layer(&LayerCache::open(cache_b.path()).unwrap(), "l", &entries).unwrap();

        assert_eq!(a.layer.digest, b.layer.digest);
        assert_eq!(a.layer.diff_id, b.layer.diff_id);
    }

    #[test]
    fn test_tar_sorted_with_parent_directories() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();

        let entries = vec![
            entry(&dir, "z", b"z", "/app/z.txt"),
            entry(&dir, "a", b"a", "/app/sub/a.txt"),
        ];
        let built = build_layer(&cache, "app", &entries).unwrap();
        let paths = tar_entry_paths(&built.layer.blob_path);
        assert_eq!(
            paths,
            vec![
                "app/".to_string(),
                "app/sub/".to_string(),
                "app/sub/a.txt".to_string(),
                "app/z.txt".to_string(),
            ]
        );
    }

    #[test]
    fn test_directory_entry_does_not_recurse() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("data");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("inner.txt"), b"inner").unwrap();

        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();
        let entries = vec![FileEntry::new(sub, "/data")];
        let built = build_layer(&cache, "data", &entries).unwrap();

        let paths = tar_entry_paths(&built.layer.blob_path);
        assert_eq!(paths, vec!["data/".to_string()]);
    }

    #[test]
    fn test_relative_extraction_path_rejected() {
        let dir = TempDir::new().unwrap();
        let entries = vec![entry(&dir, "a", b"a", "app/a")];
        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();
        assert!(build_layer(&cache, "bad", &entries).is_err());
    }

    #[test]
    fn test_cache_repair_rebuilds_identically() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();

        let entries = vec![entry(&dir, "hello", b"hi\n", "/hello")];
        let clean = build_layer(&cache, "app", &entries).unwrap();

        // corrupt: drop the blob but leave the selector pointing at it
        std::fs::remove_dir_all(clean.layer.blob_path.parent().unwrap()).unwrap();

        let repaired = build_layer(&cache, "app", &entries).unwrap();
        assert!(!repaired.from_cache);
        assert_eq!(repaired.layer.digest, clean.layer.digest);
        assert_eq!(repaired.layer.diff_id, clean.layer.diff_id);
    }

    #[test]
    fn test_fixed_owner_in_tar() {
        let dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache = LayerCache::open(cache_dir.path()).unwrap();

        let entries = vec![entry(&dir, "hello", b"hi\n", "/hello")];
        let built = build_layer(&cache, "app", &entries).unwrap();

        let file = std::fs::File::open(&built.layer.blob_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 0);
            assert_eq!(entry.header().gid().unwrap(), 0);
        }
    }
}
