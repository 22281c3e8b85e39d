//! Content digests and blob primitives.
//!
//! Everything a registry stores is a blob named by its SHA-256. Layers need
//! two digests at once: the manifest references the compressed bytes
//! (`digest`) while the container config references the uncompressed tar
//! (`diff_id`), so compression computes both in a single streaming pass.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use strata_core::error::{Result, StrataError};

/// A SHA-256 content digest.
///
/// Stored as the raw 32 bytes; rendered as lowercase `sha256:<hex>` on the
/// wire and on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest of a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest(hasher.finalize().into())
    }

    /// Parse a `sha256:<64 hex>` string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("sha256:")
            .ok_or_else(|| StrataError::InvalidDigest {
                value: s.to_string(),
            })?;
        if hex_part.len() != 64 {
            return Err(StrataError::InvalidDigest {
                value: s.to_string(),
            });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|_| StrataError::InvalidDigest {
            value: s.to_string(),
        })?;
        Ok(Digest(bytes))
    }

    /// The bare hex portion, without the `sha256:` prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A blob's identity on the wire: digest, size, and optional media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: Option<String>,
}

impl BlobDescriptor {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            media_type: None,
        }
    }
}

/// Streaming SHA-256 with byte counting.
///
/// Implements `Write` so it can sit anywhere in an output chain.
pub struct Digester {
    hasher: Sha256,
    count: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn finalize(self) -> BlobDescriptor {
        BlobDescriptor::new(Digest(self.hasher.finalize().into()), self.count)
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A writer that hashes and counts everything passing through to `inner`.
pub struct DigestWriter<W: Write> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    /// Consumes the writer, returning the inner writer and the descriptor of
    /// everything written.
    pub fn finish(self) -> (W, BlobDescriptor) {
        (self.inner, self.digester.finalize())
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Stream `reader` through SHA-256, counting bytes.
///
/// Does not close the reader.
pub fn compute_digest<R: Read>(reader: &mut R) -> Result<BlobDescriptor> {
    compute_digest_tee(reader, &mut std::io::sink())
}

/// Stream `reader` through SHA-256 while copying it to `writer`.
///
/// Closes neither side.
pub fn compute_digest_tee<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> Result<BlobDescriptor> {
    let mut digester = Digester::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.write_all(&buf[..n])?;
        writer.write_all(&buf[..n])?;
    }
    Ok(digester.finalize())
}

/// Result of [`gzip_compress`]: both identities of one layer.
#[derive(Debug, Clone)]
pub struct CompressedBlob {
    /// Digest of the gzipped bytes (what the manifest and blob endpoints use).
    pub digest: Digest,
    /// Size of the gzipped bytes.
    pub size: u64,
    /// Digest of the uncompressed tar (what `rootfs.diff_ids` uses).
    pub diff_id: Digest,
    /// Size of the uncompressed tar.
    pub uncompressed_size: u64,
}

/// Gzip-compress `reader` into `out`, computing the compressed digest and the
/// uncompressed diff-id in one pass.
///
/// The input is never re-read: the uncompressed hasher sits in front of the
/// encoder and the compressed hasher behind it. Does not close `out`.
pub fn gzip_compress<R: Read, W: Write>(reader: &mut R, out: &mut W) -> Result<CompressedBlob> {
    let compressed = DigestWriter::new(out);
    let mut encoder = flate2::write::GzEncoder::new(compressed, flate2::Compression::default());

    let mut uncompressed = Digester::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        uncompressed.write_all(&buf[..n])?;
        encoder.write_all(&buf[..n])?;
    }

    let compressed = encoder.finish()?;
    let (_, compressed_descriptor) = compressed.finish();
    let diff_descriptor = uncompressed.finalize();

    Ok(CompressedBlob {
        digest: compressed_descriptor.digest,
        size: compressed_descriptor.size,
        diff_id: diff_descriptor.digest,
        uncompressed_size: diff_descriptor.size,
    })
}

/// Write-side counterpart of [`gzip_compress`]: a `Write` chain that
/// gzip-compresses into `inner` while hashing both sides.
///
/// Used where the producer drives the writes (the tar builder).
pub struct CompressingWriter<W: Write> {
    encoder: flate2::write::GzEncoder<DigestWriter<W>>,
    uncompressed: Digester,
}

impl<W: Write> CompressingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            encoder: flate2::write::GzEncoder::new(
                DigestWriter::new(inner),
                flate2::Compression::default(),
            ),
            uncompressed: Digester::new(),
        }
    }

    /// Flush the encoder and return the inner writer with both digests.
    pub fn finish(self) -> Result<(W, CompressedBlob)> {
        let compressed = self.encoder.finish()?;
        let (inner, compressed_descriptor) = compressed.finish();
        let diff_descriptor = self.uncompressed.finalize();
        Ok((
            inner,
            CompressedBlob {
                digest: compressed_descriptor.digest,
                size: compressed_descriptor.size,
                diff_id: diff_descriptor.digest,
                uncompressed_size: diff_descriptor.size,
            },
        ))
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.uncompressed.write_all(buf)?;
        self.encoder.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.flush()
    }
}
