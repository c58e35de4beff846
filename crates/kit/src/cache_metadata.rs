//! Cache metadata for downloaded base images
//!
//! Every cached image `<os>-<digest>.qcow2` has a JSON sidecar `<image>.json`
//! recording where it came from and the SHA-256 of the bytes that were
//! written. An image is only reused when the sidecar exists, names the same
//! source URL as the catalog, and the file still hashes to the recorded
//! digest; anything else (an interrupted download, a catalog bump, a file
//! edited in place) triggers a fresh download.

use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Version of the sidecar format
const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImageMetadata {
    /// URL the image was downloaded from
    pub source_url: String,

    /// `sha256:<hex>` digest of the image file
    pub digest: String,

    /// Image size in bytes
    pub size: u64,

    pub fetched_at: DateTime<Utc>,

    /// Version of the metadata format for future compatibility
    pub version: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum CacheMiss {
    #[error("file is missing")]
    MissingFile,
    #[error("missing or unreadable metadata sidecar")]
    MissingMetadata,
    #[error("cached from a different source URL")]
    SourceMismatch,
    #[error("hash mismatch")]
    HashMismatch,
}

/// Path of the sidecar for `image`.
pub fn sidecar_path(image: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{image}.json"))
}

/// Stream `path` through SHA-256.
pub fn file_digest(path: &Utf8Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

impl CachedImageMetadata {
    /// Compute metadata for a freshly downloaded image.
    pub fn for_file(path: &Utf8Path, source_url: &str) -> Result<Self> {
        Ok(Self {
            source_url: source_url.to_owned(),
            digest: file_digest(path)?,
            size: std::fs::metadata(path)?.len(),
            fetched_at: Utc::now(),
            version: METADATA_VERSION,
        })
    }

    pub fn write_for(&self, image: &Utf8Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(sidecar_path(image), json)?;
        Ok(())
    }

    /// Read the sidecar for `image`, if present and well-formed.
    pub fn read_for(image: &Utf8Path) -> Option<Self> {
        let data = std::fs::read(sidecar_path(image)).ok()?;
        match serde_json::from_slice(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::debug!("Ignoring malformed sidecar for {}: {}", image, e);
                None
            }
        }
    }
}

/// Check whether a cached image can be reused for `source_url`.
pub(crate) fn check_cached_image(
    image: &Utf8Path,
    source_url: &str,
) -> Result<Result<CachedImageMetadata, CacheMiss>> {
    if !image.exists() {
        tracing::debug!("Cached image {} does not exist", image);
        return Ok(Err(CacheMiss::MissingFile));
    }
    let Some(meta) = CachedImageMetadata::read_for(image) else {
        return Ok(Err(CacheMiss::MissingMetadata));
    };
    if meta.source_url != source_url {
        tracing::debug!(
            "Cached image {} came from {}, catalog now says {}",
            image,
            meta.source_url,
            source_url
        );
        return Ok(Err(CacheMiss::SourceMismatch));
    }
    let actual = file_digest(image)?;
    if actual != meta.digest {
        tracing::debug!(
            "Cached image {} does not match its metadata. Expected: {}, found: {}",
            image,
            meta.digest,
            actual
        );
        return Ok(Err(CacheMiss::HashMismatch));
    }
    Ok(Ok(meta))
}
