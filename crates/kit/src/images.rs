//! Base image catalog and local cache.
//!
//! OS identifiers such as `ubuntu-24.04` map to upstream cloud images. The
//! cache downloads an image on first use, records a metadata sidecar next to
//! it, and serves the cached copy afterwards.
//!
//! Cached files are named `<os>-<digest prefix>.qcow2`. They back the disk
//! overlays of every VM created from them, so a file is never replaced by
//! different bytes: a new download lands under its own name and older copies
//! stay until removed by hand.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Result as EyreResult;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use tracing::{debug, info};

use crate::cache_metadata::{self, CachedImageMetadata};
use crate::command_run::CommandRun;
use crate::error::{ProvisionError, Result};

/// Package-management family of a guest OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum OsFamily {
    Debian,
    RedHat,
}

/// An entry of the built-in image catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub url: &'static str,
    /// libosinfo short id passed to virt-install
    pub os_variant: &'static str,
    pub family: OsFamily,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "ubuntu-24.04",
        url: "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-amd64.img",
        os_variant: "ubuntu24.04",
        family: OsFamily::Debian,
    },
    CatalogEntry {
        id: "ubuntu-22.04",
        url: "https://cloud-images.ubuntu.com/releases/22.04/release/ubuntu-22.04-server-cloudimg-amd64.img",
        os_variant: "ubuntu22.04",
        family: OsFamily::Debian,
    },
    CatalogEntry {
        id: "debian-12",
        url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
        os_variant: "debian12",
        family: OsFamily::Debian,
    },
    CatalogEntry {
        id: "fedora-40",
        url: "https://download.fedoraproject.org/pub/fedora/linux/releases/40/Cloud/x86_64/images/Fedora-Cloud-Base-Generic.x86_64-40-1.14.qcow2",
        os_variant: "fedora40",
        family: OsFamily::RedHat,
    },
    CatalogEntry {
        id: "rocky-9",
        url: "https://dl.rockylinux.org/pub/rocky/9/images/x86_64/Rocky-9-GenericCloud-Base.latest.x86_64.qcow2",
        os_variant: "rocky9",
        family: OsFamily::RedHat,
    },
    CatalogEntry {
        id: "almalinux-9",
        url: "https://repo.almalinux.org/almalinux/9/cloud/x86_64/images/AlmaLinux-9-GenericCloud-latest.x86_64.qcow2",
        os_variant: "almalinux9",
        family: OsFamily::RedHat,
    },
];

/// Look up an OS identifier in the catalog.
pub fn lookup(id: &str) -> Result<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|e| e.id == id)
        .ok_or_else(|| ProvisionError::UnknownImage {
            requested: id.to_owned(),
            known: CATALOG.iter().map(|e| e.id.to_owned()).collect(),
        })
}

/// A base image ready to back a VM disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub path: Utf8PathBuf,
    pub entry: &'static CatalogEntry,
}

/// Resolves OS identifiers to local base images.
pub trait ImageSource {
    fn resolve(&self, os: &str) -> Result<ResolvedImage>;
}

/// Fetches a URL into a local file.
pub trait Downloader {
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CurlDownloader;

impl Downloader for CurlDownloader {
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()> {
        Command::new("curl")
            .args(["--fail", "--location", "--retry", "3", "--silent", "--show-error"])
            .args(["--output", dest.as_str(), url])
            .run()
    }
}

/// Hex digits of the digest kept in cached file names
const DIGEST_PREFIX_LEN: usize = 12;

pub struct ImageCache<'a> {
    dir: Utf8PathBuf,
    downloader: &'a dyn Downloader,
}

impl<'a> ImageCache<'a> {
    pub fn new(dir: impl Into<Utf8PathBuf>, downloader: &'a dyn Downloader) -> Self {
        Self {
            dir: dir.into(),
            downloader,
        }
    }

    /// Path of the cached copy of `entry` whose content has `digest`.
    pub fn image_path(&self, entry: &CatalogEntry, digest: &str) -> Utf8PathBuf {
        let hex = digest.trim_start_matches("sha256:");
        let short = hex.get(..DIGEST_PREFIX_LEN).unwrap_or(hex);
        self.dir.join(format!("{}-{short}.qcow2", entry.id))
    }

    /// Cached copies of `entry` that still have a sidecar, newest first.
    fn cached_copies(
        &self,
        entry: &CatalogEntry,
    ) -> Result<Vec<(Utf8PathBuf, CachedImageMetadata)>> {
        let dir = match self.dir.read_dir_utf8() {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("{}-", entry.id);
        let mut copies = Vec::new();
        for dirent in dir {
            let dirent = dirent?;
            let Some(short) = dirent
                .file_name()
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".qcow2"))
            else {
                continue;
            };
            let hex = short.chars().all(|c| c.is_ascii_hexdigit());
            if short.len() != DIGEST_PREFIX_LEN || !hex {
                continue;
            }
            let path = dirent.path().to_owned();
            if let Some(meta) = CachedImageMetadata::read_for(&path) {
                copies.push((path, meta));
            }
        }
        copies.sort_by(|a, b| b.1.fetched_at.cmp(&a.1.fetched_at));
        Ok(copies)
    }

    fn fetch(&self, entry: &CatalogEntry) -> Result<Utf8PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        // Download beside the final path so the rename is atomic
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{}.", entry.id))
            .suffix(".partial")
            .tempfile_in(&self.dir)?;
        let partial_path = Utf8Path::from_path(partial.path())
            .ok_or_else(|| ProvisionError::config(format!("non UTF-8 path in {}", self.dir)))?
            .to_owned();

        info!("Downloading {} from {}", entry.id, entry.url);
        self.downloader.download(entry.url, &partial_path)?;

        let meta = CachedImageMetadata::for_file(&partial_path, entry.url)?;
        // Same name means same bytes, so this can only repair a damaged copy
        let dest = self.image_path(entry, &meta.digest);
        partial
            .persist(&dest)
            .map_err(|e| ProvisionError::Io(e.error))?;
        meta.write_for(&dest)?;
        debug!("Cached {} ({} bytes, {})", dest, meta.size, meta.digest);
        Ok(dest)
    }

    /// Cached images with their metadata, in catalog order, newest first.
    pub fn list(&self) -> Result<Vec<CachedImage>> {
        let mut images = Vec::new();
        for entry in CATALOG {
            for (path, metadata) in self.cached_copies(entry)? {
                images.push(CachedImage {
                    entry,
                    path,
                    metadata,
                });
            }
        }
        Ok(images)
    }
}

/// One file in the image cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub entry: &'static CatalogEntry,
    pub path: Utf8PathBuf,
    pub metadata: CachedImageMetadata,
}

impl ImageSource for ImageCache<'_> {
    fn resolve(&self, os: &str) -> Result<ResolvedImage> {
        let entry = lookup(os)?;
        for (path, _) in self.cached_copies(entry)? {
            match cache_metadata::check_cached_image(&path, entry.url)? {
                Ok(meta) => {
                    debug!("Using cached image {} ({})", path, meta.digest);
                    return Ok(ResolvedImage { path, entry });
                }
                Err(miss) => debug!("Skipping {}: {}", path, miss),
            }
        }
        debug!("Cache miss for {}", entry.id);
        let path = self.fetch(entry)?;
        Ok(ResolvedImage { path, entry })
    }
}

/// Command-line options for image management operations.
#[derive(clap::Subcommand, Debug)]
pub(crate) enum ImagesOpts {
    /// List cached base images
    List {
        /// Output as structured JSON instead of table format
        #[clap(long)]
        json: bool,
    },
    /// Download (or verify) the base image for an OS identifier
    Fetch {
        /// OS identifier, e.g. ubuntu-24.04
        os: String,
    },
}

#[derive(Serialize)]
struct ListedImage<'a> {
    os: &'a str,
    path: &'a Utf8Path,
    #[serde(flatten)]
    metadata: &'a CachedImageMetadata,
}

impl ImagesOpts {
    pub(crate) fn run(self, cache: &ImageCache<'_>) -> EyreResult<()> {
        match self {
            ImagesOpts::List { json } => {
                let cached = cache.list()?;
                if json {
                    let listed: Vec<_> = cached
                        .iter()
                        .map(|image| ListedImage {
                            os: image.entry.id,
                            path: &image.path,
                            metadata: &image.metadata,
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&listed)?);
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_header(vec!["OS", "VARIANT", "SIZE", "FETCHED", "DIGEST"]);
                for image in cached {
                    let meta = &image.metadata;
                    let digest = meta.digest.trim_start_matches("sha256:");
                    table.add_row(vec![
                        image.entry.id.to_string(),
                        image.entry.os_variant.to_string(),
                        indicatif::BinaryBytes(meta.size).to_string(),
                        format_relative_time(meta.fetched_at),
                        digest.chars().take(DIGEST_PREFIX_LEN).collect(),
                    ]);
                }
                println!("{}", table);
                Ok(())
            }
            ImagesOpts::Fetch { os } => {
                let resolved = cache.resolve(&os)?;
                println!("{}", resolved.path);
                Ok(())
            }
        }
    }
}

/// Format a datetime as relative time (e.g., "2 hours ago", "3 days ago").
fn format_relative_time(dt: chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(dt);
    let (n, unit) = if duration.num_minutes() < 1 {
        (duration.num_seconds().max(0), "second")
    } else if duration.num_hours() < 1 {
        (duration.num_minutes(), "minute")
    } else if duration.num_days() < 1 {
        (duration.num_hours(), "hour")
    } else if duration.num_days() < 30 {
        (duration.num_days(), "day")
    } else if duration.num_days() < 365 {
        (duration.num_days() / 30, "month")
    } else {
        (duration.num_days() / 365, "year")
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct FakeDownloader {
        downloads: Cell<u32>,
        /// Serve different bytes on every download, like a moving "latest" URL
        changing: bool,
    }

    impl Downloader for FakeDownloader {
        fn download(&self, url: &str, dest: &Utf8Path) -> Result<()> {
            let n = self.downloads.get() + 1;
            self.downloads.set(n);
            let content = if self.changing {
                format!("image from {url} #{n}")
            } else {
                format!("image from {url}")
            };
            std::fs::write(dest, content)?;
            Ok(())
        }
    }

    struct FailingDownloader;

    impl Downloader for FailingDownloader {
        fn download(&self, _: &str, _: &Utf8Path) -> Result<()> {
            Err(ProvisionError::command("curl", "(6) Could not resolve host"))
        }
    }

    /// Image source that hands out a fixed path without touching the network.
    pub(crate) struct StaticImages(pub(crate) Utf8PathBuf);

    impl ImageSource for StaticImages {
        fn resolve(&self, os: &str) -> Result<ResolvedImage> {
            Ok(ResolvedImage {
                path: self.0.clone(),
                entry: lookup(os)?,
            })
        }
    }

    fn cache_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap().join("images");
        (td, dir)
    }

    #[test]
    fn test_unknown_image_lists_catalog() {
        let err = lookup("windows-95").unwrap_err();
        match err {
            ProvisionError::UnknownImage { requested, known } => {
                assert_eq!(requested, "windows-95");
                assert!(known.contains(&"ubuntu-24.04".to_owned()));
                assert_eq!(known.len(), CATALOG.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_catalog_ids_unique() {
        let mut ids: Vec<_> = CATALOG.iter().map(|e| e.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), CATALOG.len());
    }

    #[test]
    fn test_resolve_downloads_once() {
        let (_td, dir) = cache_dir();
        let downloader = FakeDownloader::default();
        let cache = ImageCache::new(&dir, &downloader);

        let first = cache.resolve("debian-12").unwrap();
        let second = cache.resolve("debian-12").unwrap();
        assert_eq!(first, second);
        let digest = cache_metadata::file_digest(&first.path).unwrap();
        assert_eq!(first.path, cache.image_path(first.entry, &digest));
        let name = first.path.file_name().unwrap();
        assert!(name.starts_with("debian-12-") && name.ends_with(".qcow2"), "{name}");
        assert_eq!(downloader.downloads.get(), 1);
        assert_eq!(cache.list().unwrap().len(), 1);
    }

    #[test]
    fn test_refetch_never_replaces_a_base_in_use() {
        let (_td, dir) = cache_dir();
        let downloader = FakeDownloader {
            changing: true,
            ..Default::default()
        };
        let cache = ImageCache::new(&dir, &downloader);

        let old = cache.resolve("fedora-40").unwrap();
        let old_bytes = std::fs::read(&old.path).unwrap();
        // The sidecar no longer matches the catalog source
        let sidecar = cache_metadata::sidecar_path(&old.path);
        let mut meta = CachedImageMetadata::read_for(&old.path).unwrap();
        meta.source_url = "https://mirror.invalid/old.qcow2".into();
        std::fs::write(&sidecar, serde_json::to_vec(&meta).unwrap()).unwrap();

        let new = cache.resolve("fedora-40").unwrap();
        assert_eq!(downloader.downloads.get(), 2);
        assert_ne!(new.path, old.path);
        assert_eq!(std::fs::read(&old.path).unwrap(), old_bytes);
        assert_eq!(cache.list().unwrap().len(), 2);
    }

    #[test]
    fn test_resolve_refetches_corrupt_image() {
        let (_td, dir) = cache_dir();
        let downloader = FakeDownloader::default();
        let cache = ImageCache::new(&dir, &downloader);

        let resolved = cache.resolve("rocky-9").unwrap();
        let good = std::fs::read(&resolved.path).unwrap();
        std::fs::write(&resolved.path, "bit rot").unwrap();
        let repaired = cache.resolve("rocky-9").unwrap();
        assert_eq!(downloader.downloads.get(), 2);
        // Same upstream bytes, same name: the damaged copy is repaired in place
        assert_eq!(repaired.path, resolved.path);
        assert_eq!(std::fs::read(&repaired.path).unwrap(), good);
    }

    #[test]
    fn test_failed_download_leaves_no_image() {
        let (_td, dir) = cache_dir();
        let cache = ImageCache::new(&dir, &FailingDownloader);
        let err = cache.resolve("fedora-40").unwrap_err();
        assert!(err.to_string().contains("Could not resolve host"));
        // The partial download was cleaned up
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn test_format_relative_time() {
        let now = chrono::Utc::now();
        assert_eq!(
            format_relative_time(now - chrono::Duration::hours(1)),
            "1 hour ago"
        );
        assert_eq!(
            format_relative_time(now - chrono::Duration::days(3)),
            "3 days ago"
        );
    }
}
