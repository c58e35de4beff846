//! All-or-nothing rewrites of the live configuration file.
//!
//! Every mutation holds an exclusive `flock` on `<file>.lock`, applies the
//! edit in memory, snapshots the live file to `<file>.bak.<timestamp>`,
//! writes the new content to a scratch file in the same directory and lets
//! the consumer validate it before the scratch file is renamed over the live
//! one. When the configured path is a symlink, the file it points to is the
//! one that gets replaced and backed up; the link itself is left alone.

use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _, PermissionsExt as _};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use super::{ListedHost, RegistryEntry, SshConfig, UpsertOutcome};
use crate::error::{ProvisionError, Result};

const SCRATCH_MODE: u32 = 0o600;
/// Mode for a configuration directory we have to create, as for `~/.ssh`
const CONFIG_DIR_MODE: u32 = 0o700;

/// Checks a candidate configuration without touching the live file.
pub trait ConfigValidator {
    fn validate(&self, candidate: &Utf8Path, alias: &str) -> Result<()>;
}

/// Validates with `ssh -G`, which evaluates the configuration for a host
/// without connecting.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshValidator;

impl ConfigValidator for SshValidator {
    fn validate(&self, candidate: &Utf8Path, alias: &str) -> Result<()> {
        let output = Command::new("ssh")
            .args(["-G", "-F", candidate.as_str(), alias])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ProvisionError::command("ssh -G", e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        Err(ProvisionError::command(
            "ssh -G",
            String::from_utf8_lossy(&output.stderr).trim(),
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoValidation;

impl ConfigValidator for NoValidation {
    fn validate(&self, _: &Utf8Path, _: &str) -> Result<()> {
        Ok(())
    }
}

/// The live configuration file and how to validate rewrites of it.
pub struct Registry<'a> {
    path: Utf8PathBuf,
    validator: &'a dyn ConfigValidator,
}

/// Held for the duration of a mutation; the lock is released on drop.
struct LockGuard {
    _file: std::fs::File,
}

fn suffixed(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}{suffix}"))
}

fn parent_dir(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."))
}

fn read_text(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| ProvisionError::config(format!("{path} is not valid UTF-8"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn utf8_path(path: std::path::PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|p| ProvisionError::config(format!("non UTF-8 path {}", p.display())))
}

impl<'a> Registry<'a> {
    pub fn new(path: impl Into<Utf8PathBuf>, validator: &'a dyn ConfigValidator) -> Self {
        Self {
            path: path.into(),
            validator,
        }
    }

    /// The file rewrites land in: the configured path, or its final target
    /// when that path is a symlink.
    fn live_target(&self) -> Result<Utf8PathBuf> {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(_) => return Ok(self.path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self.path.clone()),
            Err(e) => return Err(e.into()),
        }
        let target = match std::fs::canonicalize(&self.path) {
            Ok(target) => utf8_path(target)?,
            // Dangling link: the first write creates its target
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let link = utf8_path(std::fs::read_link(&self.path)?)?;
                parent_dir(&self.path).join(link)
            }
            Err(e) => return Err(e.into()),
        };
        debug!("{} is a symlink to {}", self.path, target);
        Ok(target)
    }

    fn lock(&self) -> Result<LockGuard> {
        let lock_path = suffixed(&self.path, ".lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(SCRATCH_MODE)
            .open(&lock_path)?;
        debug!("Waiting for lock on {}", lock_path);
        rustix::fs::flock(&file, rustix::fs::FlockOperation::LockExclusive)
            .map_err(std::io::Error::from)?;
        Ok(LockGuard { _file: file })
    }

    fn backup(live: &Utf8Path) -> Result<Utf8PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let mut backup = suffixed(live, &format!(".bak.{stamp}"));
        let mut n = 1;
        while backup.exists() {
            backup = suffixed(live, &format!(".bak.{stamp}.{n}"));
            n += 1;
        }
        std::fs::copy(live, &backup)?;
        debug!("Backed up {} to {}", live, backup);
        Ok(backup)
    }

    /// Put the snapshot back if the live file no longer matches it.
    fn restore(live: &Utf8Path, original: Option<&str>, backup: Option<&Utf8Path>) {
        let current = read_text(live).ok().flatten();
        if current.as_deref() == original {
            return;
        }
        let restored = match backup {
            Some(backup) => std::fs::copy(backup, live).map(|_| ()),
            None => std::fs::remove_file(live),
        };
        if let Err(e) = restored {
            warn!("Failed to restore {}: {}", live, e);
        }
    }

    fn write_scratch(live: &Utf8Path, content: &str) -> Result<tempfile::NamedTempFile> {
        let prefix = format!(".{}.", live.file_name().unwrap_or("config"));
        let mut scratch = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(parent_dir(live))?;
        scratch
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(SCRATCH_MODE))?;
        scratch.write_all(content.as_bytes())?;
        scratch.as_file().sync_all()?;
        Ok(scratch)
    }

    /// Apply `transform` to the parsed file as a single transaction.
    fn mutate<T>(
        &self,
        alias: &str,
        transform: impl FnOnce(&mut SshConfig) -> Result<T>,
    ) -> Result<T> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(CONFIG_DIR_MODE)
            .create(parent_dir(&self.path))?;
        let _lock = self.lock()?;

        let live = self.live_target()?;
        if live != self.path {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(CONFIG_DIR_MODE)
                .create(parent_dir(&live))?;
        }
        let original = read_text(&live)?;
        let mut config = SshConfig::parse(original.as_deref().unwrap_or_default());
        // A rejected edit never reaches the disk, not even as a backup
        let value = transform(&mut config)?;

        let backup = match original {
            Some(_) => Some(Self::backup(&live)?),
            None => None,
        };

        let scratch = Self::write_scratch(&live, &config.serialize())?;
        let scratch_path = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| ProvisionError::config("non UTF-8 scratch path"))?
            .to_owned();

        if let Err(e) = self.validator.validate(&scratch_path, alias) {
            // Dropping the scratch file removes it
            drop(scratch);
            Self::restore(&live, original.as_deref(), backup.as_deref());
            return Err(ProvisionError::Validation {
                path: live.to_string(),
                backup: backup
                    .as_ref()
                    .map_or_else(|| "no previous file".to_owned(), |b| b.to_string()),
                reason: e.to_string(),
            });
        }

        if let Err(e) = scratch.persist(&live) {
            Self::restore(&live, original.as_deref(), backup.as_deref());
            return Err(e.error.into());
        }
        Ok(value)
    }

    pub fn list(&self) -> Result<Vec<ListedHost>> {
        let text = read_text(&self.path)?.unwrap_or_default();
        Ok(SshConfig::parse(&text).list())
    }

    pub fn add(&self, entry: RegistryEntry) -> Result<()> {
        let alias = entry.alias.clone();
        self.mutate(&alias, |config| config.add(entry))?;
        info!("Added host entry '{}' to {}", alias, self.path);
        Ok(())
    }

    pub fn update(&self, entry: RegistryEntry) -> Result<()> {
        let alias = entry.alias.clone();
        self.mutate(&alias, |config| config.update(entry))?;
        info!("Updated host entry '{}' in {}", alias, self.path);
        Ok(())
    }

    pub fn remove(&self, alias: &str) -> Result<()> {
        self.mutate(alias, |config| config.remove(alias))?;
        info!("Removed host entry '{}' from {}", alias, self.path);
        Ok(())
    }

    pub fn upsert(&self, entry: RegistryEntry) -> Result<UpsertOutcome> {
        let alias = entry.alias.clone();
        let outcome = self.mutate(&alias, |config| config.upsert(entry))?;
        info!("Recorded host entry '{}' in {} ({:?})", alias, self.path, outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct RejectAll;

    impl ConfigValidator for RejectAll {
        fn validate(&self, candidate: &Utf8Path, _: &str) -> Result<()> {
            assert!(candidate.exists());
            let mode = std::fs::metadata(candidate).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, SCRATCH_MODE);
            Err(ProvisionError::command("ssh -G", "line 3: Bad configuration option"))
        }
    }

    fn entry(alias: &str) -> RegistryEntry {
        RegistryEntry {
            alias: alias.into(),
            address: "192.168.122.13".into(),
            user: "admin".into(),
            identity_file: "/keys/id_ed25519".into(),
            known_hosts_file: None,
        }
    }

    fn fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join(".ssh/config");
        (td, path)
    }

    fn backups(path: &Utf8Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with("config.bak."))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_add_creates_missing_file() {
        let (_td, path) = fixture();
        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();
        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].alias, "web01");
        // Nothing to back up on first write
        assert!(backups(&path).is_empty());
    }

    #[test]
    fn test_mutation_backs_up_previous_content() {
        let (_td, path) = fixture();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Host old\n    User x\n").unwrap();

        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();

        let names = backups(&path);
        assert_eq!(names.len(), 1);
        let backup = path.parent().unwrap().join(&names[0]);
        assert_eq!(
            std::fs::read_to_string(backup).unwrap(),
            "Host old\n    User x\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SCRATCH_MODE);
    }

    #[test]
    fn test_failed_validation_rolls_back() {
        let (_td, path) = fixture();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let original = "Host old\n    User x";
        std::fs::write(&path, original).unwrap();

        let registry = Registry::new(&path, &RejectAll);
        for result in [
            registry.add(entry("web01")),
            registry.update(entry("old")),
            registry.remove("old"),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(err, ProvisionError::Validation { .. }), "{err:?}");
            assert!(err.to_string().contains("Bad configuration option"));
            assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        }
        assert_eq!(backups(&path).len(), 3);

        // No scratch files are left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_transform_error_leaves_file_untouched() {
        let (_td, path) = fixture();
        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();
        let before = std::fs::read(&path).unwrap();

        let err = registry.add(entry("web01")).unwrap_err();
        assert!(matches!(err, ProvisionError::DuplicateEntry(_)));
        let err = registry.remove("ghost").unwrap_err();
        assert!(matches!(err, ProvisionError::NotFound(_)));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_rejected_edits_leave_no_backup() {
        let (_td, path) = fixture();
        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();

        registry.add(entry("web01")).unwrap_err();
        registry.remove("ghost").unwrap_err();
        registry.update(entry("ghost")).unwrap_err();
        assert!(backups(&path).is_empty(), "{:?}", backups(&path));
    }

    #[test]
    fn test_symlinked_config_updates_target() {
        let (td, path) = fixture();
        let dotfiles = Utf8Path::from_path(td.path()).unwrap().join("dotfiles/ssh");
        std::fs::create_dir_all(&dotfiles).unwrap();
        let target = dotfiles.join("config");
        std::fs::write(&target, "Host old\n    User x\n").unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&target, &path).unwrap();

        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();

        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(meta.file_type().is_symlink());
        let content = std::fs::read_to_string(&target).unwrap();
        assert!(content.starts_with("Host old\n    User x\n"), "{content}");
        assert!(content.contains("Host web01"), "{content}");
        let aliases: Vec<_> = registry.list().unwrap().into_iter().map(|h| h.alias).collect();
        assert_eq!(aliases, ["old", "web01"]);
        // The snapshot sits next to the file that changed
        assert_eq!(backups(&target).len(), 1);
        assert!(backups(&path).is_empty());
    }

    #[test]
    fn test_creates_config_dir_private() {
        let (_td, path) = fixture();
        let registry = Registry::new(&path, &NoValidation);
        registry.add(entry("web01")).unwrap();
        let mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, CONFIG_DIR_MODE);
    }

    #[test]
    fn test_upsert_through_registry() {
        let (_td, path) = fixture();
        let registry = Registry::new(&path, &NoValidation);
        assert_eq!(registry.upsert(entry("web01")).unwrap(), UpsertOutcome::Added);
        let mut changed = entry("web01");
        changed.address = "192.168.122.14".into();
        assert_eq!(registry.upsert(changed).unwrap(), UpsertOutcome::Updated);
        let listed = registry.list().unwrap();
        assert_eq!(listed[0].address.as_deref(), Some("192.168.122.14"));
    }
}
