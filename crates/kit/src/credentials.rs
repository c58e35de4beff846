//! Per-VM SSH keypairs.
//!
//! Each VM gets an ed25519 keypair at `<keys_dir>/<name>/id_ed25519`. The
//! keypair is created on first use and returned untouched afterwards, so
//! re-provisioning a VM with the same name keeps its credentials.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::command_run::CommandRun;
use crate::error::{ProvisionError, Result};
use crate::vm::{KeyPair, VmName};

const KEY_FILE_NAME: &str = "id_ed25519";
const KEY_DIR_MODE: u32 = 0o700;
const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;

/// Produces a new keypair at `private_key_path` (public half at `.pub`).
pub trait KeyGenerator {
    fn generate(&self, private_key_path: &Utf8Path, comment: &str) -> Result<()>;
}

/// Generates keys with OpenSSH's `ssh-keygen`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeygen;

impl KeyGenerator for SshKeygen {
    fn generate(&self, private_key_path: &Utf8Path, comment: &str) -> Result<()> {
        Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(private_key_path.as_str())
            .run()
    }
}

pub struct KeyStore<'a> {
    root: Utf8PathBuf,
    generator: &'a dyn KeyGenerator,
}

fn public_key_path(private_key_path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{private_key_path}.pub"))
}

fn set_mode(path: &Utf8Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        ProvisionError::Permission {
            path: path.to_string(),
            reason: format!("cannot set mode {mode:o}: {e}"),
        }
    })
}

impl<'a> KeyStore<'a> {
    pub fn new(root: impl Into<Utf8PathBuf>, generator: &'a dyn KeyGenerator) -> Self {
        Self {
            root: root.into(),
            generator,
        }
    }

    pub fn key_dir(&self, name: &VmName) -> Utf8PathBuf {
        self.root.join(name.as_str())
    }

    /// Return the keypair for `name`, generating it if it does not exist yet.
    pub fn ensure_keypair(&self, name: &VmName) -> Result<KeyPair> {
        let dir = self.key_dir(name);
        let private_key_path = dir.join(KEY_FILE_NAME);
        let public_key_path = public_key_path(&private_key_path);

        if private_key_path.is_file() && public_key_path.is_file() {
            debug!("Reusing existing keypair {}", private_key_path);
            let public_key = std::fs::read_to_string(&public_key_path)?;
            return Ok(KeyPair {
                private_key_path,
                public_key_path,
                public_key,
            });
        }

        self.create_key_dir(&dir)?;

        // A half-written pair from an interrupted run would make ssh-keygen prompt
        for stale in [&private_key_path, &public_key_path] {
            if stale.exists() {
                std::fs::remove_file(stale)?;
            }
        }

        info!("Generating SSH keypair for '{}'", name);
        self.generator
            .generate(&private_key_path, &format!("vmup-{name}"))
            .map_err(|e| ProvisionError::KeyGen {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if !private_key_path.is_file() || !public_key_path.is_file() {
            return Err(ProvisionError::KeyGen {
                name: name.to_string(),
                reason: format!("generator did not produce {private_key_path} and its .pub"),
            });
        }
        set_mode(&private_key_path, PRIVATE_KEY_MODE)?;
        set_mode(&public_key_path, PUBLIC_KEY_MODE)?;

        let public_key = std::fs::read_to_string(&public_key_path)?;
        Ok(KeyPair {
            private_key_path,
            public_key_path,
            public_key,
        })
    }

    fn create_key_dir(&self, dir: &Utf8Path) -> Result<()> {
        let permission_error = |reason: String| ProvisionError::Permission {
            path: dir.to_string(),
            reason,
        };
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(KEY_DIR_MODE)
            .create(dir)
            .map_err(|e| permission_error(format!("cannot create directory: {e}")))?;
        // The directory may predate us with a looser mode
        set_mode(dir, KEY_DIR_MODE)?;
        let mode = std::fs::metadata(dir)?.permissions().mode() & 0o777;
        if mode != KEY_DIR_MODE {
            return Err(permission_error(format!(
                "directory has mode {mode:o}, expected {KEY_DIR_MODE:o}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// Writes deterministic key material instead of calling ssh-keygen.
    #[derive(Default)]
    pub(crate) struct FakeKeygen {
        pub(crate) calls: Cell<u32>,
    }

    impl KeyGenerator for FakeKeygen {
        fn generate(&self, private_key_path: &Utf8Path, comment: &str) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            std::fs::write(private_key_path, format!("PRIVATE {comment}\n"))?;
            std::fs::write(
                public_key_path(private_key_path),
                format!("ssh-ed25519 AAAAC3NzaFAKE{} {comment}\n", self.calls.get()),
            )?;
            Ok(())
        }
    }

    struct FailingKeygen;

    impl KeyGenerator for FailingKeygen {
        fn generate(&self, _: &Utf8Path, _: &str) -> Result<()> {
            Err(ProvisionError::command("ssh-keygen", "unsupported key type"))
        }
    }

    fn tempdir_utf8() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, path)
    }

    #[test]
    fn test_creates_keypair_with_modes() {
        let (_td, root) = tempdir_utf8();
        let keygen = FakeKeygen::default();
        let store = KeyStore::new(root.join("keys"), &keygen);
        let name: VmName = "web01".parse().unwrap();

        let pair = store.ensure_keypair(&name).unwrap();
        assert_eq!(pair.private_key_path, root.join("keys/web01/id_ed25519"));
        assert!(pair.public_key.starts_with("ssh-ed25519 "));

        let mode = |p: &Utf8Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&store.key_dir(&name)), 0o700);
        assert_eq!(mode(&pair.private_key_path), 0o600);
        assert_eq!(mode(&pair.public_key_path), 0o644);
    }

    #[test]
    fn test_second_call_is_idempotent() {
        let (_td, root) = tempdir_utf8();
        let keygen = FakeKeygen::default();
        let store = KeyStore::new(&root, &keygen);
        let name: VmName = "web01".parse().unwrap();

        let first = store.ensure_keypair(&name).unwrap();
        let private_before = std::fs::read(&first.private_key_path).unwrap();
        let mtime_before = std::fs::metadata(&first.private_key_path)
            .unwrap()
            .modified()
            .unwrap();

        let second = store.ensure_keypair(&name).unwrap();
        assert_eq!(first, second);
        assert_eq!(keygen.calls.get(), 1);
        assert_eq!(std::fs::read(&second.private_key_path).unwrap(), private_before);
        assert_eq!(
            std::fs::metadata(&second.private_key_path)
                .unwrap()
                .modified()
                .unwrap(),
            mtime_before
        );
    }

    #[test]
    fn test_regenerates_incomplete_pair() {
        let (_td, root) = tempdir_utf8();
        let keygen = FakeKeygen::default();
        let store = KeyStore::new(&root, &keygen);
        let name: VmName = "half".parse().unwrap();

        std::fs::create_dir_all(store.key_dir(&name)).unwrap();
        std::fs::write(store.key_dir(&name).join(KEY_FILE_NAME), "orphan").unwrap();

        let pair = store.ensure_keypair(&name).unwrap();
        assert_eq!(keygen.calls.get(), 1);
        assert!(std::fs::read_to_string(&pair.private_key_path)
            .unwrap()
            .starts_with("PRIVATE"));
    }

    #[test]
    fn test_generator_failure_is_keygen_error() {
        let (_td, root) = tempdir_utf8();
        let store = KeyStore::new(&root, &FailingKeygen);
        let name: VmName = "web01".parse().unwrap();
        let err = store.ensure_keypair(&name).unwrap_err();
        assert!(matches!(err, ProvisionError::KeyGen { .. }), "{err:?}");
        assert!(err.to_string().contains("web01"));
    }

    #[test]
    fn test_unwritable_root_is_permission_error() {
        let (_td, root) = tempdir_utf8();
        // A regular file where the key root directory should be
        let blocker = root.join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let keygen = FakeKeygen::default();
        let store = KeyStore::new(&blocker, &keygen);
        let name: VmName = "web01".parse().unwrap();
        let err = store.ensure_keypair(&name).unwrap_err();
        assert!(matches!(err, ProvisionError::Permission { .. }), "{err:?}");
    }
}
