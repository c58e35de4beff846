//! VM naming and identity.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;

use crate::error::{ProvisionError, Result};

/// Maximum length of a VM name; longer names make unwieldy paths and domain names.
const MAX_NAME_LEN: usize = 64;

/// A VM name that is safe to use as a single path component.
///
/// The name is otherwise untrusted: it may contain characters that are
/// meaningful in YAML, XML or shell syntax, and every renderer must treat it
/// as data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmName(String);

impl VmName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an RFC 1123 host label from the name.
    pub fn default_hostname(&self) -> Result<String> {
        let mut label: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        label.truncate(63);
        let label = label.trim_matches('-').to_owned();
        if label.is_empty() {
            return Err(ProvisionError::config(format!(
                "cannot derive a hostname from VM name '{}'; pass --hostname",
                self.0
            )));
        }
        Ok(label)
    }
}

/// Check that `hostname` is a single RFC 1123 label.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    let invalid =
        |why: &str| ProvisionError::config(format!("invalid hostname '{hostname}': {why}"));
    if hostname.is_empty() || hostname.len() > 63 {
        return Err(invalid("must be 1 to 63 characters"));
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid("only letters, digits and '-' are allowed"));
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    Ok(())
}

impl std::str::FromStr for VmName {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| ProvisionError::config(format!("invalid VM name '{s}': {why}"));
        if s.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if s.len() > MAX_NAME_LEN {
            return Err(invalid("too long"));
        }
        if s.starts_with('.') || s.starts_with('-') {
            return Err(invalid("must not start with '.' or '-'"));
        }
        if s.chars().any(|c| c == '/' || c.is_control()) {
            return Err(invalid("must not contain '/' or control characters"));
        }
        Ok(Self(s.to_owned()))
    }
}

impl std::fmt::Display for VmName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a per-VM SSH keypair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key_path: Utf8PathBuf,
    pub public_key_path: Utf8PathBuf,
    /// Contents of the public key file, as written by ssh-keygen
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub name: VmName,
    pub hostname: String,
    pub address: Ipv4Addr,
    pub keypair: KeyPair,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["web01", "db_primary", "Build Box #2", "a.b", "x:y{z}"] {
            assert!(name.parse::<VmName>().is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "../etc", "a/b", ".hidden", "-rf", "bad\nname", &"x".repeat(65)] {
            let err = name.parse::<VmName>().unwrap_err();
            assert!(matches!(err, ProvisionError::Config(_)), "{name:?}");
        }
    }

    #[test]
    fn test_default_hostname() {
        let name: VmName = "Build Box #2".parse().unwrap();
        assert_eq!(name.default_hostname().unwrap(), "build-box--2");

        let name: VmName = "web01".parse().unwrap();
        assert_eq!(name.default_hostname().unwrap(), "web01");

        let name: VmName = "___".parse().unwrap();
        assert!(name.default_hostname().is_err());
    }

    #[test]
    fn test_validate_hostname() {
        for ok in ["web01", "Build-Box-2", "a", &"x".repeat(63)] {
            assert!(validate_hostname(ok).is_ok(), "{ok}");
        }
        for bad in ["", "bad host", "-web", "web-", "a.b", "x_y", &"x".repeat(64)] {
            let err = validate_hostname(bad).unwrap_err();
            assert!(matches!(err, ProvisionError::Config(_)), "{bad:?}");
        }
        // Every derived hostname passes
        for name in ["Build Box #2", "web01", "x:y{z}"] {
            let name: VmName = name.parse().unwrap();
            validate_hostname(&name.default_hostname().unwrap()).unwrap();
        }
    }
}
