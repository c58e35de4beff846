//! Host entries in an OpenSSH client configuration file.
//!
//! The file is modelled as a preamble followed by blocks. A block starts at a
//! `Host` or `Match` declaration and runs until the next declaration or the
//! end of the file; its text is kept verbatim, so serializing an unmodified
//! model reproduces the input byte for byte. Only blocks this tool touches are
//! ever rewritten.
//!
//! This is not a full grammar: `list` summarizes the handful of keywords that
//! `vmup` itself writes.

mod cli;
mod transaction;

pub(crate) use cli::SshConfigOpts;
pub use transaction::{ConfigValidator, NoValidation, Registry, SshValidator};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::{ProvisionError, Result};

/// A connection entry written by this tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub alias: String,
    pub address: String,
    pub user: String,
    pub identity_file: Utf8PathBuf,
    /// Dedicated known-hosts file for this host, if any
    pub known_hosts_file: Option<Utf8PathBuf>,
}

/// What `list` reports for one alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListedHost {
    pub alias: String,
    pub address: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Host,
    Match,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    kind: BlockKind,
    patterns: Vec<String>,
    text: String,
}

impl Block {
    fn names(&self, alias: &str) -> bool {
        self.kind == BlockKind::Host && self.patterns.iter().any(|p| p == alias)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfig {
    preamble: String,
    blocks: Vec<Block>,
}

/// Split a configuration line into its keyword and argument.
///
/// Keywords are case-insensitive and separated from their argument by
/// whitespace and/or a single `=`.
fn keyword_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    Some((keyword, rest))
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn declaration(line: &str) -> Option<(BlockKind, Vec<String>)> {
    let (keyword, rest) = keyword_line(line)?;
    let kind = if keyword.eq_ignore_ascii_case("host") {
        BlockKind::Host
    } else if keyword.eq_ignore_ascii_case("match") {
        BlockKind::Match
    } else {
        return None;
    };
    let patterns = rest
        .split_whitespace()
        .map(|p| unquote(p).to_owned())
        .collect();
    Some((kind, patterns))
}

/// Patterns that can never be a concrete alias.
fn is_concrete_alias(pattern: &str) -> bool {
    !pattern.is_empty() && !pattern.contains(['*', '?']) && !pattern.starts_with('!')
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '#')
    {
        return Err(ProvisionError::config(format!("invalid {what} '{value}'")));
    }
    Ok(())
}

fn path_argument(what: &str, path: &Utf8Path) -> Result<String> {
    let s = path.as_str();
    if s.is_empty() || s.chars().any(|c| c.is_control() || c == '"') {
        return Err(ProvisionError::config(format!("invalid {what} '{s}'")));
    }
    if s.contains(char::is_whitespace) {
        Ok(format!("\"{s}\""))
    } else {
        Ok(s.to_owned())
    }
}

impl RegistryEntry {
    pub fn validate(&self) -> Result<()> {
        check_token("alias", &self.alias)?;
        if !is_concrete_alias(&self.alias) {
            return Err(ProvisionError::config(format!(
                "alias '{}' must not be a pattern",
                self.alias
            )));
        }
        check_token("address", &self.address)?;
        check_token("user", &self.user)?;
        Ok(())
    }

    /// The full block for this entry, including its trailing blank separator.
    fn render(&self) -> Result<String> {
        self.validate()?;
        let mut out = format!("Host {}\n", self.alias);
        out.push_str(&format!("    HostName {}\n", self.address));
        out.push_str(&format!("    User {}\n", self.user));
        out.push_str(&format!(
            "    IdentityFile {}\n",
            path_argument("identity file", &self.identity_file)?
        ));
        out.push_str("    IdentitiesOnly yes\n");
        out.push_str("    StrictHostKeyChecking yes\n");
        out.push_str("    PasswordAuthentication no\n");
        out.push_str("    PubkeyAuthentication yes\n");
        if let Some(known_hosts) = &self.known_hosts_file {
            out.push_str(&format!(
                "    UserKnownHostsFile {}\n",
                path_argument("known hosts file", known_hosts)?
            ));
        }
        out.push('\n');
        Ok(out)
    }

    fn into_block(self) -> Result<Block> {
        Ok(Block {
            kind: BlockKind::Host,
            text: self.render()?,
            patterns: vec![self.alias],
        })
    }
}

impl SshConfig {
    pub fn parse(text: &str) -> Self {
        let mut config = SshConfig::default();
        for line in text.split_inclusive('\n') {
            if let Some((kind, patterns)) = declaration(line) {
                config.blocks.push(Block {
                    kind,
                    patterns,
                    text: String::new(),
                });
            }
            match config.blocks.last_mut() {
                Some(block) => block.text.push_str(line),
                None => config.preamble.push_str(line),
            }
        }
        config
    }

    pub fn serialize(&self) -> String {
        let mut out = self.preamble.clone();
        for block in &self.blocks {
            out.push_str(&block.text);
        }
        out
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.blocks.iter().any(|b| b.names(alias))
    }

    /// Index of the single block that may be rewritten for `alias`.
    fn editable_block(&self, alias: &str) -> Result<usize> {
        let matching: Vec<usize> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.names(alias))
            .map(|(i, _)| i)
            .collect();
        let idx = match matching.as_slice() {
            [] => return Err(ProvisionError::NotFound(alias.to_owned())),
            [idx] => *idx,
            _ => {
                return Err(ProvisionError::config(format!(
                    "alias '{alias}' is declared by {} blocks; edit the file by hand",
                    matching.len()
                )))
            }
        };
        let block = &self.blocks[idx];
        if block.patterns.len() > 1 {
            return Err(ProvisionError::config(format!(
                "block 'Host {}' also matches other hosts; edit the file by hand",
                block.patterns.join(" ")
            )));
        }
        Ok(idx)
    }

    /// Make sure whatever precedes an appended block ends with a newline.
    fn terminate_last_line(&mut self) {
        let last = match self.blocks.last_mut() {
            Some(block) => &mut block.text,
            None => &mut self.preamble,
        };
        if !last.is_empty() && !last.ends_with('\n') {
            last.push('\n');
        }
    }

    pub fn add(&mut self, entry: RegistryEntry) -> Result<()> {
        if self.contains(&entry.alias) {
            return Err(ProvisionError::DuplicateEntry(entry.alias));
        }
        let block = entry.into_block()?;
        self.terminate_last_line();
        self.blocks.push(block);
        Ok(())
    }

    pub fn update(&mut self, entry: RegistryEntry) -> Result<()> {
        let idx = self.editable_block(&entry.alias)?;
        self.blocks[idx] = entry.into_block()?;
        Ok(())
    }

    pub fn remove(&mut self, alias: &str) -> Result<()> {
        let idx = self.editable_block(alias)?;
        self.blocks.remove(idx);
        Ok(())
    }

    pub fn upsert(&mut self, entry: RegistryEntry) -> Result<UpsertOutcome> {
        if self.contains(&entry.alias) {
            self.update(entry)?;
            Ok(UpsertOutcome::Updated)
        } else {
            self.add(entry)?;
            Ok(UpsertOutcome::Added)
        }
    }

    /// Concrete aliases with the last value seen for each summarized field.
    pub fn list(&self) -> Vec<ListedHost> {
        let mut hosts: Vec<ListedHost> = Vec::new();
        for block in self.blocks.iter().filter(|b| b.kind == BlockKind::Host) {
            let mut fields = ListedHost::default();
            for line in block.text.lines().skip(1) {
                let Some((keyword, value)) = keyword_line(line) else {
                    continue;
                };
                let value = Some(unquote(value).to_owned());
                if keyword.eq_ignore_ascii_case("hostname") {
                    fields.address = value;
                } else if keyword.eq_ignore_ascii_case("user") {
                    fields.user = value;
                } else if keyword.eq_ignore_ascii_case("identityfile") {
                    fields.identity_file = value;
                }
            }

            for alias in block.patterns.iter().filter(|p| is_concrete_alias(p)) {
                let idx = match hosts.iter().position(|h| &h.alias == alias) {
                    Some(idx) => idx,
                    None => {
                        hosts.push(ListedHost {
                            alias: alias.clone(),
                            ..Default::default()
                        });
                        hosts.len() - 1
                    }
                };
                let host = &mut hosts[idx];
                if fields.address.is_some() {
                    host.address.clone_from(&fields.address);
                }
                if fields.user.is_some() {
                    host.user.clone_from(&fields.user);
                }
                if fields.identity_file.is_some() {
                    host.identity_file.clone_from(&fields.identity_file);
                }
            }
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const EXISTING: &str = indoc! {r#"
        # Managed partly by hand
        Include ~/.ssh/config.d/*

        Host *
            ServerAliveInterval 30

        Host bastion jump
            HostName 203.0.113.7
            User ops

        Match host *.internal exec "true"
            ProxyJump bastion

        Host=db
            HostName=10.0.0.20
            User admin
            IdentityFile "/home/me/keys/db key"
    "#};

    fn entry(alias: &str, address: &str) -> RegistryEntry {
        RegistryEntry {
            alias: alias.into(),
            address: address.into(),
            user: "admin".into(),
            identity_file: format!("/keys/{alias}/id_ed25519").into(),
            known_hosts_file: None,
        }
    }

    #[test]
    fn test_parse_serialize_is_lossless() {
        for text in [EXISTING, "", "Host a\n  User x", "\n\n# only comments\n"] {
            assert_eq!(SshConfig::parse(text).serialize(), text);
        }
    }

    #[test]
    fn test_list_skips_patterns_and_match_blocks() {
        let hosts = SshConfig::parse(EXISTING).list();
        let aliases: Vec<_> = hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, ["bastion", "jump", "db"]);
        let db = &hosts[2];
        assert_eq!(db.address.as_deref(), Some("10.0.0.20"));
        assert_eq!(db.identity_file.as_deref(), Some("/home/me/keys/db key"));
    }

    #[test]
    fn test_list_reports_most_recent_values() {
        let text = "Host web\n  HostName 10.0.0.1\n  User a\nHost web\n  HostName 10.0.0.2\n";
        let hosts = SshConfig::parse(text).list();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].address.as_deref(), Some("10.0.0.2"));
        assert_eq!(hosts[0].user.as_deref(), Some("a"));
    }

    #[test]
    fn test_add_update_remove_round_trip() {
        let mut config = SshConfig::parse(EXISTING);

        config.add(entry("web01", "192.168.122.13")).unwrap();
        let after_add = config.serialize();
        assert!(after_add.starts_with(EXISTING));
        assert!(after_add.ends_with("PubkeyAuthentication yes\n\n"));
        let web = config.list().into_iter().find(|h| h.alias == "web01").unwrap();
        assert_eq!(web.address.as_deref(), Some("192.168.122.13"));

        config.update(entry("web01", "192.168.122.14")).unwrap();
        let after_update = config.serialize();
        assert!(after_update.starts_with(EXISTING));
        let web = config.list().into_iter().find(|h| h.alias == "web01").unwrap();
        assert_eq!(web.address.as_deref(), Some("192.168.122.14"));

        let block_len = entry("web01", "192.168.122.14").render().unwrap().len();
        config.remove("web01").unwrap();
        let after_remove = config.serialize();
        assert_eq!(after_remove.len(), after_update.len() - block_len);
        assert_eq!(after_remove, EXISTING);
        assert!(!config.contains("web01"));
    }

    #[test]
    fn test_update_preserves_neighbours() {
        let mut config = SshConfig::parse(EXISTING);
        config.add(entry("web01", "192.168.122.13")).unwrap();
        config.add(entry("web02", "192.168.122.14")).unwrap();
        let before = config.serialize();

        config.update(entry("web01", "192.168.122.99")).unwrap();
        let after = config.serialize();

        let old_block = entry("web01", "192.168.122.13").render().unwrap();
        let new_block = entry("web01", "192.168.122.99").render().unwrap();
        assert_eq!(after, before.replace(&old_block, &new_block));
        let aliases: Vec<_> = config.list().into_iter().map(|h| h.alias).collect();
        assert_eq!(aliases, ["bastion", "jump", "db", "web01", "web02"]);
    }

    #[test]
    fn test_add_after_missing_final_newline() {
        let mut config = SshConfig::parse("Host old\n    User x");
        config.add(entry("new", "10.0.0.5")).unwrap();
        let text = config.serialize();
        assert!(text.starts_with("Host old\n    User x\nHost new\n"), "{text}");
        let aliases: Vec<_> = config.list().into_iter().map(|h| h.alias).collect();
        assert_eq!(aliases, ["old", "new"]);
        assert_eq!(config.list()[0].user.as_deref(), Some("x"));
    }

    #[test]
    fn test_remove_block_without_blank_separator() {
        let text = "Host a\n  User x\nHost b\n  User y\nHost c\n  User z\n";
        let mut config = SshConfig::parse(text);
        config.remove("b").unwrap();
        assert_eq!(config.serialize(), "Host a\n  User x\nHost c\n  User z\n");
    }

    #[test]
    fn test_errors() {
        let mut config = SshConfig::parse(EXISTING);
        assert!(matches!(
            config.add(entry("db", "10.0.0.1")),
            Err(ProvisionError::DuplicateEntry(a)) if a == "db"
        ));
        assert!(matches!(
            config.update(entry("nope", "10.0.0.1")),
            Err(ProvisionError::NotFound(_))
        ));
        assert!(matches!(config.remove("nope"), Err(ProvisionError::NotFound(_))));
        // Shared block is refused rather than rewritten
        assert!(matches!(config.remove("jump"), Err(ProvisionError::Config(_))));
        assert!(matches!(
            config.add(entry("bad alias", "10.0.0.1")),
            Err(ProvisionError::Config(_))
        ));
        assert!(matches!(
            config.add(entry("web*", "10.0.0.1")),
            Err(ProvisionError::Config(_))
        ));
        assert_eq!(config.serialize(), EXISTING);
    }

    #[test]
    fn test_upsert() {
        let mut config = SshConfig::default();
        assert_eq!(
            config.upsert(entry("web", "10.0.0.1")).unwrap(),
            UpsertOutcome::Added
        );
        assert_eq!(
            config.upsert(entry("web", "10.0.0.2")).unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(config.list().len(), 1);
    }

    #[test]
    fn test_render_quotes_paths() {
        let mut e = entry("web", "10.0.0.1");
        e.identity_file = "/home/me/my keys/id".into();
        e.known_hosts_file = Some("/state/web/known_hosts".into());
        let block = e.render().unwrap();
        assert!(block.contains("    IdentityFile \"/home/me/my keys/id\"\n"));
        assert!(block.contains("    UserKnownHostsFile /state/web/known_hosts\n"));
        assert!(block.contains("    StrictHostKeyChecking yes\n"));
    }
}
