//! Error taxonomy shared by the provisioning components.
//!
//! Components return [`ProvisionError`] so the workflow (and tests) can match
//! on the failure class; the CLI converts them into `color_eyre` reports.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Convenience alias used by every component.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// Missing or unusable configuration (network descriptor, VM name, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Every candidate in the dynamic range is reserved or answering
    #[error("no free address in {start}-{end} (scanned {scanned} candidates)")]
    Exhausted {
        start: Ipv4Addr,
        end: Ipv4Addr,
        scanned: u32,
    },

    #[error("key generation failed for '{name}': {reason}")]
    KeyGen { name: String, reason: String },

    #[error("permission error on {path}: {reason}")]
    Permission { path: String, reason: String },

    #[error("host entry '{0}' already exists")]
    DuplicateEntry(String),

    #[error("host entry '{0}' not found")]
    NotFound(String),

    /// The consumer rejected a rewritten file; the live file was restored
    #[error("validation of {path} failed (restored from {backup}): {reason}")]
    Validation {
        path: String,
        backup: String,
        reason: String,
    },

    #[error("unknown image '{requested}' (known: {})", known.join(", "))]
    UnknownImage {
        requested: String,
        known: Vec<String>,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    /// The address was claimed by someone else between allocation and reservation
    #[error("address {ip} already reserved for {holder}")]
    ReservationConflict { ip: Ipv4Addr, holder: String },

    #[error("{what} did not become ready after {attempts} attempts ({elapsed_secs}s)")]
    Timeout {
        what: String,
        attempts: u32,
        elapsed_secs: u64,
    },

    /// An external tool exited unsuccessfully
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn command(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether the workflow may leave the instance running and report a warning
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
