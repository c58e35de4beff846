//! Guest first-boot completion checks.

use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::time::Duration;

use camino::Utf8Path;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Marker cloud-init writes once every boot stage has run.
pub const BOOT_FINISHED_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

/// How to reach a guest over SSH.
#[derive(Debug, Clone, Copy)]
pub struct GuestTarget<'a> {
    pub address: Ipv4Addr,
    pub user: &'a str,
    pub identity_file: &'a Utf8Path,
    pub known_hosts_file: &'a Utf8Path,
}

/// Decides whether a reachable guest has finished first boot.
pub trait GuestReadiness {
    fn boot_finished(&self, target: &GuestTarget<'_>) -> Result<bool>;
}

/// Runs `test -f` on the boot marker over an authenticated SSH session.
#[derive(Debug, Clone)]
pub struct SshReadiness {
    pub connect_timeout: Duration,
}

impl SshReadiness {
    fn command(&self, target: &GuestTarget<'_>) -> Command {
        let mut cmd = Command::new("ssh");
        // Ignore the user's configuration; everything needed is passed here
        cmd.args(["-F", "/dev/null", "-n"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "IdentitiesOnly=yes"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", target.known_hosts_file))
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-i")
            .arg(target.identity_file.as_str())
            .arg(format!("{}@{}", target.user, target.address))
            .args(["test", "-f", BOOT_FINISHED_MARKER]);
        cmd
    }
}

impl GuestReadiness for SshReadiness {
    fn boot_finished(&self, target: &GuestTarget<'_>) -> Result<bool> {
        let status = self
            .command(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ProvisionError::command("ssh", e.to_string()))?;
        // 255 is ssh's own failure; anything else comes from `test`
        debug!("Readiness check on {}: {}", target.address, status);
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_command_line() {
        let readiness = SshReadiness {
            connect_timeout: Duration::from_secs(5),
        };
        let target = GuestTarget {
            address: Ipv4Addr::new(192, 168, 122, 13),
            user: "admin",
            identity_file: Utf8Path::new("/keys/web01/id_ed25519"),
            known_hosts_file: Utf8Path::new("/keys/web01/known_hosts"),
        };
        let cmd = readiness.command(&target);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert!(args.contains(&"BatchMode=yes"));
        assert!(args.contains(&"UserKnownHostsFile=/keys/web01/known_hosts"));
        assert!(args.contains(&"ConnectTimeout=5"));
        assert!(args.contains(&"admin@192.168.122.13"));
        assert_eq!(&args[args.len() - 3..], ["test", "-f", BOOT_FINISHED_MARKER]);
    }
}
