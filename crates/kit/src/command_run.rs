use std::io::{Read, Seek};
use std::process::Command;

use crate::error::{ProvisionError, Result};

/// Captured result of a child process that may legitimately fail.
#[derive(Debug)]
pub struct Captured {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Helpers intended for [`std::process::Command`] invocations of external
/// control-plane tools (`virsh`, `virt-install`, `qemu-img`, `ssh-keygen`, ...).
pub trait CommandRun {
    /// Execute the child process, failing with [`ProvisionError::Command`]
    /// carrying the tail of its stderr if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process without interpreting its exit status, for
    /// callers that classify failures from stderr themselves.
    fn run_captured(&mut self) -> Result<Captured>;
}

/// Program name used in diagnostics; arguments are left out as they may be verbose.
fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // Truncate to the trailing bytes to avoid pathological error messages
    const MAX_STDERR_BYTES: u64 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len())
        .unwrap_or(0)
        .min(MAX_STDERR_BYTES);
    let mut stderr_buf = Vec::with_capacity(size as usize);
    match f
        .seek(std::io::SeekFrom::End(-(size as i64)))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).trim().to_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::debug!("exec: {self:?}");
        let status = self
            .status()
            .map_err(|e| ProvisionError::command(program_name(self), e.to_string()))?;
        if status.success() {
            return Ok(());
        }
        Err(ProvisionError::command(
            program_name(self),
            format!("{status}: {}", last_utf8_content_from_file(stderr)),
        ))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0))?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_captured(&mut self) -> Result<Captured> {
        tracing::debug!("exec: {self:?}");
        let output = self
            .output()
            .map_err(|e| ProvisionError::command(program_name(self), e.to_string()))?;
        Ok(Captured {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}
