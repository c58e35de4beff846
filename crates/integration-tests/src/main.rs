//! Integration tests for vmup
//!
//! These drive the built binary and only touch files under a temporary
//! directory; nothing here needs libvirt.

use camino::{Utf8Path, Utf8PathBuf};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

/// Get the path to the vmup binary, checking VMUP_PATH env var first, then falling back to "vmup"
pub(crate) fn get_vmup_command() -> Result<String> {
    if let Ok(path) = std::env::var("VMUP_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vmup", "target/release/vmup"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VMUP_PATH={path} to run using this binary"
        ));
    }
    Ok("vmup".to_owned())
}

struct Workdir {
    _td: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Workdir {
    fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path())
            .ok_or_else(|| eyre!("non UTF-8 tempdir"))?
            .to_owned();
        Ok(Self { _td: td, root })
    }
}

fn list_aliases(sh: &Shell, vmup: &str, file: &Utf8Path) -> Result<Vec<Value>> {
    let stdout = cmd!(sh, "{vmup} ssh-config list --json --file {file}").read()?;
    let hosts: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;
    hosts
        .as_array()
        .cloned()
        .ok_or_else(|| eyre!("Expected JSON array in output, got: {}", stdout))
}

fn test_ssh_config_round_trip() -> Result<()> {
    let sh = Shell::new()?;
    let vmup = get_vmup_command()?;
    let work = Workdir::new()?;
    let file = work.root.join("config");
    let existing = "# hand written\nHost bastion\n    HostName 203.0.113.7\n\n";
    std::fs::write(&file, existing)?;

    cmd!(
        sh,
        "{vmup} ssh-config add --skip-validation --file {file} --alias web01 --address 192.168.122.13 --identity-file /keys/web01/id_ed25519"
    )
    .run()?;
    let hosts = list_aliases(&sh, &vmup, &file)?;
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[1]["alias"], "web01");
    assert_eq!(hosts[1]["address"], "192.168.122.13");
    assert_eq!(hosts[1]["user"], "admin");

    cmd!(
        sh,
        "{vmup} ssh-config update --skip-validation --file {file} --alias web01 --address 192.168.122.14 --identity-file /keys/web01/id_ed25519 --user ops"
    )
    .run()?;
    let hosts = list_aliases(&sh, &vmup, &file)?;
    assert_eq!(hosts[1]["address"], "192.168.122.14");
    assert_eq!(hosts[1]["user"], "ops");
    let content = std::fs::read_to_string(&file)?;
    assert!(content.starts_with(existing), "{content}");

    cmd!(
        sh,
        "{vmup} ssh-config remove --skip-validation --file {file} --alias web01"
    )
    .run()?;
    assert_eq!(std::fs::read_to_string(&file)?, existing);

    let backups = std::fs::read_dir(&work.root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("config.bak."))
        .count();
    assert_eq!(backups, 3);
    Ok(())
}

fn test_ssh_config_duplicate_add_fails() -> Result<()> {
    let sh = Shell::new()?;
    let vmup = get_vmup_command()?;
    let work = Workdir::new()?;
    let file = work.root.join("config");

    let add = || {
        cmd!(
            sh,
            "{vmup} ssh-config add --skip-validation --file {file} --alias db --address 10.0.0.20 --identity-file /keys/db/id_ed25519"
        )
        .ignore_status()
        .output()
    };
    let first = add()?;
    assert!(first.status.success());
    let before = std::fs::read(&file)?;

    let second = add()?;
    assert!(!second.status.success());
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(stderr.contains("'db' already exists"), "{stderr}");
    assert_eq!(std::fs::read(&file)?, before);
    // A refused edit does not leave a snapshot behind
    let backups = std::fs::read_dir(&work.root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("config.bak."))
        .count();
    assert_eq!(backups, 0);
    Ok(())
}

fn test_images_unknown_os() -> Result<()> {
    let sh = Shell::new()?;
    let vmup = get_vmup_command()?;
    let work = Workdir::new()?;
    let dir = work.root.join("images");

    let output = cmd!(sh, "{vmup} images fetch --image-dir {dir} plan9")
        .ignore_status()
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown image 'plan9'"), "{stderr}");
    assert!(stderr.contains("ubuntu-24.04"), "{stderr}");
    Ok(())
}

fn test_images_list_empty_cache() -> Result<()> {
    let sh = Shell::new()?;
    let vmup = get_vmup_command()?;
    let work = Workdir::new()?;
    let dir = work.root.join("images");

    let stdout = cmd!(sh, "{vmup} images list --json --image-dir {dir}").read()?;
    let images: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;
    assert_eq!(images, Value::Array(Vec::new()));
    Ok(())
}

fn test_create_rejects_bad_name() -> Result<()> {
    let sh = Shell::new()?;
    let vmup = get_vmup_command()?;

    let output = cmd!(sh, "{vmup} create --name ../etc")
        .ignore_status()
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid VM name"), "{stderr}");
    Ok(())
}

const INTEGRATION_TESTS: &[(&str, fn() -> Result<()>)] = &[
    ("test_ssh_config_round_trip", test_ssh_config_round_trip),
    (
        "test_ssh_config_duplicate_add_fails",
        test_ssh_config_duplicate_add_fails,
    ),
    ("test_images_unknown_os", test_images_unknown_os),
    ("test_images_list_empty_cache", test_images_list_empty_cache),
    ("test_create_rejects_bad_name", test_create_rejects_bad_name),
];

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|&(name, f)| Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into())))
        .collect();

    // Run the tests and exit with the result
    libtest_mimic::run(&args, tests).exit();
}
