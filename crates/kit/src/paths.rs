//! Default locations, resolved from the user's home when the command line is parsed.

use camino::Utf8PathBuf;

fn utf8_or_cwd(path: Option<std::path::PathBuf>) -> Utf8PathBuf {
    path.and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}

fn data_dir() -> Utf8PathBuf {
    utf8_or_cwd(dirs::data_dir()).join("vmup")
}

/// Per-VM documents and disks
pub(crate) fn state_dir() -> Utf8PathBuf {
    data_dir().join("vms")
}

pub(crate) fn keys_dir() -> Utf8PathBuf {
    data_dir().join("keys")
}

pub(crate) fn image_dir() -> Utf8PathBuf {
    utf8_or_cwd(dirs::cache_dir()).join("vmup").join("images")
}

pub(crate) fn ssh_config() -> Utf8PathBuf {
    utf8_or_cwd(dirs::home_dir()).join(".ssh").join("config")
}
