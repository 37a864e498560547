use std::path::{Path, PathBuf};

/// Downloaded image cache: `~/.cache/mkvm/images/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mkvm")
        .join("images")
}

/// The VM disk that gets provisioned and archived afterwards.
pub fn disk_path(workdir: &Path) -> PathBuf {
    workdir.join("disk.img")
}

/// QMP control socket of the running QEMU.
pub fn qmp_socket_path(workdir: &Path) -> PathBuf {
    workdir.join("qmp.sock")
}

/// Tool log and console transcripts.
pub fn logs_dir(workdir: &Path) -> PathBuf {
    workdir.join("logs")
}
