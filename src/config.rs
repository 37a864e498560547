use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::MkvmError;
use crate::recipe::{DEFAULT_BOOTSTRAP_URL, DEFAULT_DAILY_URL, DEFAULT_PKGSRC_URL};
use crate::util::parse_size;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "mkvm.toml";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub vm: VmConfig,
    #[facet(default)]
    pub mirror: MirrorConfig,
    #[facet(default)]
    pub qemu: QemuConfig,
    #[facet(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    #[facet(default = "16G")]
    pub disk_size: String,
    #[facet(default = "2G")]
    pub memory_size: String,
    /// Write guest changes back to the disk image instead of a throwaway snapshot.
    #[facet(default = true)]
    pub persist: bool,
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = 600)]
    pub boot_timeout_s: u64,
    #[facet(default = 3600)]
    pub command_timeout_s: u64,
    #[facet(default = 300)]
    pub halt_timeout_s: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            disk_size: "16G".into(),
            memory_size: "2G".into(),
            persist: true,
            cpus: 2,
            boot_timeout_s: 600,
            command_timeout_s: 3600,
            halt_timeout_s: 300,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct MirrorConfig {
    /// Daily build base; `{release}` and `{arch}` are substituted.
    #[facet(default = "https://nycdn.netbsd.org/pub/NetBSD-daily/netbsd-{release}/latest/{arch}/")]
    pub daily_url: String,
    #[facet(default = "https://pkgsrc.smartos.org/packages/NetBSD/bootstrap/")]
    pub bootstrap_url: String,
    #[facet(default = "https://cdn.netbsd.org/pub/pkgsrc/packages/NetBSD/")]
    pub pkgsrc_url: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            daily_url: DEFAULT_DAILY_URL.into(),
            bootstrap_url: DEFAULT_BOOTSTRAP_URL.into(),
            pkgsrc_url: DEFAULT_PKGSRC_URL.into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct QemuConfig {
    /// Emulator binary; derived from the guest arch when empty.
    #[facet(default)]
    pub binary: String,
    #[facet(default = "kvm")]
    pub accel: String,
    /// UEFI firmware for arm64 guests.
    #[facet(default = "/usr/share/AAVMF/AAVMF_CODE.fd")]
    pub firmware: String,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: String::new(),
            accel: "kvm".into(),
            firmware: "/usr/share/AAVMF/AAVMF_CODE.fd".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ConsoleConfig {
    #[facet(default = "login: ")]
    pub login_prompt: String,
    #[facet(default = "# ")]
    pub shell_prompt: String,
    #[facet(default = "root")]
    pub user: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            login_prompt: "login: ".into(),
            shell_prompt: "# ".into(),
            user: "root".into(),
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), MkvmError> {
    parse_size(&config.vm.disk_size).map_err(|e| MkvmError::Validation {
        message: format!("vm.disk_size: {e}"),
    })?;
    crate::util::size_in_mib(&config.vm.memory_size).map_err(|e| MkvmError::Validation {
        message: format!("vm.memory_size: {e}"),
    })?;

    if config.vm.cpus < 1 {
        return Err(MkvmError::Validation {
            message: "vm.cpus must be at least 1".into(),
        });
    }

    for (key, value) in [
        ("vm.boot_timeout_s", config.vm.boot_timeout_s),
        ("vm.command_timeout_s", config.vm.command_timeout_s),
        ("vm.halt_timeout_s", config.vm.halt_timeout_s),
    ] {
        if value == 0 {
            return Err(MkvmError::Validation {
                message: format!("{key} must be greater than 0"),
            });
        }
    }

    for (key, value) in [
        ("mirror.daily_url", &config.mirror.daily_url),
        ("mirror.bootstrap_url", &config.mirror.bootstrap_url),
        ("mirror.pkgsrc_url", &config.mirror.pkgsrc_url),
        ("console.login_prompt", &config.console.login_prompt),
        ("console.shell_prompt", &config.console.shell_prompt),
    ] {
        if value.trim().is_empty() {
            return Err(MkvmError::Validation {
                message: format!("{key} must not be empty"),
            });
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, MkvmError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| MkvmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the config file.
///
/// An explicit path must exist. Without one, `mkvm.toml` in the working
/// directory is used when present and built-in defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, MkvmError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !p.exists() {
                tracing::debug!("no {DEFAULT_CONFIG_FILE}, using defaults");
                return Ok(Config::default());
            }
            p
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| MkvmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents, &path)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}
