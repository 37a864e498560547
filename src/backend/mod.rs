pub mod qemu;
pub mod qmp;

use std::path::PathBuf;
use std::time::Duration;

use crate::arch::GuestArch;
use crate::config::Config;
use crate::error::MkvmError;

/// Everything needed to construct a VM session.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// Daily build base URL, or a local image file.
    pub image_source: String,
    pub workdir: PathBuf,
    pub disk_size: String,
    pub memory_size: String,
    /// Keep guest writes on the disk image.
    pub persist: bool,
}

/// A VM that can be started once and halted once.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Machine {
    type Console: GuestConsole;

    /// Start the VM and return its console.
    async fn boot(&mut self) -> Result<Self::Console, MkvmError>;

    /// Ask the guest to power off and wait for it.
    async fn halt(&mut self) -> Result<(), MkvmError>;
}

#[allow(async_fn_in_trait)]
pub trait GuestConsole {
    async fn login(&mut self) -> Result<(), MkvmError>;

    /// Run one shell command, failing on timeout or a non-zero exit status.
    async fn run_command(&mut self, command: &str, timeout: Duration) -> Result<(), MkvmError>;

    /// The session is over; `success` tells whether every step passed.
    /// Returns where the console transcript was saved, if one was kept.
    fn finish(&mut self, _success: bool) -> Option<PathBuf> {
        None
    }
}

pub fn create_backend(spec: MachineSpec, guest: GuestArch, config: &Config) -> qemu::QemuMachine {
    qemu::QemuMachine::new(spec, guest, config, crate::paths::cache_dir())
}
