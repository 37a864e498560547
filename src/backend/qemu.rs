use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::{Machine, MachineSpec, qmp};
use crate::arch::GuestArch;
use crate::config::{Config, ConsoleConfig, QemuConfig};
use crate::console::SerialConsole;
use crate::error::MkvmError;
use crate::logging::{self, ConsoleTranscript};
use crate::util::size_in_mib;
use crate::{image, paths};

pub type QemuConsole = SerialConsole<ChildStdout, ChildStdin>;

/// A NetBSD guest under QEMU with its serial console on stdio.
pub struct QemuMachine {
    spec: MachineSpec,
    guest: GuestArch,
    qemu: QemuConfig,
    console: ConsoleConfig,
    cpus: u32,
    boot_timeout: Duration,
    halt_timeout: Duration,
    cache_dir: PathBuf,
    child: Option<Child>,
}

impl QemuMachine {
    pub fn new(spec: MachineSpec, guest: GuestArch, config: &Config, cache_dir: PathBuf) -> Self {
        Self {
            spec,
            guest,
            qemu: config.qemu.clone(),
            console: config.console.clone(),
            cpus: config.vm.cpus,
            boot_timeout: Duration::from_secs(config.vm.boot_timeout_s),
            halt_timeout: Duration::from_secs(config.vm.halt_timeout_s),
            cache_dir,
            child: None,
        }
    }

    fn binary(&self) -> &str {
        if self.qemu.binary.is_empty() {
            self.guest.qemu_binary
        } else {
            &self.qemu.binary
        }
    }
}

/// Command-line arguments for QEMU.
pub fn qemu_args(
    spec: &MachineSpec,
    guest: &GuestArch,
    qemu: &QemuConfig,
    cpus: u32,
    disk: &Path,
    qmp_socket: &Path,
) -> Result<Vec<String>, MkvmError> {
    let mut args: Vec<String> = guest.machine_args.iter().map(|s| s.to_string()).collect();

    args.extend([
        "-accel".to_string(),
        qemu.accel.clone(),
        "-m".to_string(),
        size_in_mib(&spec.memory_size)?.to_string(),
        "-smp".to_string(),
        cpus.to_string(),
    ]);

    if guest.needs_firmware {
        args.extend(["-bios".to_string(), qemu.firmware.clone()]);
    }

    args.extend([
        "-drive".to_string(),
        format!(
            "file={},format=raw,if={}",
            disk.display(),
            guest.disk_interface
        ),
        "-netdev".to_string(),
        "user,id=net0".to_string(),
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
        "-display".to_string(),
        "none".to_string(),
        "-serial".to_string(),
        "stdio".to_string(),
        "-monitor".to_string(),
        "none".to_string(),
        "-qmp".to_string(),
        format!("unix:{},server=on,wait=off", qmp_socket.display()),
    ]);

    if !spec.persist {
        args.push("-snapshot".to_string());
    }

    Ok(args)
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "mkvm::qemu", "{line}");
    }
}

impl Machine for QemuMachine {
    type Console = QemuConsole;

    async fn boot(&mut self) -> Result<QemuConsole, MkvmError> {
        let workdir = self.spec.workdir.clone();
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| MkvmError::Io {
                context: format!("creating work directory {}", workdir.display()),
                source: e,
            })?;

        let disk = image::prepare_disk(&self.spec, &self.guest, &self.cache_dir).await?;

        let qmp_socket = paths::qmp_socket_path(&workdir);
        let _ = tokio::fs::remove_file(&qmp_socket).await;

        let args = qemu_args(&self.spec, &self.guest, &self.qemu, self.cpus, &disk, &qmp_socket)?;
        let binary = self.binary().to_string();
        tracing::info!(%binary, args = %args.join(" "), "starting QEMU");

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MkvmError::Io {
                context: format!("running {binary}"),
                source: e,
            })?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(MkvmError::ExternalCommand {
                command: binary,
                message: "console pipes not available".into(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }
        self.child = Some(child);

        let logs = paths::logs_dir(&workdir);
        logging::rotate_transcripts(&logs, logging::KEEP_TRANSCRIPTS);
        let transcript = ConsoleTranscript::create(&logs).map_err(|e| MkvmError::Io {
            context: format!("creating console transcript in {}", logs.display()),
            source: e,
        })?;

        Ok(SerialConsole::new(stdout, stdin, self.console.clone(), self.boot_timeout)
            .with_transcript(transcript))
    }

    async fn halt(&mut self) -> Result<(), MkvmError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        let exited = child.try_wait().map_err(|e| MkvmError::Io {
            context: "checking QEMU process".into(),
            source: e,
        })?;
        if let Some(status) = exited {
            tracing::info!(%status, "QEMU already exited");
            self.child = None;
            return Ok(());
        }

        qmp::system_powerdown(&paths::qmp_socket_path(&self.spec.workdir)).await?;

        match tokio::time::timeout(self.halt_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "guest powered off");
                self.child = None;
                Ok(())
            }
            Ok(Err(e)) => Err(MkvmError::Io {
                context: "waiting for QEMU to exit".into(),
                source: e,
            }),
            Err(_) => {
                let _ = child.kill().await;
                self.child = None;
                Err(MkvmError::Timeout {
                    what: "the guest to power off".into(),
                    secs: self.halt_timeout.as_secs(),
                })
            }
        }
    }
}
