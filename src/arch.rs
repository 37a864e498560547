//! NetBSD ports the QEMU backend knows how to boot.

use crate::error::MkvmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestArch {
    /// Port name as used in the daily build tree.
    pub name: &'static str,
    pub qemu_binary: &'static str,
    pub machine_args: &'static [&'static str],
    /// `-drive if=` value; decides whether the guest sees `wd0` or `ld0`.
    pub disk_interface: &'static str,
    /// Directory under the daily build holding bootable images.
    pub image_dir: &'static str,
    /// Filename suffix of the image to boot.
    pub image_suffix: &'static str,
    /// Whether QEMU needs UEFI firmware (`-bios`).
    pub needs_firmware: bool,
    /// The image grows its root partition and file system to fill the disk
    /// on first boot (`resize_root=YES` in its rc.conf).
    pub grows_root: bool,
}

const SUPPORTED: &[GuestArch] = &[
    GuestArch {
        name: "amd64",
        qemu_binary: "qemu-system-x86_64",
        machine_args: &[],
        disk_interface: "ide",
        image_dir: "images/",
        image_suffix: "-live.img.gz",
        needs_firmware: false,
        grows_root: false,
    },
    GuestArch {
        name: "i386",
        qemu_binary: "qemu-system-i386",
        machine_args: &[],
        disk_interface: "ide",
        image_dir: "images/",
        image_suffix: "-live.img.gz",
        needs_firmware: false,
        grows_root: false,
    },
    GuestArch {
        name: "evbarm-aarch64",
        qemu_binary: "qemu-system-aarch64",
        machine_args: &["-M", "virt", "-cpu", "cortex-a57"],
        disk_interface: "virtio",
        image_dir: "binary/gzimg/",
        image_suffix: "arm64.img.gz",
        needs_firmware: true,
        grows_root: true,
    },
];

impl GuestArch {
    /// Every port the QEMU backend can boot.
    pub fn supported() -> &'static [GuestArch] {
        SUPPORTED
    }

    pub fn lookup(arch: &str) -> Result<GuestArch, MkvmError> {
        SUPPORTED
            .iter()
            .find(|g| g.name == arch)
            .cloned()
            .ok_or_else(|| MkvmError::Validation {
                message: format!(
                    "unsupported arch '{arch}' (supported: {})",
                    SUPPORTED.iter().map(|g| g.name).collect::<Vec<_>>().join(", ")
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known() {
        let g = GuestArch::lookup("amd64").unwrap();
        assert_eq!(g.qemu_binary, "qemu-system-x86_64");
        assert!(!g.needs_firmware);

        let g = GuestArch::lookup("evbarm-aarch64").unwrap();
        assert_eq!(g.image_suffix, "arm64.img.gz");
        assert!(g.needs_firmware);
    }

    #[test]
    fn only_arm_images_grow_root() {
        let growing: Vec<&str> = SUPPORTED
            .iter()
            .filter(|g| g.grows_root)
            .map(|g| g.name)
            .collect();
        assert_eq!(growing, vec!["evbarm-aarch64"]);
    }

    #[test]
    fn lookup_unknown_lists_supported() {
        let err = GuestArch::lookup("vax").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'vax'"));
        assert!(msg.contains("amd64, i386, evbarm-aarch64"));
    }
}
