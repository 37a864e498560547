//! The provisioning recipe: which packages go into the image and the
//! ordered shell commands typed into the guest console to get there.
//!
//! Arguments are substituted verbatim. Nothing here escapes or validates
//! operator input; a bad tarball name fails inside the guest.

use crate::config::MirrorConfig;

/// Packages installed on top of the pkgsrc bootstrap kit.
pub const KIT_PACKAGES: &[&str] = &[
    "bash",
    "curl",
    "git-base",
    "go121",
    // Interactive debugging for users on `gomote ssh`
    "emacs29-nox11",
    "vim",
    "screen",
    // golang.org/issue/24354
    "clang",
    "cmake",
];

/// Packages installed from a pkgsrc binary repository release.
pub const PKG_PACKAGES: &[&str] = &[
    "bash",
    "curl",
    "git-base",
    "go122",
    "emacs29-nox11",
    "vim",
    "screen",
    "clang",
    "cmake",
];

// GOROOT_BOOTSTRAP stays at go121 for both variants, matching the images
// already in the fleet.
const RC_LOCAL_BUILDLET: &str = r#"cat >> /etc/rc.local <<EOF
(
  export PATH=/usr/pkg/bin:/usr/pkg/sbin:${PATH}
  export GOROOT_BOOTSTRAP=/usr/pkg/go121
  set -x
  echo 'starting buildlet script'
  netstat -rn
  cat /etc/resolv.conf
  dig metadata.google.internal
  (
    set -e
    curl -o /buildlet \$(curl -H 'Metadata-Flavor: Google' http://metadata.google.internal/computeMetadata/v1/instance/attributes/buildlet-binary-url)
    chmod +x /buildlet
    exec /buildlet
  )
  echo 'giving up'
  sleep 10
  halt -p
)
EOF"#;

const IFCONFIG_VIOIF0: &str = "cat > /etc/ifconfig.vioif0 << EOF
!dhcpcd
mtu 1460
EOF";

// /tmp is tmpfs -s=ram%25 by default, too small for builds.
const FSTAB_DROP_TMP: &str = r"ed /etc/fstab << EOF
H
/\/tmp/d
wq
EOF";

/// Default location of NetBSD daily builds; `{release}` and `{arch}` are
/// substituted.
pub const DEFAULT_DAILY_URL: &str =
    "https://nycdn.netbsd.org/pub/NetBSD-daily/netbsd-{release}/latest/{arch}/";
pub const DEFAULT_BOOTSTRAP_URL: &str = "https://pkgsrc.smartos.org/packages/NetBSD/bootstrap/";
pub const DEFAULT_PKGSRC_URL: &str = "https://cdn.netbsd.org/pub/pkgsrc/packages/NetBSD/";

/// Which OS build the image is made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// NetBSD port name as used by the daily builds, e.g. `amd64`.
    pub arch: String,
    /// Release branch, e.g. `10`.
    pub release: String,
}

/// How pkgin gets onto the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    /// Unpack a pkgsrc bootstrap kit tarball, checked against its SHA-1.
    BootstrapKit { tarball: String, sha1: String },
    /// `pkg_add pkgin` from a pkgsrc binary package release.
    PkgRepo { pkg_release: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub target: Target,
    pub variant: Variant,
}

/// `pkgin -y install` for the packages, in the order given.
pub fn install_command(packages: &[&str]) -> String {
    format!("pkgin -y install {}", packages.join(" "))
}

fn join_url(base: &str, rest: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{rest}")
    } else {
        format!("{base}/{rest}")
    }
}

impl Recipe {
    pub fn new(target: Target, variant: Variant) -> Self {
        Self { target, variant }
    }

    pub fn packages(&self) -> &'static [&'static str] {
        match self.variant {
            Variant::BootstrapKit { .. } => KIT_PACKAGES,
            Variant::PkgRepo { .. } => PKG_PACKAGES,
        }
    }

    /// Base URL of the daily build for this target.
    pub fn image_url(&self, template: &str) -> String {
        template
            .replace("{release}", &self.target.release)
            .replace("{arch}", &self.target.arch)
    }

    /// Work directory holding the disk, QMP socket and logs.
    pub fn workdir(&self) -> String {
        format!("work-NetBSD-{}-{}", self.target.release, self.target.arch)
    }

    /// The full command sequence, in the order it is typed into the guest.
    pub fn commands(&self, mirrors: &MirrorConfig) -> Vec<String> {
        let mut commands = vec![
            RC_LOCAL_BUILDLET.to_string(),
            IFCONFIG_VIOIF0.to_string(),
            "dhcpcd -w".to_string(),
        ];

        match &self.variant {
            Variant::BootstrapKit { tarball, sha1 } => {
                commands.push(format!("ftp {}", join_url(&mirrors.bootstrap_url, tarball)));
                commands.push(verify_command(tarball, sha1));
                commands.push(format!("tar -zxpf {tarball} -C /"));
                commands.push(format!("rm {tarball}"));
            }
            Variant::PkgRepo { pkg_release } => {
                let repo = join_url(
                    &mirrors.pkgsrc_url,
                    &format!("{}/{}/All", self.target.arch, pkg_release),
                );
                commands.push(format!("env PKG_PATH={repo}/ pkg_add pkgin"));
                commands.push(format!(
                    "echo {repo} > /usr/pkg/etc/pkgin/repositories.conf"
                ));
            }
        }

        commands.push("pkgin update".to_string());
        commands.push(install_command(self.packages()));
        commands.push("pkgin clean".to_string());
        commands.push(FSTAB_DROP_TMP.to_string());
        commands.push("echo sshd=yes >> /etc/rc.conf".to_string());
        commands.push(
            "echo PermitRootLogin without-password >> /etc/ssh/sshd_config".to_string(),
        );
        commands.push("/etc/rc.d/sshd restart".to_string());
        commands.push("sync; shutdown -hp now".to_string());
        commands
    }
}

/// `sha1 -c` check line for the bootstrap kit.
pub fn verify_command(tarball: &str, sha1: &str) -> String {
    format!("echo \"{sha1} {tarball}\" | sha1 -c")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kit(arch: &str, release: &str) -> Recipe {
        Recipe::new(
            Target {
                arch: arch.into(),
                release: release.into(),
            },
            Variant::BootstrapKit {
                tarball: "bootstrap-netbsd-trunk-x86_64-20240426.tar.gz".into(),
                sha1: "cd5fd2ec5e4b2e9d1fa6e8c1e3e0b18e57d7e4d2".into(),
            },
        )
    }

    fn pkg(arch: &str, release: &str) -> Recipe {
        Recipe::new(
            Target {
                arch: arch.into(),
                release: release.into(),
            },
            Variant::PkgRepo {
                pkg_release: "10.0_2024Q1".into(),
            },
        )
    }

    #[test]
    fn install_command_is_direct_join() {
        assert_eq!(install_command(&["b", "a", "c"]), "pkgin -y install b a c");
        assert_eq!(install_command(&["c", "a", "b"]), "pkgin -y install c a b");
    }

    #[test]
    fn verify_command_format() {
        assert_eq!(verify_command("X", "Y"), "echo \"Y X\" | sha1 -c");
    }

    #[test]
    fn kit_sequence_order() {
        let cmds = kit("amd64", "10").commands(&MirrorConfig::default());
        assert_eq!(cmds.len(), 15);
        assert!(cmds[0].starts_with("cat >> /etc/rc.local <<EOF\n"));
        assert!(cmds[1].starts_with("cat > /etc/ifconfig.vioif0 << EOF\n"));
        assert_eq!(cmds[2], "dhcpcd -w");
        assert_eq!(
            cmds[3],
            "ftp https://pkgsrc.smartos.org/packages/NetBSD/bootstrap/bootstrap-netbsd-trunk-x86_64-20240426.tar.gz"
        );
        assert_eq!(
            cmds[4],
            "echo \"cd5fd2ec5e4b2e9d1fa6e8c1e3e0b18e57d7e4d2 bootstrap-netbsd-trunk-x86_64-20240426.tar.gz\" | sha1 -c"
        );
        assert_eq!(cmds[5], "tar -zxpf bootstrap-netbsd-trunk-x86_64-20240426.tar.gz -C /");
        assert_eq!(cmds[6], "rm bootstrap-netbsd-trunk-x86_64-20240426.tar.gz");
        assert_eq!(cmds[7], "pkgin update");
        assert_eq!(
            cmds[8],
            "pkgin -y install bash curl git-base go121 emacs29-nox11 vim screen clang cmake"
        );
        assert_eq!(cmds[9], "pkgin clean");
        assert_eq!(cmds[10], "ed /etc/fstab << EOF\nH\n/\\/tmp/d\nwq\nEOF");
        assert_eq!(cmds[11], "echo sshd=yes >> /etc/rc.conf");
        assert_eq!(cmds[12], "echo PermitRootLogin without-password >> /etc/ssh/sshd_config");
        assert_eq!(cmds[13], "/etc/rc.d/sshd restart");
        assert_eq!(cmds[14], "sync; shutdown -hp now");
    }

    #[test]
    fn pkg_sequence_uses_repository() {
        let cmds = pkg("evbarm-aarch64", "10").commands(&MirrorConfig::default());
        assert_eq!(cmds.len(), 13);
        assert_eq!(
            cmds[3],
            "env PKG_PATH=https://cdn.netbsd.org/pub/pkgsrc/packages/NetBSD/evbarm-aarch64/10.0_2024Q1/All/ pkg_add pkgin"
        );
        assert_eq!(
            cmds[4],
            "echo https://cdn.netbsd.org/pub/pkgsrc/packages/NetBSD/evbarm-aarch64/10.0_2024Q1/All > /usr/pkg/etc/pkgin/repositories.conf"
        );
        assert_eq!(cmds[5], "pkgin update");
        assert!(cmds[6].contains(" go122 "));
        assert_eq!(cmds.last().map(String::as_str), Some("sync; shutdown -hp now"));
    }

    #[test]
    fn buildlet_hook_keeps_go121_bootstrap_in_both_variants() {
        for recipe in [kit("amd64", "10"), pkg("amd64", "10")] {
            let cmds = recipe.commands(&MirrorConfig::default());
            assert!(cmds[0].contains("export GOROOT_BOOTSTRAP=/usr/pkg/go121\n"));
            assert!(cmds[0].contains("curl -o /buildlet \\$(curl -H 'Metadata-Flavor: Google'"));
            assert!(cmds[0].ends_with("  halt -p\n)\nEOF"));
        }
    }

    #[test]
    fn release_only_changes_url_and_workdir() {
        let a = kit("amd64", "9");
        let b = kit("amd64", "10");
        let mirrors = MirrorConfig::default();
        assert_eq!(a.commands(&mirrors), b.commands(&mirrors));
        assert_ne!(a.workdir(), b.workdir());
        assert_ne!(a.image_url(DEFAULT_DAILY_URL), b.image_url(DEFAULT_DAILY_URL));
    }

    #[test]
    fn every_arch_variant_and_release() {
        let mirrors = MirrorConfig::default();
        let tail = [
            "pkgin clean",
            FSTAB_DROP_TMP,
            "echo sshd=yes >> /etc/rc.conf",
            "echo PermitRootLogin without-password >> /etc/ssh/sshd_config",
            "/etc/rc.d/sshd restart",
            "sync; shutdown -hp now",
        ];

        for guest in crate::arch::GuestArch::supported() {
            let arch = guest.name;
            let mut by_release = Vec::new();
            for release in ["9", "10"] {
                let kit_cmds = kit(arch, release).commands(&mirrors);
                let pkg_cmds = pkg(arch, release).commands(&mirrors);

                for cmds in [&kit_cmds, &pkg_cmds] {
                    assert_eq!(cmds[0], RC_LOCAL_BUILDLET, "{arch}/{release}");
                    assert_eq!(cmds[1], IFCONFIG_VIOIF0, "{arch}/{release}");
                    assert_eq!(cmds[2], "dhcpcd -w", "{arch}/{release}");
                    assert_eq!(&cmds[cmds.len() - tail.len()..], tail, "{arch}/{release}");
                    assert!(cmds.iter().all(|c| !c.contains(&format!("netbsd-{release}"))));
                }

                assert_eq!(kit_cmds.len(), 15, "{arch}/{release}");
                assert_eq!(kit_cmds[7], "pkgin update");
                assert_eq!(kit_cmds[8], install_command(KIT_PACKAGES));

                let repo = format!(
                    "https://cdn.netbsd.org/pub/pkgsrc/packages/NetBSD/{arch}/10.0_2024Q1/All"
                );
                assert_eq!(pkg_cmds.len(), 13, "{arch}/{release}");
                assert_eq!(pkg_cmds[3], format!("env PKG_PATH={repo}/ pkg_add pkgin"));
                assert_eq!(
                    pkg_cmds[4],
                    format!("echo {repo} > /usr/pkg/etc/pkgin/repositories.conf")
                );
                assert_eq!(pkg_cmds[5], "pkgin update");
                assert_eq!(pkg_cmds[6], install_command(PKG_PACKAGES));

                by_release.push((kit_cmds, pkg_cmds));
            }
            assert_eq!(by_release[0], by_release[1], "{arch}: release leaked into commands");
        }
    }

    #[test]
    fn image_url_and_workdir() {
        let r = kit("amd64", "10");
        assert_eq!(
            r.image_url(DEFAULT_DAILY_URL),
            "https://nycdn.netbsd.org/pub/NetBSD-daily/netbsd-10/latest/amd64/"
        );
        assert_eq!(r.workdir(), "work-NetBSD-10-amd64");
    }

    #[test]
    fn parameters_are_not_escaped() {
        let r = Recipe::new(
            Target {
                arch: "amd64".into(),
                release: "10".into(),
            },
            Variant::BootstrapKit {
                tarball: "kit with space.tgz".into(),
                sha1: "$(true)".into(),
            },
        );
        let cmds = r.commands(&MirrorConfig::default());
        assert_eq!(cmds[4], "echo \"$(true) kit with space.tgz\" | sha1 -c");
        assert_eq!(cmds[6], "rm kit with space.tgz");
    }

    #[test]
    fn mirror_without_trailing_slash() {
        let mirrors = MirrorConfig {
            bootstrap_url: "https://mirror.example/bootstrap".into(),
            ..MirrorConfig::default()
        };
        let cmds = kit("amd64", "10").commands(&mirrors);
        assert_eq!(
            cmds[3],
            "ftp https://mirror.example/bootstrap/bootstrap-netbsd-trunk-x86_64-20240426.tar.gz"
        );
    }
}
