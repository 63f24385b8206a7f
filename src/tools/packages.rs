//! Distribution package managers.

use crate::env::Env;
use crate::exec::Cmd;
use crate::tools::ToolArgs;
use anyhow::Result;
use serde::Serialize;
use strum::{Display, EnumString};

/// Package manager of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian, Ubuntu and derivatives
    Apt,
    /// Arch Linux and derivatives
    Pacman,
}

impl PackageManager {
    /// Packages the host needs for KVM, libvirt, cloud images and dkms builds.
    pub const fn host_packages(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &[
                "qemu-system-x86",
                "qemu-utils",
                "libvirt-daemon-system",
                "libvirt-clients",
                "virtinst",
                "cloud-image-utils",
                "dkms",
                "build-essential",
                "linux-headers-generic",
                "git",
                "curl",
            ],
            Self::Pacman => &[
                "qemu-base",
                "libvirt",
                "virt-install",
                "dnsmasq",
                "cloud-image-utils",
                "dkms",
                "base-devel",
                "linux-headers",
                "git",
                "curl",
            ],
        }
    }

    /// Probe whether `package` is installed.
    pub fn query_cmd(self, package: &str) -> Cmd {
        match self {
            Self::Apt => Cmd::new("dpkg-query").args(["-W", "-f=${Status}", package]),
            Self::Pacman => Cmd::new("pacman").args(["-Q", package]),
        }
    }

    /// Interpret the output of [`query_cmd`](Self::query_cmd).
    pub fn query_says_installed(self, success: bool, stdout: &str) -> bool {
        match self {
            Self::Apt => success && stdout.contains("install ok installed"),
            Self::Pacman => success,
        }
    }
}

/// Install `packages` with the host package manager.
#[derive(Debug, Clone)]
pub struct InstallArgs {
    pub manager: PackageManager,
    pub packages: Vec<String>,
}

impl ToolArgs for InstallArgs {
    fn program(&self) -> &'static str {
        match self.manager {
            PackageManager::Apt => "apt-get",
            PackageManager::Pacman => "pacman",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.manager {
            PackageManager::Apt => vec!["install".into(), "-y".into()],
            PackageManager::Pacman => {
                vec!["-S".into(), "--needed".into(), "--noconfirm".into()]
            }
        };
        args.extend(self.packages.iter().cloned());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        match self.manager {
            PackageManager::Apt => vec![("DEBIAN_FRONTEND".into(), "noninteractive".into())],
            PackageManager::Pacman => Vec::new(),
        }
    }
}

pub fn is_installed(env: &Env, manager: PackageManager, package: &str) -> bool {
    match env.run(&manager.query_cmd(package)) {
        Ok(out) => manager.query_says_installed(out.success, &out.stdout),
        Err(e) => {
            tracing::debug!("package query for {} failed: {:#}", package, e);
            false
        }
    }
}

/// Packages from `wanted` that are not installed yet.
pub fn missing(env: &Env, manager: PackageManager, wanted: &[&str]) -> Vec<String> {
    wanted
        .iter()
        .filter(|p| !is_installed(env, manager, p))
        .map(|p| p.to_string())
        .collect()
}

/// Install `packages` (no-op for an empty list).
pub fn install(env: &Env, manager: PackageManager, packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    if manager == PackageManager::Apt {
        env.run_ok(&Cmd::new("apt-get").arg("update").destructive().stream())?;
    }
    let args = InstallArgs {
        manager,
        packages: packages.to_vec(),
    };
    env.run_ok(&args.to_cmd().stream())?;
    tracing::info!(manager = %manager, "installed {}", packages.join(" "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CmdOutput;
    use crate::testing::{FakeExec, test_env};

    #[test]
    fn test_install_args() {
        let apt = InstallArgs {
            manager: PackageManager::Apt,
            packages: vec!["git".into(), "curl".into()],
        }
        .to_cmd();
        assert_eq!(apt.command_line(), "apt-get install -y git curl");
        assert!(apt.is_destructive());
        assert_eq!(apt.env_vars()[0].1, "noninteractive");

        let pacman = InstallArgs {
            manager: PackageManager::Pacman,
            packages: vec!["libvirt".into()],
        }
        .to_cmd();
        assert_eq!(pacman.command_line(), "pacman -S --needed --noconfirm libvirt");
    }

    #[test]
    fn test_missing_uses_dpkg_status() {
        let exec = FakeExec::new()
            .ok("dpkg-query -W '-f=${Status}' git", "install ok installed")
            .on(
                "dpkg-query -W '-f=${Status}' curl",
                CmdOutput::ok("deinstall ok config-files"),
            );
        let (env, _dir) = test_env(exec);
        assert_eq!(
            missing(&env, PackageManager::Apt, &["git", "curl", "dkms"]),
            vec!["curl", "dkms"]
        );
    }

    #[test]
    fn test_install_nothing_runs_nothing() {
        let exec = FakeExec::new();
        let (env, _dir) = test_env(exec.clone());
        install(&env, PackageManager::Apt, &[]).unwrap();
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_install_updates_apt_first() {
        let exec = FakeExec::new().ok("apt-get", "");
        let (env, _dir) = test_env(exec.clone());
        install(&env, PackageManager::Apt, &["git".into()]).unwrap();
        assert_eq!(exec.calls(), vec!["apt-get update", "apt-get install -y git"]);
    }
}
