//! libvirt (`virsh`, `virt-install`), `qemu-img` and `cloud-localds`.

use crate::env::Env;
use crate::exec::Cmd;
use crate::tools::ToolArgs;
use crate::vm_config::VmConfig;
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

// ============================================================================
// Domains
// ============================================================================

/// Domain state as printed by `virsh domstate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    ShutOff,
    Paused,
    /// Domain is not defined
    Missing,
    Other(String),
}

impl DomainState {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "running" => Self::Running,
            "shut off" => Self::ShutOff,
            "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::ShutOff => write!(f, "shut off"),
            Self::Paused => write!(f, "paused"),
            Self::Missing => write!(f, "not defined"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

pub fn domain_exists(env: &Env, name: &str) -> bool {
    env.succeeds(&Cmd::new("virsh").args(["dominfo", name]))
}

pub fn domain_state(env: &Env, name: &str) -> DomainState {
    match env.run(&Cmd::new("virsh").args(["domstate", name])) {
        Ok(out) if out.success => DomainState::parse(&out.stdout),
        _ => DomainState::Missing,
    }
}

pub fn start(env: &Env, name: &str) -> Result<()> {
    env.run_ok(&Cmd::new("virsh").args(["start", name]).destructive())?;
    Ok(())
}

pub fn resume(env: &Env, name: &str) -> Result<()> {
    env.run_ok(&Cmd::new("virsh").args(["resume", name]).destructive())?;
    Ok(())
}

/// First IPv4 address in `virsh domifaddr` output, prefix length stripped.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------
///  vnet0      52:54:00:6b:3c:58    ipv4         192.168.122.50/24
/// ```
pub fn parse_domifaddr(text: &str) -> Option<Ipv4Addr> {
    text.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let proto = fields.iter().position(|f| *f == "ipv4")?;
        let addr = fields.get(proto + 1)?;
        addr.split('/').next()?.parse().ok()
    })
}

/// Address of a running domain from DHCP leases, if any yet.
pub fn domain_ip(env: &Env, name: &str) -> Option<Ipv4Addr> {
    env.run_ok(&Cmd::new("virsh").args(["domifaddr", name]))
        .ok()
        .and_then(|out| parse_domifaddr(&out))
}

// ============================================================================
// Networks
// ============================================================================

/// Activity flags from `virsh net-info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetInfo {
    pub active: bool,
    pub autostart: bool,
}

pub fn parse_net_info(text: &str) -> NetInfo {
    let mut info = NetInfo::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let yes = value.trim() == "yes";
        match key.trim() {
            "Active" => info.active = yes,
            "Autostart" => info.autostart = yes,
            _ => {}
        }
    }
    info
}

/// `None` when the network is not defined.
pub fn net_info(env: &Env, network: &str) -> Option<NetInfo> {
    env.run_ok(&Cmd::new("virsh").args(["net-info", network]))
        .ok()
        .map(|out| parse_net_info(&out))
}

pub fn net_start(env: &Env, network: &str) -> Result<()> {
    env.run_ok(&Cmd::new("virsh").args(["net-start", network]).destructive())?;
    Ok(())
}

pub fn net_autostart(env: &Env, network: &str) -> Result<()> {
    env.run_ok(
        &Cmd::new("virsh")
            .args(["net-autostart", network])
            .destructive(),
    )?;
    Ok(())
}

// ============================================================================
// Snapshots
// ============================================================================

pub fn snapshot_names(env: &Env, domain: &str) -> Vec<String> {
    env.run_ok(&Cmd::new("virsh").args(["snapshot-list", "--name", domain]))
        .map(|out| {
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn snapshot_create(env: &Env, domain: &str, name: &str, description: &str) -> Result<()> {
    env.run_ok(
        &Cmd::new("virsh")
            .args([
                "snapshot-create-as",
                "--domain",
                domain,
                "--name",
                name,
                "--description",
                description,
                "--atomic",
            ])
            .destructive(),
    )?;
    Ok(())
}

// ============================================================================
// Provisioning
// ============================================================================

/// Arguments for `virt-install --import` of a cloud image.
#[derive(Debug, Clone)]
pub struct VirtInstallArgs {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub disk: PathBuf,
    pub seed_iso: PathBuf,
    pub network: String,
    pub os_variant: String,
    /// PCI address of a GPU virtual function to pass through.
    pub hostdev: Option<String>,
}

impl VirtInstallArgs {
    pub fn for_vm(cfg: &VmConfig, seed_iso: PathBuf) -> Self {
        Self {
            name: cfg.name.clone(),
            vcpus: cfg.vcpus,
            memory_mb: cfg.ram_mb,
            disk: cfg.disk_path.clone(),
            seed_iso,
            network: cfg.network.clone(),
            os_variant: cfg.os_variant.clone(),
            hostdev: cfg.gpu_vf.clone(),
        }
    }
}

impl ToolArgs for VirtInstallArgs {
    fn program(&self) -> &'static str {
        "virt-install"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--name".to_string(),
            self.name.clone(),
            "--vcpus".to_string(),
            self.vcpus.to_string(),
            "--memory".to_string(),
            self.memory_mb.to_string(),
            "--disk".to_string(),
            format!("path={},format=qcow2,bus=virtio", self.disk.display()),
            "--disk".to_string(),
            format!("path={},device=cdrom", self.seed_iso.display()),
            "--network".to_string(),
            format!("network={},model=virtio", self.network),
            "--os-variant".to_string(),
            self.os_variant.clone(),
            "--import".to_string(),
            "--graphics".to_string(),
            "none".to_string(),
            "--noautoconsole".to_string(),
        ];
        if let Some(ref pci) = self.hostdev {
            args.push("--hostdev".to_string());
            args.push(pci.clone());
        }
        args
    }
}

/// Copy-on-write overlay on top of the downloaded base image.
#[derive(Debug, Clone)]
pub struct QemuImgCreateArgs {
    pub backing: PathBuf,
    pub disk: PathBuf,
    pub size_gb: u32,
}

impl ToolArgs for QemuImgCreateArgs {
    fn program(&self) -> &'static str {
        "qemu-img"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            self.backing.display().to_string(),
            self.disk.display().to_string(),
            format!("{}G", self.size_gb),
        ]
    }
}

/// NoCloud seed image.
#[derive(Debug, Clone)]
pub struct CloudLocaldsArgs {
    pub output: PathBuf,
    pub user_data: PathBuf,
    pub meta_data: PathBuf,
    pub network_config: PathBuf,
}

impl ToolArgs for CloudLocaldsArgs {
    fn program(&self) -> &'static str {
        "cloud-localds"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            format!("--network-config={}", self.network_config.display()),
            self.output.display().to_string(),
            self.user_data.display().to_string(),
            self.meta_data.display().to_string(),
        ]
    }
}
