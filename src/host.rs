//! Host environment detection.
//!
//! Everything here reads files under the sysroot (`/etc`, `/proc`, `/sys`,
//! `/dev`) so it can be pointed at a fixture tree in tests. Detection never
//! fails: an unreadable file means "feature not present".
//!
//! # Pre-flight
//!
//! [`preflight`] checks that the binaries a phase shells out to are on
//! `PATH` and prints a package hint for each missing one.

use crate::env::Env;
use crate::kvconf::KvFile;
use crate::pipeline::Phase;
use crate::tools::packages::PackageManager;
use crate::tools::which;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Integrated Intel GPU, the usual SR-IOV physical function.
pub const DEFAULT_GPU_PCI: &str = "0000:00:02.0";

// ============================================================================
// Distribution
// ============================================================================

/// Fields of `/etc/os-release` we care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Distro {
    pub id: String,
    pub id_like: Vec<String>,
    pub pretty_name: String,
}

impl Distro {
    pub fn parse(text: &str) -> Option<Self> {
        let file = KvFile::parse("/etc/os-release", text).ok()?;
        let id = file.get("ID")?.to_string();
        Some(Self {
            id_like: file
                .get("ID_LIKE")
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            pretty_name: file.get("PRETTY_NAME").unwrap_or(&id).to_string(),
            id,
        })
    }

    fn is(&self, family: &str) -> bool {
        self.id == family || self.id_like.iter().any(|l| l == family)
    }

    pub fn package_manager(&self) -> Option<PackageManager> {
        if self.is("debian") || self.is("ubuntu") {
            Some(PackageManager::Apt)
        } else if self.is("arch") {
            Some(PackageManager::Pacman)
        } else {
            None
        }
    }
}

pub fn detect_distro(env: &Env) -> Option<Distro> {
    env.read_sys("/etc/os-release")
        .and_then(|text| Distro::parse(&text))
}

// ============================================================================
// CPU and virtualization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuVendor {
    Intel,
    Amd,
    Other,
}

impl fmt::Display for CpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intel => write!(f, "Intel"),
            Self::Amd => write!(f, "AMD"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuInfo {
    pub vendor: CpuVendor,
    /// `vmx` (Intel VT-x) or `svm` (AMD-V) flag present
    pub virtualization: bool,
}

impl CpuInfo {
    /// Parse `/proc/cpuinfo`; only the first processor block is read.
    pub fn parse(text: &str) -> Self {
        let mut vendor = CpuVendor::Other;
        let mut virtualization = false;
        for line in text.lines() {
            if line.trim().is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "vendor_id" => {
                    vendor = match value.trim() {
                        "GenuineIntel" => CpuVendor::Intel,
                        "AuthenticAMD" => CpuVendor::Amd,
                        _ => CpuVendor::Other,
                    }
                }
                "flags" => {
                    virtualization = value
                        .split_whitespace()
                        .any(|flag| flag == "vmx" || flag == "svm");
                }
                _ => {}
            }
        }
        Self {
            vendor,
            virtualization,
        }
    }
}

pub fn detect_cpu(env: &Env) -> CpuInfo {
    CpuInfo::parse(&env.read_sys("/proc/cpuinfo").unwrap_or_default())
}

pub fn kvm_available(env: &Env) -> bool {
    env.paths.sys("/dev/kvm").exists()
}

fn dir_has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// IOMMU enabled in the running kernel.
pub fn iommu_active(env: &Env) -> bool {
    dir_has_entries(&env.paths.sys("/sys/class/iommu"))
        || dir_has_entries(&env.paths.sys("/sys/kernel/iommu_groups"))
}

/// Running kernel's command line.
pub fn proc_cmdline(env: &Env) -> String {
    env.read_sys("/proc/cmdline")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Kernel parameters that turn on the IOMMU in passthrough mode and, when
/// `max_vfs` is given, let the i915 driver create virtual functions.
pub fn iommu_params(vendor: CpuVendor, max_vfs: Option<u32>) -> Vec<String> {
    let mut params = Vec::new();
    match vendor {
        CpuVendor::Intel => params.push("intel_iommu=on".to_string()),
        CpuVendor::Amd => params.push("amd_iommu=on".to_string()),
        CpuVendor::Other => {}
    }
    params.push("iommu=pt".to_string());
    if let Some(n) = max_vfs {
        params.push("i915.enable_guc=3".to_string());
        params.push(format!("i915.max_vfs={}", n));
    }
    params
}

// ============================================================================
// SR-IOV
// ============================================================================

/// SR-IOV capabilities of one PCI device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SriovDevice {
    pub pci: String,
    pub total_vfs: u32,
    pub num_vfs: u32,
    /// PCI addresses of the enabled virtual functions
    pub vfs: Vec<String>,
}

fn read_u32(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `None` when the device does not exist or has no SR-IOV capability.
pub fn sriov_device(env: &Env, pci: &str) -> Option<SriovDevice> {
    let dev = env.paths.sys(&format!("/sys/bus/pci/devices/{}", pci));
    let total_vfs = read_u32(&dev.join("sriov_totalvfs"))?;
    let num_vfs = read_u32(&dev.join("sriov_numvfs")).unwrap_or(0);

    let mut links: Vec<(u32, String)> = std::fs::read_dir(&dev)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let idx: u32 = e
                        .file_name()
                        .to_str()?
                        .strip_prefix("virtfn")?
                        .parse()
                        .ok()?;
                    let target = std::fs::read_link(e.path()).ok()?;
                    let addr = target.file_name()?.to_str()?.to_string();
                    Some((idx, addr))
                })
                .collect()
        })
        .unwrap_or_default();
    links.sort();

    Some(SriovDevice {
        pci: pci.to_string(),
        total_vfs,
        num_vfs,
        vfs: links.into_iter().map(|(_, addr)| addr).collect(),
    })
}

// ============================================================================
// Privileges and binaries
// ============================================================================

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Binaries each phase shells out to.
pub const fn required_binaries(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::Host => &["systemctl"],
        Phase::Tunnel => &["systemctl", "curl"],
        Phase::Client => &["ssh", "ssh-keygen"],
        Phase::Vm => &[
            "virsh",
            "virt-install",
            "qemu-img",
            "cloud-localds",
            "ssh",
            "ssh-keygen",
            "curl",
        ],
        Phase::Guest => &["virsh", "ssh"],
    }
}

/// Map binary names to the package that ships them.
fn package_for_binary(binary: &str, manager: Option<PackageManager>) -> &'static str {
    let apt = manager != Some(PackageManager::Pacman);
    match binary {
        "virsh" if apt => "libvirt-clients",
        "virsh" => "libvirt",
        "virt-install" if apt => "virtinst",
        "virt-install" => "virt-install",
        "qemu-img" if apt => "qemu-utils",
        "qemu-img" => "qemu-base",
        "cloud-localds" => "cloud-image-utils",
        "ssh" | "ssh-keygen" if apt => "openssh-client",
        "ssh" | "ssh-keygen" => "openssh",
        "systemctl" => "systemd",
        "git" => "git",
        "curl" => "curl",
        _ => "unknown",
    }
}

pub fn missing_binaries(env: &Env, binaries: &[&str]) -> Vec<String> {
    binaries
        .iter()
        .filter(|b| !env.succeeds(&which(b)))
        .map(|b| b.to_string())
        .collect()
}

/// Fail with an install hint when a binary `phase` needs is missing.
/// Binaries phase 1 installs itself are not checked.
pub fn preflight(env: &Env, phase: Phase) -> anyhow::Result<()> {
    tracing::debug!(%phase, "running pre-flight checks");
    let missing = missing_binaries(env, required_binaries(phase));
    if missing.is_empty() {
        return Ok(());
    }
    let manager = detect_distro(env).and_then(|d| d.package_manager());
    let hints: Vec<String> = missing
        .iter()
        .map(|b| format!("{} (package {})", b, package_for_binary(b, manager)))
        .collect();
    anyhow::bail!(
        "missing required binaries: {}{}",
        hints.join(", "),
        if phase == Phase::Vm {
            "; run `labstrap phase1` first"
        } else {
            ""
        }
    )
}

// ============================================================================
// Aggregated facts
// ============================================================================

/// Snapshot of host facts, used by `check` and phase 1.
#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub distro: Option<Distro>,
    pub package_manager: Option<PackageManager>,
    pub cpu: CpuInfo,
    pub kvm: bool,
    pub iommu_active: bool,
    pub cmdline: String,
    pub grub_present: bool,
    pub sriov: Option<SriovDevice>,
}

impl HostFacts {
    pub fn detect(env: &Env, gpu_pci: &str) -> Self {
        let distro = detect_distro(env);
        let facts = Self {
            package_manager: distro.as_ref().and_then(Distro::package_manager),
            distro,
            cpu: detect_cpu(env),
            kvm: kvm_available(env),
            iommu_active: iommu_active(env),
            cmdline: proc_cmdline(env),
            grub_present: env.paths.sys(crate::tools::grub::GRUB_DEFAULTS).is_file(),
            sriov: sriov_device(env, gpu_pci),
        };
        tracing::info!(
            cpu = %facts.cpu.vendor,
            kvm = facts.kvm,
            iommu = facts.iommu_active,
            sriov = facts.sriov.is_some(),
            "host detection"
        );
        facts
    }
}
