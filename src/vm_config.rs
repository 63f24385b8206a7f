//! VM configuration records under `generated-vm/<name>.conf`.
//!
//! Records are plain key-value files so they can be edited by hand:
//!
//! ```text
//! VM_NAME="dev"
//! VM_VCPUS="4"
//! VM_RAM_MB="8192"
//! VM_IP="192.168.122.50"
//! ```
//!
//! Saving patches the existing file, so comments and keys this tool does not
//! know about are kept.

use crate::env::Env;
use crate::error::{LabError, Result};
use crate::exec::is_dry_run;
use crate::kvconf::KvFile;
use crate::platform::Platform;
use crate::state::StateFile;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img";
const IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// One VM's settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    pub vcpus: u32,
    pub ram_mb: u32,
    pub disk_path: PathBuf,
    pub disk_size_gb: u32,
    /// Static address; `None` means DHCP (the address is discovered after boot).
    pub ip: Option<Ipv4Addr>,
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    /// libvirt network name
    pub network: String,
    /// Login user created by cloud-init
    pub user: String,
    pub os_variant: String,
    pub image_url: String,
    /// Public hostname routed to the guest's tunnel
    pub tunnel_hostname: Option<String>,
    /// SR-IOV virtual function passed through, `DDDD:BB:DD.F`
    pub gpu_vf: Option<String>,
    pub platform: Platform,
}

impl VmConfig {
    /// Defaults for a new VM called `name`.
    pub fn default_for(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vcpus: 4,
            ram_mb: 8192,
            disk_path: Path::new(IMAGE_DIR).join(format!("{}.qcow2", name)),
            disk_size_gb: 64,
            ip: None,
            prefix: 24,
            gateway: None,
            dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
            network: "default".to_string(),
            user: "ubuntu".to_string(),
            os_variant: "ubuntu24.04".to_string(),
            image_url: DEFAULT_IMAGE_URL.to_string(),
            tunnel_hostname: None,
            gpu_vf: None,
            platform: Platform::None,
        }
    }

    /// Read a record. `fallback_name` (the file stem) is used when
    /// `VM_NAME` is absent; missing keys take their defaults.
    pub fn from_kv(file: &KvFile, fallback_name: &str) -> Result<Self> {
        let name = file.get("VM_NAME").unwrap_or(fallback_name);
        let mut cfg = Self::default_for(name);
        let text = |key: &str| file.get(key).map(str::trim).filter(|v| !v.is_empty());

        if let Some(v) = text("VM_VCPUS") {
            cfg.vcpus = parse_field("VM_VCPUS", v)?;
        }
        if let Some(v) = text("VM_RAM_MB") {
            cfg.ram_mb = parse_field("VM_RAM_MB", v)?;
        }
        if let Some(v) = text("VM_DISK_PATH") {
            cfg.disk_path = PathBuf::from(v);
        }
        if let Some(v) = text("VM_DISK_SIZE_GB") {
            cfg.disk_size_gb = parse_field("VM_DISK_SIZE_GB", v)?;
        }
        cfg.ip = text("VM_IP").map(|v| parse_field("VM_IP", v)).transpose()?;
        if let Some(v) = text("VM_PREFIX") {
            cfg.prefix = parse_field("VM_PREFIX", v)?;
        }
        cfg.gateway = text("VM_GATEWAY")
            .map(|v| parse_field("VM_GATEWAY", v))
            .transpose()?;
        if let Some(v) = text("VM_DNS") {
            cfg.dns = v
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| parse_field("VM_DNS", s))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = text("VM_NETWORK") {
            cfg.network = v.to_string();
        }
        if let Some(v) = text("VM_USER") {
            cfg.user = v.to_string();
        }
        if let Some(v) = text("VM_OS_VARIANT") {
            cfg.os_variant = v.to_string();
        }
        if let Some(v) = text("VM_IMAGE_URL") {
            cfg.image_url = v.to_string();
        }
        cfg.tunnel_hostname = text("TUNNEL_HOSTNAME").map(str::to_string);
        cfg.gpu_vf = text("GPU_VF").map(str::to_string);
        if let Some(v) = text("PLATFORM") {
            cfg.platform = parse_field("PLATFORM", v)?;
        }
        Ok(cfg)
    }

    /// Key/value pairs as written to disk. Optional fields that are unset
    /// map to an empty value.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            ("VM_NAME", self.name.clone()),
            ("VM_VCPUS", self.vcpus.to_string()),
            ("VM_RAM_MB", self.ram_mb.to_string()),
            ("VM_DISK_PATH", self.disk_path.display().to_string()),
            ("VM_DISK_SIZE_GB", self.disk_size_gb.to_string()),
            ("VM_IP", self.ip.map(|ip| ip.to_string()).unwrap_or_default()),
            ("VM_PREFIX", self.prefix.to_string()),
            (
                "VM_GATEWAY",
                self.gateway.map(|g| g.to_string()).unwrap_or_default(),
            ),
            (
                "VM_DNS",
                self.dns
                    .iter()
                    .map(Ipv4Addr::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("VM_NETWORK", self.network.clone()),
            ("VM_USER", self.user.clone()),
            ("VM_OS_VARIANT", self.os_variant.clone()),
            ("VM_IMAGE_URL", self.image_url.clone()),
            ("TUNNEL_HOSTNAME", opt(&self.tunnel_hostname)),
            ("GPU_VF", opt(&self.gpu_vf)),
            ("PLATFORM", self.platform.to_string()),
        ]
    }

    /// Address and gateway when the guest should use a static address.
    /// An address without gateway (discovered over DHCP and persisted
    /// afterwards) keeps the guest on DHCP.
    pub fn static_network(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        Some((self.ip?, self.gateway?))
    }

    /// Every problem with the record, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();

        if let Err(msg) = check_vm_name(&self.name) {
            out.push(msg);
        }
        if !(1..=256).contains(&self.vcpus) {
            out.push(format!("VM_VCPUS must be 1-256, got {}", self.vcpus));
        }
        if self.ram_mb < 1024 {
            out.push(format!("VM_RAM_MB must be at least 1024, got {}", self.ram_mb));
        }
        if self.disk_size_gb < 10 {
            out.push(format!(
                "VM_DISK_SIZE_GB must be at least 10, got {}",
                self.disk_size_gb
            ));
        }
        if !self.disk_path.is_absolute() {
            out.push(format!(
                "VM_DISK_PATH must be absolute, got '{}'",
                self.disk_path.display()
            ));
        }
        if !(1..=32).contains(&self.prefix) {
            out.push(format!("VM_PREFIX must be 1-32, got {}", self.prefix));
        }
        match (self.ip, self.gateway) {
            (Some(ip), Some(gw)) if (1..=32).contains(&self.prefix) => {
                if !same_subnet(ip, gw, self.prefix) {
                    out.push(format!(
                        "VM_GATEWAY {} is not in {}/{}",
                        gw, ip, self.prefix
                    ));
                } else if ip == gw {
                    out.push("VM_GATEWAY must differ from VM_IP".to_string());
                }
            }
            _ => {}
        }
        if self.static_network().is_some() && self.dns.is_empty() {
            out.push("VM_DNS is required with a static address".to_string());
        }
        if self.network.trim().is_empty() {
            out.push("VM_NETWORK must not be empty".to_string());
        }
        if self.user.trim().is_empty() {
            out.push("VM_USER must not be empty".to_string());
        }
        if let Some(host) = &self.tunnel_hostname {
            if let Err(msg) = check_hostname(host) {
                out.push(format!("TUNNEL_HOSTNAME {}", msg));
            }
        }
        if let Some(vf) = &self.gpu_vf {
            if !is_pci_address(vf) {
                out.push(format!("GPU_VF must look like 0000:00:02.1, got '{}'", vf));
            }
        }
        out
    }

    /// # Errors
    ///
    /// [`LabError::Validation`] listing every problem.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LabError::validation(format!(
                "VM config '{}': {}",
                self.name,
                problems.join("; ")
            )))
        }
    }
}

fn parse_field<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| LabError::validation(format!("{} has an invalid value '{}'", key, value)))
}

/// 2-63 characters, starts with a letter, letters/digits/hyphens only.
pub fn check_vm_name(name: &str) -> std::result::Result<(), String> {
    if !(2..=63).contains(&name.len()) {
        return Err(format!("VM name '{}' must be 2-63 characters long", name));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(format!("VM name '{}' must start with a letter", name));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(format!(
            "VM name '{}' can only contain letters, digits and hyphens",
            name
        ));
    }
    Ok(())
}

/// A bare DNS name: has a dot, no scheme, no path.
pub fn check_hostname(host: &str) -> std::result::Result<(), String> {
    if host.contains("://") {
        return Err(format!("'{}' must not include a scheme", host));
    }
    if host.contains('/') || host.contains(char::is_whitespace) {
        return Err(format!("'{}' must be a bare hostname", host));
    }
    if !host.contains('.') || host.starts_with('.') || host.ends_with('.') {
        return Err(format!("'{}' must be a fully qualified name", host));
    }
    Ok(())
}

/// `DDDD:BB:DD.F` with hex digits.
pub fn is_pci_address(addr: &str) -> bool {
    let hex = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_hexdigit());
    let Some((domain, rest)) = addr.split_once(':') else {
        return false;
    };
    let Some((bus, rest)) = rest.split_once(':') else {
        return false;
    };
    let Some((dev, func)) = rest.split_once('.') else {
        return false;
    };
    hex(domain, 4)
        && hex(bus, 2)
        && hex(dev, 2)
        && func.len() == 1
        && func.chars().all(|c| ('0'..='7').contains(&c))
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// The `generated-vm/` directory.
#[derive(Debug, Clone)]
pub struct VmConfigStore {
    dir: PathBuf,
}

impl VmConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.conf", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Record names (file stems of `*.conf`), sorted. A missing directory
    /// has no records.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load `<name>.conf`. The name must be a valid VM name and match the
    /// record's `VM_NAME`, since saving writes to the file named after it.
    pub fn load(&self, name: &str) -> Result<VmConfig> {
        check_vm_name(name).map_err(LabError::validation)?;
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(LabError::config(format!(
                "no VM config '{}' ({})",
                name,
                path.display()
            )));
        }
        let file = KvFile::load(&path)?;
        let cfg = VmConfig::from_kv(&file, name)?;
        if cfg.name != name {
            return Err(LabError::validation(format!(
                "{}: VM_NAME '{}' does not match the file name '{}'",
                path.display(),
                cfg.name,
                name
            )));
        }
        Ok(cfg)
    }

    /// Write the record, patching an existing file in place. A no-op under
    /// `--dry-run`.
    pub fn save(&self, cfg: &VmConfig) -> Result<PathBuf> {
        let path = self.path_for(&cfg.name);
        let mut file = if path.is_file() {
            KvFile::load(&path)?
        } else {
            KvFile::parse(&path, "# labstrap VM configuration\n")?
        };
        let mut changed = false;
        for (key, value) in cfg.to_pairs() {
            changed |= file.set(key, &value)?;
        }
        if !changed && path.is_file() {
            return Ok(path);
        }
        if is_dry_run() {
            println!("  [dry-run] write {}", path.display());
            return Ok(path);
        }
        file.save()?;
        tracing::info!(vm = %cfg.name, path = %path.display(), "saved VM config");
        Ok(path)
    }
}

/// How phase 2/3 should pick a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// `--config NAME`
    pub explicit: Option<String>,
    /// `--new`
    pub create: bool,
}

/// Pick the VM record to work on, creating one when there is none.
///
/// Order: `--config`, `--new`, `LAST_CONFIG` from state (if the record
/// still exists), the only record, a prompt among several, or a new record.
pub fn select(
    env: &Env,
    store: &VmConfigStore,
    state: &StateFile,
    selection: &Selection,
) -> anyhow::Result<VmConfig> {
    if let Some(name) = &selection.explicit {
        return Ok(store.load(name)?);
    }
    if selection.create {
        return create_interactive(env, store);
    }
    if let Some(last) = state.last_config() {
        if store.exists(last) {
            tracing::info!(vm = last, "using last config");
            return Ok(store.load(last)?);
        }
        tracing::warn!(vm = last, "LAST_CONFIG points at a missing record");
    }
    let names = store.list()?;
    match names.as_slice() {
        [] => create_interactive(env, store),
        [only] => Ok(store.load(only)?),
        _ => {
            let idx = env.prompt.select("Which VM?", &names)?;
            let name = names
                .get(idx)
                .ok_or_else(|| LabError::prompt("selection out of range"))?;
            Ok(store.load(name)?)
        }
    }
}

fn ask_number<T: FromStr + ToString>(env: &Env, msg: &str, default: T) -> anyhow::Result<T> {
    let answer = env.prompt.text(msg, Some(&default.to_string()))?;
    answer
        .trim()
        .parse()
        .map_err(|_| LabError::validation(format!("{}: '{}' is not a number", msg, answer)).into())
}

/// Ask for a new record's settings, validate and save it.
pub fn create_interactive(env: &Env, store: &VmConfigStore) -> anyhow::Result<VmConfig> {
    println!("Creating a new VM configuration");
    let name = env.prompt.text("VM name", Some("labvm"))?;
    check_vm_name(&name).map_err(LabError::validation)?;
    if store.exists(&name) {
        return Err(LabError::config(format!(
            "VM config '{}' already exists; use --config {}",
            name, name
        ))
        .into());
    }

    let mut cfg = VmConfig::default_for(&name);
    cfg.vcpus = ask_number(env, "vCPUs", cfg.vcpus)?;
    cfg.ram_mb = ask_number(env, "RAM (MB)", cfg.ram_mb)?;
    cfg.disk_size_gb = ask_number(env, "Disk size (GB)", cfg.disk_size_gb)?;

    let ip = env.prompt.text("Static IPv4 address (empty for DHCP)", Some(""))?;
    if !ip.trim().is_empty() {
        let addr: Ipv4Addr = parse_field("VM_IP", ip.trim())?;
        cfg.ip = Some(addr);
        let octets = addr.octets();
        let guess = Ipv4Addr::new(octets[0], octets[1], octets[2], 1).to_string();
        let gw = env.prompt.text("Gateway", Some(&guess))?;
        cfg.gateway = Some(parse_field("VM_GATEWAY", gw.trim())?);
    }

    let host = env
        .prompt
        .text("Tunnel hostname for the guest (empty to skip)", Some(""))?;
    cfg.tunnel_hostname = Some(host.trim().to_string()).filter(|h| !h.is_empty());

    cfg.validate()?;
    let path = store.save(&cfg)?;
    println!("✓ Saved {}", path.display());
    Ok(cfg)
}
