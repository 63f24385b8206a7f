//! Phase 1: prepare the host for GPU-backed VMs.

use super::{announce, finish, load_state, with_snapshot_pair};
use crate::env::Env;
use crate::exec::{Cmd, is_dry_run};
use crate::host::{CpuVendor, DEFAULT_GPU_PCI, HostFacts, iommu_params, preflight, sriov_device};
use crate::kvconf::KvFile;
use crate::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use crate::tools::packages::{self, PackageManager};
use crate::tools::{dkms, grub, libvirt, systemd};
use anyhow::{Context, Result};

const DKMS_SRC_DIR: &str = "/var/lib/labstrap/i915-sriov-dkms";
const TMPFILES_PATH: &str = "/etc/tmpfiles.d/i915-sriov.conf";
const LIBVIRT_UNIT: &str = "libvirtd";
const LIBVIRT_GROUP: &str = "libvirt";
const DEFAULT_NETWORK: &str = "default";

/// `labstrap phase1` flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    pub skip_sriov: bool,
    /// Number of GPU virtual functions to create at boot
    pub vfs: u32,
    /// PCI address of the GPU physical function
    pub gpu: String,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            skip_sriov: false,
            vfs: 7,
            gpu: DEFAULT_GPU_PCI.to_string(),
        }
    }
}

pub struct HostCtx<'a> {
    env: &'a Env,
    opts: HostOptions,
    facts: HostFacts,
    manager: PackageManager,
    reboot_required: bool,
}

impl StepContext for HostCtx<'_> {
    fn env(&self) -> &Env {
        self.env
    }
}

impl HostCtx<'_> {
    /// SR-IOV steps only apply to Intel graphics.
    fn sriov_enabled(&self) -> bool {
        !self.opts.skip_sriov && self.facts.cpu.vendor == CpuVendor::Intel
    }

    fn kernel_params(&self) -> Vec<String> {
        let vfs = self.sriov_enabled().then_some(self.opts.vfs);
        iommu_params(self.facts.cpu.vendor, vfs)
    }

    /// Record the reboot request in `.state` right away so a later failing
    /// step cannot lose it.
    fn request_reboot(&mut self) -> Result<()> {
        self.reboot_required = true;
        let mut state = load_state(self.env)?;
        state.set_reboot_required(true)?;
        state.save()?;
        Ok(())
    }

    fn tmpfiles_line(&self) -> String {
        format!(
            "w /sys/bus/pci/devices/{}/sriov_numvfs - - - - {}\n",
            self.opts.gpu, self.opts.vfs
        )
    }
}

// ============================================================================
// Steps
// ============================================================================

struct InstallPackages;

impl<'a> Step<HostCtx<'a>> for InstallPackages {
    fn name(&self) -> &'static str {
        "packages"
    }

    fn description(&self) -> &'static str {
        "Install virtualization packages"
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        Ok(packages::missing(ctx.env, ctx.manager, ctx.manager.host_packages()).is_empty())
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        let missing = packages::missing(ctx.env, ctx.manager, ctx.manager.host_packages());
        println!("  installing: {}", missing.join(" "));
        packages::install(ctx.env, ctx.manager, &missing)?;
        Ok(StepStatus::Applied)
    }
}

struct IommuCmdline;

impl<'a> Step<HostCtx<'a>> for IommuCmdline {
    fn name(&self) -> &'static str {
        "iommu-cmdline"
    }

    fn description(&self) -> &'static str {
        "Enable IOMMU on the kernel command line"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        let params = ctx.kernel_params();
        // Without grub, a boot loader configured by hand counts as done
        // once the running kernel carries the parameters.
        let current = match grub::read_cmdline(ctx.env)? {
            Some((_, current)) => current,
            None => ctx.facts.cmdline.clone(),
        };
        Ok(grub::missing_params(&current, &params).is_empty())
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        let params = ctx.kernel_params();
        if !ctx.facts.grub_present {
            return Ok(StepStatus::Warned(format!(
                "{} not found; add `{}` to your boot loader's kernel command line",
                grub::GRUB_DEFAULTS,
                params.join(" ")
            )));
        }
        if grub::apply_params(ctx.env, &params)? {
            grub::regenerate(ctx.env)?;
            ctx.request_reboot()?;
        }
        Ok(StepStatus::Applied)
    }
}

struct SriovDkms;

impl<'a> Step<HostCtx<'a>> for SriovDkms {
    fn name(&self) -> &'static str {
        "sriov-dkms"
    }

    fn description(&self) -> &'static str {
        "Build the SR-IOV capable i915 driver with dkms"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        if !ctx.sriov_enabled() {
            return Ok(true);
        }
        let kernel = dkms::running_kernel(ctx.env);
        Ok(dkms::is_installed(
            ctx.env,
            dkms::I915_SRIOV_MODULE,
            kernel.as_deref(),
        ))
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        let src = ctx.env.paths.sys(DKMS_SRC_DIR);
        let dkms_conf = src.join("dkms.conf");
        if !dkms_conf.is_file() {
            ctx.env.run_ok(
                &Cmd::new("git")
                    .args(["clone", "--depth", "1", dkms::I915_SRIOV_REPO])
                    .arg(src.display().to_string())
                    .destructive()
                    .stream(),
            )?;
        }
        if is_dry_run() && !dkms_conf.is_file() {
            println!("  [dry-run] dkms add/install {}", dkms::I915_SRIOV_MODULE);
            return Ok(StepStatus::Applied);
        }

        let conf = KvFile::load(&dkms_conf)
            .with_context(|| format!("failed to read {}", dkms_conf.display()))?;
        let module = conf
            .get("PACKAGE_NAME")
            .unwrap_or(dkms::I915_SRIOV_MODULE)
            .to_string();
        let Some(version) = conf.get("PACKAGE_VERSION").filter(|v| !v.is_empty()) else {
            anyhow::bail!("{} has no PACKAGE_VERSION", dkms_conf.display());
        };
        dkms::add_and_install(ctx.env, &src.display().to_string(), &module, version)?;
        ctx.request_reboot()?;
        Ok(StepStatus::Applied)
    }
}

struct SriovVfs;

impl<'a> Step<HostCtx<'a>> for SriovVfs {
    fn name(&self) -> &'static str {
        "sriov-vfs"
    }

    fn description(&self) -> &'static str {
        "Create GPU virtual functions at boot"
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        if !ctx.sriov_enabled() {
            return Ok(true);
        }
        Ok(ctx.env.read_sys(TMPFILES_PATH).as_deref() == Some(ctx.tmpfiles_line().as_str()))
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        let gpu = &ctx.opts.gpu;
        let Some(dev) = sriov_device(ctx.env, gpu) else {
            return Ok(StepStatus::Warned(format!(
                "{} reports no SR-IOV capability; reboot into the new driver and run phase1 again",
                gpu
            )));
        };
        if ctx.opts.vfs > dev.total_vfs {
            anyhow::bail!(
                "{} supports at most {} virtual functions, {} requested",
                gpu,
                dev.total_vfs,
                ctx.opts.vfs
            );
        }
        let path = ctx.env.paths.sys(TMPFILES_PATH);
        ctx.env.write_file(&path, &ctx.tmpfiles_line())?;

        if dev.num_vfs == 0 {
            let create = Cmd::new("systemd-tmpfiles")
                .args(["--create", TMPFILES_PATH])
                .destructive();
            if !ctx.env.succeeds(&create) {
                tracing::warn!("could not create virtual functions now; they appear after reboot");
            }
        }
        Ok(StepStatus::Applied)
    }
}

struct Libvirtd;

impl<'a> Step<HostCtx<'a>> for Libvirtd {
    fn name(&self) -> &'static str {
        "libvirtd"
    }

    fn description(&self) -> &'static str {
        "Enable and start libvirtd"
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        Ok(systemd::is_enabled(ctx.env, LIBVIRT_UNIT) && systemd::is_active(ctx.env, LIBVIRT_UNIT))
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        systemd::enable_now(ctx.env, LIBVIRT_UNIT)?;
        Ok(StepStatus::Applied)
    }
}

struct LibvirtGroup;

impl LibvirtGroup {
    fn user<'e>(ctx: &HostCtx<'e>) -> Option<&'e str> {
        ctx.env.operator.as_deref().filter(|u| *u != "root")
    }
}

impl<'a> Step<HostCtx<'a>> for LibvirtGroup {
    fn name(&self) -> &'static str {
        "libvirt-group"
    }

    fn description(&self) -> &'static str {
        "Add the operator to the libvirt group"
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        Ok(match Self::user(ctx) {
            Some(user) => systemd::user_in_group(ctx.env, user, LIBVIRT_GROUP),
            None => true,
        })
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        if let Some(user) = Self::user(ctx) {
            systemd::add_user_to_group(ctx.env, user, LIBVIRT_GROUP)?;
            println!("  {} must log in again for the group change to apply", user);
        }
        Ok(StepStatus::Applied)
    }
}

struct DefaultNetwork;

impl<'a> Step<HostCtx<'a>> for DefaultNetwork {
    fn name(&self) -> &'static str {
        "default-network"
    }

    fn description(&self) -> &'static str {
        "Activate the libvirt default network"
    }

    fn is_done(&self, ctx: &mut HostCtx<'a>) -> Result<bool> {
        Ok(libvirt::net_info(ctx.env, DEFAULT_NETWORK).is_some_and(|n| n.active && n.autostart))
    }

    fn apply(&self, ctx: &mut HostCtx<'a>) -> Result<StepStatus> {
        let Some(info) = libvirt::net_info(ctx.env, DEFAULT_NETWORK) else {
            return Ok(StepStatus::Warned(format!(
                "libvirt network '{}' is not defined; define it with `virsh net-define`",
                DEFAULT_NETWORK
            )));
        };
        if !info.active {
            libvirt::net_start(ctx.env, DEFAULT_NETWORK)?;
        }
        if !info.autostart {
            libvirt::net_autostart(ctx.env, DEFAULT_NETWORK)?;
        }
        Ok(StepStatus::Applied)
    }
}

fn pipeline<'a>() -> Pipeline<HostCtx<'a>> {
    Pipeline::new(Phase::Host)
        .step(InstallPackages)
        .step(IommuCmdline)
        .step(SriovDkms)
        .step(SriovVfs)
        .step(Libvirtd)
        .step(LibvirtGroup)
        .step(DefaultNetwork)
}

// ============================================================================
// Entry point
// ============================================================================

/// `labstrap phase1`
pub fn run(env: &Env, opts: HostOptions) -> Result<()> {
    preflight(env, Phase::Host)?;
    announce(Phase::Host);

    let facts = HostFacts::detect(env, &opts.gpu);
    let manager = facts.package_manager.ok_or_else(|| {
        let name = facts
            .distro
            .as_ref()
            .map_or("unknown distribution", |d| d.pretty_name.as_str());
        anyhow::anyhow!("{} is not supported (need apt or pacman)", name)
    })?;
    if !facts.cpu.virtualization {
        println!("⚠ CPU virtualization (vmx/svm) not reported; check firmware settings");
    }
    if opts.skip_sriov {
        println!("  SR-IOV steps disabled (--skip-sriov)");
    } else if facts.cpu.vendor != CpuVendor::Intel {
        println!("  {} CPU: SR-IOV GPU steps do not apply", facts.cpu.vendor);
    }

    let mut ctx = HostCtx {
        env,
        opts,
        facts,
        manager,
        reboot_required: false,
    };
    let report = with_snapshot_pair(env, "labstrap phase1", || pipeline().run(&mut ctx))?;

    // The running kernel already has every parameter: any earlier reboot
    // request has been honoured.
    let booted = grub::missing_params(&ctx.facts.cmdline, &ctx.kernel_params()).is_empty();
    let mut state = load_state(env)?;
    if ctx.reboot_required {
        state.set_reboot_required(true)?;
    } else if booted {
        state.set_reboot_required(false)?;
    }
    state.save()?;

    finish(env, Phase::Host, &report)?;
    if ctx.reboot_required || state.reboot_required() {
        println!();
        println!("↻ Reboot required for the kernel command line and GPU driver to take effect.");
        println!("  Then run `labstrap phase1` again to create the virtual functions.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, ScriptedPrompter, test_env, write_sys};

    const UBUNTU: &str = "ID=ubuntu\nID_LIKE=debian\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n";
    const INTEL: &str = "processor\t: 0\nvendor_id\t: GenuineIntel\nflags\t\t: fpu vmx\n";
    const FULL_CMDLINE: &str = "quiet splash intel_iommu=on iommu=pt i915.enable_guc=3 i915.max_vfs=7";

    /// A host where every step is already done.
    fn configured_host() -> FakeExec {
        FakeExec::new()
            .ok("which", "/usr/bin/x")
            .ok("dpkg-query", "install ok installed")
            .ok("uname -r", "6.8.0-49-generic\n")
            .ok(
                "dkms status",
                "i915-sriov-dkms/2025.01.22, 6.8.0-49-generic, x86_64: installed\n",
            )
            .ok("systemctl is-enabled", "")
            .ok("systemctl is-active", "")
            .ok("id -nG lab", "lab libvirt\n")
            .ok("virsh net-info default", "Name: default\nActive: yes\nAutostart: yes\n")
    }

    fn seed_host(env: &Env, grub_cmdline: &str) {
        write_sys(env, "/etc/os-release", UBUNTU);
        write_sys(env, "/proc/cpuinfo", INTEL);
        write_sys(env, "/proc/cmdline", FULL_CMDLINE);
        write_sys(
            env,
            "/etc/default/grub",
            &format!("GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"{}\"\n", grub_cmdline),
        );
        write_sys(
            env,
            TMPFILES_PATH,
            "w /sys/bus/pci/devices/0000:00:02.0/sriov_numvfs - - - - 7\n",
        );
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let exec = configured_host();
        let (env, _dir) = test_env(exec.clone());
        seed_host(&env, FULL_CMDLINE);

        run(&env, HostOptions::default()).unwrap();

        assert!(
            exec.commands().iter().all(|c| !c.is_destructive()),
            "unexpected changes: {:?}",
            exec.calls()
        );
        let state = load_state(&env).unwrap();
        assert!(state.is_done(Phase::Host));
        assert!(!state.reboot_required());
    }

    #[test]
    fn test_cmdline_update_requests_reboot() {
        let exec = configured_host()
            .fail("which update-grub")
            .ok("grub-mkconfig", "");
        let (mut env, _dir) = test_env(exec.clone());
        env.prompt = Box::new(ScriptedPrompter::with_confirms(&[true]));
        seed_host(&env, "quiet splash");

        run(&env, HostOptions::default()).unwrap();

        assert!(exec.ran("grub-mkconfig -o /boot/grub/grub.cfg"));
        let grub = std::fs::read_to_string(env.paths.sys("/etc/default/grub")).unwrap();
        assert!(grub.contains(&format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{}\"", FULL_CMDLINE)));
        assert!(grub.starts_with("GRUB_DEFAULT=0\n"));
        assert!(load_state(&env).unwrap().reboot_required());
    }

    #[test]
    fn test_stock_debian_grub_defaults() {
        let exec = configured_host().ok("update-grub", "");
        let (mut env, _dir) = test_env(exec.clone());
        env.assume_yes = true;
        seed_host(&env, FULL_CMDLINE);
        write_sys(
            &env,
            "/etc/default/grub",
            "# If you change this file, run 'update-grub' afterwards to update\n\
             # /boot/grub/grub.cfg.\n\
             \n\
             GRUB_DEFAULT=0\n\
             GRUB_TIMEOUT_STYLE=hidden\n\
             GRUB_TIMEOUT=0\n\
             GRUB_DISTRIBUTOR=`lsb_release -i -s 2> /dev/null || echo Debian`\n\
             GRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\n\
             GRUB_CMDLINE_LINUX=\"\"\n",
        );

        run(&env, HostOptions::default()).unwrap();

        assert!(exec.ran("update-grub"));
        let grub = std::fs::read_to_string(env.paths.sys("/etc/default/grub")).unwrap();
        assert!(grub.contains("GRUB_DISTRIBUTOR=`lsb_release -i -s 2> /dev/null || echo Debian`\n"));
        assert!(grub.contains(&format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{}\"", FULL_CMDLINE)));
        assert!(load_state(&env).unwrap().is_done(Phase::Host));
    }

    #[test]
    fn test_reboot_request_survives_later_failure() {
        let exec = configured_host()
            .ok("update-grub", "")
            .fail("systemctl is-enabled")
            .fail("systemctl enable --now libvirtd");
        let (mut env, _dir) = test_env(exec.clone());
        env.assume_yes = true;
        seed_host(&env, "quiet splash");

        assert!(run(&env, HostOptions::default()).is_err());
        assert!(exec.ran("update-grub"));
        let state = load_state(&env).unwrap();
        assert!(state.reboot_required());
        assert!(!state.is_done(Phase::Host));
    }

    #[test]
    fn test_declining_cmdline_change_stops_phase() {
        let exec = configured_host();
        let (mut env, _dir) = test_env(exec.clone());
        env.prompt = Box::new(ScriptedPrompter::with_confirms(&[false]));
        seed_host(&env, "quiet");

        let err = run(&env, HostOptions::default()).unwrap_err();
        assert!(err.to_string().contains("aborted by operator"));
        assert!(!load_state(&env).unwrap().is_done(Phase::Host));
        assert!(!exec.ran("virsh net-info"), "later steps must not run");
    }

    #[test]
    fn test_skip_sriov_leaves_driver_alone() {
        let exec = configured_host().fail("dkms status");
        let (env, _dir) = test_env(exec.clone());
        seed_host(&env, "quiet intel_iommu=on iommu=pt");
        std::fs::remove_file(env.paths.sys(TMPFILES_PATH)).unwrap();

        let opts = HostOptions {
            skip_sriov: true,
            ..HostOptions::default()
        };
        run(&env, opts).unwrap();
        assert!(!exec.ran("dkms"));
        assert!(!env.paths.sys(TMPFILES_PATH).exists());
    }

    #[test]
    fn test_vfs_written_when_device_supports_them() {
        let exec = configured_host().fail("systemd-tmpfiles");
        let (env, _dir) = test_env(exec.clone());
        seed_host(&env, FULL_CMDLINE);
        std::fs::remove_file(env.paths.sys(TMPFILES_PATH)).unwrap();
        write_sys(&env, "/sys/bus/pci/devices/0000:00:02.0/sriov_totalvfs", "7\n");
        write_sys(&env, "/sys/bus/pci/devices/0000:00:02.0/sriov_numvfs", "0\n");

        run(&env, HostOptions::default()).unwrap();
        assert_eq!(
            std::fs::read_to_string(env.paths.sys(TMPFILES_PATH)).unwrap(),
            "w /sys/bus/pci/devices/0000:00:02.0/sriov_numvfs - - - - 7\n"
        );
        assert!(exec.ran("systemd-tmpfiles --create /etc/tmpfiles.d/i915-sriov.conf"));
    }

    #[test]
    fn test_too_many_vfs_is_hard_stop() {
        let (env, _dir) = test_env(configured_host());
        seed_host(&env, "quiet intel_iommu=on iommu=pt i915.enable_guc=3 i915.max_vfs=9");
        std::fs::remove_file(env.paths.sys(TMPFILES_PATH)).unwrap();
        write_sys(&env, "/sys/bus/pci/devices/0000:00:02.0/sriov_totalvfs", "7\n");

        let opts = HostOptions {
            vfs: 9,
            ..HostOptions::default()
        };
        let err = run(&env, opts).unwrap_err();
        assert!(format!("{:#}", err).contains("at most 7 virtual functions"));
    }

    #[test]
    fn test_missing_grub_accepts_running_cmdline() {
        let (env, _dir) = test_env(configured_host());
        seed_host(&env, FULL_CMDLINE);
        std::fs::remove_file(env.paths.sys("/etc/default/grub")).unwrap();

        run(&env, HostOptions::default()).unwrap();
        assert!(load_state(&env).unwrap().is_done(Phase::Host));
    }

    #[test]
    fn test_missing_grub_warns_and_completes() {
        let exec = configured_host();
        let (mut env, _dir) = test_env(exec.clone());
        env.assume_yes = true;
        seed_host(&env, FULL_CMDLINE);
        write_sys(&env, "/proc/cmdline", "quiet");
        std::fs::remove_file(env.paths.sys("/etc/default/grub")).unwrap();

        run(&env, HostOptions::default()).unwrap();
        assert!(!exec.ran("grub-mkconfig"));
        let state = load_state(&env).unwrap();
        assert!(state.is_done(Phase::Host));
        assert!(!state.reboot_required());
    }

    #[test]
    fn test_unsupported_distribution() {
        let (env, _dir) = test_env(configured_host());
        seed_host(&env, FULL_CMDLINE);
        write_sys(&env, "/etc/os-release", "ID=fedora\nPRETTY_NAME=\"Fedora 40\"\n");
        let err = run(&env, HostOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "Fedora 40 is not supported (need apt or pacman)");
    }

    #[test]
    fn test_operator_is_added_to_group() {
        let exec = configured_host()
            .ok("id -nG lab", "lab wheel\n")
            .ok("usermod", "");
        let (env, _dir) = test_env(exec.clone());
        seed_host(&env, FULL_CMDLINE);
        run(&env, HostOptions::default()).unwrap();
        assert!(exec.ran("usermod -aG libvirt lab"));
    }
}
