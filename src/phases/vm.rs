//! Phase 2: create the VM and push the second-stage configuration.
//!
//! ```text
//! select-config → base-image → ssh-key → disk → seed → domain
//!               → wait-ssh (5 s × 180, then ask for the address)
//!               → stage2 → persist
//! ```

use super::{announce, check_prerequisites, finish, load_state};
use crate::cloudinit::render_seed;
use crate::env::Env;
use crate::error::LabError;
use crate::exec::{Cmd, is_dry_run};
use crate::host::preflight;
use crate::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use crate::poll::{PollPolicy, poll_until};
use crate::stage2;
use crate::tools::ToolArgs;
use crate::tools::libvirt::{self, CloudLocaldsArgs, DomainState, QemuImgCreateArgs, VirtInstallArgs};
use crate::tools::ssh::{self, SshTarget};
use crate::vm_config::{self, Selection, VmConfig, VmConfigStore};
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Print a "still waiting" line every this many attempts.
const PROGRESS_EVERY: u32 = 12;

/// Dedicated key pair used to reach every VM.
pub fn key_path(env: &Env) -> PathBuf {
    env.paths.vm_dir().join("id_ed25519")
}

/// How to reach `cfg` at `ip`.
pub fn ssh_target(env: &Env, cfg: &VmConfig, ip: Ipv4Addr) -> SshTarget {
    SshTarget {
        user: cfg.user.clone(),
        host: ip.to_string(),
        identity: Some(key_path(env)),
        known_hosts: Some(env.paths.vm_work_dir(&cfg.name).join("known_hosts")),
    }
}

/// Configured address, else the DHCP lease libvirt knows about.
pub fn vm_address(env: &Env, cfg: &VmConfig) -> Option<Ipv4Addr> {
    cfg.ip.or_else(|| libvirt::domain_ip(env, &cfg.name))
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if !is_dry_run() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

pub struct VmCtx<'a> {
    env: &'a Env,
    cfg: VmConfig,
    store: VmConfigStore,
    ip: Option<Ipv4Addr>,
    domain: DomainState,
    /// The domain was defined during this run
    created: bool,
}

impl StepContext for VmCtx<'_> {
    fn env(&self) -> &Env {
        self.env
    }
}

impl VmCtx<'_> {
    fn image_dir(&self) -> PathBuf {
        let disk = self.disk();
        disk.parent().map(Path::to_path_buf).unwrap_or(disk)
    }

    fn disk(&self) -> PathBuf {
        self.env.paths.sys(&self.cfg.disk_path.display().to_string())
    }

    fn base_image(&self) -> PathBuf {
        let file = self
            .cfg
            .image_url
            .rsplit('/')
            .next()
            .filter(|f| !f.is_empty())
            .unwrap_or("base.img");
        self.image_dir().join(file)
    }

    fn seed_iso(&self) -> PathBuf {
        self.image_dir().join(format!("{}-seed.iso", self.cfg.name))
    }

    fn work_dir(&self) -> PathBuf {
        self.env.paths.vm_work_dir(&self.cfg.name)
    }

    fn target(&self) -> Option<SshTarget> {
        self.ip.map(|ip| ssh_target(self.env, &self.cfg, ip))
    }
}

// ============================================================================
// Steps
// ============================================================================

struct BaseImage;

impl<'a> Step<VmCtx<'a>> for BaseImage {
    fn name(&self) -> &'static str {
        "base-image"
    }

    fn description(&self) -> &'static str {
        "Download the cloud image"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        Ok(ctx.base_image().is_file())
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        let base = ctx.base_image();
        let partial = base.with_extension("part");
        ensure_dir(&ctx.image_dir())?;
        ctx.env.run_ok(
            &Cmd::new("curl")
                .args(["-fL", "--progress-bar", "-o"])
                .arg(partial.display().to_string())
                .arg(&ctx.cfg.image_url)
                .destructive()
                .stream(),
        )?;
        if is_dry_run() {
            return Ok(StepStatus::Applied);
        }
        // Only a complete download gets the final name.
        std::fs::rename(&partial, &base).with_context(|| {
            format!("download did not produce {}", partial.display())
        })?;
        Ok(StepStatus::Applied)
    }
}

struct SshKey;

impl<'a> Step<VmCtx<'a>> for SshKey {
    fn name(&self) -> &'static str {
        "ssh-key"
    }

    fn description(&self) -> &'static str {
        "Create the VM access key"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        Ok(key_path(ctx.env).is_file())
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        ensure_dir(&ctx.env.paths.vm_dir())?;
        ctx.env
            .run_ok(&ssh::keygen_cmd(&key_path(ctx.env), "labstrap-vm"))?;
        Ok(StepStatus::Applied)
    }
}

struct Disk;

impl<'a> Step<VmCtx<'a>> for Disk {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn description(&self) -> &'static str {
        "Create the VM disk on top of the cloud image"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        Ok(ctx.disk().is_file())
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        let args = QemuImgCreateArgs {
            backing: ctx.base_image(),
            disk: ctx.disk(),
            size_gb: ctx.cfg.disk_size_gb,
        };
        ctx.env.run_ok(&args.to_cmd())?;
        Ok(StepStatus::Applied)
    }
}

struct Seed;

impl<'a> Step<VmCtx<'a>> for Seed {
    fn name(&self) -> &'static str {
        "seed"
    }

    fn description(&self) -> &'static str {
        "Build the cloud-init seed image"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        // Only needed to define the domain.
        Ok(ctx.seed_iso().is_file() || libvirt::domain_exists(ctx.env, &ctx.cfg.name))
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        let pub_key = key_path(ctx.env).with_extension("pub");
        let key = match std::fs::read_to_string(&pub_key) {
            Ok(key) => key,
            Err(_) if is_dry_run() => String::from("ssh-ed25519 (generated on a real run)"),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", pub_key.display()));
            }
        };
        let seed = render_seed(&ctx.cfg, &[key])?;

        let dir = ctx.work_dir();
        ensure_dir(&dir)?;
        let args = CloudLocaldsArgs {
            output: ctx.seed_iso(),
            user_data: dir.join("user-data"),
            meta_data: dir.join("meta-data"),
            network_config: dir.join("network-config"),
        };
        ctx.env.write_file(&args.user_data, &seed.user_data)?;
        ctx.env.write_file(&args.meta_data, &seed.meta_data)?;
        ctx.env.write_file(&args.network_config, &seed.network_config)?;
        ctx.env.run_ok(&args.to_cmd())?;
        Ok(StepStatus::Applied)
    }
}

struct Domain;

impl<'a> Step<VmCtx<'a>> for Domain {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn description(&self) -> &'static str {
        "Define and start the VM"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        ctx.domain = libvirt::domain_state(ctx.env, &ctx.cfg.name);
        Ok(ctx.domain == DomainState::Running)
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        let name = &ctx.cfg.name;
        match &ctx.domain {
            DomainState::Missing => {
                let args = VirtInstallArgs::for_vm(&ctx.cfg, ctx.seed_iso());
                ctx.env.run_ok(&args.to_cmd().stream())?;
                ctx.created = true;
            }
            DomainState::ShutOff => libvirt::start(ctx.env, name)?,
            DomainState::Paused => libvirt::resume(ctx.env, name)?,
            DomainState::Running => {}
            other => {
                anyhow::bail!("domain '{}' is {}; fix it with virsh and re-run", name, other)
            }
        }
        Ok(StepStatus::Applied)
    }
}

struct WaitSsh;

impl WaitSsh {
    fn ask_address(ctx: &VmCtx<'_>) -> Result<Ipv4Addr> {
        println!(
            "  no SSH after {} s; check `virsh console {}`",
            PollPolicy::SSH_BOOT.max_wait().as_secs(),
            ctx.cfg.name
        );
        let answer = ctx
            .env
            .prompt
            .text("VM IP address (empty to abort)", Some(""))?;
        let answer = answer.trim();
        if answer.is_empty() {
            anyhow::bail!("VM '{}' did not become reachable over SSH", ctx.cfg.name);
        }
        let ip: Ipv4Addr = answer
            .parse()
            .map_err(|_| LabError::validation(format!("'{}' is not an IPv4 address", answer)))?;
        if !ssh::probe(ctx.env, &ssh_target(ctx.env, &ctx.cfg, ip)) {
            anyhow::bail!("no SSH on {} either", ip);
        }
        Ok(ip)
    }
}

impl<'a> Step<VmCtx<'a>> for WaitSsh {
    fn name(&self) -> &'static str {
        "wait-ssh"
    }

    fn description(&self) -> &'static str {
        "Wait for the VM to accept SSH"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        if ctx.created {
            return Ok(false);
        }
        ctx.ip = vm_address(ctx.env, &ctx.cfg);
        Ok(ctx
            .target()
            .is_some_and(|t| ssh::probe(ctx.env, &t)))
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        if is_dry_run() {
            println!("  [dry-run] would wait up to {} s for SSH", PollPolicy::SSH_BOOT.max_wait().as_secs());
            return Ok(StepStatus::Applied);
        }
        if ctx.created {
            // A rebuilt VM has a new host key.
            let known_hosts = ctx.work_dir().join("known_hosts");
            if known_hosts.exists() {
                std::fs::remove_file(&known_hosts)
                    .with_context(|| format!("failed to remove {}", known_hosts.display()))?;
            }
        }

        let policy = PollPolicy::SSH_BOOT;
        let found = {
            let ctx = &*ctx;
            poll_until(policy, ctx.env.sleep, |attempt| {
                if attempt % PROGRESS_EVERY == 0 {
                    println!("  still waiting ({}/{})", attempt, policy.attempts);
                }
                let ip = vm_address(ctx.env, &ctx.cfg)?;
                ssh::probe(ctx.env, &ssh_target(ctx.env, &ctx.cfg, ip)).then_some(ip)
            })
        };
        let ip = match found {
            Some(ip) => ip,
            None => Self::ask_address(ctx)?,
        };
        println!("  SSH is up on {}", ip);
        ctx.ip = Some(ip);
        Ok(StepStatus::Applied)
    }
}

struct Stage2;

impl<'a> Step<VmCtx<'a>> for Stage2 {
    fn name(&self) -> &'static str {
        "stage2"
    }

    fn description(&self) -> &'static str {
        "Run the second-stage setup inside the VM"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        Ok(ctx
            .target()
            .is_some_and(|t| ctx.env.succeeds(&t.test_file_cmd(stage2::MARKER))))
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        let script = stage2::render(&ctx.cfg)?;
        let Some(target) = ctx.target() else {
            if is_dry_run() {
                println!("  [dry-run] would push a {} byte script over SSH", script.len());
                return Ok(StepStatus::Applied);
            }
            anyhow::bail!("address of VM '{}' is unknown", ctx.cfg.name);
        };
        ctx.env.run_ok(&target.run_script_cmd(&script))?;
        Ok(StepStatus::Applied)
    }
}

struct Persist;

impl<'a> Step<VmCtx<'a>> for Persist {
    fn name(&self) -> &'static str {
        "persist"
    }

    fn description(&self) -> &'static str {
        "Record the VM address and selection"
    }

    fn is_done(&self, ctx: &mut VmCtx<'a>) -> Result<bool> {
        let state = load_state(ctx.env)?;
        Ok((ctx.ip.is_none() || ctx.cfg.ip == ctx.ip)
            && state.last_config() == Some(ctx.cfg.name.as_str()))
    }

    fn apply(&self, ctx: &mut VmCtx<'a>) -> Result<StepStatus> {
        if ctx.ip.is_some() && ctx.cfg.ip != ctx.ip {
            ctx.cfg.ip = ctx.ip;
            ctx.store.save(&ctx.cfg)?;
        }
        let mut state = load_state(ctx.env)?;
        state.set_last_config(&ctx.cfg.name)?;
        state.save()?;
        Ok(StepStatus::Applied)
    }
}

fn pipeline<'a>() -> Pipeline<VmCtx<'a>> {
    Pipeline::new(Phase::Vm)
        .step(BaseImage)
        .step(SshKey)
        .step(Disk)
        .step(Seed)
        .step(Domain)
        .step(WaitSsh)
        .step(Stage2)
        .step(Persist)
}

// ============================================================================
// Entry point
// ============================================================================

/// `labstrap phase2`
pub fn run(env: &Env, selection: Selection) -> Result<()> {
    preflight(env, Phase::Vm)?;
    announce(Phase::Vm);
    let state = load_state(env)?;
    check_prerequisites(env, &state, Phase::Vm)?;

    let store = VmConfigStore::new(env.paths.vm_dir());
    let cfg = vm_config::select(env, &store, &state, &selection)?;
    cfg.validate()?;
    println!(
        "  VM '{}': {} vCPU, {} MB RAM, {} GB disk, {}",
        cfg.name,
        cfg.vcpus,
        cfg.ram_mb,
        cfg.disk_size_gb,
        cfg.ip.map_or_else(|| "DHCP".to_string(), |ip| ip.to_string())
    );

    let mut ctx = VmCtx {
        env,
        cfg,
        store,
        ip: None,
        domain: DomainState::Missing,
        created: false,
    };
    let report = pipeline().run(&mut ctx)?;
    finish(env, Phase::Vm, &report)?;
    if let Some(target) = ctx.target() {
        println!(
            "  Connect with: ssh -i {} {}",
            key_path(env).display(),
            target.destination()
        );
    }
    Ok(())
}
