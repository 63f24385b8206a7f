//! Phase 3: tunnel and container platform inside the VM, over SSH.

use super::vm::{ssh_target, vm_address};
use super::{announce, check_prerequisites, finish, load_state};
use crate::env::Env;
use crate::exec::is_dry_run;
use crate::host::preflight;
use crate::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use crate::platform::Platform;
use crate::poll::{PollPolicy, poll_until};
use crate::tools::cloudflared;
use crate::tools::libvirt;
use crate::tools::ssh::{self, SshTarget, shell_quote};
use crate::vm_config::{self, Selection, VmConfig, VmConfigStore};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// libvirt snapshot taken before anything changes in the guest.
pub const SNAPSHOT_NAME: &str = "labstrap-pre-phase3";

/// `labstrap phase3` flags.
#[derive(Debug, Clone, Default)]
pub struct GuestOptions {
    pub selection: Selection,
    pub platform: Option<Platform>,
    /// File holding the Cloudflare tunnel token
    pub token_file: Option<PathBuf>,
}

pub struct GuestCtx<'a> {
    env: &'a Env,
    cfg: VmConfig,
    platform: Platform,
    token_file: Option<PathBuf>,
    target: Option<SshTarget>,
}

impl StepContext for GuestCtx<'_> {
    fn env(&self) -> &Env {
        self.env
    }
}

impl GuestCtx<'_> {
    fn target(&self) -> Result<&SshTarget> {
        self.target
            .as_ref()
            .with_context(|| format!("VM '{}' has no known address", self.cfg.name))
    }

    fn remote_ok(&self, command: &str) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| self.env.succeeds(&t.remote_cmd(command)))
    }

    fn token(&self) -> Result<String> {
        match &self.token_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read token file {}", path.display()))?;
                Ok(text.trim().to_string())
            }
            None => Ok(self
                .env
                .prompt
                .text("Cloudflare tunnel token for the VM (empty to skip)", Some(""))?
                .trim()
                .to_string()),
        }
    }
}

/// Installs cloudflared from the release .deb when missing, then registers
/// the token-based service.
fn tunnel_script(token: &str) -> String {
    format!(
        "set -eu\n\
         if ! command -v cloudflared >/dev/null 2>&1; then\n\
         \x20 arch=$(dpkg --print-architecture)\n\
         \x20 curl -fsSL -o /tmp/cloudflared.deb \"{}\"\n\
         \x20 dpkg -i /tmp/cloudflared.deb\n\
         fi\n\
         cloudflared service install {}\n",
        cloudflared::deb_url("${arch}"),
        shell_quote(token)
    )
}

// ============================================================================
// Steps
// ============================================================================

struct Reachable;

impl<'a> Step<GuestCtx<'a>> for Reachable {
    fn name(&self) -> &'static str {
        "reachable"
    }

    fn description(&self) -> &'static str {
        "Reach the VM over SSH"
    }

    fn is_done(&self, ctx: &mut GuestCtx<'a>) -> Result<bool> {
        ctx.target = vm_address(ctx.env, &ctx.cfg).map(|ip| ssh_target(ctx.env, &ctx.cfg, ip));
        Ok(ctx
            .target
            .as_ref()
            .is_some_and(|t| ssh::probe(ctx.env, t)))
    }

    fn apply(&self, ctx: &mut GuestCtx<'a>) -> Result<StepStatus> {
        let found = {
            let ctx = &*ctx;
            poll_until(PollPolicy::SSH_QUICK, ctx.env.sleep, |_| {
                let ip = vm_address(ctx.env, &ctx.cfg)?;
                let target = ssh_target(ctx.env, &ctx.cfg, ip);
                ssh::probe(ctx.env, &target).then_some(target)
            })
        };
        match found {
            Some(target) => {
                ctx.target = Some(target);
                Ok(StepStatus::Applied)
            }
            None => anyhow::bail!(
                "VM '{}' is not reachable over SSH (domain is {}); run `labstrap phase2` to start it",
                ctx.cfg.name,
                libvirt::domain_state(ctx.env, &ctx.cfg.name)
            ),
        }
    }
}

struct Snapshot;

impl<'a> Step<GuestCtx<'a>> for Snapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn description(&self) -> &'static str {
        "Snapshot the VM before changing it"
    }

    fn is_done(&self, ctx: &mut GuestCtx<'a>) -> Result<bool> {
        Ok(libvirt::snapshot_names(ctx.env, &ctx.cfg.name)
            .iter()
            .any(|n| n == SNAPSHOT_NAME))
    }

    fn apply(&self, ctx: &mut GuestCtx<'a>) -> Result<StepStatus> {
        if ctx.cfg.gpu_vf.is_some() {
            return Ok(StepStatus::Warned(
                "libvirt cannot snapshot a VM with a passed-through GPU; back up the disk manually"
                    .to_string(),
            ));
        }
        libvirt::snapshot_create(
            ctx.env,
            &ctx.cfg.name,
            SNAPSHOT_NAME,
            "before labstrap phase3",
        )?;
        Ok(StepStatus::Applied)
    }
}

struct Tunnel;

impl<'a> Step<GuestCtx<'a>> for Tunnel {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn description(&self) -> &'static str {
        "Install the Cloudflare tunnel in the VM"
    }

    fn is_done(&self, ctx: &mut GuestCtx<'a>) -> Result<bool> {
        Ok(ctx.remote_ok("systemctl is-active --quiet cloudflared"))
    }

    fn apply(&self, ctx: &mut GuestCtx<'a>) -> Result<StepStatus> {
        let token = ctx.token()?;
        if token.is_empty() {
            return Ok(StepStatus::Warned(
                "no tunnel token; create one in the Cloudflare dashboard and re-run with --token-file"
                    .to_string(),
            ));
        }
        ctx.env.run_ok(&ctx.target()?.run_script_cmd(&tunnel_script(&token)))?;
        if let Some(host) = &ctx.cfg.tunnel_hostname {
            println!("  route {} to the VM in the tunnel's public hostnames", host);
        }
        Ok(StepStatus::Applied)
    }
}

struct InstallPlatform;

impl<'a> Step<GuestCtx<'a>> for InstallPlatform {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn description(&self) -> &'static str {
        "Install the container platform"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_done(&self, ctx: &mut GuestCtx<'a>) -> Result<bool> {
        Ok(match ctx.platform.installed_probe() {
            None => true,
            Some(probe) => ctx.remote_ok(probe),
        })
    }

    fn apply(&self, ctx: &mut GuestCtx<'a>) -> Result<StepStatus> {
        let Some(install) = ctx.platform.install_command() else {
            return Ok(StepStatus::Skipped);
        };
        let target = ctx.target()?;
        ctx.env
            .run_ok(&target.run_script_cmd(&format!("set -eu\n{}\n", install)))?;
        if let Some(port) = ctx.platform.web_port() {
            println!("  {} dashboard: http://{}:{}", ctx.platform, target.host, port);
        }
        Ok(StepStatus::Applied)
    }
}

/// Platform from the flag, else the record, else ask.
fn choose_platform(env: &Env, cfg: &VmConfig, flag: Option<Platform>) -> Result<Platform> {
    if let Some(p) = flag {
        return Ok(p);
    }
    if cfg.platform != Platform::None {
        return Ok(cfg.platform);
    }
    let all = Platform::all();
    let labels: Vec<String> = all
        .iter()
        .map(|p| format!("{:<8} {}", p.to_string(), p.description()))
        .collect();
    let idx = env.prompt.select("Container platform", &labels)?;
    Ok(all.get(idx).copied().unwrap_or_default())
}

/// `labstrap phase3`
pub fn run(env: &Env, opts: GuestOptions) -> Result<()> {
    preflight(env, Phase::Guest)?;
    announce(Phase::Guest);
    let state = load_state(env)?;
    check_prerequisites(env, &state, Phase::Guest)?;

    let store = VmConfigStore::new(env.paths.vm_dir());
    let cfg = vm_config::select(env, &store, &state, &opts.selection)?;
    cfg.validate()?;
    let platform = choose_platform(env, &cfg, opts.platform)?;
    println!("  VM '{}', platform {}", cfg.name, platform);

    let mut ctx = GuestCtx {
        env,
        cfg,
        platform,
        token_file: opts.token_file,
        target: None,
    };
    let report = Pipeline::new(Phase::Guest)
        .step(Reachable)
        .step(Snapshot)
        .step(Tunnel)
        .step(InstallPlatform)
        .run(&mut ctx)?;

    let mut cfg = ctx.cfg;
    if cfg.platform != platform {
        cfg.platform = platform;
        if is_dry_run() {
            println!("  [dry-run] would record PLATFORM={} for {}", platform, cfg.name);
        } else {
            store.save(&cfg)?;
        }
    }
    finish(env, Phase::Guest, &report)?;
    Ok(())
}
