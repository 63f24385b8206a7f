//! Cloudflare tunnel on the host: `labstrap cloudflared setup|add-port|list`.

use super::{announce, finish, load_state};
use crate::env::Env;
use crate::error::LabError;
use crate::exec::Cmd;
use crate::host::{detect_distro, preflight};
use crate::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use crate::state::StateFile;
use crate::tools::cloudflared::{
    self, CONFIG_PATH, IngressChange, SERVICE_UNIT, TunnelConfig, TunnelInfo,
};
use crate::tools::packages::{self, PackageManager};
use crate::tools::{systemd, which};
use crate::vm_config::check_hostname;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// cloudflared keeps the login certificate and tunnel credentials here.
const CRED_DIR: &str = "/root/.cloudflared";
const DEB_PATH: &str = "/tmp/labstrap-cloudflared.deb";
const SSH_SERVICE: &str = "ssh://localhost:22";
pub const DEFAULT_TUNNEL_NAME: &str = "homelab";

/// `labstrap cloudflared setup` flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOptions {
    pub tunnel: Option<String>,
    /// Public hostname for SSH to the host
    pub hostname: Option<String>,
}

/// `labstrap cloudflared add-port` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPortOptions {
    pub port: u32,
    pub hostname: Option<String>,
    pub tunnel: Option<String>,
}

/// cloudflared reads `~/.cloudflared` of whoever runs it; pin it to root's
/// even when sudo kept the operator's `HOME`.
fn as_root(cmd: Cmd) -> Cmd {
    cmd.env("HOME", "/root")
}

pub struct TunnelCtx<'a> {
    env: &'a Env,
    state: StateFile,
    name: String,
    hostname: String,
    manager: Option<PackageManager>,
    /// Resolved by `create-tunnel`
    tunnel_id: Option<String>,
    config_changed: bool,
}

impl StepContext for TunnelCtx<'_> {
    fn env(&self) -> &Env {
        self.env
    }
}

impl TunnelCtx<'_> {
    fn cred_dir(&self) -> PathBuf {
        self.env.paths.sys(CRED_DIR)
    }

    fn find_tunnel(&self) -> Option<TunnelInfo> {
        match cloudflared::list_tunnels(self.env) {
            Ok(tunnels) => tunnels.into_iter().find(|t| t.name == self.name),
            Err(e) => {
                tracing::debug!("tunnel list failed: {:#}", e);
                None
            }
        }
    }

    /// Tunnel ID from the account listing, else from the only credentials
    /// file on disk.
    fn resolve_tunnel_id(&mut self) -> Option<String> {
        if self.tunnel_id.is_none() {
            self.tunnel_id = self.find_tunnel().map(|t| t.id);
        }
        if self.tunnel_id.is_none() {
            if let [only] = cloudflared::credential_ids(&self.cred_dir()).as_slice() {
                self.tunnel_id = Some(only.clone());
            }
        }
        self.tunnel_id.clone()
    }
}

// ============================================================================
// Steps
// ============================================================================

struct Install;

impl<'a> Step<TunnelCtx<'a>> for Install {
    fn name(&self) -> &'static str {
        "install"
    }

    fn description(&self) -> &'static str {
        "Install cloudflared"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        Ok(ctx.env.succeeds(&which("cloudflared")))
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        match ctx.manager {
            Some(PackageManager::Apt) => {
                let arch = ctx
                    .env
                    .run_ok(&Cmd::new("dpkg").arg("--print-architecture"))?
                    .trim()
                    .to_string();
                ctx.env.run_ok(
                    &Cmd::new("curl")
                        .args(["-fsSL", "-o", DEB_PATH])
                        .arg(cloudflared::deb_url(&arch))
                        .destructive(),
                )?;
                ctx.env
                    .run_ok(&Cmd::new("dpkg").args(["-i", DEB_PATH]).destructive().stream())?;
            }
            Some(manager) => {
                packages::install(ctx.env, manager, &["cloudflared".to_string()])?;
            }
            None => {
                return Ok(StepStatus::Warned(
                    "unknown package manager; install cloudflared by hand".to_string(),
                ));
            }
        }
        Ok(StepStatus::Applied)
    }
}

struct Login;

impl<'a> Step<TunnelCtx<'a>> for Login {
    fn name(&self) -> &'static str {
        "login"
    }

    fn description(&self) -> &'static str {
        "Log in to Cloudflare (opens a browser link)"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        Ok(ctx.cred_dir().join("cert.pem").is_file())
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        ctx.env.run_ok(&as_root(cloudflared::login_cmd()))?;
        Ok(StepStatus::Applied)
    }
}

struct CreateTunnel;

impl<'a> Step<TunnelCtx<'a>> for CreateTunnel {
    fn name(&self) -> &'static str {
        "create-tunnel"
    }

    fn description(&self) -> &'static str {
        "Create the named tunnel"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        if let Some(t) = ctx.find_tunnel() {
            tracing::debug!(id = %t.id, "tunnel exists");
            ctx.tunnel_id = Some(t.id);
            return Ok(true);
        }
        Ok(false)
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        ctx.env.run_ok(&as_root(cloudflared::create_cmd(&ctx.name)))?;
        ctx.tunnel_id = ctx.find_tunnel().map(|t| t.id);
        Ok(StepStatus::Applied)
    }
}

struct WriteConfig;

impl<'a> Step<TunnelCtx<'a>> for WriteConfig {
    fn name(&self) -> &'static str {
        "tunnel-config"
    }

    fn description(&self) -> &'static str {
        "Write /etc/cloudflared/config.yml"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        let Some(cfg) = cloudflared::load_config(ctx.env)? else {
            return Ok(false);
        };
        let id_matches = ctx.tunnel_id.as_deref().is_none_or(|id| id == cfg.tunnel);
        Ok(id_matches && cfg.routes().contains(&(ctx.hostname.as_str(), SSH_SERVICE)))
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        let Some(id) = ctx.resolve_tunnel_id() else {
            return Ok(StepStatus::Warned(format!(
                "could not determine the ID of tunnel '{}'; configure {} manually",
                ctx.name, CONFIG_PATH
            )));
        };
        let credentials = PathBuf::from(CRED_DIR).join(format!("{}.json", id));
        let cfg = match cloudflared::load_config(ctx.env)? {
            Some(mut cfg) => {
                cfg.tunnel = id;
                cfg.credentials_file = credentials;
                cfg.add_ingress(&ctx.hostname, SSH_SERVICE);
                cfg
            }
            None => TunnelConfig::new(&id, credentials, &ctx.hostname),
        };
        let path = ctx.env.paths.sys(CONFIG_PATH);
        ctx.env.write_file(&path, &cfg.render()?)?;
        ctx.config_changed = true;
        Ok(StepStatus::Applied)
    }
}

struct RouteDns;

impl<'a> Step<TunnelCtx<'a>> for RouteDns {
    fn name(&self) -> &'static str {
        "route-dns"
    }

    fn description(&self) -> &'static str {
        "Point the SSH hostname at the tunnel"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        Ok(ctx.state.routed_hostnames().contains(&ctx.hostname.as_str()))
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        ctx.env
            .run_ok(&as_root(cloudflared::route_dns_cmd(&ctx.name, &ctx.hostname)))?;
        ctx.state.add_routed_hostname(&ctx.hostname)?;
        ctx.state.save()?;
        Ok(StepStatus::Applied)
    }
}

struct Service;

impl<'a> Step<TunnelCtx<'a>> for Service {
    fn name(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> &'static str {
        "Run cloudflared as a system service"
    }

    fn is_done(&self, ctx: &mut TunnelCtx<'a>) -> Result<bool> {
        Ok(!ctx.config_changed
            && systemd::is_enabled(ctx.env, SERVICE_UNIT)
            && systemd::is_active(ctx.env, SERVICE_UNIT))
    }

    fn apply(&self, ctx: &mut TunnelCtx<'a>) -> Result<StepStatus> {
        if systemd::is_enabled(ctx.env, SERVICE_UNIT) {
            systemd::restart(ctx.env, SERVICE_UNIT)?;
        } else {
            ctx.env
                .run_ok(&as_root(cloudflared::service_install_cmd()))?;
        }
        Ok(StepStatus::Applied)
    }
}

fn pipeline<'a>() -> Pipeline<TunnelCtx<'a>> {
    Pipeline::new(Phase::Tunnel)
        .step(Install)
        .step(Login)
        .step(CreateTunnel)
        .step(WriteConfig)
        .step(RouteDns)
        .step(Service)
}

// ============================================================================
// Entry points
// ============================================================================

fn ask_hostname(env: &Env, question: &str) -> Result<String> {
    let host = env.prompt.text(question, None)?;
    check_hostname(host.trim()).map_err(LabError::validation)?;
    Ok(host.trim().to_string())
}

/// `labstrap cloudflared setup`
pub fn setup(env: &Env, opts: SetupOptions) -> Result<()> {
    preflight(env, Phase::Tunnel)?;
    announce(Phase::Tunnel);

    let existing_ssh_host = cloudflared::load_config(env)?.and_then(|cfg| {
        cfg.routes()
            .into_iter()
            .find(|(_, service)| *service == SSH_SERVICE)
            .map(|(host, _)| host.to_string())
    });
    let hostname = match opts.hostname.or(existing_ssh_host) {
        Some(h) => {
            check_hostname(&h).map_err(LabError::validation)?;
            h
        }
        None => ask_hostname(env, "Public hostname for SSH to this host (e.g. ssh.example.com)")?,
    };

    let mut ctx = TunnelCtx {
        env,
        state: load_state(env)?,
        name: opts.tunnel.unwrap_or_else(|| DEFAULT_TUNNEL_NAME.to_string()),
        hostname,
        manager: detect_distro(env).and_then(|d| d.package_manager()),
        tunnel_id: None,
        config_changed: false,
    };
    let report = pipeline().run(&mut ctx)?;
    finish(env, Phase::Tunnel, &report)?;
    println!(
        "  From a client: labstrap phase1-client --hostname {}",
        ctx.hostname
    );
    Ok(())
}

/// `labstrap cloudflared add-port`: expose a local port through the host
/// tunnel. Re-adding an identical rule changes nothing.
pub fn add_port(env: &Env, opts: AddPortOptions) -> Result<()> {
    let port = u16::try_from(opts.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| LabError::validation(format!("port must be 1-65535, got {}", opts.port)))?;

    let path = env.paths.sys(CONFIG_PATH);
    let Some(mut cfg) = cloudflared::load_config(env)? else {
        anyhow::bail!(
            "no tunnel config at {}; run `labstrap cloudflared setup` first",
            path.display()
        );
    };
    let hostname = match opts.hostname {
        Some(h) => {
            check_hostname(&h).map_err(LabError::validation)?;
            h
        }
        None => ask_hostname(env, &format!("Public hostname for local port {}", port))?,
    };
    let service = format!("http://localhost:{}", port);

    let change = cfg.add_ingress(&hostname, &service);
    let mut state = load_state(env)?;
    let routed = state.routed_hostnames().contains(&hostname.as_str());
    match change {
        IngressChange::Unchanged if routed => {
            println!("✓ {} already routes to {}", hostname, service);
            return Ok(());
        }
        // Rule written by a run that failed to route DNS.
        IngressChange::Unchanged => println!("  finishing {} → {}", hostname, service),
        IngressChange::Added => println!("  adding {} → {}", hostname, service),
        IngressChange::Updated => println!("  updating {} → {}", hostname, service),
    }

    if !routed {
        let tunnel = opts.tunnel.unwrap_or_else(|| cfg.tunnel.clone());
        env.run_ok(&as_root(cloudflared::route_dns_cmd(&tunnel, &hostname)))
            .with_context(|| format!("failed to route {} to the tunnel", hostname))?;
        state.add_routed_hostname(&hostname)?;
        state.save()?;
    }
    if change != IngressChange::Unchanged {
        env.write_file(&path, &cfg.render()?)?;
    }
    systemd::restart(env, SERVICE_UNIT)?;
    println!("✓ https://{} → localhost:{}", hostname, port);
    Ok(())
}

/// `labstrap cloudflared list`: ingress rules of the host tunnel.
pub fn list(env: &Env) -> Result<()> {
    let Some(cfg) = cloudflared::load_config(env)? else {
        println!("No tunnel configured ({} not found)", CONFIG_PATH);
        return Ok(());
    };
    println!("Tunnel {}", cfg.tunnel);
    let routes = cfg.routes();
    if routes.is_empty() {
        println!("  (no hostname rules)");
    }
    let state = load_state(env)?;
    let routed = state.routed_hostnames();
    for (host, service) in routes {
        let dns = if routed.contains(&host) { "" } else { "  (DNS not routed by labstrap)" };
        println!("  {:<32} → {}{}", host, service, dns);
    }
    Ok(())
}
