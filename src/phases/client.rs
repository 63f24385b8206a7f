//! Operator laptop: SSH to the host through Cloudflare Access.

use super::{announce, finish};
use crate::env::Env;
use crate::error::LabError;
use crate::exec::is_dry_run;
use crate::host::preflight;
use crate::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use crate::tools::{ssh, which};
use crate::vm_config::check_hostname;
use anyhow::{Context, Result};
use std::path::PathBuf;

const INSTALL_HINT: &str = "install cloudflared from \
https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/";

/// `labstrap phase1-client` flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Public SSH hostname of the host tunnel
    pub hostname: String,
    /// `Host` alias; defaults to the first label of the hostname
    pub alias: Option<String>,
    /// Remote login user
    pub user: Option<String>,
}

impl ClientOptions {
    pub fn alias(&self) -> String {
        self.alias.clone().unwrap_or_else(|| {
            self.hostname
                .split('.')
                .next()
                .unwrap_or(&self.hostname)
                .to_string()
        })
    }
}

pub struct ClientCtx<'a> {
    env: &'a Env,
    opts: ClientOptions,
}

impl StepContext for ClientCtx<'_> {
    fn env(&self) -> &Env {
        self.env
    }
}

impl ClientCtx<'_> {
    fn key_path(&self) -> PathBuf {
        self.env.paths.home_path(".ssh/id_ed25519")
    }

    fn config_path(&self) -> PathBuf {
        self.env.paths.home_path(".ssh/config")
    }

    fn ssh_config(&self) -> Result<String> {
        let path = self.config_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

struct Cloudflared;

impl<'a> Step<ClientCtx<'a>> for Cloudflared {
    fn name(&self) -> &'static str {
        "cloudflared"
    }

    fn description(&self) -> &'static str {
        "Check for cloudflared"
    }

    fn is_done(&self, ctx: &mut ClientCtx<'a>) -> Result<bool> {
        Ok(ctx.env.succeeds(&which("cloudflared")))
    }

    fn apply(&self, _ctx: &mut ClientCtx<'a>) -> Result<StepStatus> {
        Ok(StepStatus::Warned(INSTALL_HINT.to_string()))
    }
}

struct SshKey;

impl<'a> Step<ClientCtx<'a>> for SshKey {
    fn name(&self) -> &'static str {
        "ssh-key"
    }

    fn description(&self) -> &'static str {
        "Create an SSH key"
    }

    fn is_done(&self, ctx: &mut ClientCtx<'a>) -> Result<bool> {
        Ok(ctx.key_path().is_file())
    }

    fn apply(&self, ctx: &mut ClientCtx<'a>) -> Result<StepStatus> {
        let key = ctx.key_path();
        if let Some(dir) = key.parent().filter(|_| !is_dry_run()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let comment = format!("{}@labstrap", ctx.env.operator.as_deref().unwrap_or("operator"));
        ctx.env.run_ok(&ssh::keygen_cmd(&key, &comment))?;
        Ok(StepStatus::Applied)
    }
}

struct SshConfig;

impl<'a> Step<ClientCtx<'a>> for SshConfig {
    fn name(&self) -> &'static str {
        "ssh-config"
    }

    fn description(&self) -> &'static str {
        "Add a Host block to ~/.ssh/config"
    }

    fn is_done(&self, ctx: &mut ClientCtx<'a>) -> Result<bool> {
        Ok(ssh::has_host_block(&ctx.ssh_config()?, &ctx.opts.alias()))
    }

    fn apply(&self, ctx: &mut ClientCtx<'a>) -> Result<StepStatus> {
        let block = ssh::render_host_block(
            &ctx.opts.alias(),
            &ctx.opts.hostname,
            ctx.opts.user.as_deref(),
        );
        let updated = ssh::append_block(&ctx.ssh_config()?, &block);
        ctx.env.write_file(&ctx.config_path(), &updated)?;
        Ok(StepStatus::Applied)
    }
}

/// `labstrap phase1-client`
pub fn run(env: &Env, opts: ClientOptions) -> Result<()> {
    check_hostname(&opts.hostname).map_err(LabError::validation)?;
    preflight(env, Phase::Client)?;
    announce(Phase::Client);

    let mut ctx = ClientCtx { env, opts };
    let report = Pipeline::new(Phase::Client)
        .step(Cloudflared)
        .step(SshKey)
        .step(SshConfig)
        .run(&mut ctx)?;
    finish(env, Phase::Client, &report)?;
    println!("  Connect with: ssh {}", ctx.opts.alias());
    Ok(())
}
