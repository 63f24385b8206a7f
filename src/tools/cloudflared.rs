//! Cloudflare tunnel client (`cloudflared`) and its ingress config.
//!
//! The host tunnel is driven by `/etc/cloudflared/config.yml`:
//!
//! ```yaml
//! tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
//! credentials-file: /root/.cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json
//! ingress:
//!   - hostname: ssh.example.com
//!     service: ssh://localhost:22
//!   - service: http_status:404
//! ```
//!
//! cloudflared requires the last ingress rule to match everything, so every
//! edit goes through [`TunnelConfig::add_ingress`], which keeps exactly one
//! catch-all rule at the end.

use crate::env::Env;
use crate::error::{LabError, Result};
use crate::exec::Cmd;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "/etc/cloudflared/config.yml";
pub const CATCH_ALL_SERVICE: &str = "http_status:404";
pub const SERVICE_UNIT: &str = "cloudflared";

/// Release asset for Debian-family hosts; `arch` is `dpkg --print-architecture`.
pub fn deb_url(arch: &str) -> String {
    format!(
        "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-{}.deb",
        arch
    )
}

// ============================================================================
// Tunnel metadata
// ============================================================================

/// One entry of `cloudflared tunnel list -o json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub name: String,
}

pub fn parse_tunnel_list(json: &str) -> Result<Vec<TunnelInfo>> {
    let trimmed = json.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Credentials file written by `cloudflared tunnel create`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
}

pub fn parse_credentials(json: &str) -> Result<Credentials> {
    Ok(serde_json::from_str(json)?)
}

/// Tunnel IDs from `*.json` credentials files in `dir`.
pub fn credential_ids(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|p| std::fs::read_to_string(&p).ok())
        .filter_map(|text| parse_credentials(&text).ok())
        .map(|c| c.tunnel_id)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

// ============================================================================
// Ingress configuration
// ============================================================================

/// One ingress rule. A rule without hostname (and path) matches everything.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service: String,
    /// Keys we do not model (`originRequest`, …) pass through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl IngressRule {
    pub fn new(hostname: &str, service: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            path: None,
            service: service.to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            path: None,
            service: CATCH_ALL_SERVICE.to_string(),
            extra: BTreeMap::new(),
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_none() && self.path.is_none()
    }
}

/// `config.yml` for a named tunnel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TunnelConfig {
    pub tunnel: String,
    #[serde(rename = "credentials-file")]
    pub credentials_file: PathBuf,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Result of [`TunnelConfig::add_ingress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressChange {
    Unchanged,
    Added,
    Updated,
}

impl TunnelConfig {
    /// Fresh config exposing local SSH at `ssh_hostname`.
    pub fn new(tunnel_id: &str, credentials_file: PathBuf, ssh_hostname: &str) -> Self {
        let mut cfg = Self {
            tunnel: tunnel_id.to_string(),
            credentials_file,
            ingress: Vec::new(),
            extra: BTreeMap::new(),
        };
        cfg.add_ingress(ssh_hostname, "ssh://localhost:22");
        cfg
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let mut cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.normalize_catch_all();
        Ok(cfg)
    }

    pub fn render(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Keep hostname rules in order, then exactly one catch-all.
    fn normalize_catch_all(&mut self) {
        let (mut rules, catch_alls): (Vec<_>, Vec<_>) =
            self.ingress.drain(..).partition(|r| !r.is_catch_all());
        rules.push(
            catch_alls
                .into_iter()
                .last()
                .unwrap_or_else(IngressRule::catch_all),
        );
        self.ingress = rules;
    }

    /// Route `hostname` to `service`, inserting before the catch-all.
    pub fn add_ingress(&mut self, hostname: &str, service: &str) -> IngressChange {
        let change = match self
            .ingress
            .iter_mut()
            .find(|r| r.hostname.as_deref() == Some(hostname) && r.path.is_none())
        {
            Some(rule) if rule.service == service => IngressChange::Unchanged,
            Some(rule) => {
                rule.service = service.to_string();
                IngressChange::Updated
            }
            None => {
                self.ingress.push(IngressRule::new(hostname, service));
                IngressChange::Added
            }
        };
        self.normalize_catch_all();
        change
    }

    /// Hostnames with their services, catch-all excluded.
    pub fn routes(&self) -> Vec<(&str, &str)> {
        self.ingress
            .iter()
            .filter_map(|r| Some((r.hostname.as_deref()?, r.service.as_str())))
            .collect()
    }
}

/// Load the host's tunnel config, `None` if it does not exist.
pub fn load_config(env: &Env) -> anyhow::Result<Option<TunnelConfig>> {
    let path = env.paths.sys(CONFIG_PATH);
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(Some(TunnelConfig::parse(&text).map_err(|e| {
            LabError::config(format!("{}: {}", path.display(), e))
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LabError::from(e).into()),
    }
}

// ============================================================================
// Commands
// ============================================================================

pub fn list_cmd() -> Cmd {
    Cmd::new("cloudflared").args(["tunnel", "list", "-o", "json"])
}

pub fn list_tunnels(env: &Env) -> anyhow::Result<Vec<TunnelInfo>> {
    let out = env.run_ok(&list_cmd())?;
    Ok(parse_tunnel_list(&out)?)
}

/// Browser-based login; writes `~/.cloudflared/cert.pem`.
pub fn login_cmd() -> Cmd {
    Cmd::new("cloudflared")
        .args(["tunnel", "login"])
        .interactive()
        .destructive()
}

pub fn create_cmd(name: &str) -> Cmd {
    Cmd::new("cloudflared")
        .args(["tunnel", "create", name])
        .destructive()
}

pub fn route_dns_cmd(tunnel: &str, hostname: &str) -> Cmd {
    Cmd::new("cloudflared")
        .args(["tunnel", "route", "dns", "--overwrite-dns", tunnel, hostname])
        .destructive()
}

pub fn service_install_cmd() -> Cmd {
    Cmd::new("cloudflared")
        .args(["service", "install"])
        .destructive()
}
