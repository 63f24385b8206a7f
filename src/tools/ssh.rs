//! SSH into the VM, and the operator's `~/.ssh/config`.

use crate::env::Env;
use crate::exec::Cmd;
use std::path::PathBuf;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    /// Private key passed with `-i`
    pub identity: Option<PathBuf>,
    /// Dedicated known_hosts file, so a rebuilt VM does not trip over the
    /// operator's own file.
    pub known_hosts: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            identity: None,
            known_hosts: None,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Non-interactive options shared by every connection.
    pub fn options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=5".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(ref kh) = self.known_hosts {
            opts.push("-o".to_string());
            opts.push(format!("UserKnownHostsFile={}", kh.display()));
        }
        if let Some(ref key) = self.identity {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        opts
    }

    fn base(&self) -> Cmd {
        Cmd::new("ssh").args(self.options()).arg(self.destination())
    }

    /// `ssh ... true`: succeeds once the guest accepts our key.
    pub fn probe_cmd(&self) -> Cmd {
        self.base().arg("true")
    }

    /// Run a shell command line in the guest (read-only unless marked).
    pub fn remote_cmd(&self, command: &str) -> Cmd {
        self.base().arg(command)
    }

    /// Pipe `script` into `sudo bash -s` in the guest, streaming its output.
    pub fn run_script_cmd(&self, script: &str) -> Cmd {
        self.base()
            .arg("sudo bash -s")
            .stdin(script)
            .destructive()
            .stream()
    }

    /// `test -e <path>` in the guest.
    pub fn test_file_cmd(&self, path: &str) -> Cmd {
        self.remote_cmd(&format!("test -e {}", shell_quote(path)))
    }
}

pub fn probe(env: &Env, target: &SshTarget) -> bool {
    env.succeeds(&target.probe_cmd())
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Generate an ed25519 key pair at `path` with no passphrase.
pub fn keygen_cmd(path: &std::path::Path, comment: &str) -> Cmd {
    Cmd::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(path.display().to_string())
        .destructive()
}

// ============================================================================
// Client configuration
// ============================================================================

/// `Host` block that reaches `hostname` through Cloudflare Access.
pub fn render_host_block(alias: &str, hostname: &str, user: Option<&str>) -> String {
    let mut block = format!("Host {}\n    HostName {}\n", alias, hostname);
    if let Some(u) = user {
        block.push_str(&format!("    User {}\n", u));
    }
    block.push_str("    ProxyCommand cloudflared access ssh --hostname %h\n");
    block
}

/// Whether some `Host` line in `config` already lists `alias`.
pub fn has_host_block(config: &str, alias: &str) -> bool {
    config.lines().any(|line| {
        let mut words = line.split_whitespace();
        matches!(words.next(), Some(kw) if kw.eq_ignore_ascii_case("host"))
            && words.any(|pattern| pattern == alias)
    })
}

/// `config` with `block` appended, separated by a blank line.
pub fn append_block(config: &str, block: &str) -> String {
    let mut out = config.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(block);
    out
}
