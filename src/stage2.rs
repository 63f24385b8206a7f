//! Second-stage configuration script run inside the VM over SSH.
//!
//! The script is self-guarding: it exits early when its marker file exists,
//! so pushing it twice is harmless. Every value interpolated from the VM
//! record is single-quoted.

use crate::cloudinit::render_netplan;
use crate::error::Result;
use crate::tools::ssh::shell_quote;
use crate::vm_config::VmConfig;

/// Written as the last action of a successful run.
pub const MARKER: &str = "/var/lib/labstrap/stage2.done";

const BASE_PACKAGES: &[&str] = &[
    "curl",
    "git",
    "ca-certificates",
    "gnupg",
    "qemu-guest-agent",
    "unattended-upgrades",
];

const NETPLAN_PATH: &str = "/etc/netplan/60-labstrap.yaml";

const PRELUDE: &str = r#"#!/usr/bin/env bash
set -euo pipefail
trap 'echo "stage2: failed at line $LINENO: $BASH_COMMAND" >&2' ERR
"#;

const GUARD: &str = r#"if [ -f "$MARKER" ]; then echo 'stage2: already applied'; exit 0; fi
export DEBIAN_FRONTEND=noninteractive

"#;

const DOCKER: &str = r#"echo 'stage2: docker'
if ! command -v docker >/dev/null 2>&1; then
  curl -fsSL https://get.docker.com | sh
fi
"#;

const FINISH: &str = r#"mkdir -p "$(dirname "$MARKER")"
date -u +%FT%TZ > "$MARKER"
echo 'stage2: done'
"#;

/// Render the script for `cfg`.
pub fn render(cfg: &VmConfig) -> Result<String> {
    let mut s = String::from(PRELUDE);
    s.push_str(&format!("MARKER={}\n", shell_quote(MARKER)));
    s.push_str(GUARD);

    s.push_str(&format!(
        "echo 'stage2: hostname'\nhostnamectl set-hostname {}\n\n",
        shell_quote(&cfg.name)
    ));

    if cfg.static_network().is_some() {
        let mut netplan = render_netplan(cfg)?;
        if !netplan.ends_with('\n') {
            netplan.push('\n');
        }
        s.push_str(&format!(
            "echo 'stage2: static network'\n\
             cat > {path} <<'LABSTRAP_NETPLAN'\n\
             {netplan}\
             LABSTRAP_NETPLAN\n\
             chmod 600 {path}\n\
             netplan generate\n\
             netplan apply\n\n",
            path = NETPLAN_PATH,
            netplan = netplan,
        ));
    }

    s.push_str(&format!(
        "echo 'stage2: base packages'\n\
         apt-get update -q\n\
         apt-get install -y -q {}\n\
         systemctl enable --now qemu-guest-agent\n\
         dpkg-reconfigure -f noninteractive unattended-upgrades\n\n",
        BASE_PACKAGES.join(" ")
    ));

    s.push_str(DOCKER);
    s.push_str(&format!("usermod -aG docker {}\n\n", shell_quote(&cfg.user)));
    s.push_str(FINISH);
    Ok(s)
}
