//! Self-hosted container platforms that phase 3 can deploy inside the VM.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Container platform to deploy in the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    None,
    Coolify,
    Dokploy,
    Zeabur,
}

impl Platform {
    /// Human-readable description
    pub const fn description(self) -> &'static str {
        match self {
            Self::None => "No platform (plain VM with Docker prerequisites)",
            Self::Coolify => "Coolify: self-hosted PaaS on Docker",
            Self::Dokploy => "Dokploy: Docker Swarm based PaaS",
            Self::Zeabur => "Zeabur: self-hosted server agent (k3s)",
        }
    }

    /// Shell pipeline run as root in the guest to install the platform.
    pub const fn install_command(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Coolify => Some("curl -fsSL https://cdn.coollabs.io/coolify/install.sh | bash"),
            Self::Dokploy => Some("curl -sSL https://dokploy.com/install.sh | sh"),
            Self::Zeabur => Some("curl -sSL https://zeabur.com/install.sh | bash"),
        }
    }

    /// Port of the platform's web dashboard in the guest.
    pub const fn web_port(self) -> Option<u16> {
        match self {
            Self::None => None,
            Self::Coolify => Some(8000),
            Self::Dokploy => Some(3000),
            Self::Zeabur => Some(8080),
        }
    }

    /// Shell test that exits 0 when the platform is already installed.
    pub const fn installed_probe(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Coolify => Some("test -d /data/coolify/source"),
            Self::Dokploy => Some("docker service inspect dokploy >/dev/null 2>&1"),
            Self::Zeabur => Some("test -x /usr/local/bin/k3s"),
        }
    }

    pub fn all() -> Vec<Platform> {
        Platform::iter().collect()
    }
}
