//! Progress state kept in `<workdir>/.state`.
//!
//! The file is a flat key-value file like the VM records:
//!
//! ```text
//! LAST_CONFIG="dev"
//! PHASE1_DONE="1"
//! PHASE1_DONE_AT="1760000000"
//! REBOOT_REQUIRED="1"
//! ```
//!
//! A missing file is the same as an empty one. There is no locking; two
//! concurrent runs may overwrite each other's flags.

use crate::error::{LabError, Result};
use crate::exec::is_dry_run;
use crate::kvconf::KvFile;
use crate::pipeline::{Phase, unix_now};
use serde::Serialize;
use std::path::Path;

const LAST_CONFIG: &str = "LAST_CONFIG";
const REBOOT_REQUIRED: &str = "REBOOT_REQUIRED";
const SNAPPER_PRE: &str = "SNAPPER_PRE";
const SNAPPER_PRE_DESC: &str = "SNAPPER_PRE_DESC";
const TUNNEL_ROUTES: &str = "TUNNEL_ROUTES";

/// A snapper "pre" snapshot still waiting for its "post" partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    pub number: u32,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct StateFile {
    file: KvFile,
}

impl StateFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: KvFile::load_or_default(path)?,
        })
    }

    /// Name of the VM record used by the last successful phase 2 run.
    pub fn last_config(&self) -> Option<&str> {
        self.file.get(LAST_CONFIG).filter(|v| !v.is_empty())
    }

    pub fn set_last_config(&mut self, name: &str) -> Result<()> {
        self.file.set(LAST_CONFIG, name)?;
        Ok(())
    }

    pub fn is_done(&self, phase: Phase) -> bool {
        self.file.get(phase.state_key()) == Some("1")
    }

    /// When the phase was last completed (unix seconds).
    pub fn done_at(&self, phase: Phase) -> Option<u64> {
        self.file
            .get(&format!("{}_AT", phase.state_key()))
            .and_then(|v| v.parse().ok())
    }

    pub fn mark_done(&mut self, phase: Phase) -> Result<()> {
        self.file.set(phase.state_key(), "1")?;
        self.file
            .set(&format!("{}_AT", phase.state_key()), &unix_now().to_string())?;
        Ok(())
    }

    pub fn reboot_required(&self) -> bool {
        self.file.get(REBOOT_REQUIRED) == Some("1")
    }

    pub fn set_reboot_required(&mut self, required: bool) -> Result<()> {
        if required {
            self.file.set(REBOOT_REQUIRED, "1")?;
        } else {
            self.file.remove(REBOOT_REQUIRED);
        }
        Ok(())
    }

    /// Hostnames already routed to the host tunnel in DNS.
    pub fn routed_hostnames(&self) -> Vec<&str> {
        self.file
            .get(TUNNEL_ROUTES)
            .unwrap_or_default()
            .split_whitespace()
            .collect()
    }

    pub fn add_routed_hostname(&mut self, hostname: &str) -> Result<()> {
        let mut routes: Vec<String> = self
            .routed_hostnames()
            .into_iter()
            .map(str::to_string)
            .collect();
        if !routes.iter().any(|r| r == hostname) {
            routes.push(hostname.to_string());
        }
        self.file.set(TUNNEL_ROUTES, &routes.join(" "))?;
        Ok(())
    }

    /// The recorded "pre" snapshot, if one has not been paired yet.
    ///
    /// # Errors
    ///
    /// `SNAPPER_PRE` present but not a number.
    pub fn pending_snapshot(&self) -> Result<Option<PendingSnapshot>> {
        let Some(raw) = self.file.get(SNAPPER_PRE).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let number = raw.parse().map_err(|_| {
            LabError::state(format!("{} is not a snapshot number: '{}'", SNAPPER_PRE, raw))
        })?;
        Ok(Some(PendingSnapshot {
            number,
            description: self.file.get(SNAPPER_PRE_DESC).unwrap_or_default().to_string(),
        }))
    }

    pub fn set_pending_snapshot(&mut self, number: u32, description: &str) -> Result<()> {
        self.file.set(SNAPPER_PRE, &number.to_string())?;
        self.file.set(SNAPPER_PRE_DESC, description)?;
        Ok(())
    }

    pub fn clear_pending_snapshot(&mut self) {
        self.file.remove(SNAPPER_PRE);
        self.file.remove(SNAPPER_PRE_DESC);
    }

    /// Write the file back. A no-op under `--dry-run`.
    pub fn save(&self) -> Result<()> {
        if is_dry_run() {
            tracing::info!("dry-run: not writing {}", self.file.path().display());
            return Ok(());
        }
        self.file.save()
    }
}
