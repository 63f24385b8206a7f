//! Runtime environment shared by every phase: how to run commands, how to
//! ask the operator, and where things live on disk.

use crate::exec::{Cmd, CmdOutput, Exec, is_dry_run};
use crate::prompt::Prompter;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Holds `generated-vm/` and `.state`.
    pub workdir: PathBuf,
    /// Prefix for absolute system paths (`/etc`, `/sys`, `/proc`).
    pub sysroot: PathBuf,
    /// Home directory of the operator (the sudo caller, not root).
    pub home: PathBuf,
}

impl Paths {
    /// Resolve an absolute system path under the sysroot.
    pub fn sys(&self, abs: &str) -> PathBuf {
        self.sysroot.join(abs.trim_start_matches('/'))
    }

    /// Directory holding VM records.
    pub fn vm_dir(&self) -> PathBuf {
        self.workdir.join("generated-vm")
    }

    /// The `.state` file.
    pub fn state_file(&self) -> PathBuf {
        self.workdir.join(".state")
    }

    /// Working files for one VM (cloud-init seed and friends).
    pub fn vm_work_dir(&self, vm: &str) -> PathBuf {
        self.vm_dir().join(vm)
    }

    /// Path relative to the operator's home directory.
    pub fn home_path(&self, rel: &str) -> PathBuf {
        self.home.join(rel)
    }
}

/// Everything a step needs besides its own phase data.
pub struct Env {
    pub exec: Box<dyn Exec>,
    pub prompt: Box<dyn Prompter>,
    pub paths: Paths,
    /// `--yes`: skip destructive-step confirmations.
    pub assume_yes: bool,
    /// Login name of the operator (`SUDO_USER`, else `USER`).
    pub operator: Option<String>,
    /// Injected so tests can poll without waiting.
    pub sleep: fn(Duration),
}

impl Env {
    pub fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        self.exec.run(cmd)
    }

    pub fn run_ok(&self, cmd: &Cmd) -> Result<String> {
        self.exec.run_ok(cmd)
    }

    pub fn succeeds(&self, cmd: &Cmd) -> bool {
        self.exec.succeeds(cmd)
    }

    /// Read a system file (under the sysroot); `None` if it is missing or unreadable.
    pub fn read_sys(&self, abs: &str) -> Option<String> {
        std::fs::read_to_string(self.paths.sys(abs)).ok()
    }

    /// Write a file unless in dry-run mode.
    pub fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if is_dry_run() {
            println!("  [dry-run] write {} ({} bytes)", path.display(), contents.len());
            return Ok(());
        }
        crate::kvconf::write_atomic(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote file");
        Ok(())
    }
}
