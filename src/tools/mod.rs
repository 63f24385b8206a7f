//! Typed wrappers over the third-party CLIs the phases drive.
//!
//! Wrappers only build [`Cmd`] values and parse output with pure
//! functions; running them goes through [`crate::env::Env`] so tests can
//! answer with canned output. Tools with many flags get an argument struct
//! implementing [`ToolArgs`], so a flag typo is a compile error rather than
//! a confusing failure halfway through a phase.

pub mod cloudflared;
pub mod dkms;
pub mod grub;
pub mod libvirt;
pub mod packages;
pub mod snapper;
pub mod ssh;
pub mod systemd;

use crate::exec::Cmd;

/// Typed argument contract for one external program.
///
/// # Contract
///
/// - `to_cli_args()` returns arguments exactly as the program expects them.
/// - `get_env_vars()` returns environment variables the program needs.
/// - Destructive invocations are skipped under `--dry-run`.
pub trait ToolArgs {
    /// Executable name, resolved through `PATH`.
    fn program(&self) -> &'static str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Whether the invocation changes the system.
    fn is_destructive(&self) -> bool {
        true
    }

    /// Build the command.
    fn to_cmd(&self) -> Cmd {
        let mut cmd = Cmd::new(self.program()).args(self.to_cli_args());
        for (key, value) in self.get_env_vars() {
            cmd = cmd.env(key, value);
        }
        if self.is_destructive() {
            cmd = cmd.destructive();
        }
        cmd
    }
}

/// `which <name>`: whether a binary is on `PATH`.
pub fn which(name: &str) -> Cmd {
    Cmd::new("which").arg(name)
}
