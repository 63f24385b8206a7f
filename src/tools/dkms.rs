//! dkms module builds.

use crate::env::Env;
use crate::exec::Cmd;
use anyhow::Result;

/// Out-of-tree i915 driver with SR-IOV support.
pub const I915_SRIOV_MODULE: &str = "i915-sriov-dkms";
pub const I915_SRIOV_REPO: &str = "https://github.com/strongtz/i915-sriov-dkms";

/// Whether `dkms status` output shows `module` installed, optionally for a
/// specific kernel release.
///
/// Lines look like `i915-sriov-dkms/2024.12.30, 6.8.0-49-generic, x86_64: installed`.
pub fn status_says_installed(status: &str, module: &str, kernel: Option<&str>) -> bool {
    status.lines().any(|line| {
        let Some((ident, state)) = line.rsplit_once(':') else {
            return false;
        };
        if state.trim() != "installed" {
            return false;
        }
        let mut fields = ident.split(',').map(str::trim);
        let name_ok = fields
            .next()
            .is_some_and(|nv| nv.split('/').next() == Some(module));
        let kernel_ok = match kernel {
            Some(k) => fields.next() == Some(k),
            None => true,
        };
        name_ok && kernel_ok
    })
}

/// Running kernel release (`uname -r`).
pub fn running_kernel(env: &Env) -> Option<String> {
    env.run_ok(&Cmd::new("uname").arg("-r"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn is_installed(env: &Env, module: &str, kernel: Option<&str>) -> bool {
    env.run_ok(&Cmd::new("dkms").args(["status", module]))
        .map(|out| status_says_installed(&out, module, kernel))
        .unwrap_or(false)
}

/// Register the source tree at `src_dir` and build/install `module/version`.
pub fn add_and_install(env: &Env, src_dir: &str, module: &str, version: &str) -> Result<()> {
    let add = Cmd::new("dkms").args(["add", src_dir]).destructive();
    let out = env.run(&add)?;
    if !out.success && !out.stderr.contains("already added") {
        out.ensure_success(&add)?;
    }
    env.run_ok(
        &Cmd::new("dkms")
            .args(["install", "--force", &format!("{}/{}", module, version)])
            .destructive()
            .stream(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
i915-sriov-dkms/2024.12.30, 6.8.0-49-generic, x86_64: installed
i915-sriov-dkms/2024.12.30, 6.8.0-51-generic, x86_64: built
nvidia/550, 6.8.0-51-generic, x86_64: installed
";

    #[test]
    fn test_status_parsing() {
        assert!(status_says_installed(STATUS, I915_SRIOV_MODULE, None));
        assert!(status_says_installed(
            STATUS,
            I915_SRIOV_MODULE,
            Some("6.8.0-49-generic")
        ));
        assert!(!status_says_installed(
            STATUS,
            I915_SRIOV_MODULE,
            Some("6.8.0-51-generic")
        ));
        assert!(!status_says_installed("", I915_SRIOV_MODULE, None));
    }

    #[test]
    fn test_added_only_is_not_installed() {
        let status = "i915-sriov-dkms/2024.12.30: added\n";
        assert!(!status_says_installed(status, I915_SRIOV_MODULE, None));
    }
}
