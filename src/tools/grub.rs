//! Kernel command line parameters in `/etc/default/grub`.

use crate::env::Env;
use crate::exec::Cmd;
use crate::kvconf::KvFile;
use crate::tools::which;
use anyhow::{Context, Result};

pub const GRUB_DEFAULTS: &str = "/etc/default/grub";
pub const CMDLINE_KEY: &str = "GRUB_CMDLINE_LINUX_DEFAULT";

fn param_key(param: &str) -> &str {
    param.split_once('=').map_or(param, |(k, _)| k)
}

/// Parameters from `wanted` not present verbatim in `cmdline`.
pub fn missing_params<'a>(cmdline: &str, wanted: &'a [String]) -> Vec<&'a str> {
    let present: Vec<&str> = cmdline.split_whitespace().collect();
    wanted
        .iter()
        .map(String::as_str)
        .filter(|p| !present.contains(p))
        .collect()
}

/// Merge `params` into `cmdline`. A parameter replaces any existing one
/// with the same key (`i915.max_vfs=2` replaces `i915.max_vfs=7`);
/// duplicates are dropped and the order of untouched parameters is kept.
pub fn merge_cmdline(cmdline: &str, params: &[String]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in cmdline.split_whitespace() {
        let replaced = params.iter().any(|p| param_key(p) == param_key(token));
        if !replaced && !out.contains(&token) {
            out.push(token);
        }
    }
    for p in params {
        if !out.contains(&p.as_str()) {
            out.push(p);
        }
    }
    out.join(" ")
}

/// Current `GRUB_CMDLINE_LINUX_DEFAULT`, `None` when grub is not configured.
pub fn read_cmdline(env: &Env) -> Result<Option<(KvFile, String)>> {
    let path = env.paths.sys(GRUB_DEFAULTS);
    if !path.is_file() {
        return Ok(None);
    }
    let file = KvFile::load(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let current = file.get(CMDLINE_KEY).unwrap_or_default().to_string();
    Ok(Some((file, current)))
}

/// Write the merged command line back. Returns whether anything changed.
pub fn apply_params(env: &Env, params: &[String]) -> Result<bool> {
    let Some((mut file, current)) = read_cmdline(env)? else {
        anyhow::bail!("{} not found", GRUB_DEFAULTS);
    };
    let merged = merge_cmdline(&current, params);
    if !file.set(CMDLINE_KEY, &merged)? {
        return Ok(false);
    }
    env.write_file(file.path(), &file.render())?;
    tracing::info!(cmdline = %merged, "updated kernel command line");
    Ok(true)
}

/// Regenerate `grub.cfg` with whichever tool the distribution ships.
pub fn regenerate(env: &Env) -> Result<()> {
    let cmd = if env.succeeds(&which("update-grub")) {
        Cmd::new("update-grub")
    } else {
        Cmd::new("grub-mkconfig").args(["-o", "/boot/grub/grub.cfg"])
    };
    env.run_ok(&cmd.destructive())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, test_env, write_sys};

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_keeps_order_and_replaces_keys() {
        let merged = merge_cmdline(
            "quiet splash i915.max_vfs=2 quiet",
            &params(&["intel_iommu=on", "iommu=pt", "i915.max_vfs=7"]),
        );
        assert_eq!(merged, "quiet splash intel_iommu=on iommu=pt i915.max_vfs=7");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let p = params(&["amd_iommu=on", "iommu=pt"]);
        let once = merge_cmdline("quiet", &p);
        assert_eq!(merge_cmdline(&once, &p), once);
        assert!(missing_params(&once, &p).is_empty());
        assert_eq!(missing_params("quiet", &p), vec!["amd_iommu=on", "iommu=pt"]);
    }

    #[test]
    fn test_apply_patches_only_cmdline() {
        let (env, _dir) = test_env(FakeExec::new());
        write_sys(
            &env,
            GRUB_DEFAULTS,
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\nGRUB_CMDLINE_LINUX=\"\"\n",
        );
        let p = params(&["intel_iommu=on", "iommu=pt"]);
        assert!(apply_params(&env, &p).unwrap());
        let text = std::fs::read_to_string(env.paths.sys(GRUB_DEFAULTS)).unwrap();
        assert_eq!(
            text,
            "GRUB_DEFAULT=0\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash intel_iommu=on iommu=pt\"\nGRUB_CMDLINE_LINUX=\"\"\n"
        );
        assert!(!apply_params(&env, &p).unwrap());
    }

    #[test]
    fn test_missing_grub_defaults() {
        let (env, _dir) = test_env(FakeExec::new());
        assert!(read_cmdline(&env).unwrap().is_none());
        assert!(apply_params(&env, &params(&["iommu=pt"])).is_err());
    }

    #[test]
    fn test_regenerate_prefers_update_grub() {
        let exec = FakeExec::new().ok("which update-grub", "/usr/sbin/update-grub").ok("update-grub", "");
        let (env, _dir) = test_env(exec.clone());
        regenerate(&env).unwrap();
        assert!(exec.ran("update-grub"));

        let exec = FakeExec::new().ok("grub-mkconfig", "");
        let (env, _dir) = test_env(exec.clone());
        regenerate(&env).unwrap();
        assert!(exec.ran("grub-mkconfig -o /boot/grub/grub.cfg"));
    }
}
