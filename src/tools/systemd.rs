//! systemd units and group membership.

use crate::env::Env;
use crate::exec::Cmd;
use anyhow::Result;

pub fn is_active(env: &Env, unit: &str) -> bool {
    env.succeeds(&Cmd::new("systemctl").args(["is-active", "--quiet", unit]))
}

pub fn is_enabled(env: &Env, unit: &str) -> bool {
    env.succeeds(&Cmd::new("systemctl").args(["is-enabled", "--quiet", unit]))
}

/// `systemctl enable --now <unit>`
pub fn enable_now(env: &Env, unit: &str) -> Result<()> {
    env.run_ok(
        &Cmd::new("systemctl")
            .args(["enable", "--now", unit])
            .destructive(),
    )?;
    Ok(())
}

pub fn restart(env: &Env, unit: &str) -> Result<()> {
    env.run_ok(&Cmd::new("systemctl").args(["restart", unit]).destructive())?;
    Ok(())
}

/// Whether `user` is a member of `group` (`id -nG`).
pub fn user_in_group(env: &Env, user: &str, group: &str) -> bool {
    env.run_ok(&Cmd::new("id").args(["-nG", user]))
        .map(|out| out.split_whitespace().any(|g| g == group))
        .unwrap_or(false)
}

pub fn add_user_to_group(env: &Env, user: &str, group: &str) -> Result<()> {
    env.run_ok(
        &Cmd::new("usermod")
            .args(["-aG", group, user])
            .destructive(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, test_env};

    #[test]
    fn test_group_membership_parses_id_output() {
        let exec = FakeExec::new().ok("id -nG lab", "lab wheel libvirt\n");
        let (env, _dir) = test_env(exec);
        assert!(user_in_group(&env, "lab", "libvirt"));
        assert!(!user_in_group(&env, "lab", "kvm"));
        assert!(!user_in_group(&env, "nobody", "libvirt"));
    }

    #[test]
    fn test_unit_probes() {
        let exec = FakeExec::new()
            .ok("systemctl is-active --quiet libvirtd", "")
            .fail("systemctl is-enabled --quiet libvirtd");
        let (env, _dir) = test_env(exec);
        assert!(is_active(&env, "libvirtd"));
        assert!(!is_enabled(&env, "libvirtd"));
    }
}
