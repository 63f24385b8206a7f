//! Entry points for each phase and the helper commands.
//!
//! Every phase follows the same shape: pre-flight, prerequisite check, build
//! a [`Pipeline`](crate::pipeline::Pipeline) over a phase-specific context,
//! run it, then record completion in `.state` and print the summary.

pub mod check;
pub mod client;
pub mod config;
pub mod guest;
pub mod host;
pub mod snapshot;
pub mod tunnel;
pub mod vm;

use crate::env::Env;
use crate::exec::is_dry_run;
use crate::pipeline::{Phase, PipelineReport};
use crate::state::StateFile;
use crate::tools::snapper;
use anyhow::{Context, Result};

/// Load `.state` for this run.
pub fn load_state(env: &Env) -> Result<StateFile> {
    let path = env.paths.state_file();
    StateFile::load(&path).with_context(|| format!("failed to read {}", path.display()))
}

/// Warn about phases that should have run first; the operator decides
/// whether to continue (`--yes` continues).
pub fn check_prerequisites(env: &Env, state: &StateFile, phase: Phase) -> Result<()> {
    for prereq in phase.prerequisites() {
        if state.is_done(*prereq) {
            continue;
        }
        tracing::warn!(%phase, %prereq, "prerequisite phase not completed");
        println!("⚠ {} has not completed ({}).", prereq, prereq.description());
        let proceed = env.assume_yes
            || env
                .prompt
                .confirm(&format!("Continue with {} anyway?", phase), false)?;
        if !proceed {
            anyhow::bail!("run `labstrap {}` first", prereq);
        }
    }
    Ok(())
}

/// Print the phase banner.
pub fn announce(phase: Phase) {
    println!("==> {}: {}", phase, phase.description());
    if is_dry_run() {
        println!("    (dry run: nothing will be changed)");
    }
}

/// Record completion and print the summary.
pub fn finish(env: &Env, phase: Phase, report: &PipelineReport) -> Result<()> {
    let mut state = load_state(env)?;
    state.mark_done(phase)?;
    state.save()?;
    report.print_summary();
    if report.has_warnings() {
        println!("✓ {} finished with warnings", phase);
    } else {
        println!("✓ {} complete", phase);
    }
    Ok(())
}

/// Run `f` between a snapper pre and post snapshot when snapper manages
/// the root filesystem. The pre number is kept in `.state` until the post
/// snapshot exists, so `labstrap snapshot post` can close an interrupted
/// pair. The post snapshot is taken even when `f` fails.
pub fn with_snapshot_pair<T>(
    env: &Env,
    description: &str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    if is_dry_run() || !snapper::available(env) {
        tracing::debug!("snapper not in use; running without snapshot pair");
        return f();
    }

    let mut state = load_state(env)?;
    if let Some(pending) = state.pending_snapshot()? {
        anyhow::bail!(
            "snapper pre snapshot #{} ('{}') has no post snapshot yet; run `labstrap snapshot post` first",
            pending.number,
            pending.description
        );
    }
    let pre = snapper::create_pre(env, description)?;
    state.set_pending_snapshot(pre, description)?;
    state.save()?;
    println!("  snapper pre snapshot #{}", pre);

    let result = f();

    if let Err(post_err) = snapper::create_post(env, pre, description) {
        let Err(err) = result else {
            return Err(post_err);
        };
        // The step error is what the operator needs; the pair stays pending.
        tracing::error!(pre, "snapper post snapshot failed: {:#}", post_err);
        println!(
            "⚠ snapper post snapshot for #{} failed ({:#}); close it with `labstrap snapshot post`",
            pre, post_err
        );
        return Err(err);
    }
    let mut state = load_state(env)?;
    state.clear_pending_snapshot();
    state.save()?;
    println!("  snapper post snapshot for #{}", pre);
    result
}

/// Re-run the current command through `sudo -E` and return its exit code.
pub fn reexec_with_sudo() -> Result<i32> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
    println!("→ root privileges needed, re-running with sudo");
    tracing::info!(exe = %exe.display(), "re-executing through sudo");
    let status = std::process::Command::new("sudo")
        .arg("-E")
        .arg(&exe)
        .args(&args)
        .status()
        .context("failed to run sudo")?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, ScriptedPrompter, test_env};

    #[test]
    fn test_missing_prerequisite_asks() {
        let (mut env, _dir) = test_env(FakeExec::new());
        env.prompt = Box::new(ScriptedPrompter::with_confirms(&[false]));
        let state = load_state(&env).unwrap();
        let err = check_prerequisites(&env, &state, Phase::Vm).unwrap_err();
        assert_eq!(err.to_string(), "run `labstrap phase1` first");

        env.prompt = Box::new(ScriptedPrompter::with_confirms(&[true]));
        assert!(check_prerequisites(&env, &state, Phase::Vm).is_ok());
    }

    #[test]
    fn test_satisfied_prerequisite_does_not_ask() {
        let (env, _dir) = test_env(FakeExec::new());
        let mut state = load_state(&env).unwrap();
        state.mark_done(Phase::Host).unwrap();
        check_prerequisites(&env, &state, Phase::Vm).unwrap();
        check_prerequisites(&env, &state, Phase::Client).unwrap();
    }

    #[test]
    fn test_snapshot_pair_brackets_the_work() {
        let exec = FakeExec::new()
            .ok("snapper list-configs", "Config | Subvolume\n-------+---------\nroot   | /\n")
            .ok("snapper -c root create --type pre", "12\n")
            .ok("snapper -c root create --type post", "");
        let (env, _dir) = test_env(exec.clone());

        let seen = with_snapshot_pair(&env, "labstrap phase1", || {
            let state = load_state(&env)?;
            Ok(state.pending_snapshot()?.map(|p| p.number))
        })
        .unwrap();
        assert_eq!(seen, Some(12));
        assert!(exec.ran("snapper -c root create --type post --pre-number 12"));
        assert_eq!(load_state(&env).unwrap().pending_snapshot().unwrap(), None);
    }

    #[test]
    fn test_snapshot_pair_closes_after_failure() {
        let exec = FakeExec::new()
            .ok("snapper list-configs", "root | /\n")
            .ok("snapper -c root create --type pre", "3\n")
            .ok("snapper -c root create --type post", "");
        let (env, _dir) = test_env(exec.clone());
        let result: Result<()> = with_snapshot_pair(&env, "x", || anyhow::bail!("boom"));
        assert!(result.is_err());
        assert!(exec.ran("snapper -c root create --type post --pre-number 3"));
    }

    #[test]
    fn test_step_error_survives_failed_post_snapshot() {
        let exec = FakeExec::new()
            .ok("snapper list-configs", "root | /\n")
            .ok("snapper -c root create --type pre", "8\n")
            .fail("snapper -c root create --type post");
        let (env, _dir) = test_env(exec.clone());

        let result: Result<()> =
            with_snapshot_pair(&env, "x", || anyhow::bail!("libvirtd would not start"));
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "libvirtd would not start");
        assert!(exec.ran("snapper -c root create --type post --pre-number 8"));
        let pending = load_state(&env).unwrap().pending_snapshot().unwrap();
        assert_eq!(pending.map(|p| p.number), Some(8));
    }

    #[test]
    fn test_failed_post_snapshot_fails_successful_work() {
        let exec = FakeExec::new()
            .ok("snapper list-configs", "root | /\n")
            .ok("snapper -c root create --type pre", "9\n")
            .fail("snapper -c root create --type post");
        let (env, _dir) = test_env(exec);
        assert!(with_snapshot_pair(&env, "x", || Ok(())).is_err());
    }

    #[test]
    fn test_no_snapper_runs_plainly() {
        let (env, _dir) = test_env(FakeExec::new());
        assert_eq!(with_snapshot_pair(&env, "x", || Ok(5)).unwrap(), 5);
    }
}
