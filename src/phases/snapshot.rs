//! `labstrap snapshot`: manual snapper pre/post pairs around host changes.
//!
//! The pre number lives in `.state` until `post` closes the pair, the same
//! bookkeeping phase 1 uses, so an interrupted phase can be closed by hand.

use super::load_state;
use crate::env::Env;
use crate::error::LabError;
use crate::exec::is_dry_run;
use crate::tools::snapper;
use anyhow::Result;

fn require_snapper(env: &Env) -> Result<()> {
    if snapper::available(env) {
        Ok(())
    } else {
        Err(LabError::config("snapper has no 'root' config; nothing to snapshot").into())
    }
}

/// `labstrap snapshot pre DESC`
pub fn pre(env: &Env, description: &str) -> Result<()> {
    let mut state = load_state(env)?;
    if let Some(pending) = state.pending_snapshot()? {
        return Err(LabError::state(format!(
            "pre snapshot #{} ('{}') is still open; run `labstrap snapshot post` first",
            pending.number, pending.description
        ))
        .into());
    }
    require_snapper(env)?;
    if is_dry_run() {
        println!("  [dry-run] would create snapper pre snapshot '{}'", description);
        return Ok(());
    }
    let number = snapper::create_pre(env, description)?;
    state.set_pending_snapshot(number, description)?;
    state.save()?;
    println!("✓ pre snapshot #{} ('{}')", number, description);
    Ok(())
}

/// `labstrap snapshot post`
pub fn post(env: &Env) -> Result<()> {
    let mut state = load_state(env)?;
    let Some(pending) = state.pending_snapshot()? else {
        return Err(LabError::state("no open pre snapshot").into());
    };
    require_snapper(env)?;
    snapper::create_post(env, pending.number, &pending.description)?;
    state.clear_pending_snapshot();
    state.save()?;
    println!("✓ post snapshot for #{}", pending.number);
    Ok(())
}

/// `labstrap snapshot status`
pub fn status(env: &Env) -> Result<()> {
    match load_state(env)?.pending_snapshot()? {
        Some(p) => println!("open pre snapshot #{} ('{}')", p.number, p.description),
        None => println!("no open pre snapshot"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, test_env};

    fn snapper_exec() -> FakeExec {
        FakeExec::new()
            .ok("snapper list-configs", "root | /\n")
            .ok("snapper -c root create --type pre", "41\n")
            .ok("snapper -c root create --type post", "")
    }

    #[test]
    fn test_pre_then_post() {
        let exec = snapper_exec();
        let (env, _dir) = test_env(exec.clone());

        pre(&env, "before grub edit").unwrap();
        let pending = load_state(&env).unwrap().pending_snapshot().unwrap().unwrap();
        assert_eq!(pending.number, 41);
        assert_eq!(pending.description, "before grub edit");

        let err = pre(&env, "again").unwrap_err();
        assert!(err.to_string().contains("#41"));

        post(&env).unwrap();
        assert!(exec.ran("snapper -c root create --type post --pre-number 41"));
        assert_eq!(load_state(&env).unwrap().pending_snapshot().unwrap(), None);
        status(&env).unwrap();
    }

    #[test]
    fn test_post_without_pre() {
        let (env, _dir) = test_env(snapper_exec());
        let err = post(&env).unwrap_err();
        assert_eq!(err.to_string(), "State error: no open pre snapshot");
    }

    #[test]
    fn test_pre_without_snapper() {
        let (env, _dir) = test_env(FakeExec::new());
        assert!(pre(&env, "x").is_err());
        assert_eq!(load_state(&env).unwrap().pending_snapshot().unwrap(), None);
    }
}
