//! `labstrap config`: inspect VM records.

use crate::env::Env;
use crate::error::LabError;
use crate::vm_config::VmConfigStore;
use anyhow::Result;

fn store(env: &Env) -> VmConfigStore {
    VmConfigStore::new(env.paths.vm_dir())
}

/// `labstrap config list`
pub fn list(env: &Env) -> Result<()> {
    let store = store(env);
    let names = store.list()?;
    if names.is_empty() {
        println!("No VM configs in {}", store.dir().display());
        return Ok(());
    }
    for name in names {
        match store.load(&name) {
            Ok(cfg) => println!(
                "{:<16} {} vCPU  {:>6} MB  {:>4} GB  {}",
                name,
                cfg.vcpus,
                cfg.ram_mb,
                cfg.disk_size_gb,
                cfg.ip.map_or_else(|| "dhcp".to_string(), |ip| ip.to_string())
            ),
            Err(e) => println!("{:<16} ⚠ {}", name, e),
        }
    }
    Ok(())
}

/// `labstrap config show NAME`
pub fn show(env: &Env, name: &str) -> Result<()> {
    let cfg = store(env).load(name)?;
    for (key, value) in cfg.to_pairs() {
        println!("{}={}", key, value);
    }
    Ok(())
}

/// `labstrap config validate NAME`: print every problem; error when any.
pub fn validate(env: &Env, name: &str) -> Result<()> {
    let cfg = store(env).load(name)?;
    let problems = cfg.problems();
    if problems.is_empty() {
        println!("✓ {} is valid", name);
        return Ok(());
    }
    for problem in &problems {
        println!("  ✗ {}", problem);
    }
    Err(LabError::validation(format!("{} has {} problem(s)", name, problems.len())).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, test_env, write_file};
    use crate::vm_config::VmConfig;

    #[test]
    fn test_validate() {
        let (env, _dir) = test_env(FakeExec::new());
        store(&env).save(&VmConfig::default_for("dev")).unwrap();
        validate(&env, "dev").unwrap();

        write_file(
            &env.paths.vm_dir().join("tiny.conf"),
            "VM_NAME=\"tiny\"\nVM_RAM_MB=\"256\"\nVM_VCPUS=\"0\"\n",
        );
        let err = validate(&env, "tiny").unwrap_err();
        assert_eq!(err.to_string(), "Validation error: tiny has 2 problem(s)");
    }

    #[test]
    fn test_unknown_record() {
        let (env, _dir) = test_env(FakeExec::new());
        assert!(show(&env, "ghost").is_err());
        assert!(validate(&env, "ghost").is_err());
        list(&env).unwrap();
    }
}
