//! snapper pre/post snapshot pairs on the host root filesystem.

use crate::env::Env;
use crate::exec::Cmd;
use crate::tools::ToolArgs;
use anyhow::{Context, Result};

const SNAPPER_CONFIG: &str = "root";

/// `snapper create` for one half of a pair.
#[derive(Debug, Clone)]
pub enum SnapperCreateArgs {
    Pre { description: String },
    Post { pre_number: u32, description: String },
}

impl ToolArgs for SnapperCreateArgs {
    fn program(&self) -> &'static str {
        "snapper"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            SNAPPER_CONFIG.to_string(),
            "create".to_string(),
        ];
        match self {
            Self::Pre { description } => {
                args.extend([
                    "--type".to_string(),
                    "pre".to_string(),
                    "--print-number".to_string(),
                    "--cleanup-algorithm".to_string(),
                    "number".to_string(),
                    "--description".to_string(),
                    description.clone(),
                ]);
            }
            Self::Post {
                pre_number,
                description,
            } => {
                args.extend([
                    "--type".to_string(),
                    "post".to_string(),
                    "--pre-number".to_string(),
                    pre_number.to_string(),
                    "--cleanup-algorithm".to_string(),
                    "number".to_string(),
                    "--description".to_string(),
                    description.clone(),
                ]);
            }
        }
        args
    }
}

/// Whether `snapper list-configs` output lists the root config.
pub fn configs_include_root(text: &str) -> bool {
    text.lines()
        .filter_map(|line| line.split(['│', '|']).next())
        .any(|cell| cell.trim() == SNAPPER_CONFIG)
}

/// snapper installed and configured for `/`.
pub fn available(env: &Env) -> bool {
    env.run_ok(&Cmd::new("snapper").arg("list-configs"))
        .map(|out| configs_include_root(&out))
        .unwrap_or(false)
}

/// Create the "pre" snapshot and return its number.
pub fn create_pre(env: &Env, description: &str) -> Result<u32> {
    let cmd = SnapperCreateArgs::Pre {
        description: description.to_string(),
    }
    .to_cmd();
    let out = env.run_ok(&cmd)?;
    out.trim()
        .parse()
        .with_context(|| format!("snapper printed no snapshot number: '{}'", out.trim()))
}

pub fn create_post(env: &Env, pre_number: u32, description: &str) -> Result<()> {
    let cmd = SnapperCreateArgs::Post {
        pre_number,
        description: description.to_string(),
    }
    .to_cmd();
    env.run_ok(&cmd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, test_env};

    #[test]
    fn test_list_configs_detection() {
        let unicode = "Config │ Subvolume\n───────┼──────────\nroot   │ /\n";
        let ascii = "Config | Subvolume\n-------+----------\nhome   | /home\n";
        assert!(configs_include_root(unicode));
        assert!(!configs_include_root(ascii));
    }

    #[test]
    fn test_pre_returns_number() {
        let exec = FakeExec::new().ok("snapper -c root create --type pre", "57\n");
        let (env, _dir) = test_env(exec.clone());
        assert_eq!(create_pre(&env, "labstrap phase1").unwrap(), 57);
        assert!(exec.calls()[0].ends_with("--description 'labstrap phase1'"));
    }

    #[test]
    fn test_post_references_pre() {
        let exec = FakeExec::new().ok("snapper", "");
        let (env, _dir) = test_env(exec.clone());
        create_post(&env, 57, "labstrap phase1").unwrap();
        assert!(exec.calls()[0].contains("--type post --pre-number 57"));
    }

    #[test]
    fn test_pre_without_number_is_error() {
        let exec = FakeExec::new().ok("snapper", "");
        let (env, _dir) = test_env(exec);
        assert!(create_pre(&env, "x").is_err());
    }
}
