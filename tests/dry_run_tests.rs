//! Dry-run behaviour
//!
//! Dry-run is a process-wide switch, so these tests live in their own test
//! binary and all run with it enabled.

use labstrap::env::{Env, Paths};
use labstrap::exec::{Cmd, CmdOutput, Exec, SystemExec, enable_dry_run, is_dry_run};
use labstrap::phases::{self, client};
use labstrap::pipeline::Phase;
use labstrap::prompt::AssumeYes;
use labstrap::vm_config::{VmConfig, VmConfigStore};
use std::cell::RefCell;
use std::rc::Rc;

/// Answers like `SystemExec` under dry-run without running anything.
#[derive(Clone, Default)]
struct Recorder {
    calls: Rc<RefCell<Vec<Cmd>>>,
}

impl Exec for Recorder {
    fn run(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        self.calls.borrow_mut().push(cmd.clone());
        Ok(CmdOutput::ok(""))
    }
}

fn dry_env(exec: Recorder) -> (Env, tempfile::TempDir) {
    enable_dry_run();
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths {
        workdir: dir.path().join("work"),
        sysroot: dir.path().join("root"),
        home: dir.path().join("home"),
    };
    let env = Env {
        exec: Box::new(exec),
        prompt: Box::new(AssumeYes),
        paths,
        assume_yes: true,
        operator: Some("lab".to_string()),
        sleep: |_| {},
    };
    (env, dir)
}

#[test]
fn test_destructive_commands_are_skipped() {
    enable_dry_run();
    assert!(is_dry_run());
    // `false` would fail if it actually ran.
    let out = SystemExec
        .run(&Cmd::new("false").destructive())
        .unwrap();
    assert!(out.success);
    assert!(out.stdout.is_empty());
}

#[test]
fn test_read_only_commands_still_run() {
    enable_dry_run();
    let out = SystemExec.run(&Cmd::new("echo").arg("probe")).unwrap();
    assert_eq!(out.stdout.trim(), "probe");
}

#[test]
fn test_file_writes_are_skipped() {
    let (env, dir) = dry_env(Recorder::default());
    let target = dir.path().join("work/file.txt");
    env.write_file(&target, "contents").unwrap();
    assert!(!target.exists());

    let store = VmConfigStore::new(env.paths.vm_dir());
    store.save(&VmConfig::default_for("dev")).unwrap();
    assert!(!store.exists("dev"));

    let mut state = phases::load_state(&env).unwrap();
    state.mark_done(Phase::Host).unwrap();
    state.save().unwrap();
    assert!(!env.paths.state_file().exists());
}

#[test]
fn test_client_phase_leaves_home_untouched() {
    let exec = Recorder::default();
    let (env, _dir) = dry_env(exec.clone());

    client::run(
        &env,
        client::ClientOptions {
            hostname: "ssh.example.com".into(),
            alias: None,
            user: None,
        },
    )
    .unwrap();

    let calls: Vec<String> = exec.calls.borrow().iter().map(Cmd::command_line).collect();
    assert!(calls.iter().any(|c| c.starts_with("which")));
    assert!(!env.paths.home.exists(), "dry-run created {}", env.paths.home.display());
    assert!(!env.paths.state_file().exists());
}
