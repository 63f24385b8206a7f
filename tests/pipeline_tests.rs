//! Pipeline idempotence
//!
//! A second run over steps that have taken effect must skip every step and
//! run no commands.

use labstrap::env::{Env, Paths};
use labstrap::exec::{Cmd, CmdOutput, Exec};
use labstrap::pipeline::{Phase, Pipeline, Step, StepContext, StepStatus};
use labstrap::prompt::AssumeYes;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Clone, Default)]
struct Recorder {
    calls: Rc<RefCell<Vec<String>>>,
}

impl Exec for Recorder {
    fn run(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        self.calls.borrow_mut().push(cmd.command_line());
        Ok(CmdOutput::ok(""))
    }
}

struct Ctx {
    env: Env,
}

impl StepContext for Ctx {
    fn env(&self) -> &Env {
        &self.env
    }
}

/// Writes a file and runs a command the first time.
struct Provision {
    name: &'static str,
    file: PathBuf,
}

impl Step<Ctx> for Provision {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "Provision a file"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn is_done(&self, _ctx: &mut Ctx) -> anyhow::Result<bool> {
        Ok(self.file.is_file())
    }

    fn apply(&self, ctx: &mut Ctx) -> anyhow::Result<StepStatus> {
        ctx.env
            .run_ok(&Cmd::new("install").arg(self.file.display().to_string()).destructive())?;
        ctx.env.write_file(&self.file, self.name)?;
        Ok(StepStatus::Applied)
    }
}

fn pipeline(root: &std::path::Path) -> Pipeline<Ctx> {
    Pipeline::new(Phase::Host)
        .step(Provision {
            name: "first",
            file: root.join("a/first"),
        })
        .step(Provision {
            name: "second",
            file: root.join("b/second"),
        })
}

#[test]
fn test_second_run_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Recorder::default();
    let mut ctx = Ctx {
        env: Env {
            exec: Box::new(exec.clone()),
            prompt: Box::new(AssumeYes),
            paths: Paths {
                workdir: dir.path().to_path_buf(),
                sysroot: dir.path().to_path_buf(),
                home: dir.path().to_path_buf(),
            },
            assume_yes: true,
            operator: None,
            sleep: |_| {},
        },
    };

    let first = pipeline(dir.path()).run(&mut ctx).unwrap();
    assert_eq!(first.applied(), 2);
    assert_eq!(exec.calls.borrow().len(), 2);

    let second = pipeline(dir.path()).run(&mut ctx).unwrap();
    assert_eq!(second.skipped(), 2);
    assert!(second.records.iter().all(|r| r.status == StepStatus::Skipped));
    assert!(!second.has_warnings());
    assert_eq!(exec.calls.borrow().len(), 2, "second run executed commands");
}
