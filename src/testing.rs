//! Test doubles for unit tests: a scripted command runner and prompter.

use crate::env::{Env, Paths};
use crate::exec::{Cmd, CmdOutput, Exec};
use crate::prompt::Prompter;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

#[derive(Default)]
struct FakeState {
    rules: Vec<(String, VecDeque<CmdOutput>)>,
    calls: Vec<Cmd>,
}

/// Answers commands from canned outputs keyed by command-line prefix.
///
/// The longest matching prefix wins. A rule with several outputs hands
/// them out in order and then keeps repeating the last one. Unmatched
/// commands fail with exit code 127.
#[derive(Clone, Default)]
pub struct FakeExec {
    state: Rc<RefCell<FakeState>>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn on(self, prefix: &str, output: CmdOutput) -> Self {
        self.on_seq(prefix, vec![output])
    }

    /// Succeed with `stdout` for commands starting with `prefix`.
    pub fn ok(self, prefix: &str, stdout: &str) -> Self {
        self.on(prefix, CmdOutput::ok(stdout))
    }

    /// Fail with exit code 1 for commands starting with `prefix`.
    pub fn fail(self, prefix: &str) -> Self {
        self.on(prefix, CmdOutput::failed(1, "faked failure"))
    }

    pub fn on_seq(self, prefix: &str, outputs: Vec<CmdOutput>) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.rules.retain(|(p, _)| p != prefix);
            state.rules.push((prefix.to_string(), outputs.into()));
        }
        self
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .map(Cmd::command_line)
            .collect()
    }

    /// Commands run so far, with stdin and flags.
    pub fn commands(&self) -> Vec<Cmd> {
        self.state.borrow().calls.clone()
    }

    /// Whether any command line starting with `prefix` was run.
    pub fn ran(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

impl Exec for FakeExec {
    fn run(&self, cmd: &Cmd) -> anyhow::Result<CmdOutput> {
        let line = cmd.command_line();
        let mut state = self.state.borrow_mut();
        state.calls.push(cmd.clone());
        let best = state
            .rules
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        match best {
            Some((_, outputs)) => {
                if outputs.len() > 1 {
                    Ok(outputs.pop_front().unwrap_or_default())
                } else {
                    Ok(outputs.front().cloned().unwrap_or_default())
                }
            }
            None => Ok(CmdOutput::failed(127, format!("not faked: {}", line))),
        }
    }
}

/// Prompter with pre-recorded answers. Panics on an unexpected question.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: RefCell<VecDeque<bool>>,
    texts: RefCell<VecDeque<String>>,
    selects: RefCell<VecDeque<usize>>,
}

impl ScriptedPrompter {
    pub fn with_confirms(answers: &[bool]) -> Self {
        let p = Self::default();
        p.confirms.borrow_mut().extend(answers.iter().copied());
        p
    }

    pub fn texts(self, answers: &[&str]) -> Self {
        self.texts
            .borrow_mut()
            .extend(answers.iter().map(|s| s.to_string()));
        self
    }

    pub fn selects(self, answers: &[usize]) -> Self {
        self.selects.borrow_mut().extend(answers.iter().copied());
        self
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, message: &str, _default: bool) -> crate::error::Result<bool> {
        Ok(self
            .confirms
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected confirm: {}", message)))
    }

    fn text(&self, message: &str, default: Option<&str>) -> crate::error::Result<String> {
        let answer = self
            .texts
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected text prompt: {}", message));
        if answer.is_empty() {
            Ok(default.unwrap_or_default().to_string())
        } else {
            Ok(answer)
        }
    }

    fn select(&self, message: &str, _options: &[String]) -> crate::error::Result<usize> {
        Ok(self
            .selects
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected select: {}", message)))
    }
}

/// An [`Env`] rooted in a fresh temp dir: `work/`, `root/` (sysroot) and
/// `home/`. Sleeping is a no-op.
pub fn test_env(exec: FakeExec) -> (Env, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = Paths {
        workdir: dir.path().join("work"),
        sysroot: dir.path().join("root"),
        home: dir.path().join("home"),
    };
    for p in [&paths.workdir, &paths.sysroot, &paths.home] {
        std::fs::create_dir_all(p).expect("create test dirs");
    }
    let env = Env {
        exec: Box::new(exec),
        prompt: Box::new(ScriptedPrompter::default()),
        paths,
        assume_yes: false,
        operator: Some("lab".to_string()),
        sleep: |_| {},
    };
    (env, dir)
}

/// Write `contents` to an absolute system path under the env's sysroot.
pub fn write_sys(env: &Env, abs: &str, contents: &str) {
    let path = env.paths.sys(abs);
    write_file(&path, contents);
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write test file");
}
