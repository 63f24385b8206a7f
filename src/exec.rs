//! External command execution.
//!
//! Every third-party CLI call (`virsh`, `ssh`, `cloudflared`, `apt-get`, …)
//! is described by a [`Cmd`] value and run through the [`Exec`] trait. The
//! production implementation, [`SystemExec`], spawns children in their own
//! process group and registers them with the [`ChildRegistry`] so a Ctrl-C
//! cleans them up. Tests substitute their own `Exec` and never touch the
//! host.
//!
//! # Dry run
//!
//! With `--dry-run`, commands marked [`Cmd::destructive`] are printed and
//! skipped, returning a successful empty output. Read-only probes still run
//! so the preview reflects the real host.

use crate::error::LabError;
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Turn on dry-run mode for the rest of the process.
pub fn enable_dry_run() {
    DRY_RUN.store(true, Ordering::SeqCst);
}

/// Turn dry-run mode off again.
pub fn disable_dry_run() {
    DRY_RUN.store(false, Ordering::SeqCst);
}

/// Whether destructive commands and file writes should be skipped.
pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Capture stdout and stderr.
    #[default]
    Capture,
    /// Capture, and echo stdout lines to the terminal as they arrive.
    Stream,
    /// Inherit the terminal (login flows, key generation prompts). The
    /// child stays in our process group so it can read the TTY.
    Interactive,
}

/// A command line to run, plus how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    destructive: bool,
    mode: IoMode,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            destructive: false,
            mode: IoMode::Capture,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `data` to the child's stdin.
    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Mark the command as changing the system (skipped under dry run).
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub fn stream(mut self) -> Self {
        self.mode = IoMode::Stream;
        self
    }

    pub fn interactive(mut self) -> Self {
        self.mode = IoMode::Interactive;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// Program and arguments joined with spaces, quoting where needed.
    /// Used for logs, dry-run output and fake lookups in tests.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(display_word)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

fn display_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Output from a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Standard output (empty in interactive mode).
    pub stdout: String,
    /// Standard error (empty in interactive mode).
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited with code 0.
    pub success: bool,
}

impl CmdOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Return an error unless the command succeeded.
    pub fn ensure_success(&self, cmd: &Cmd) -> std::result::Result<(), LabError> {
        if self.success {
            Ok(())
        } else {
            Err(LabError::Command {
                command: cmd.command_line(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Something that can run a [`Cmd`].
pub trait Exec {
    /// Run the command. `Err` means it could not be started at all; a
    /// non-zero exit is reported through [`CmdOutput::success`].
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Run and require exit code 0, returning stdout.
    fn run_ok(&self, cmd: &Cmd) -> Result<String> {
        let out = self.run(cmd)?;
        out.ensure_success(cmd)?;
        Ok(out.stdout)
    }

    /// Run a probe: true only if it could be started and exited 0.
    fn succeeds(&self, cmd: &Cmd) -> bool {
        match self.run(cmd) {
            Ok(out) => out.success,
            Err(e) => {
                debug!("probe `{}` could not run: {:#}", cmd, e);
                false
            }
        }
    }
}

/// Runs commands on the local system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExec;

impl Exec for SystemExec {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        if cmd.is_destructive() && is_dry_run() {
            info!("dry-run: skipping `{}`", cmd);
            println!("  [dry-run] {}", cmd);
            return Ok(CmdOutput::ok(""));
        }

        debug!(mode = ?cmd.mode(), "exec `{}`", cmd);

        let mut command = Command::new(cmd.program());
        command.args(cmd.arguments());
        for (key, value) in cmd.env_vars() {
            command.env(key, value);
        }

        if cmd.mode() == IoMode::Interactive {
            let status = command
                .status()
                .with_context(|| format!("failed to run `{}`", cmd.program()))?;
            return Ok(CmdOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: status.code(),
                success: status.success(),
            });
        }

        command
            .stdin(if cmd.stdin_data().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", cmd.program()))?;
        let pid = child.id();
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let stdin_writer = match (child.stdin.take(), cmd.stdin_data()) {
            (Some(mut pipe), Some(data)) => {
                let data = data.to_string();
                Some(std::thread::spawn(move || {
                    // The child may exit before reading everything; that is
                    // reported through its exit status instead.
                    let _ = pipe.write_all(data.as_bytes());
                }))
            }
            _ => None,
        };

        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let mut stdout = String::new();
        if let Some(pipe) = child.stdout.take() {
            if cmd.mode() == IoMode::Stream {
                for line in BufReader::new(pipe).lines().map_while(|l| l.ok()) {
                    println!("  │ {}", line);
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
            } else {
                let mut pipe = pipe;
                pipe.read_to_string(&mut stdout)
                    .with_context(|| format!("failed reading output of `{}`", cmd.program()))?;
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("failed waiting for `{}`", cmd.program()))?;

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }
        if let Some(handle) = stdin_writer {
            let _ = handle.join();
        }
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            debug!(code = ?status.code(), "`{}` failed: {}", cmd, stderr.trim());
        }

        Ok(CmdOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            success: status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes_only_when_needed() {
        let cmd = Cmd::new("ssh")
            .args(["-o", "BatchMode=yes", "ubuntu@10.0.0.5"])
            .arg("sudo bash -s")
            .arg("it's");
        assert_eq!(
            cmd.command_line(),
            "ssh -o BatchMode=yes ubuntu@10.0.0.5 'sudo bash -s' 'it'\\''s'"
        );
    }

    #[test]
    fn test_builder_flags() {
        let cmd = Cmd::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .destructive()
            .stream();
        assert!(cmd.is_destructive());
        assert_eq!(cmd.mode(), IoMode::Stream);
        assert_eq!(
            cmd.env_vars(),
            &[("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
        );
    }

    #[test]
    fn test_ensure_success() {
        let cmd = Cmd::new("virsh").args(["start", "dev"]);
        assert!(CmdOutput::ok("").ensure_success(&cmd).is_ok());
        let err = CmdOutput::failed(1, "error: domain not found\n")
            .ensure_success(&cmd)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "`virsh start dev` failed (exit code 1): error: domain not found"
        );
    }

    #[test]
    fn test_system_exec_captures_output() {
        let out = SystemExec
            .run(&Cmd::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
    }

    #[test]
    fn test_system_exec_feeds_stdin() {
        let out = SystemExec
            .run(&Cmd::new("sh").arg("-s").stdin("echo from-stdin\n"))
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "from-stdin");
    }

    #[test]
    fn test_missing_program_is_error_and_probe_false() {
        let cmd = Cmd::new("labstrap-definitely-not-a-binary");
        assert!(SystemExec.run(&cmd).is_err());
        assert!(!SystemExec.succeeds(&cmd));
    }
}
