//! Phases and the idempotent step runner.
//!
//! Each phase is an ordered list of [`Step`]s. A step first checks whether
//! its effect is already in place and is skipped if so, which is what makes
//! re-running a phase safe:
//!
//! ```text
//! for each step:
//!     is_done?            → Skipped
//!     destructive?        → ask (declining stops the phase)
//!     apply               → Applied | Warned(hint) | Err (hard stop)
//! ```
//!
//! Failures come in two kinds. `Err` is a hard stop: nothing after the
//! failing step runs. `Warned` means the step could not finish on its own
//! and the operator has to do something by hand; the phase carries on.

use crate::env::Env;
use anyhow::{Context, Result};
use std::fmt;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

/// Independently invocable phases, in the order they are normally run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
#[repr(u8)]
pub enum Phase {
    /// Host packages, IOMMU, SR-IOV, libvirt
    #[strum(serialize = "phase1")]
    Host = 1,
    /// Cloudflare tunnel on the host
    #[strum(serialize = "cloudflared")]
    Tunnel = 2,
    /// Operator laptop: SSH through the tunnel
    #[strum(serialize = "phase1-client")]
    Client = 3,
    /// VM creation and second-stage configuration
    #[strum(serialize = "phase2")]
    Vm = 4,
    /// Guest tunnel and container platform
    #[strum(serialize = "phase3")]
    Guest = 5,
}

impl Phase {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Human-readable description
    pub const fn description(self) -> &'static str {
        match self {
            Self::Host => "Host setup (packages, IOMMU, SR-IOV, libvirt)",
            Self::Tunnel => "Cloudflare tunnel on the host",
            Self::Client => "Client SSH access through the tunnel",
            Self::Vm => "VM provisioning",
            Self::Guest => "Guest tunnel and container platform",
        }
    }

    /// Completion flag key in the `.state` file
    pub const fn state_key(self) -> &'static str {
        match self {
            Self::Host => "PHASE1_DONE",
            Self::Tunnel => "CLOUDFLARED_DONE",
            Self::Client => "PHASE1_CLIENT_DONE",
            Self::Vm => "PHASE2_DONE",
            Self::Guest => "PHASE3_DONE",
        }
    }

    /// Phases that should have completed before this one
    pub const fn prerequisites(self) -> &'static [Phase] {
        match self {
            Self::Vm => &[Self::Host],
            Self::Guest => &[Self::Vm],
            Self::Host | Self::Tunnel | Self::Client => &[],
        }
    }

    /// Whether the phase has to run as root on the host
    pub const fn needs_root(self) -> bool {
        !matches!(self, Self::Client)
    }

    pub fn all() -> Vec<Phase> {
        Phase::iter().collect()
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Effect already present (or step not applicable); nothing ran.
    Skipped,
    /// The step made its change.
    Applied,
    /// The step could not complete automatically; the message says what to
    /// do by hand.
    Warned(String),
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "already done"),
            Self::Applied => write!(f, "done"),
            Self::Warned(msg) => write!(f, "needs attention: {}", msg),
        }
    }
}

/// Record of one step run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: &'static str,
    pub status: StepStatus,
    /// Unix timestamp when the step finished
    pub finished_at: u64,
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub phase: Phase,
    pub records: Vec<StepRecord>,
}

impl PipelineReport {
    pub fn has_warnings(&self) -> bool {
        self.records
            .iter()
            .any(|r| matches!(r.status, StepStatus::Warned(_)))
    }

    pub fn warnings(&self) -> Vec<(&'static str, &str)> {
        self.records
            .iter()
            .filter_map(|r| match &r.status {
                StepStatus::Warned(msg) => Some((r.name, msg.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn applied(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == StepStatus::Applied)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == StepStatus::Skipped)
            .count()
    }

    /// Print the end-of-phase summary.
    pub fn print_summary(&self) {
        println!();
        println!(
            "{}: {} applied, {} already done, {} need attention",
            self.phase,
            self.applied(),
            self.skipped(),
            self.warnings().len()
        );
        for (name, msg) in self.warnings() {
            println!("  ⚠ {}: {}", name, msg);
        }
    }
}

/// Hard stops raised by the runner itself (step errors are wrapped with
/// `anyhow` context instead).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("step '{step}' aborted by operator")]
    Declined { step: &'static str },
}

/// Anything that carries an [`Env`].
pub trait StepContext {
    fn env(&self) -> &Env;
}

/// One idempotent unit of work.
pub trait Step<C> {
    /// Short identifier, shown in summaries
    fn name(&self) -> &'static str;

    /// What the step does, shown before it runs
    fn description(&self) -> &'static str;

    /// Steps that rewrite boot config, disks or services ask first
    fn is_destructive(&self) -> bool {
        false
    }

    /// Whether the step's effect is already present
    fn is_done(&self, ctx: &mut C) -> Result<bool>;

    /// Make the change
    fn apply(&self, ctx: &mut C) -> Result<StepStatus>;
}

/// Ordered list of steps for one phase.
pub struct Pipeline<C> {
    phase: Phase,
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: StepContext> Pipeline<C> {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: impl Step<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// - A step's `is_done` or `apply` failed (wrapped with the step name)
    /// - [`PipelineError::Declined`] if the operator refused a destructive step
    pub fn run(&self, ctx: &mut C) -> Result<PipelineReport> {
        tracing::info!(phase = %self.phase, steps = self.steps.len(), "running phase");
        let mut records = Vec::with_capacity(self.steps.len());

        for (idx, step) in self.steps.iter().enumerate() {
            let name = step.name();
            println!("[{}/{}] {}", idx + 1, self.steps.len(), step.description());

            let done = step
                .is_done(ctx)
                .with_context(|| format!("step '{}' could not check its state", name))?;

            let status = if done {
                tracing::debug!(step = name, "already done");
                StepStatus::Skipped
            } else {
                if step.is_destructive() && !ctx.env().assume_yes {
                    let question = format!("{}: continue?", step.description());
                    let proceed = ctx.env().prompt.confirm(&question, false)?;
                    if !proceed {
                        return Err(PipelineError::Declined { step: name }.into());
                    }
                }
                step.apply(ctx)
                    .with_context(|| format!("step '{}' failed", name))?
            };

            match &status {
                StepStatus::Skipped => println!("  ↷ already done"),
                StepStatus::Applied => println!("  ✓ done"),
                StepStatus::Warned(msg) => {
                    tracing::warn!(step = name, "{}", msg);
                    println!("  ⚠ {}", msg);
                }
            }

            records.push(StepRecord {
                name,
                status,
                finished_at: unix_now(),
            });
        }

        Ok(PipelineReport {
            phase: self.phase,
            records,
        })
    }
}

/// Seconds since the Unix epoch (0 if the clock is before it).
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExec, ScriptedPrompter, test_env};
    use std::cell::Cell;

    struct Ctx {
        env: Env,
        counter: Cell<u32>,
    }

    impl StepContext for Ctx {
        fn env(&self) -> &Env {
            &self.env
        }
    }

    struct Counting {
        name: &'static str,
        done: bool,
        destructive: bool,
        outcome: fn() -> Result<StepStatus>,
    }

    impl Step<Ctx> for Counting {
        fn name(&self) -> &'static str {
            self.name
        }
        fn description(&self) -> &'static str {
            "counting step"
        }
        fn is_destructive(&self) -> bool {
            self.destructive
        }
        fn is_done(&self, _ctx: &mut Ctx) -> Result<bool> {
            Ok(self.done)
        }
        fn apply(&self, ctx: &mut Ctx) -> Result<StepStatus> {
            ctx.counter.set(ctx.counter.get() + 1);
            (self.outcome)()
        }
    }

    fn step(name: &'static str, done: bool) -> Counting {
        Counting {
            name,
            done,
            destructive: false,
            outcome: || Ok(StepStatus::Applied),
        }
    }

    fn ctx(prompter: ScriptedPrompter, assume_yes: bool) -> (Ctx, tempfile::TempDir) {
        let (mut env, dir) = test_env(FakeExec::new());
        env.prompt = Box::new(prompter);
        env.assume_yes = assume_yes;
        (
            Ctx {
                env,
                counter: Cell::new(0),
            },
            dir,
        )
    }

    #[test]
    fn test_phase_order_and_keys() {
        let phases = Phase::all();
        assert_eq!(phases.len(), 5);
        for pair in phases.windows(2) {
            assert!(pair[0].order() < pair[1].order());
        }
        assert_eq!(Phase::Vm.state_key(), "PHASE2_DONE");
        assert_eq!(Phase::Guest.prerequisites(), &[Phase::Vm]);
        assert!(!Phase::Client.needs_root());
    }

    #[test]
    fn test_phase_display_roundtrip() {
        for phase in Phase::all() {
            let parsed: Phase = phase.to_string().parse().expect("should parse");
            assert_eq!(parsed, phase);
        }
        assert_eq!(Phase::Client.to_string(), "phase1-client");
    }

    #[test]
    fn test_done_steps_are_skipped() {
        let (mut c, _dir) = ctx(ScriptedPrompter::default(), false);
        let report = Pipeline::new(Phase::Host)
            .step(step("a", true))
            .step(step("b", false))
            .step(step("c", true))
            .run(&mut c)
            .unwrap();
        assert_eq!(c.counter.get(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.records[1].name, "b");
    }

    #[test]
    fn test_error_is_hard_stop() {
        let (mut c, _dir) = ctx(ScriptedPrompter::default(), false);
        let failing = Counting {
            name: "boom",
            done: false,
            destructive: false,
            outcome: || Err(anyhow::anyhow!("exit 1")),
        };
        let err = Pipeline::new(Phase::Host)
            .step(failing)
            .step(step("after", false))
            .run(&mut c)
            .unwrap_err();
        assert_eq!(c.counter.get(), 1, "step after the failure must not run");
        assert!(format!("{:#}", err).contains("step 'boom' failed"));
    }

    #[test]
    fn test_warning_continues() {
        let (mut c, _dir) = ctx(ScriptedPrompter::default(), false);
        let warn = Counting {
            name: "tunnel-id",
            done: false,
            destructive: false,
            outcome: || Ok(StepStatus::Warned("configure manually".into())),
        };
        let report = Pipeline::new(Phase::Tunnel)
            .step(warn)
            .step(step("next", false))
            .run(&mut c)
            .unwrap();
        assert_eq!(c.counter.get(), 2);
        assert!(report.has_warnings());
        assert_eq!(report.warnings(), vec![("tunnel-id", "configure manually")]);
    }

    #[test]
    fn test_destructive_step_declined_stops() {
        let (mut c, _dir) = ctx(ScriptedPrompter::with_confirms(&[false]), false);
        let grub = Counting {
            name: "iommu-cmdline",
            done: false,
            destructive: true,
            outcome: || Ok(StepStatus::Applied),
        };
        let err = Pipeline::new(Phase::Host).step(grub).run(&mut c).unwrap_err();
        assert_eq!(c.counter.get(), 0);
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::Declined {
                step: "iommu-cmdline"
            })
        );
    }

    #[test]
    fn test_destructive_step_not_asked_with_assume_yes_or_when_done() {
        // ScriptedPrompter panics on unexpected questions
        let (mut c, _dir) = ctx(ScriptedPrompter::default(), true);
        let grub = Counting {
            name: "iommu-cmdline",
            done: false,
            destructive: true,
            outcome: || Ok(StepStatus::Applied),
        };
        Pipeline::new(Phase::Host).step(grub).run(&mut c).unwrap();
        assert_eq!(c.counter.get(), 1);

        let (mut c, _dir) = ctx(ScriptedPrompter::default(), false);
        let grub_done = Counting {
            name: "iommu-cmdline",
            done: true,
            destructive: true,
            outcome: || Ok(StepStatus::Applied),
        };
        Pipeline::new(Phase::Host).step(grub_done).run(&mut c).unwrap();
        assert_eq!(c.counter.get(), 0);
    }
}
