//! labstrap library
//!
//! Idempotent bootstrap of a home-lab KVM workstation, in phases:
//! host setup (IOMMU, SR-IOV GPU, libvirt), a Cloudflare tunnel for SSH,
//! client SSH config, VM provisioning with cloud-init, and guest setup.

pub mod cli;
pub mod cloudinit;
pub mod env;
pub mod error;
pub mod exec;
pub mod host;
pub mod kvconf;
pub mod logging;
pub mod phases;
pub mod pipeline;
pub mod platform;
pub mod poll;
pub mod process_guard;
pub mod prompt;
pub mod stage2;
pub mod state;
pub mod tools;
pub mod vm_config;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use env::{Env, Paths};
pub use error::LabError;
pub use exec::{Cmd, CmdOutput, Exec, SystemExec, disable_dry_run, enable_dry_run, is_dry_run};
pub use pipeline::{Phase, Pipeline, PipelineReport, Step, StepContext, StepStatus};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use state::StateFile;
pub use vm_config::{VmConfig, VmConfigStore};
