//! `labstrap check`: read-only status report.

use super::load_state;
use super::vm::{ssh_target, vm_address};
use crate::env::Env;
use crate::host::{DEFAULT_GPU_PCI, HostFacts};
use crate::pipeline::Phase;
use crate::platform::Platform;
use crate::state::PendingSnapshot;
use crate::tools::libvirt::{self, DomainState};
use crate::tools::{cloudflared, ssh, systemd};
use crate::vm_config::VmConfigStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub host: HostFacts,
    pub services: Services,
    pub phases: Vec<PhaseStatus>,
    pub reboot_required: bool,
    pub pending_snapshot: Option<PendingSnapshot>,
    pub last_config: Option<String>,
    pub vms: Vec<VmStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Services {
    pub libvirtd: bool,
    pub cloudflared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub phase: String,
    pub done: bool,
    /// Unix seconds of the last completion
    pub done_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub name: String,
    pub domain: DomainState,
    pub ip: Option<Ipv4Addr>,
    pub ssh: bool,
    pub platform: Option<Platform>,
    /// Validation problems, or why the record could not be read
    pub problems: Vec<String>,
}

impl CheckReport {
    /// Gather the report. Runs only read-only commands.
    pub fn collect(env: &Env) -> Result<Self> {
        let state = load_state(env)?;
        let store = VmConfigStore::new(env.paths.vm_dir());

        let mut vms = Vec::new();
        for name in store.list()? {
            vms.push(match store.load(&name) {
                Ok(cfg) => {
                    let domain = libvirt::domain_state(env, &cfg.name);
                    let ip = match domain {
                        DomainState::Missing => cfg.ip,
                        _ => vm_address(env, &cfg),
                    };
                    let ssh = domain == DomainState::Running
                        && ip.is_some_and(|ip| ssh::probe(env, &ssh_target(env, &cfg, ip)));
                    VmStatus {
                        problems: cfg.problems(),
                        platform: Some(cfg.platform),
                        name,
                        domain,
                        ip,
                        ssh,
                    }
                }
                Err(e) => VmStatus {
                    name,
                    domain: DomainState::Missing,
                    ip: None,
                    ssh: false,
                    platform: None,
                    problems: vec![e.to_string()],
                },
            });
        }

        Ok(Self {
            host: HostFacts::detect(env, DEFAULT_GPU_PCI),
            services: Services {
                libvirtd: systemd::is_active(env, "libvirtd"),
                cloudflared: systemd::is_active(env, cloudflared::SERVICE_UNIT),
            },
            phases: Phase::all()
                .into_iter()
                .map(|phase| PhaseStatus {
                    phase: phase.to_string(),
                    done: state.is_done(phase),
                    done_at: state.done_at(phase),
                })
                .collect(),
            reboot_required: state.reboot_required(),
            pending_snapshot: state.pending_snapshot()?,
            last_config: state.last_config().map(str::to_string),
            vms,
        })
    }

    pub fn print(&self) {
        let mark = |ok: bool| if ok { "✓" } else { "✗" };
        let host = &self.host;

        println!("Host");
        println!(
            "  distro        {}",
            host.distro
                .as_ref()
                .map_or("unknown", |d| d.pretty_name.as_str())
        );
        println!(
            "  cpu           {} (virtualization {})",
            host.cpu.vendor,
            mark(host.cpu.virtualization)
        );
        println!("  kvm           {}", mark(host.kvm));
        println!("  iommu         {}", mark(host.iommu_active));
        match &host.sriov {
            Some(dev) => println!(
                "  sr-iov        {} ({}/{} VFs)",
                dev.pci, dev.num_vfs, dev.total_vfs
            ),
            None => println!("  sr-iov        none"),
        }
        println!("  libvirtd      {}", mark(self.services.libvirtd));
        println!("  cloudflared   {}", mark(self.services.cloudflared));

        println!("Phases");
        for p in &self.phases {
            println!("  {:<13} {}", p.phase, mark(p.done));
        }
        if self.reboot_required {
            println!("  ⚠ reboot required to apply kernel parameters");
        }
        if let Some(pending) = &self.pending_snapshot {
            println!(
                "  ⚠ snapper pre snapshot #{} ('{}') has no post; run `labstrap snapshot post`",
                pending.number, pending.description
            );
        }

        println!("VMs");
        if self.vms.is_empty() {
            println!("  none (run `labstrap phase2`)");
        }
        for vm in &self.vms {
            let last = self.last_config.as_deref() == Some(vm.name.as_str());
            println!(
                "  {}{}: {}, ip {}, ssh {}",
                vm.name,
                if last { " (last)" } else { "" },
                vm.domain,
                vm.ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
                mark(vm.ssh)
            );
            for problem in &vm.problems {
                println!("    ⚠ {}", problem);
            }
        }
    }
}

/// `labstrap check`
pub fn run(env: &Env, json: bool) -> Result<()> {
    let report = CheckReport::collect(env)?;
    if json {
        let text = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{}", text);
    } else {
        report.print();
    }
    Ok(())
}
