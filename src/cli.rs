use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// labstrap - Idempotent bootstrap for a home-lab KVM workstation
#[derive(Parser, Debug)]
#[command(name = "labstrap")]
#[command(about = "Idempotent bootstrap for a home-lab KVM workstation")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Destructive commands and file writes are logged and skipped.
    /// Read-only probes (virsh domstate, ssh true) still run so the
    /// preview reflects the real machine.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Accept defaults for every prompt, including destructive steps
    #[arg(short = 'y', long = "yes", global = true)]
    pub yes: bool,

    /// More log output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding generated-vm/ and .state
    #[arg(long, env = "LABSTRAP_DIR", global = true, default_value = ".")]
    pub workdir: PathBuf,

    /// Prefix for /etc, /proc and /sys access
    #[arg(long, global = true, default_value = "/", hide = true)]
    pub sysroot: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Phase 1: packages, IOMMU, SR-IOV GPU and libvirt on the host
    Phase1 {
        /// Skip the i915 SR-IOV driver and virtual functions
        #[arg(long)]
        skip_sriov: bool,
        /// Number of GPU virtual functions to create
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..=7))]
        vfs: u32,
        /// PCI address of the GPU
        #[arg(long, default_value = "0000:00:02.0")]
        gpu: String,
    },
    /// Cloudflare tunnel on the host
    Cloudflared {
        #[command(subcommand)]
        action: TunnelCommands,
    },
    /// Phase 1 on the operator's machine: SSH through Cloudflare Access
    #[command(name = "phase1-client")]
    Phase1Client {
        /// Public SSH hostname of the host tunnel
        #[arg(long)]
        hostname: String,
        /// Host alias in ~/.ssh/config
        #[arg(long)]
        alias: Option<String>,
        /// Remote login user
        #[arg(long)]
        user: Option<String>,
    },
    /// Phase 2: create and configure a VM
    Phase2 {
        #[command(flatten)]
        select: SelectArgs,
    },
    /// Phase 3: tunnel and container platform inside the VM
    Phase3 {
        #[command(flatten)]
        select: SelectArgs,
        /// Container platform to install
        #[arg(long, value_parser = ["coolify", "dokploy", "zeabur", "none"], ignore_case = true)]
        platform: Option<String>,
        /// File holding the Cloudflare tunnel token
        #[arg(long)]
        token_file: Option<PathBuf>,
    },
    /// Report host, phase and VM status without changing anything
    Check {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Inspect VM records
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Manual snapper pre/post pairs
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommands,
    },
}

/// Which VM record phase 2 and 3 act on
#[derive(Args, Debug, Default)]
pub struct SelectArgs {
    /// VM record name (generated-vm/NAME.conf)
    #[arg(long, conflicts_with = "new")]
    pub config: Option<String>,
    /// Create a new record interactively
    #[arg(long)]
    pub new: bool,
}

#[derive(Subcommand, Debug)]
pub enum TunnelCommands {
    /// Install, log in, create the tunnel and route SSH to this host
    Setup {
        /// Tunnel name
        #[arg(long)]
        tunnel: Option<String>,
        /// Public hostname for SSH
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Expose a local port through the tunnel
    AddPort {
        /// Local port (1-65535)
        port: u32,
        /// Public hostname for the port
        #[arg(long)]
        hostname: Option<String>,
        /// Tunnel to route DNS through
        #[arg(long)]
        tunnel: Option<String>,
    },
    /// Show the tunnel's ingress rules
    List,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// List VM records
    List,
    /// Print a record's settings
    Show { name: String },
    /// Check a record for problems
    Validate { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Create a pre snapshot
    Pre {
        /// Snapshot description
        description: String,
    },
    /// Close the open pair with a post snapshot
    Post,
    /// Show the open pre snapshot, if any
    Status,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_phase1() {
        let cli = Cli::try_parse_from(["labstrap", "phase1", "--skip-sriov"]).unwrap();
        match cli.command {
            Commands::Phase1 {
                skip_sriov,
                vfs,
                gpu,
            } => {
                assert!(skip_sriov);
                assert_eq!(vfs, 7);
                assert_eq!(gpu, "0000:00:02.0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_vfs_range() {
        assert!(Cli::try_parse_from(["labstrap", "phase1", "--vfs", "3"]).is_ok());
        assert!(Cli::try_parse_from(["labstrap", "phase1", "--vfs", "0"]).is_err());
        assert!(Cli::try_parse_from(["labstrap", "phase1", "--vfs", "8"]).is_err());
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "labstrap", "check", "--json", "--dry-run", "-vv", "-y", "--workdir", "/tmp/lab",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert!(cli.yes);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.workdir, PathBuf::from("/tmp/lab"));
        assert!(matches!(cli.command, Commands::Check { json: true }));
    }

    #[test]
    fn test_cli_add_port() {
        let cli = Cli::try_parse_from([
            "labstrap",
            "cloudflared",
            "add-port",
            "8000",
            "--hostname",
            "app.example.com",
        ])
        .unwrap();
        match cli.command {
            Commands::Cloudflared {
                action: TunnelCommands::AddPort { port, hostname, .. },
            } => {
                assert_eq!(port, 8000);
                assert_eq!(hostname.as_deref(), Some("app.example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["labstrap", "cloudflared", "add-port", "http"]).is_err());
    }

    #[test]
    fn test_cli_phase_selection() {
        let cli = Cli::try_parse_from(["labstrap", "phase2", "--config", "dev"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Phase2 { select: SelectArgs { config: Some(ref c), new: false } } if c == "dev"
        ));
        assert!(Cli::try_parse_from(["labstrap", "phase2", "--config", "dev", "--new"]).is_err());
    }

    #[test]
    fn test_cli_phase3_platform() {
        let cli =
            Cli::try_parse_from(["labstrap", "phase3", "--platform", "Coolify"]).unwrap();
        match cli.command {
            Commands::Phase3 { platform, .. } => {
                assert_eq!(platform.as_deref().map(str::to_lowercase).as_deref(), Some("coolify"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["labstrap", "phase3", "--platform", "heroku"]).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["labstrap"]).is_err());
        assert!(Cli::try_parse_from(["labstrap", "config", "show"]).is_err());
        assert!(Cli::try_parse_from(["labstrap", "snapshot", "pre", "before upgrade"]).is_ok());
    }
}
