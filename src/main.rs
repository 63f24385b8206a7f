//! labstrap - Main entry point

use anyhow::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use labstrap::cli::{Cli, Commands, ConfigCommands, SelectArgs, SnapshotCommands, TunnelCommands};
use labstrap::env::{Env, Paths};
use labstrap::exec::{SystemExec, enable_dry_run};
use labstrap::phases::{self, check, client, config, guest, host, snapshot, tunnel, vm};
use labstrap::pipeline::Phase;
use labstrap::platform::Platform;
use labstrap::prompt::{AssumeYes, InquirePrompter, Prompter};
use labstrap::vm_config::Selection;
use labstrap::{logging, process_guard};

/// Phase whose privilege and pre-flight rules a command follows.
fn phase_of(command: &Commands) -> Option<Phase> {
    match command {
        Commands::Phase1 { .. } => Some(Phase::Host),
        Commands::Cloudflared {
            action: TunnelCommands::List,
        } => None,
        Commands::Cloudflared { .. } => Some(Phase::Tunnel),
        Commands::Phase1Client { .. } => Some(Phase::Client),
        Commands::Phase2 { .. } => Some(Phase::Vm),
        Commands::Phase3 { .. } => Some(Phase::Guest),
        Commands::Check { .. } | Commands::Config { .. } => None,
        Commands::Snapshot { .. } => None,
    }
}

fn needs_root(command: &Commands) -> bool {
    match command {
        Commands::Snapshot {
            action: SnapshotCommands::Pre { .. } | SnapshotCommands::Post,
        } => true,
        other => phase_of(other).is_some_and(Phase::needs_root),
    }
}

/// The operator behind sudo, else the current user.
fn operator() -> Option<String> {
    std::env::var("SUDO_USER")
        .ok()
        .or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.is_empty())
}

/// Home of the operator, so keys and ssh config land in their home and
/// not root's.
fn operator_home() -> PathBuf {
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        match nix::unistd::User::from_name(&sudo_user) {
            Ok(Some(user)) => return user.dir,
            Ok(None) => warn!(user = %sudo_user, "SUDO_USER not found in passwd"),
            Err(e) => warn!(error = %e, "could not look up SUDO_USER"),
        }
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}

fn build_env(cli: &Cli) -> Result<Env> {
    let workdir = if cli.workdir.is_absolute() {
        cli.workdir.clone()
    } else {
        std::env::current_dir()?.join(&cli.workdir)
    };
    let prompt: Box<dyn Prompter> = if cli.yes {
        Box::new(AssumeYes)
    } else {
        Box::new(InquirePrompter)
    };
    Ok(Env {
        exec: Box::new(SystemExec),
        prompt,
        paths: Paths {
            workdir,
            sysroot: cli.sysroot.clone(),
            home: operator_home(),
        },
        assume_yes: cli.yes,
        operator: operator(),
        sleep: std::thread::sleep as fn(Duration),
    })
}

fn selection(select: SelectArgs) -> Selection {
    Selection {
        explicit: select.config,
        create: select.new,
    }
}

fn dispatch(env: &Env, command: Commands) -> Result<()> {
    match command {
        Commands::Phase1 {
            skip_sriov,
            vfs,
            gpu,
        } => host::run(
            env,
            host::HostOptions {
                skip_sriov,
                vfs,
                gpu,
            },
        ),
        Commands::Cloudflared { action } => match action {
            TunnelCommands::Setup { tunnel, hostname } => {
                tunnel::setup(env, tunnel::SetupOptions { tunnel, hostname })
            }
            TunnelCommands::AddPort {
                port,
                hostname,
                tunnel,
            } => tunnel::add_port(
                env,
                tunnel::AddPortOptions {
                    port,
                    hostname,
                    tunnel,
                },
            ),
            TunnelCommands::List => tunnel::list(env),
        },
        Commands::Phase1Client {
            hostname,
            alias,
            user,
        } => client::run(
            env,
            client::ClientOptions {
                hostname,
                alias,
                user,
            },
        ),
        Commands::Phase2 { select } => vm::run(env, selection(select)),
        Commands::Phase3 {
            select,
            platform,
            token_file,
        } => {
            let platform = platform
                .map(|p| Platform::from_str(&p))
                .transpose()
                .map_err(|e| anyhow::anyhow!("invalid platform: {}", e))?;
            guest::run(
                env,
                guest::GuestOptions {
                    selection: selection(select),
                    platform,
                    token_file,
                },
            )
        }
        Commands::Check { json } => check::run(env, json),
        Commands::Config { action } => match action {
            ConfigCommands::List => config::list(env),
            ConfigCommands::Show { name } => config::show(env, &name),
            ConfigCommands::Validate { name } => config::validate(env, &name),
        },
        Commands::Snapshot { action } => match action {
            SnapshotCommands::Pre { description } => snapshot::pre(env, &description),
            SnapshotCommands::Post => snapshot::post(env),
            SnapshotCommands::Status => snapshot::status(env),
        },
    }
}

fn main() {
    let cli = Cli::parse_args();
    logging::init(cli.verbose);
    info!("labstrap starting");

    // Children are killed with us on Ctrl-C
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    if cli.dry_run {
        enable_dry_run();
    }

    if needs_root(&cli.command) && !cli.dry_run && !labstrap::host::is_root() {
        match phases::reexec_with_sudo() {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                error!("{:#}", e);
                eprintln!("✗ {:#}", e);
                std::process::exit(1);
            }
        }
    }

    let result = build_env(&cli).and_then(|env| dispatch(&env, cli.command));
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}
