//! vzctl: create, boot and manage Linux VMs on macOS Virtualization.framework.
//!
//! Every subcommand is a short-lived process that goes through the lifecycle
//! controller. The hidden `host` subcommand is the long-lived process that
//! owns one running VM; `start` spawns it.

use std::io::{BufRead, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use vzctl::config::Settings;
use vzctl::logging;
use vzctl::paths::{AppPaths, VmLayout};
use vzctl::protocol::RuntimeState;
use vzctl::VmError;
use vzctl::vm::controller::ProcessLauncher;
use vzctl::vm::{self, Controller, DescriptorInputs, GIB, descriptor, host};

/// Manage Linux VMs on macOS Virtualization.framework
#[derive(Parser, Debug)]
#[command(name = "vzctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check whether this host can run VMs
    Check,

    /// Create a new VM
    Create {
        name: String,
        /// Virtual CPUs
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=32))]
        cpu: u32,
        /// Memory in GiB
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..=128))]
        memory: u64,
        /// Disk size in GiB
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..=1000))]
        disk: u64,
        /// Installer ISO to attach as read-only boot media
        #[arg(long)]
        iso: Option<PathBuf>,
        /// Public key to authorize instead of generating a key pair
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// Build a cloud-init bundle for an unattended install
        #[arg(long)]
        auto_install: bool,
    },

    /// List VMs and their state
    List,

    /// Boot a VM
    Start {
        name: String,
        /// Return once the boot was accepted instead of waiting for Running
        #[arg(long)]
        detach: bool,
    },

    /// Stop a VM
    Stop {
        name: String,
        /// Power off immediately instead of asking the guest
        #[arg(long)]
        force: bool,
    },

    /// Show a VM's state
    Status { name: String },

    /// Delete a stopped VM and all of its files
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Open an SSH session to a running VM
    Ssh {
        name: String,
        #[arg(long)]
        user: Option<String>,
        /// Private key to use instead of the VM's generated key
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Print a VM's IP address
    Ip { name: String },

    /// Run the host process for one VM (spawned by `start`)
    #[command(hide = true)]
    Host {
        name: String,
        #[arg(long)]
        vm_root: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = AppPaths::resolve().context("HOME is not set")?;
    paths.ensure().context("create vzctl directories")?;
    let mut settings = Settings::load(&paths)?;

    let _log_guard = match &cli.command {
        Cmd::Host { name, vm_root } => {
            if let Some(root) = vm_root {
                settings.vm_root = Some(root.clone());
            }
            logging::init_host(&paths.logs, name)
        }
        _ => logging::init(&paths.logs),
    };
    debug!(vm_root = %settings.vm_root().display(), "Settings loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("create Tokio runtime")?;
    let result = runtime.block_on(dispatch(cli.command, settings, &paths));
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    result
}

async fn dispatch(command: Cmd, settings: Settings, paths: &AppPaths) -> Result<()> {
    let launcher = ProcessLauncher::new(settings.vm_root()).with_log_dir(paths.logs.clone());
    let controller = Controller::new(settings.clone()).with_launcher(Arc::new(launcher));
    match command {
        Cmd::Host { name, .. } => {
            descriptor::validate_name(&name)?;
            let layout = VmLayout::new(&settings.vm_root(), &name);
            host::run(layout, &settings).await?;
        }

        Cmd::Check => {
            let report = vm::check_support(controller.settings().vfkit.binary.as_deref());
            println!("{}", report.message);
            if !report.supported {
                bail!("this host cannot run VMs");
            }
        }

        Cmd::Create {
            name,
            cpu,
            memory,
            disk,
            iso,
            ssh_key,
            auto_install,
        } => {
            let mut inputs = DescriptorInputs::new(name, cpu, memory * GIB, disk * GIB);
            inputs.install_iso = iso;
            inputs.auto_install = auto_install;
            if let Some(path) = ssh_key {
                let key = std::fs::read_to_string(&path)
                    .with_context(|| format!("read public key {}", path.display()))?;
                inputs.ssh_public_key = Some(key.trim().to_owned());
            }

            let created = controller.create(&inputs)?;
            println!("Created VM '{}'", created.name);
            println!("  CPUs:    {}", created.cpu_count);
            println!("  Memory:  {} MiB", created.memory_mib());
            println!("  Disk:    {} ({} GiB)", created.disk_path.display(), created.disk_bytes / GIB);
            println!("  MAC:     {}", created.mac_address);
            if let Some(iso) = &created.cloud_init_iso_path {
                println!("  Cloud-init: {}", iso.display());
            }
        }

        Cmd::List => {
            let vms = controller.list().await?;
            if vms.is_empty() {
                println!("No VMs under {}", controller.settings().vm_root().display());
                return Ok(());
            }
            println!("{:<24} {:<16} {:>4} {:>10} {:>8}", "NAME", "STATE", "CPUS", "MEMORY", "DISK");
            for (d, state) in vms {
                println!(
                    "{:<24} {:<16} {:>4} {:>6} MiB {:>4} GiB",
                    d.name,
                    state.to_string(),
                    d.cpu_count,
                    d.memory_mib(),
                    d.disk_bytes / GIB
                );
            }
        }

        Cmd::Start { name, detach } => {
            let state = controller.start(&name, detach).await?;
            match state {
                RuntimeState::Running => println!("VM '{name}' is running"),
                other => println!("VM '{name}' is {other}; check `vzctl status {name}`"),
            }
        }

        Cmd::Stop { name, force } => {
            controller.stop(&name, force).await?;
            println!("VM '{name}' stopped");
        }

        Cmd::Status { name } => {
            let state = controller.status(&name).await?;
            println!("{name}: {state}");
        }

        Cmd::Delete { name, force } => {
            if !force && !confirm(&format!("Delete VM '{name}' and all of its files?"))? {
                println!("Aborted");
                return Ok(());
            }
            controller.delete(&name).await?;
            println!("Deleted VM '{name}'");
        }

        Cmd::Ssh { name, user, key } => {
            let target = controller.ssh_target(&name, user).await?;
            let mut ssh = Command::new("ssh");
            ssh.args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=10",
            ]);
            if let Some(identity) = key.or(target.identity) {
                ssh.arg("-i").arg(identity);
            }
            ssh.arg(format!("{}@{}", target.user, target.ip));
            debug!(?ssh, "exec ssh");
            let err = ssh.exec();
            return Err(anyhow::Error::new(err).context("exec ssh"));
        }

        Cmd::Ip { name } => match controller.ip(&name).await? {
            Some(ip) => println!("{ip}"),
            None => return Err(VmError::AddressNotLeased(name).into()),
        },
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
