//! CLI surface: `clap`-derived argument parsing and the thin glue that
//! turns flags into a [`ContainerSpec`](crate::types::ContainerSpec) and
//! drives the [`Orchestrator`](crate::orchestrator::Orchestrator).

mod parse;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sudocker_shared::{SudockerError, SudockerResult};

use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::types::{ContainerSpec, Resources};

use parse::{parse_env_assignment, parse_env_file, parse_memory, parse_port, parse_volume};

#[derive(Parser)]
#[command(name = "sudocker", about = "A Docker-like container runtime", version)]
pub struct Cli {
    /// Overrides the user-preferences config directory (`~/.sudocker` by
    /// default).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the persisted-state root (`/var/lib/sudocker` by
    /// default).
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    #[arg(long, global = true)]
    pub debug: bool,

    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create and start a container.
    Run(RunArgs),
    /// Create a container without starting it.
    Create(RunArgs),
    /// Start one or more previously created or stopped containers.
    Start { containers: Vec<String> },
    /// Run a command inside a running container.
    Exec(ExecArgs),
    /// List containers.
    Ps {
        #[arg(short = 'a', long)]
        all: bool,
        #[arg(short = 'q', long)]
        quiet: bool,
        #[arg(long)]
        no_trunc: bool,
    },
    /// Fetch a container's stdio log.
    Logs {
        #[arg(short = 'f', long)]
        follow: bool,
        container: String,
    },
    /// Stop one or more running containers.
    Stop {
        #[arg(short = 't', long, default_value_t = 10)]
        time: u64,
        containers: Vec<String>,
    },
    /// Remove one or more containers.
    Rm {
        #[arg(short = 'f', long)]
        force: bool,
        #[arg(short = 'v', long)]
        volumes: bool,
        containers: Vec<String>,
    },
    /// Snapshot a container's merged rootfs into a new image tarball.
    Commit {
        #[arg(short = 'm', long)]
        message: Option<String>,
        #[arg(short = 'a', long)]
        author: Option<String>,
        container: String,
        reference: Option<String>,
    },
    /// Network management.
    Network(NetworkArgs),
    /// Internal: container init re-entry. Invoked via `/proc/self/exe`
    /// re-exec, never directly by a user.
    #[command(hide = true)]
    Init,
}

#[derive(Parser)]
pub struct RunArgs {
    #[arg(short = 'd', long)]
    pub detach: bool,
    #[arg(short = 't', long)]
    pub tty: bool,
    #[arg(short = 'i', long)]
    pub interactive: bool,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub rm: bool,
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,
    #[arg(short = 'p', long = "publish")]
    pub ports: Vec<String>,
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    #[arg(long)]
    pub net: Option<String>,
    #[arg(short = 'm', long)]
    pub memory: Option<String>,
    #[arg(long)]
    pub memory_swap: Option<String>,
    #[arg(long)]
    pub cpus: Option<f64>,
    #[arg(long)]
    pub cpu_shares: Option<u64>,
    #[arg(long)]
    pub cpuset_cpus: Option<String>,
    #[arg(long)]
    pub pids_limit: Option<i64>,
    /// Places the container's cgroup under this path instead of the
    /// default managed parent; a rootless permission failure writing any
    /// knob becomes fatal once this is set, since the caller asked for
    /// that specific location.
    #[arg(long)]
    pub cgroup_parent: Option<String>,
    pub image: String,
    pub command: Vec<String>,
}

#[derive(Parser)]
pub struct ExecArgs {
    #[arg(short = 'i', long)]
    pub interactive: bool,
    #[arg(short = 't', long)]
    pub tty: bool,
    #[arg(short = 'd', long)]
    pub detach: bool,
    #[arg(short = 'u', long)]
    pub user: Option<String>,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Parser)]
pub struct NetworkArgs {
    #[command(subcommand)]
    pub command: NetworkCommand,
}

#[derive(Subcommand)]
pub enum NetworkCommand {
    Create {
        #[arg(short = 'd', long, default_value = "bridge")]
        driver: String,
        #[arg(long)]
        subnet: String,
        name: String,
    },
    Ls,
    Rm { names: Vec<String> },
}

impl RunArgs {
    fn into_spec(self) -> SudockerResult<ContainerSpec> {
        if self.image.is_empty() {
            return Err(SudockerError::InvalidArgument("missing image".into()));
        }

        let mut env = Vec::new();
        if let Some(path) = &self.env_file {
            env.extend(parse_env_file(path)?);
        }
        for raw in &self.env {
            env.push(parse_env_assignment(raw)?);
        }

        let volumes = self.volumes.iter().map(|v| parse_volume(v)).collect::<SudockerResult<Vec<_>>>()?;
        let ports = self.ports.iter().map(|p| parse_port(p)).collect::<SudockerResult<Vec<_>>>()?;

        let memory_limit_bytes = self.memory.as_deref().map(parse_memory).transpose()?.filter(|&v| v != 0);
        let memory_swap_bytes = self.memory_swap.as_deref().map(parse_memory).transpose()?;

        let resources = Resources {
            cpu_shares: self.cpu_shares,
            cpu_period_us: self.cpus.map(|_| 100_000),
            cpu_quota_us: self.cpus.map(|cpus| (cpus * 100_000.0) as i64),
            cpuset_cpus: self.cpuset_cpus,
            pids_limit: self.pids_limit,
            memory_limit_bytes,
            memory_swap_bytes,
            cgroup_parent: self.cgroup_parent,
            ..Resources::default()
        };

        Ok(ContainerSpec {
            image: self.image,
            command: self.command,
            env,
            volumes,
            ports,
            network_name: self.net,
            requested_ip: None,
            tty: self.tty,
            detach: self.detach,
            auto_remove: self.rm,
            name: self.name,
            resources,
        })
    }
}

/// Parses arguments and runs the requested command against a fresh
/// [`Orchestrator`]. Returns the process exit code.
pub async fn dispatch(cli: Cli) -> i32 {
    if let Err(e) = config::init_for_cli(&cli) {
        eprintln!("sudocker: {e}");
        return e.exit_code();
    }

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sudocker: {e}");
            e.exit_code()
        }
    }
}

mod config {
    use super::Cli;
    use sudocker_shared::SudockerResult;

    pub fn init_for_cli(cli: &Cli) -> SudockerResult<()> {
        crate::config::init(cli.config.clone())?;
        crate::config::init_data_root(cli.data_root.clone())?;
        let level = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
        crate::logging::init(&level, cli.debug);
        Ok(())
    }
}

async fn run_command(cli: Cli) -> SudockerResult<i32> {
    let orchestrator = Orchestrator::new(crate::config::data_root())?;

    match cli.command {
        Command::Init => {
            eprintln!("sudocker: `init` is internal and must not be invoked directly");
            Ok(125)
        }
        Command::Run(args) => {
            let spec = args.into_spec()?;
            match orchestrator.run(spec).await? {
                RunOutcome::Detached(id) => {
                    println!("{id}");
                    Ok(0)
                }
                RunOutcome::Foreground { exit_code, .. } => Ok(exit_code),
            }
        }
        Command::Create(args) => {
            let spec = args.into_spec()?;
            let id = orchestrator.create(spec)?;
            println!("{id}");
            Ok(0)
        }
        Command::Start { containers } => {
            for c in containers {
                match orchestrator.start(&c).await? {
                    RunOutcome::Detached(id) => println!("{id}"),
                    RunOutcome::Foreground { id, .. } => println!("{id}"),
                }
            }
            Ok(0)
        }
        Command::Exec(args) => {
            if args.command.is_empty() {
                return Err(SudockerError::InvalidArgument("missing exec command".into()));
            }
            match orchestrator.exec(&args.container, args.command, args.detach)? {
                Some(code) => Ok(code),
                None => Ok(0),
            }
        }
        Command::Ps { all, quiet, no_trunc } => {
            let containers = orchestrator.ps(all)?;
            for c in containers {
                let id = if no_trunc { c.id.as_str() } else { sudocker_shared::short_id(&c.id) };
                if quiet {
                    println!("{id}");
                } else {
                    println!(
                        "{id}\t{}\t{}\t{:?}\t{}",
                        c.image_name,
                        c.command.join(" "),
                        c.status,
                        c.container_name.unwrap_or_default()
                    );
                }
            }
            Ok(0)
        }
        Command::Logs { follow, container } => {
            if follow {
                orchestrator
                    .logs_follow(&container, |chunk| {
                        use std::io::Write;
                        let _ = std::io::stdout().write_all(chunk);
                    })
                    .await?;
            } else {
                let bytes = orchestrator.logs(&container)?;
                use std::io::Write;
                std::io::stdout().write_all(&bytes)?;
            }
            Ok(0)
        }
        Command::Stop { time, containers } => {
            let grace = Duration::from_secs(time);
            let results = orchestrator.stop_many(containers, grace).await;
            report_bulk(results)
        }
        Command::Rm { force, containers, .. } => {
            let results = orchestrator.rm_many(containers, force).await;
            report_bulk(results)
        }
        Command::Commit { container, reference, .. } => {
            let reference = reference.unwrap_or_else(|| format!("{container}-commit"));
            let path = orchestrator.commit(&container, &reference)?;
            println!("{}", path.display());
            Ok(0)
        }
        Command::Network(args) => match args.command {
            NetworkCommand::Create { subnet, name, .. } => {
                let info = orchestrator.network_create(&name, &subnet)?;
                println!("{}", info.name);
                Ok(0)
            }
            NetworkCommand::Ls => {
                for n in orchestrator.network_list()? {
                    println!("{}\t{}\t{}", n.name, n.driver, n.subnet);
                }
                Ok(0)
            }
            NetworkCommand::Rm { names } => {
                for name in names {
                    orchestrator.network_remove(&name)?;
                }
                Ok(0)
            }
        },
    }
}

/// Prints one line per failure and returns nonzero if any operation in a
/// `stop`/`rm` fan-out failed, without aborting the rest of the batch.
fn report_bulk(results: Vec<(String, SudockerResult<()>)>) -> SudockerResult<i32> {
    let mut failed = false;
    for (id, result) in results {
        match result {
            Ok(()) => println!("{id}"),
            Err(e) => {
                eprintln!("sudocker: {id}: {e}");
                failed = true;
            }
        }
    }
    Ok(if failed { 125 } else { 0 })
}
