use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use skiff_deploy::deployment::{DeployOptions, Deployment, RunReport};
use skiff_deploy::{Config, SecretStore};

/// Exit codes: 0 success, 1 any per-host error, 2 configuration invalid.
const EXIT_HOST_ERROR: u8 = 1;
const EXIT_CONFIG_INVALID: u8 = 2;

#[derive(Parser)]
#[command(name = "skiff", about = "Declarative container deployment for small fleets", version)]
struct Cli {
    /// Project config file.
    #[arg(long, global = true, default_value = "skiff.yml")]
    config: PathBuf,
    /// Secrets file (KEY=value lines).
    #[arg(long, global = true, default_value = ".skiff/secrets")]
    secrets: PathBuf,
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Scaffold a config file, secrets file, and gitignore entry.
    Init {
        #[arg(long)]
        non_interactive: bool,
    },
    /// Prepare hosts: runtime check, project network, edge proxy, services.
    Setup { names: Vec<String> },
    /// Deploy apps (default) or services.
    Deploy {
        names: Vec<String>,
        /// Target services instead of apps.
        #[arg(long)]
        services: bool,
        /// Skip the clean-worktree safety gate.
        #[arg(long)]
        force: bool,
    },
    /// Report per-workload and proxy state.
    Status { names: Vec<String> },
    /// Control the edge proxy.
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
}

#[derive(Subcommand)]
enum ProxyCommand {
    Status,
    Update {
        /// Replace the proxy without asking for confirmation.
        #[arg(long)]
        force: bool,
    },
    DeleteHost { host: String },
    Logs {
        #[arg(long, default_value_t = 100)]
        lines: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let CliCommand::Init { non_interactive } = &cli.command {
        return match init(&cli.config, &cli.secrets, *non_interactive) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::from(EXIT_HOST_ERROR)
            }
        };
    }

    let deployment = match load(&cli) {
        Ok(deployment) => deployment,
        Err(err) => {
            eprintln!("error: configuration invalid: {err:#}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    let report = match run(&cli, &deployment).await {
        Ok(report) => report,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(EXIT_HOST_ERROR);
        }
    };

    report.print();
    if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_HOST_ERROR)
    }
}

fn load(cli: &Cli) -> Result<Deployment> {
    let config = Config::load(&cli.config)?;
    let secrets = SecretStore::load(&cli.secrets)?;

    // Referenced secret keys must exist before any remote work starts.
    for workload in &config.workloads {
        for key in &workload.env_secret_keys {
            if !secrets.contains(key) {
                bail!(
                    "workload {:?} references secret {key:?}, which is missing from {}",
                    workload.name,
                    cli.secrets.display()
                );
            }
        }
    }

    // Unknown names on the command line are config errors too.
    if let CliCommand::Deploy { names, .. } | CliCommand::Status { names } = &cli.command {
        for name in names {
            if config.workload(name).is_none() {
                bail!("unknown workload {name:?}");
            }
        }
    }

    Ok(Deployment::new(config, secrets, cli.verbose))
}

async fn run(cli: &Cli, deployment: &Deployment) -> Result<RunReport> {
    match &cli.command {
        CliCommand::Init { .. } => unreachable!("handled before config load"),
        CliCommand::Setup { names } => Ok(deployment.setup(names).await),
        CliCommand::Deploy {
            names,
            services,
            force,
        } => {
            deployment
                .deploy(&DeployOptions {
                    names: names.clone(),
                    services: *services,
                    force: *force,
                })
                .await
        }
        CliCommand::Status { names } => Ok(deployment.status(names).await),
        CliCommand::Proxy { command } => match command {
            ProxyCommand::Status => Ok(deployment.proxy_status().await),
            ProxyCommand::Update { force } => {
                if !force {
                    print!("updating replaces the proxy container on every host (brief downtime); continue? [y/N] ");
                    std::io::stdout().flush()?;
                    let mut answer = String::new();
                    std::io::stdin().read_line(&mut answer)?;
                    if !answer.trim().eq_ignore_ascii_case("y") {
                        bail!("aborted");
                    }
                }
                Ok(deployment.proxy_update().await)
            }
            ProxyCommand::DeleteHost { host } => Ok(deployment.proxy_delete_host(host).await),
            ProxyCommand::Logs { lines } => Ok(deployment.proxy_logs(*lines).await),
        },
    }
}

const CONFIG_TEMPLATE: &str = r#"name: PROJECT

ssh:
  username: root
  # port: 22
  # identity_file: ~/.ssh/id_ed25519

# docker:
#   registry: ghcr.io
#   username: you

apps:
  web:
    host: 1.2.3.4
    image: PROJECT-web
    build:
      context: .
    replicas: 1
    ports: ["3000"]
    environment:
      plain: []
      secret: []
    proxy:
      hosts: []
      app_port: 3000
      ssl: true
      health_path: /up

services: {}
"#;

fn init(config_path: &Path, secrets_path: &Path, non_interactive: bool) -> Result<()> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let default_name = std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "myproject".to_owned())
        .to_lowercase()
        .replace(|c: char| !c.is_ascii_alphanumeric(), "-");

    let name = if non_interactive {
        default_name
    } else {
        print!("project name [{default_name}]: ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();
        if trimmed.is_empty() {
            default_name
        } else {
            trimmed.to_owned()
        }
    };

    std::fs::write(config_path, CONFIG_TEMPLATE.replace("PROJECT", &name))
        .with_context(|| format!("cannot write {}", config_path.display()))?;

    if let Some(parent) = secrets_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !secrets_path.exists() {
        std::fs::write(secrets_path, "# KEY=value\n")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(secrets_path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    // Secrets must never land in version control.
    let ignore_line = secrets_path.display().to_string();
    let gitignore = Path::new(".gitignore");
    let current = std::fs::read_to_string(gitignore).unwrap_or_default();
    if !current.lines().any(|line| line.trim() == ignore_line) {
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&ignore_line);
        updated.push('\n');
        std::fs::write(gitignore, updated)?;
    }

    println!("wrote {}, {}", config_path.display(), secrets_path.display());
    println!("next: edit {}, then run `skiff setup`", config_path.display());
    Ok(())
}
