use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skiff_proxy::acme::CertQueue;
use skiff_proxy::control::{self, Command, ProxyContext, Response};
use skiff_proxy::server::{self, RunOptions};
use skiff_proxy::state::StateJournal;
use skiff_proxy::tls::CertStore;

#[derive(Parser)]
#[command(name = "skiff-proxy", about = "Skiff edge proxy", version)]
struct Cli {
    /// Directory holding the state journal and control socket.
    #[arg(long, global = true, default_value = "/data/state")]
    state_dir: PathBuf,
    /// Directory holding issued certificates.
    #[arg(long, global = true, default_value = "/data/certs")]
    certs_dir: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the proxy daemon (listeners, ACME worker, control socket).
    Run {
        #[arg(long, default_value_t = 80)]
        http_port: u16,
        #[arg(long, default_value_t = 443)]
        https_port: u16,
        /// Contact email for the ACME account.
        #[arg(long)]
        acme_email: Option<String>,
        /// Override the ACME directory URL.
        #[arg(long)]
        acme_directory: Option<String>,
        /// Use the Let's Encrypt staging environment.
        #[arg(long)]
        staging: bool,
    },
    /// Add or update a route.
    Deploy {
        #[arg(long)]
        host: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "/up")]
        health_path: String,
        #[arg(long)]
        ssl: bool,
    },
    /// Remove a route.
    Remove {
        #[arg(long)]
        host: String,
    },
    /// List configured routes.
    List,
    /// Show state, certificate, and queue status.
    Status,
    /// Mark a route healthy or unhealthy.
    Updatehealth {
        #[arg(long)]
        host: String,
        #[arg(long, action = ArgAction::Set)]
        healthy: bool,
    },
    /// Remove a host's route and certificates.
    DeleteHost { host: String },
    /// One-shot HTTP health probe (used by deploy health checks).
    Probe {
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match dispatch(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let command = match cli.command {
        CliCommand::Run {
            http_port,
            https_port,
            acme_email,
            acme_directory,
            staging,
        } => {
            return server::run(RunOptions {
                state_dir: cli.state_dir,
                certs_dir: cli.certs_dir,
                http_port,
                https_port,
                acme_email,
                acme_directory,
                staging: staging.then_some(true),
            })
            .await;
        }
        CliCommand::Probe { url, timeout } => {
            return server::probe(&url, timeout).await;
        }
        CliCommand::Deploy {
            host,
            target,
            project,
            health_path,
            ssl,
        } => Command::Deploy {
            host,
            target,
            project,
            health_path,
            ssl,
        },
        CliCommand::Remove { host } => Command::Remove { host },
        CliCommand::List => Command::List,
        CliCommand::Status => Command::Status,
        CliCommand::Updatehealth { host, healthy } => Command::UpdateHealth { host, healthy },
        CliCommand::DeleteHost { host } => Command::DeleteHost { host },
    };

    let response = match control::send(&cli.state_dir, &command).await {
        Ok(response) => response,
        // No daemon (fresh install, maintenance): mutate the journal
        // directly; the daemon reconciles certificate work on next boot.
        Err(_) => offline_apply(&cli.state_dir, &cli.certs_dir, command).await?,
    };

    println!("{}", response.message);
    if response.ok {
        Ok(())
    } else {
        anyhow::bail!("command failed")
    }
}

async fn offline_apply(
    state_dir: &std::path::Path,
    certs_dir: &std::path::Path,
    command: Command,
) -> Result<Response> {
    let ctx = ProxyContext {
        journal: Arc::new(StateJournal::load(state_dir)?),
        certs: CertStore::new(),
        queue: CertQueue::new(),
        challenges: Arc::new(RwLock::new(HashMap::new())),
        certs_dir: certs_dir.to_path_buf(),
    };
    Ok(control::apply(&ctx, command).await)
}
