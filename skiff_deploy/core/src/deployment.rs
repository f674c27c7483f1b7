//! Top-level driver: fans work out across hosts, keeps per-host work
//! sequential, and aggregates failures without letting one host abort the
//! run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};

use crate::config::{Config, PROXY_CONTAINER_NAME, Workload};
use crate::deploy::{AppDeployer, Deployer, ServiceDeployer};
use crate::fingerprint::{self, Fingerprint};
use crate::image;
use crate::plan::{self, Decision};
use crate::progress::ProgressTracker;
use crate::proxy::ProxyController;
use crate::runtime::{ContainerRuntime, labels};
use crate::secrets::SecretStore;
use crate::session::{AuthMethod, ConnectionOptions, HostSession};

/// Environment variable consulted for password authentication when no
/// identity file is configured.
pub const SSH_PASSWORD_ENV: &str = "SKIFF_SSH_PASSWORD";

/// A required piece of host state that `setup` creates and `deploy` refuses
/// to self-heal.
#[derive(Debug)]
pub struct PreconditionMissing {
    pub what: String,
}

impl fmt::Display for PreconditionMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "precondition missing: {}", self.what)
    }
}

impl std::error::Error for PreconditionMissing {}

#[derive(Debug)]
pub struct HostFailure {
    pub host: String,
    pub workload: Option<String>,
    pub phase: &'static str,
    pub error: anyhow::Error,
    pub hint: &'static str,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.host)?;
        if let Some(workload) = &self.workload {
            write!(f, "{workload}: ")?;
        }
        write!(f, "{} failed: {:#}. hint: {}", self.phase, self.error, self.hint)
    }
}

/// Aggregated outcome of a run across hosts.
#[derive(Debug, Default)]
pub struct RunReport {
    pub failures: Vec<HostFailure>,
}

impl RunReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn print(&self) {
        for failure in &self.failures {
            ProgressTracker::eprintln(format!("error: {failure}"));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Workload names to target; empty means every workload of the selected
    /// kind.
    pub names: Vec<String>,
    /// Target services instead of apps.
    pub services: bool,
    /// Skip the clean-worktree safety gate.
    pub force: bool,
}

pub struct Deployment {
    pub config: Config,
    pub secrets: SecretStore,
    pub verbose: bool,
}

impl Deployment {
    pub fn new(config: Config, secrets: SecretStore, verbose: bool) -> Self {
        Deployment {
            config,
            secrets,
            verbose,
        }
    }

    /// Fresh release identifier: unix seconds, so release tags sort.
    fn release_id(&self) -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string()
    }

    async fn session_for(&self, host: &str) -> Result<Arc<HostSession>> {
        let ssh = &self.config.ssh;
        let auth = if let Some(identity) = &ssh.identity_file {
            AuthMethod::IdentityFile(identity.clone())
        } else if let Ok(password) = std::env::var(SSH_PASSWORD_ENV) {
            AuthMethod::Password(password)
        } else {
            AuthMethod::Agent
        };
        let session = HostSession::connect(ConnectionOptions {
            host: host.to_owned(),
            port: ssh.port,
            username: ssh.username.clone(),
            auth,
        })
        .await?;
        for value in self.secrets.all_values() {
            session.redact_value(value);
        }
        Ok(session)
    }

    // -----------------------------------------------------------------
    // setup

    /// Prepares hosts: verifies the container runtime, ensures the project
    /// network and the edge proxy, and materializes every pinned service.
    pub async fn setup(&self, hosts_filter: &[String]) -> RunReport {
        let hosts = self.filter_hosts(hosts_filter);
        let futures = hosts.iter().map(|host| async move {
            self.setup_host(host).await.err().map(|error| HostFailure {
                host: host.clone(),
                workload: None,
                phase: "setup",
                error,
                hint: "fix connectivity or the container runtime, then re-run `skiff setup`",
            })
        });
        RunReport {
            failures: futures::future::join_all(futures)
                .await
                .into_iter()
                .flatten()
                .collect(),
        }
    }

    async fn setup_host(&self, host: &str) -> Result<()> {
        let session = self.session_for(host).await?;
        let runtime = ContainerRuntime::new(session);

        runtime
            .session()
            .exec(
                &["docker".to_owned(), "version".to_owned(), "--format".to_owned(), "{{.Server.Version}}".to_owned()],
                crate::session::DEFAULT_EXEC_TIMEOUT,
            )
            .await
            .context("container runtime is not available on the host")?;

        let network = self.config.network_name();
        runtime.network_ensure(&network).await?;

        let proxy = ProxyController::new(&runtime, &self.config.proxy_image);
        proxy.ensure(std::slice::from_ref(&network)).await?;

        // Pinned services come up during setup so apps can depend on them.
        let release_id = self.release_id();
        for workload in self
            .config
            .workloads
            .iter()
            .filter(|w| !w.is_app() && w.hosts.iter().any(|h| h == host))
        {
            self.deploy_one(&runtime, workload, &release_id, None).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // deploy

    pub async fn deploy(&self, options: &DeployOptions) -> Result<RunReport> {
        if !options.force {
            ensure_clean_worktree().await?;
        }

        let targets: Vec<&Workload> = self
            .config
            .workloads
            .iter()
            .filter(|w| w.is_app() != options.services)
            .filter(|w| options.names.is_empty() || options.names.contains(&w.name))
            .collect();
        if targets.is_empty() {
            bail!("no matching workloads to deploy");
        }

        let release_id = self.release_id();

        // Build and push once per built workload, before touching any host.
        for workload in targets.iter().filter(|w| w.is_built()) {
            image::build(workload, &self.config.name, &release_id).await?;
            let registry = workload
                .registry
                .as_ref()
                .or(self.config.registry.as_ref())
                .ok_or_else(|| {
                    anyhow!(
                        "built workload {:?} needs a `docker` registry section to distribute through",
                        workload.name
                    )
                })?;
            image::push(workload, &self.config.name, &release_id, registry, &self.secrets)
                .await?;
        }

        // Desired fingerprints, with local image identity resolved.
        let mut fingerprints: BTreeMap<String, Fingerprint> = BTreeMap::new();
        for workload in &targets {
            let mut fp = fingerprint::compute(workload, &self.secrets, &self.config.name)?;
            if workload.is_built() {
                fp.local_image_id =
                    image::local_image_id(&format!("{}:latest", workload.repo(&self.config.name)))
                        .await?;
            }
            fingerprints.insert(workload.name.clone(), fp);
        }

        let hosts = self.filter_hosts(&[]);
        let futures = hosts.iter().map(|host| {
            let targets = &targets;
            let fingerprints = &fingerprints;
            let release_id = &release_id;
            async move {
                self.deploy_host(host, targets, fingerprints, release_id)
                    .await
            }
        });
        let failures = futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(RunReport { failures })
    }

    async fn deploy_host(
        &self,
        host: &str,
        targets: &[&Workload],
        fingerprints: &BTreeMap<String, Fingerprint>,
        release_id: &str,
    ) -> Vec<HostFailure> {
        let on_host: Vec<&&Workload> = targets
            .iter()
            .filter(|w| w.hosts.iter().any(|h| h == host))
            .collect();
        if on_host.is_empty() {
            return Vec::new();
        }

        let runtime = match self.session_for(host).await {
            Ok(session) => ContainerRuntime::new(session),
            Err(error) => {
                return vec![HostFailure {
                    host: host.to_owned(),
                    workload: None,
                    phase: "connect",
                    error,
                    hint: "check SSH reachability and credentials",
                }];
            }
        };

        // Preconditions: deploy never self-heals mid-run.
        if let Err(error) = self.check_preconditions(&runtime).await {
            return vec![HostFailure {
                host: host.to_owned(),
                workload: None,
                phase: "preconditions",
                error,
                hint: "run `skiff setup` first",
            }];
        }

        let mut failures = Vec::new();
        for workload in on_host {
            let fingerprint = fingerprints
                .get(&workload.name)
                .expect("fingerprint computed for every target");
            if let Err(error) = self
                .deploy_one(&runtime, workload, release_id, Some(fingerprint))
                .await
            {
                failures.push(HostFailure {
                    host: host.to_owned(),
                    workload: Some(workload.name.clone()),
                    phase: "deploy",
                    error,
                    hint: "see `skiff status`; the previous generation is still serving",
                });
            }
        }
        failures
    }

    async fn check_preconditions(&self, runtime: &ContainerRuntime) -> Result<()> {
        let network = self.config.network_name();
        if !runtime.network_exists(&network).await? {
            return Err(anyhow::Error::new(PreconditionMissing {
                what: format!("project network {network} does not exist"),
            }));
        }
        let proxy = ProxyController::new(runtime, &self.config.proxy_image);
        if !proxy.is_running().await? {
            return Err(anyhow::Error::new(PreconditionMissing {
                what: format!("proxy container {PROXY_CONTAINER_NAME} is not running"),
            }));
        }
        Ok(())
    }

    /// Plans and, when needed, executes one workload on one already-connected
    /// host. `desired` is computed by the caller for deploys; `setup` passes
    /// `None` and computes here.
    async fn deploy_one(
        &self,
        runtime: &ContainerRuntime,
        workload: &Workload,
        release_id: &str,
        desired: Option<&Fingerprint>,
    ) -> Result<()> {
        let host = runtime.host();
        let computed;
        let desired = match desired {
            Some(fp) => fp,
            None => {
                computed = fingerprint::compute(workload, &self.secrets, &self.config.name)?;
                &computed
            }
        };

        let current = self.observe_current(runtime, workload).await?;
        let decision: Decision = plan::decide(current.as_ref(), desired);
        ProgressTracker::println(format!(
            "[{host}] {}: {} ({:?})",
            workload.name, decision.reason, decision.priority
        ));
        if !decision.should {
            ProgressTracker::println(format!("[{host}] {}: skipped", workload.name));
            return Ok(());
        }

        let prepared = image::distribute(
            runtime,
            workload,
            &self.config.name,
            release_id,
            self.config.registry.as_ref(),
            &self.secrets,
        )
        .await?;

        let network = self.config.network_name();
        let deployer: Box<dyn Deployer + '_> = if workload.is_app() {
            Box::new(AppDeployer::new(
                runtime,
                &self.config.name,
                network,
                PROXY_CONTAINER_NAME,
                workload,
            )?)
        } else {
            Box::new(ServiceDeployer::new(
                runtime,
                &self.config.name,
                network,
                workload,
            ))
        };
        deployer
            .execute(&prepared.run_ref, desired, &self.secrets)
            .await?;
        if workload.is_app() {
            self.program_routes(runtime, workload).await?;
        }
        Ok(())
    }

    /// Programs the proxy routes for an app. The containers are already
    /// serving at this point, so a failure here degrades routing but must
    /// not roll the deploy back; it surfaces as a prominent host error.
    async fn program_routes(&self, runtime: &ContainerRuntime, workload: &Workload) -> Result<()> {
        let Some(settings) = workload.app_settings() else {
            return Ok(());
        };
        let proxy = ProxyController::new(runtime, &self.config.proxy_image);
        let target = format!(
            "{}:{}",
            workload.scoped_alias(&self.config.name),
            settings.app_port
        );
        for hostname in &settings.proxy_hosts {
            proxy
                .deploy_route(
                    hostname,
                    &target,
                    &self.config.name,
                    &settings.health_path,
                    settings.ssl,
                )
                .await
                .with_context(|| {
                    format!("containers are up but routing for {hostname} is degraded")
                })?;
        }
        Ok(())
    }

    /// Current fingerprint as observed on the host: for apps, prefer the
    /// container holding the project-scoped alias; for services, the single
    /// named container.
    async fn observe_current(
        &self,
        runtime: &ContainerRuntime,
        workload: &Workload,
    ) -> Result<Option<Fingerprint>> {
        if workload.is_app() {
            let names = runtime
                .names_by_label(
                    &[
                        (labels::MANAGED.to_owned(), "true".to_owned()),
                        (labels::PROJECT.to_owned(), self.config.name.clone()),
                        (labels::APP.to_owned(), workload.name.clone()),
                    ],
                    true,
                )
                .await?;
            let scoped = workload.scoped_alias(&self.config.name);
            let network = self.config.network_name();
            let mut fallback = None;
            for name in names {
                let Some(details) = runtime.inspect_opt(&name).await? else {
                    continue;
                };
                if details.aliases_on(&network).contains(&scoped) {
                    return Ok(plan::observe_current(&details));
                }
                if details.state.running && fallback.is_none() {
                    fallback = Some(details);
                }
            }
            Ok(fallback.as_ref().and_then(plan::observe_current))
        } else {
            let name = format!("{}-{}", self.config.name, workload.name);
            Ok(runtime
                .inspect_opt(&name)
                .await?
                .as_ref()
                .and_then(plan::observe_current))
        }
    }

    // -----------------------------------------------------------------
    // status

    pub async fn status(&self, names: &[String]) -> RunReport {
        let hosts = self.filter_hosts(&[]);
        let futures = hosts.iter().map(|host| async move {
            self.status_host(host, names).await.err().map(|error| HostFailure {
                host: host.clone(),
                workload: None,
                phase: "status",
                error,
                hint: "check SSH reachability",
            })
        });
        RunReport {
            failures: futures::future::join_all(futures)
                .await
                .into_iter()
                .flatten()
                .collect(),
        }
    }

    async fn status_host(&self, host: &str, names: &[String]) -> Result<()> {
        let session = self.session_for(host).await?;
        let runtime = ContainerRuntime::new(session);

        for workload in self
            .config
            .workloads
            .iter()
            .filter(|w| w.hosts.iter().any(|h| h == host))
            .filter(|w| names.is_empty() || names.contains(&w.name))
        {
            let desired = fingerprint::compute(workload, &self.secrets, &self.config.name)?;
            let containers = if workload.is_app() {
                runtime
                    .names_by_label(
                        &[
                            (labels::MANAGED.to_owned(), "true".to_owned()),
                            (labels::PROJECT.to_owned(), self.config.name.clone()),
                            (labels::APP.to_owned(), workload.name.clone()),
                        ],
                        true,
                    )
                    .await?
            } else {
                vec![format!("{}-{}", self.config.name, workload.name)]
            };

            let mut running = 0usize;
            let mut lines = Vec::new();
            for name in &containers {
                let Some(details) = runtime.inspect_opt(name).await? else {
                    continue;
                };
                if details.state.running {
                    running += 1;
                }
                let hash_state =
                    if details.label(labels::CONFIG_HASH) == Some(desired.config_hash.as_str()) {
                        "in sync"
                    } else {
                        "stale"
                    };
                let uptime = details
                    .state
                    .started_at
                    .parse::<chrono::DateTime<chrono::Utc>>()
                    .ok()
                    .map(|started| {
                        let minutes = (chrono::Utc::now() - started).num_minutes();
                        format!("up {}h{:02}m", minutes / 60, minutes % 60)
                    })
                    .unwrap_or_else(|| "uptime unknown".to_owned());
                let usage = if self.verbose && details.state.running {
                    match runtime.stats(name).await {
                        Ok(stats) => format!(", cpu {} mem {}", stats.cpu, stats.memory),
                        Err(_) => String::new(),
                    }
                } else {
                    String::new()
                };
                lines.push(format!(
                    "    {name}: {} ({hash_state}, restarts {}, {uptime}{usage})",
                    details.state.status, details.restart_count
                ));
            }
            ProgressTracker::println(format!(
                "[{host}] {} ({}): {running}/{} running",
                workload.name,
                if workload.is_app() { "app" } else { "service" },
                containers.len().max(workload.replicas as usize),
            ));
            for line in lines {
                ProgressTracker::println(line);
            }
        }

        let proxy = ProxyController::new(&runtime, &self.config.proxy_image);
        let proxy_state = if proxy.is_running().await? {
            "running"
        } else {
            "NOT RUNNING"
        };
        ProgressTracker::println(format!("[{host}] proxy: {proxy_state}"));
        if self.verbose {
            if let Ok(status) = proxy.status().await {
                for line in status.lines() {
                    ProgressTracker::println(format!("    {line}"));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // proxy operations

    pub async fn proxy_update(&self) -> RunReport {
        self.for_each_host("proxy update", |runtime| async move {
            ProxyController::new(&runtime, &self.config.proxy_image)
                .update()
                .await
        })
        .await
    }

    pub async fn proxy_status(&self) -> RunReport {
        self.for_each_host("proxy status", |runtime| async move {
            let status = ProxyController::new(&runtime, &self.config.proxy_image)
                .status()
                .await?;
            ProgressTracker::println(format!("[{}]", runtime.host()));
            for line in status.lines() {
                ProgressTracker::println(format!("    {line}"));
            }
            Ok(())
        })
        .await
    }

    pub async fn proxy_logs(&self, lines: u32) -> RunReport {
        self.for_each_host("proxy logs", move |runtime| async move {
            let logs = ProxyController::new(&runtime, &self.config.proxy_image)
                .logs(lines)
                .await?;
            ProgressTracker::println(format!("[{}]", runtime.host()));
            for line in logs.lines() {
                ProgressTracker::println(format!("    {line}"));
            }
            Ok(())
        })
        .await
    }

    pub async fn proxy_delete_host(&self, hostname: &str) -> RunReport {
        self.for_each_host("proxy delete-host", move |runtime| async move {
            ProxyController::new(&runtime, &self.config.proxy_image)
                .delete_host(hostname)
                .await?;
            Ok(())
        })
        .await
    }

    async fn for_each_host<'a, F, Fut>(&'a self, phase: &'static str, op: F) -> RunReport
    where
        F: Fn(ContainerRuntime) -> Fut + Clone,
        Fut: std::future::Future<Output = Result<()>> + 'a,
    {
        let hosts = self.filter_hosts(&[]);
        let futures = hosts.iter().map(|host| {
            let op = op.clone();
            async move {
                let result = async {
                    let session = self.session_for(host).await?;
                    op(ContainerRuntime::new(session)).await
                }
                .await;
                result.err().map(|error| HostFailure {
                    host: host.clone(),
                    workload: None,
                    phase,
                    error,
                    hint: "check the proxy container on the host",
                })
            }
        });
        RunReport {
            failures: futures::future::join_all(futures)
                .await
                .into_iter()
                .flatten()
                .collect(),
        }
    }

    fn filter_hosts(&self, filter: &[String]) -> Vec<String> {
        let all = self.config.hosts();
        if filter.is_empty() {
            all
        } else {
            all.into_iter().filter(|h| filter.contains(h)).collect()
        }
    }
}

/// Refuses to deploy from a dirty worktree unless forced; deploying
/// uncommitted code makes releases untraceable.
async fn ensure_clean_worktree() -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            if output.stdout.is_empty() {
                Ok(())
            } else {
                bail!(
                    "worktree has uncommitted changes; commit them or pass --force"
                )
            }
        }
        // Not a git repo (or git missing): nothing to gate on.
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_failure_names_host_workload_phase_and_hint() {
        let failure = HostFailure {
            host: "10.0.0.1".to_owned(),
            workload: Some("web".to_owned()),
            phase: "deploy",
            error: anyhow!("boom"),
            hint: "see `skiff status`; the previous generation is still serving",
        };
        let text = failure.to_string();
        assert!(text.contains("10.0.0.1"));
        assert!(text.contains("web"));
        assert!(text.contains("deploy failed"));
        assert!(text.contains("hint:"));
    }

    #[test]
    fn precondition_error_is_downcastable() {
        let err = anyhow::Error::new(PreconditionMissing {
            what: "project network acme-network does not exist".to_owned(),
        });
        assert!(err.downcast_ref::<PreconditionMissing>().is_some());
        assert!(err.to_string().contains("precondition missing"));
    }
}
