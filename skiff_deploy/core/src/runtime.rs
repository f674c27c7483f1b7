//! Thin adapter over the container CLI on a remote host.
//!
//! Command construction is a pure function layer ([`cmd`]) producing argv
//! vectors; [`ContainerRuntime`] sends them through the host session and
//! parses structured output. Keeping the builders pure makes every command
//! shape testable without a daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::PortMapping;
use crate::session::{CommandError, DEFAULT_EXEC_TIMEOUT, HostSession, PULL_TIMEOUT};

/// Container labels owned exclusively by the engine.
pub mod labels {
    pub const MANAGED: &str = "skiff.managed";
    pub const PROJECT: &str = "skiff.project";
    pub const TYPE: &str = "skiff.type";
    pub const APP: &str = "skiff.app";
    pub const SERVICE: &str = "skiff.service";
    pub const COLOR: &str = "skiff.color";
    pub const REPLICA: &str = "skiff.replica";
    pub const ACTIVE: &str = "skiff.active";
    pub const CONFIG_HASH: &str = "skiff.config-hash";
    pub const FINGERPRINT_TYPE: &str = "skiff.fingerprint-type";
    pub const SECRETS_HASH: &str = "skiff.secrets-hash";
    pub const IMAGE_REFERENCE: &str = "skiff.image-reference";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    Always,
    UnlessStopped,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
        })
    }
}

/// Everything needed to create one container. Labels are applied atomically
/// with creation; they cannot be changed afterwards.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub network: Option<String>,
    pub network_aliases: Vec<String>,
    pub restart: RestartPolicy,
    pub command: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Pure argv builders for the container CLI.
pub mod cmd {
    use super::{ContainerSpec, RestartPolicy};

    fn docker(args: &[&str]) -> Vec<String> {
        std::iter::once("docker".to_owned())
            .chain(args.iter().map(|s| (*s).to_owned()))
            .collect()
    }

    pub fn create(spec: &ContainerSpec) -> Vec<String> {
        let mut argv = docker(&["container", "create", "--name", &spec.name]);
        for (key, value) in &spec.labels {
            argv.push("--label".to_owned());
            argv.push(format!("{key}={value}"));
        }
        for port in &spec.ports {
            argv.push("-p".to_owned());
            argv.push(port.to_string());
        }
        for volume in &spec.volumes {
            argv.push("-v".to_owned());
            argv.push(volume.clone());
        }
        for (key, value) in &spec.env {
            argv.push("-e".to_owned());
            argv.push(format!("{key}={value}"));
        }
        if let Some(network) = &spec.network {
            argv.push("--network".to_owned());
            argv.push(network.clone());
            for alias in &spec.network_aliases {
                argv.push("--network-alias".to_owned());
                argv.push(alias.clone());
            }
        }
        if spec.restart != RestartPolicy::No {
            argv.push("--restart".to_owned());
            argv.push(spec.restart.to_string());
        }
        argv.push(spec.image.clone());
        if let Some(command) = &spec.command {
            argv.extend(command.split_whitespace().map(str::to_owned));
        }
        argv
    }

    pub fn start(name: &str) -> Vec<String> {
        docker(&["start", name])
    }

    pub fn stop(name: &str, grace: u64) -> Vec<String> {
        docker(&["stop", "--time", &grace.to_string(), name])
    }

    pub fn remove(name: &str) -> Vec<String> {
        docker(&["rm", "--force", name])
    }

    pub fn inspect(name: &str) -> Vec<String> {
        docker(&["inspect", "--type", "container", name])
    }

    pub fn image_id(image: &str) -> Vec<String> {
        docker(&["image", "inspect", "--format", "{{.Id}}", image])
    }

    pub fn pull(image: &str) -> Vec<String> {
        docker(&["pull", image])
    }

    pub fn push(image: &str) -> Vec<String> {
        docker(&["push", image])
    }

    pub fn tag(src: &str, dst: &str) -> Vec<String> {
        docker(&["tag", src, dst])
    }

    /// Local image build; always emits at least the release and `latest` tags
    /// so content ids line up across releases.
    pub fn build(
        context: &str,
        dockerfile: Option<&str>,
        args: &std::collections::BTreeMap<String, String>,
        target: Option<&str>,
        platform: &str,
        tags: &[String],
    ) -> Vec<String> {
        let mut argv = docker(&["build", "--platform", platform]);
        if let Some(dockerfile) = dockerfile {
            argv.push("--file".to_owned());
            argv.push(dockerfile.to_owned());
        }
        for (key, value) in args {
            argv.push("--build-arg".to_owned());
            argv.push(format!("{key}={value}"));
        }
        if let Some(target) = target {
            argv.push("--target".to_owned());
            argv.push(target.to_owned());
        }
        for tag in tags {
            argv.push("--tag".to_owned());
            argv.push(tag.clone());
        }
        argv.push(context.to_owned());
        argv
    }

    pub fn network_create(name: &str) -> Vec<String> {
        docker(&["network", "create", name])
    }

    pub fn network_inspect(name: &str) -> Vec<String> {
        docker(&["network", "inspect", "--format", "{{.Name}}", name])
    }

    pub fn network_ls_names(filter: Option<&str>) -> Vec<String> {
        let mut argv = docker(&["network", "ls", "--format", "{{.Name}}"]);
        if let Some(filter) = filter {
            argv.push("--filter".to_owned());
            argv.push(format!("name={filter}"));
        }
        argv
    }

    pub fn network_connect(container: &str, network: &str, aliases: &[String]) -> Vec<String> {
        let mut argv = docker(&["network", "connect"]);
        for alias in aliases {
            argv.push("--alias".to_owned());
            argv.push(alias.clone());
        }
        argv.push(network.to_owned());
        argv.push(container.to_owned());
        argv
    }

    pub fn network_disconnect(container: &str, network: &str) -> Vec<String> {
        docker(&["network", "disconnect", network, container])
    }

    pub fn exec_in(container: &str, inner: &[String]) -> Vec<String> {
        let mut argv = docker(&["exec", container]);
        argv.extend(inner.iter().cloned());
        argv
    }

    pub fn ps_names(label_filters: &[(String, String)], all: bool) -> Vec<String> {
        let mut argv = docker(&["ps", "--format", "{{.Names}}"]);
        if all {
            argv.push("--all".to_owned());
        }
        for (key, value) in label_filters {
            argv.push("--filter".to_owned());
            argv.push(format!("label={key}={value}"));
        }
        argv
    }

    pub fn login(registry: &str, username: &str) -> Vec<String> {
        docker(&["login", registry, "--username", username, "--password-stdin"])
    }

    pub fn logout(registry: &str) -> Vec<String> {
        docker(&["logout", registry])
    }

    pub fn logs(container: &str, lines: u32) -> Vec<String> {
        docker(&["logs", "--tail", &lines.to_string(), container])
    }

    pub fn stats(container: &str) -> Vec<String> {
        docker(&["stats", "--no-stream", "--format", "{{json .}}", container])
    }
}

// ---------------------------------------------------------------------------
// Inspect model

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,
    /// Content id of the image the container was created from.
    #[serde(rename = "Image")]
    pub image_id: String,
    #[serde(rename = "RestartCount", default)]
    pub restart_count: u32,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<Mount>,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "StartedAt", default)]
    pub started_at: String,
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Image")]
    pub image_ref: String,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    #[serde(rename = "Source", default)]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "Mode", default)]
    pub mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Ports", default)]
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
    #[serde(rename = "Networks", default)]
    pub networks: BTreeMap<String, NetworkAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkAttachment {
    #[serde(rename = "Aliases", default)]
    pub aliases: Option<Vec<String>>,
}

impl ContainerDetails {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    pub fn aliases_on(&self, network: &str) -> Vec<String> {
        self.network_settings
            .networks
            .get(network)
            .and_then(|n| n.aliases.clone())
            .unwrap_or_default()
    }
}

/// Output of `exec_in`, preserved even when the inner command exits non-zero.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: u32,
    pub stdout: String,
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "CPUPerc", default)]
    pub cpu: String,
    #[serde(rename = "MemUsage", default)]
    pub memory: String,
}

// ---------------------------------------------------------------------------
// Executing adapter

pub struct ContainerRuntime {
    session: Arc<HostSession>,
}

impl ContainerRuntime {
    pub fn new(session: Arc<HostSession>) -> Self {
        ContainerRuntime { session }
    }

    pub fn session(&self) -> &Arc<HostSession> {
        &self.session
    }

    pub fn host(&self) -> &str {
        self.session.host()
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        let names = self.names_matching(name, true).await?;
        Ok(names.iter().any(|n| n == name))
    }

    pub async fn container_running(&self, name: &str) -> Result<bool> {
        let names = self.names_matching(name, false).await?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn names_matching(&self, name: &str, all: bool) -> Result<Vec<String>> {
        let mut argv = vec![
            "docker".to_owned(),
            "ps".to_owned(),
            "--format".to_owned(),
            "{{.Names}}".to_owned(),
            "--filter".to_owned(),
            format!("name=^{name}$"),
        ];
        if all {
            argv.push("--all".to_owned());
        }
        let out = self.session.exec(&argv, DEFAULT_EXEC_TIMEOUT).await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        self.session
            .exec(&cmd::create(spec), DEFAULT_EXEC_TIMEOUT)
            .await
            .with_context(|| format!("failed to create container {}", spec.name))?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.session
            .exec(&cmd::start(name), DEFAULT_EXEC_TIMEOUT)
            .await
            .with_context(|| format!("failed to start container {name}"))?;
        Ok(())
    }

    pub async fn stop(&self, name: &str, grace: u64) -> Result<()> {
        // Stopping has to outlive the grace period.
        let timeout = DEFAULT_EXEC_TIMEOUT + Duration::from_secs(grace);
        self.session
            .exec(&cmd::stop(name, grace), timeout)
            .await
            .with_context(|| format!("failed to stop container {name}"))?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.session
            .exec(&cmd::remove(name), DEFAULT_EXEC_TIMEOUT)
            .await
            .with_context(|| format!("failed to remove container {name}"))?;
        Ok(())
    }

    pub async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        let out = self
            .session
            .exec(&cmd::inspect(name), DEFAULT_EXEC_TIMEOUT)
            .await?;
        parse_inspect(&out).with_context(|| format!("unparseable inspect output for {name}"))
    }

    /// Inspect that treats a missing container as `None` rather than an error.
    pub async fn inspect_opt(&self, name: &str) -> Result<Option<ContainerDetails>> {
        match self.inspect(name).await {
            Ok(details) => Ok(Some(details)),
            Err(err) => {
                if is_not_found(&err) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Content id of an image present on the host, or `None` if absent.
    pub async fn image_id(&self, image: &str) -> Result<Option<String>> {
        match self
            .session
            .exec(&cmd::image_id(image), DEFAULT_EXEC_TIMEOUT)
            .await
        {
            Ok(out) => Ok(Some(out.trim().to_owned())),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn pull(&self, image: &str) -> Result<()> {
        self.session
            .exec(&cmd::pull(image), PULL_TIMEOUT)
            .await
            .with_context(|| format!("failed to pull {image}"))?;
        Ok(())
    }

    pub async fn tag(&self, src: &str, dst: &str) -> Result<()> {
        self.session.exec(&cmd::tag(src, dst), DEFAULT_EXEC_TIMEOUT).await?;
        Ok(())
    }

    pub async fn network_ensure(&self, name: &str) -> Result<()> {
        if self.network_exists(name).await? {
            return Ok(());
        }
        match self
            .session
            .exec(&cmd::network_create(name), DEFAULT_EXEC_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            // Lost the race against a concurrent creator; that is fine.
            Err(err) if command_stderr(&err).contains("already exists") => Ok(()),
            Err(err) => Err(err.context(format!("failed to create network {name}"))),
        }
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool> {
        match self
            .session
            .exec(&cmd::network_inspect(name), DEFAULT_EXEC_TIMEOUT)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Names of networks, optionally filtered by a name fragment.
    pub async fn network_names(&self, filter: Option<&str>) -> Result<Vec<String>> {
        let out = self
            .session
            .exec(&cmd::network_ls_names(filter), DEFAULT_EXEC_TIMEOUT)
            .await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// Idempotent: a container already attached to the network is not an error.
    pub async fn network_connect(
        &self,
        container: &str,
        network: &str,
        aliases: &[String],
    ) -> Result<()> {
        match self
            .session
            .exec(&cmd::network_connect(container, network, aliases), DEFAULT_EXEC_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if command_stderr(&err).contains("already exists in network") => Ok(()),
            Err(err) => Err(err.context(format!(
                "failed to connect {container} to network {network}"
            ))),
        }
    }

    pub async fn network_disconnect(&self, container: &str, network: &str) -> Result<()> {
        match self
            .session
            .exec(&cmd::network_disconnect(container, network), DEFAULT_EXEC_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if command_stderr(&err).contains("is not connected") => Ok(()),
            Err(err) => Err(err.context(format!(
                "failed to disconnect {container} from network {network}"
            ))),
        }
    }

    /// Runs `inner` inside `container`, returning exit code and stdout even on
    /// non-zero exit.
    pub async fn exec_in(&self, container: &str, inner: &[String]) -> Result<ExecOutput> {
        self.exec_in_with_timeout(container, inner, DEFAULT_EXEC_TIMEOUT)
            .await
    }

    pub async fn exec_in_with_timeout(
        &self,
        container: &str,
        inner: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        match self
            .session
            .exec(&cmd::exec_in(container, inner), timeout)
            .await
        {
            Ok(stdout) => Ok(ExecOutput { exit_code: 0, stdout }),
            Err(err) => match err.downcast_ref::<CommandError>() {
                Some(cmd_err) => Ok(ExecOutput {
                    exit_code: cmd_err.exit_code,
                    stdout: cmd_err.stdout.clone(),
                }),
                None => Err(err),
            },
        }
    }

    /// Container names matching every label filter.
    pub async fn names_by_label(
        &self,
        label_filters: &[(String, String)],
        all: bool,
    ) -> Result<Vec<String>> {
        let out = self
            .session
            .exec(&cmd::ps_names(label_filters, all), DEFAULT_EXEC_TIMEOUT)
            .await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    /// Registry login with the password on stdin; the password is registered
    /// for redaction first. Warnings about unencrypted credential storage
    /// arrive on stderr with a zero exit, which is success.
    pub async fn login(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        self.session.redact_value(password);
        self.session
            .exec_with_stdin(
                &cmd::login(registry, username),
                Some(password),
                DEFAULT_EXEC_TIMEOUT,
            )
            .await
            .with_context(|| format!("failed to log in to {registry}"))?;
        Ok(())
    }

    pub async fn logout(&self, registry: &str) -> Result<()> {
        self.session
            .exec(&cmd::logout(registry), DEFAULT_EXEC_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn logs(&self, container: &str, lines: u32) -> Result<String> {
        self.session
            .exec(&cmd::logs(container, lines), DEFAULT_EXEC_TIMEOUT)
            .await
    }

    pub async fn stats(&self, container: &str) -> Result<ContainerStats> {
        let out = self
            .session
            .exec(&cmd::stats(container), DEFAULT_EXEC_TIMEOUT)
            .await?;
        serde_json::from_str(out.trim())
            .with_context(|| format!("unparseable stats output for {container}"))
    }
}

pub fn parse_inspect(out: &str) -> Result<ContainerDetails> {
    let mut entries: Vec<ContainerDetails> = serde_json::from_str(out)?;
    entries
        .pop()
        .ok_or_else(|| anyhow::anyhow!("inspect returned an empty array"))
}

fn command_stderr(err: &anyhow::Error) -> &str {
    err.downcast_ref::<CommandError>()
        .map(|e| e.stderr.as_str())
        .unwrap_or("")
}

fn is_not_found(err: &anyhow::Error) -> bool {
    let text = err
        .downcast_ref::<CommandError>()
        .map(|e| format!("{} {}", e.stderr, e.stdout))
        .unwrap_or_default();
    text.contains("No such") || text.contains("no such") || text.contains("not found")
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "acme-web-blue-1".to_owned(),
            image: "acme-web:latest".to_owned(),
            ports: vec![],
            volumes: vec!["data:/var/lib/data".to_owned()],
            env: BTreeMap::from([("PORT".to_owned(), "3000".to_owned())]),
            network: Some("acme-network".to_owned()),
            network_aliases: vec!["web".to_owned(), "acme-web".to_owned()],
            restart: RestartPolicy::UnlessStopped,
            command: None,
            labels: BTreeMap::from([
                (labels::MANAGED.to_owned(), "true".to_owned()),
                (labels::COLOR.to_owned(), "blue".to_owned()),
            ]),
        }
    }

    #[test]
    fn create_sets_labels_network_and_aliases() {
        let argv = cmd::create(&spec());
        let joined = argv.join(" ");
        assert!(joined.starts_with("docker container create --name acme-web-blue-1"));
        assert!(joined.contains("--label skiff.managed=true"));
        assert!(joined.contains("--label skiff.color=blue"));
        assert!(joined.contains("--network acme-network"));
        assert!(joined.contains("--network-alias web"));
        assert!(joined.contains("--network-alias acme-web"));
        assert!(joined.contains("--restart unless-stopped"));
        assert!(joined.ends_with("acme-web:latest"));
    }

    #[test]
    fn build_always_carries_all_tags() {
        let argv = cmd::build(
            ".",
            Some("Dockerfile"),
            &BTreeMap::new(),
            None,
            "linux/amd64",
            &["acme-web:1712000000".to_owned(), "acme-web:latest".to_owned()],
        );
        let joined = argv.join(" ");
        assert!(joined.contains("--tag acme-web:1712000000"));
        assert!(joined.contains("--tag acme-web:latest"));
        assert!(joined.contains("--platform linux/amd64"));
        assert!(joined.ends_with(" ."));
    }

    #[test]
    fn stop_passes_grace_seconds() {
        assert_eq!(
            cmd::stop("acme-web-blue-1", 30),
            vec!["docker", "stop", "--time", "30", "acme-web-blue-1"]
        );
    }

    #[test]
    fn parse_inspect_surfaces_labels_mounts_and_ports() {
        let json = r#"[
          {
            "Id": "abc123",
            "Image": "sha256:deadbeef",
            "RestartCount": 2,
            "State": {"Running": true, "ExitCode": 0, "StartedAt": "2026-01-01T00:00:00Z", "Status": "running"},
            "Config": {
              "Image": "acme-web:latest",
              "Env": ["PORT=3000"],
              "Labels": {"skiff.config-hash": "0123456789ab", "skiff.color": "blue"},
              "Cmd": null
            },
            "Mounts": [{"Source": "/srv/data", "Destination": "/var/lib/data", "Mode": "rw"}],
            "NetworkSettings": {
              "Ports": {"3000/tcp": [{"HostIp": "0.0.0.0", "HostPort": "3000"}]},
              "Networks": {"acme-network": {"Aliases": ["web", "acme-web"]}}
            }
          }
        ]"#;
        let details = parse_inspect(json).unwrap();
        assert_eq!(details.image_id, "sha256:deadbeef");
        assert_eq!(details.label(labels::CONFIG_HASH), Some("0123456789ab"));
        assert_eq!(details.restart_count, 2);
        assert_eq!(details.mounts[0].destination, "/var/lib/data");
        assert_eq!(
            details.aliases_on("acme-network"),
            vec!["web".to_owned(), "acme-web".to_owned()]
        );
        assert!(details.state.running);
    }

    #[test]
    fn exec_in_wraps_inner_argv() {
        let argv = cmd::exec_in(
            "skiff-proxy",
            &["skiff-proxy".to_owned(), "list".to_owned()],
        );
        assert_eq!(argv, vec!["docker", "exec", "skiff-proxy", "skiff-proxy", "list"]);
    }
}
