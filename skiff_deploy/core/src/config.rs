//! The `skiff.yml` model: raw file shape, normalization into [`Workload`]s,
//! and validation.
//!
//! Apps and services may be written as maps (the key becomes the name) or as
//! arrays of entries carrying their own `name`; both normalize to the same
//! tagged [`WorkloadKind`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// Name of the edge proxy container on every host. Workload names may not
/// collide with it.
pub const PROXY_CONTAINER_NAME: &str = "skiff-proxy";

pub const DEFAULT_PROXY_IMAGE: &str = "ghcr.io/skiff-deploy/skiff-proxy:latest";

const RESERVED_NAMES: &[&str] = &["proxy", "status", "init"];

// ---------------------------------------------------------------------------
// Raw file shape

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub name: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub docker: Option<RegistryConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub apps: Entries<AppEntry>,
    #[serde(default)]
    pub services: Entries<ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            username: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_registry")]
    pub registry: String,
    pub username: String,
    /// Secrets-file key holding the registry password.
    #[serde(default = "default_registry_password_key")]
    pub password_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub image: Option<String>,
}

/// Entry collection accepted as either a map (`name: entry`) or an array of
/// entries with inline `name` fields.
#[derive(Debug, Clone)]
pub struct Entries<T>(pub Vec<T>);

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Entries(Vec::new())
    }
}

pub trait NamedEntry {
    fn name(&self) -> Option<&str>;
    fn set_name(&mut self, name: String);
}

impl<'de, T> Deserialize<'de> for Entries<T>
where
    T: Deserialize<'de> + NamedEntry,
{
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Seq(Vec<T>),
            Map(BTreeMap<String, T>),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Seq(entries) => {
                for entry in &entries {
                    if entry.name().is_none() {
                        return Err(serde::de::Error::custom(
                            "array-form entries must carry a `name` field",
                        ));
                    }
                }
                Ok(Entries(entries))
            }
            Repr::Map(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (name, mut entry) in map {
                    entry.set_name(name);
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub image: String,
    #[serde(default)]
    pub build: Option<BuildEntry>,
    #[serde(default)]
    pub environment: EnvEntry,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyEntry>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub image: String,
    #[serde(default)]
    pub environment: EnvEntry,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
}

macro_rules! impl_named_entry {
    ($ty:ty) => {
        impl NamedEntry for $ty {
            fn name(&self) -> Option<&str> {
                self.name.as_deref()
            }
            fn set_name(&mut self, name: String) {
                self.name = Some(name);
            }
        }
    };
}
impl_named_entry!(AppEntry);
impl_named_entry!(ServiceEntry);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvEntry {
    #[serde(default)]
    pub plain: Vec<String>,
    #[serde(default)]
    pub secret: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildEntry {
    #[serde(default = "default_build_context")]
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub app_port: u16,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Seconds to wait before the first health probe of a fresh container.
    #[serde(default)]
    pub health_start_period: u64,
}

fn default_ssh_user() -> String {
    "root".to_owned()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_registry() -> String {
    "docker.io".to_owned()
}
fn default_registry_password_key() -> String {
    "DOCKER_REGISTRY_PASSWORD".to_owned()
}
fn default_replicas() -> u32 {
    1
}
fn default_build_context() -> String {
    ".".to_owned()
}
fn default_platform() -> String {
    "linux/amd64".to_owned()
}
fn default_true() -> bool {
    true
}
fn default_health_path() -> String {
    "/up".to_owned()
}

// ---------------------------------------------------------------------------
// Normalized model

#[derive(Debug, Clone)]
pub struct Config {
    /// Project name; also the namespace for networks, image repos, and aliases.
    pub name: String,
    pub ssh: SshConfig,
    pub registry: Option<RegistryConfig>,
    pub proxy_image: String,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub hosts: Vec<String>,
    pub image: String,
    pub build: Option<BuildSpec>,
    pub env_plain: Vec<(String, String)>,
    pub env_secret_keys: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<String>,
    pub replicas: u32,
    pub command: Option<String>,
    pub registry: Option<RegistryConfig>,
    pub kind: WorkloadKind,
}

#[derive(Debug, Clone)]
pub enum WorkloadKind {
    App(AppSettings),
    Service,
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub proxy_hosts: Vec<String>,
    pub app_port: u16,
    pub ssl: bool,
    pub health_path: String,
    pub health_start_period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: Option<String>,
    pub args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortMapping {
    pub host: Option<u16>,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse_port = |p: &str| -> Result<u16> {
            p.parse::<u16>()
                .map_err(|_| anyhow!("invalid port number {p:?}"))
        };
        match s.split_once(':') {
            None => Ok(PortMapping {
                host: None,
                container: parse_port(s)?,
            }),
            Some((host, container)) => Ok(PortMapping {
                host: Some(parse_port(host)?),
                container: parse_port(container)?,
            }),
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{host}:{}", self.container),
            None => write!(f, "{}", self.container),
        }
    }
}

impl Workload {
    pub fn is_app(&self) -> bool {
        matches!(self.kind, WorkloadKind::App(_))
    }

    pub fn is_built(&self) -> bool {
        self.build.is_some()
    }

    pub fn app_settings(&self) -> Option<&AppSettings> {
        match &self.kind {
            WorkloadKind::App(settings) => Some(settings),
            WorkloadKind::Service => None,
        }
    }

    /// Local/registry repo for built workloads: `{project}-{name}`.
    pub fn repo(&self, project: &str) -> String {
        format!("{project}-{}", self.name)
    }

    /// Project-scoped network alias used by the proxy for routing.
    pub fn scoped_alias(&self, project: &str) -> String {
        format!("{project}-{}", self.name)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: ConfigFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Config::from_file(file)
    }

    pub fn network_name(&self) -> String {
        format!("{}-network", self.name)
    }

    /// Every host any workload targets, deduplicated, in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for workload in &self.workloads {
            for host in &workload.hosts {
                if !seen.contains(host) {
                    seen.push(host.clone());
                }
            }
        }
        seen
    }

    pub fn workload(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }

    pub fn from_file(file: ConfigFile) -> Result<Config> {
        if file.name.is_empty()
            || !file
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            bail!(
                "project name {:?} must be non-empty lowercase [a-z0-9-]",
                file.name
            );
        }

        let mut workloads = Vec::new();
        for app in file.apps.0 {
            workloads.push(normalize_app(app)?);
        }
        for service in file.services.0 {
            workloads.push(normalize_service(service)?);
        }

        let config = Config {
            name: file.name,
            ssh: file.ssh,
            registry: file.docker,
            proxy_image: file
                .proxy
                .and_then(|p| p.image)
                .unwrap_or_else(|| DEFAULT_PROXY_IMAGE.to_owned()),
            workloads,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen: Vec<&str> = Vec::new();
        for workload in &self.workloads {
            let name = workload.name.as_str();
            if seen.contains(&name) {
                bail!("workload name {name:?} is declared more than once");
            }
            seen.push(name);

            if RESERVED_NAMES.contains(&name) || name.starts_with(PROXY_CONTAINER_NAME) {
                bail!("workload name {name:?} is reserved");
            }
            if workload.hosts.is_empty() {
                bail!("workload {name:?} declares no hosts");
            }
            if workload.replicas < 1 {
                bail!("workload {name:?} must have replicas >= 1");
            }
            if !workload.is_app() {
                // Services are replaced in place; their image must be a pinned
                // external reference, never a local build.
                if workload.build.is_some() {
                    bail!("service {name:?} may not declare a build section");
                }
                let tag = workload.image.rsplit('/').next().and_then(|last| {
                    last.split_once(':').map(|(_, tag)| tag)
                });
                match tag {
                    Some(tag) if !tag.is_empty() && tag != "latest" => {}
                    _ => bail!(
                        "service {name:?} image {:?} must be pinned to an explicit tag",
                        workload.image
                    ),
                }
            }
        }

        // Two workloads binding the same host port on the same host is a
        // config error, not a runtime surprise.
        for (i, a) in self.workloads.iter().enumerate() {
            for b in &self.workloads[i + 1..] {
                let shared_host = a.hosts.iter().any(|h| b.hosts.contains(h));
                if !shared_host {
                    continue;
                }
                for pa in &a.ports {
                    for pb in &b.ports {
                        if let (Some(ha), Some(hb)) = (pa.host, pb.host) {
                            if ha == hb {
                                bail!(
                                    "port_conflict: {:?} and {:?} both bind host port {} on a shared host",
                                    a.name,
                                    b.name,
                                    ha
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn parse_env_plain(entries: &[String], workload: &str) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| {
                    anyhow!("workload {workload:?}: plain env entry {entry:?} is not KEY=value")
                })
        })
        .collect()
}

fn parse_ports(entries: &[String], workload: &str) -> Result<Vec<PortMapping>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .parse()
                .with_context(|| format!("workload {workload:?}: bad port mapping {entry:?}"))
        })
        .collect()
}

fn hosts_of(name: &str, host: Option<String>, hosts: Vec<String>) -> Result<Vec<String>> {
    let mut all = hosts;
    if let Some(host) = host {
        all.insert(0, host);
    }
    all.dedup();
    if all.is_empty() {
        bail!("workload {name:?} declares no hosts");
    }
    Ok(all)
}

fn normalize_app(entry: AppEntry) -> Result<Workload> {
    let name = entry.name.expect("entry name filled during deserialization");
    let proxy = entry.proxy.unwrap_or(ProxyEntry {
        hosts: Vec::new(),
        app_port: first_container_port(&entry.ports).unwrap_or(80),
        ssl: true,
        health_path: default_health_path(),
        health_start_period: 0,
    });
    Ok(Workload {
        hosts: hosts_of(&name, entry.host, entry.hosts)?,
        env_plain: parse_env_plain(&entry.environment.plain, &name)?,
        env_secret_keys: entry.environment.secret,
        ports: parse_ports(&entry.ports, &name)?,
        volumes: entry.volumes,
        replicas: entry.replicas,
        command: entry.command,
        registry: entry.registry,
        image: entry.image,
        build: entry.build.map(|b| BuildSpec {
            context: b.context,
            dockerfile: b.dockerfile,
            args: b.args,
            target: b.target,
            platform: b.platform,
        }),
        kind: WorkloadKind::App(AppSettings {
            proxy_hosts: proxy.hosts,
            app_port: proxy.app_port,
            ssl: proxy.ssl,
            health_path: proxy.health_path,
            health_start_period_secs: proxy.health_start_period,
        }),
        name,
    })
}

fn normalize_service(entry: ServiceEntry) -> Result<Workload> {
    let name = entry.name.expect("entry name filled during deserialization");
    Ok(Workload {
        hosts: hosts_of(&name, entry.host, entry.hosts)?,
        env_plain: parse_env_plain(&entry.environment.plain, &name)?,
        env_secret_keys: entry.environment.secret,
        ports: parse_ports(&entry.ports, &name)?,
        volumes: entry.volumes,
        replicas: 1,
        command: entry.command,
        registry: entry.registry,
        image: entry.image,
        build: None,
        kind: WorkloadKind::Service,
        name,
    })
}

fn first_container_port(ports: &[String]) -> Option<u16> {
    ports
        .first()
        .and_then(|p| p.parse::<PortMapping>().ok())
        .map(|m| m.container)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        Config::from_file(serde_yaml::from_str(yaml).unwrap())
    }

    const BASIC: &str = r#"
name: acme
ssh:
  username: deploy
apps:
  web:
    host: 10.0.0.1
    image: acme-web
    build: { context: . }
    replicas: 2
    ports: ["3000"]
    proxy: { hosts: [example.com], app_port: 3000 }
services:
  db:
    host: 10.0.0.1
    image: postgres:16.2
    ports: ["5432:5432"]
"#;

    #[test]
    fn maps_normalize_with_key_as_name() {
        let config = parse(BASIC).unwrap();
        assert_eq!(config.name, "acme");
        assert_eq!(config.workloads.len(), 2);
        let web = config.workload("web").unwrap();
        assert!(web.is_app());
        assert!(web.is_built());
        assert_eq!(web.replicas, 2);
        let db = config.workload("db").unwrap();
        assert!(!db.is_app());
        assert_eq!(db.ports, vec![PortMapping { host: Some(5432), container: 5432 }]);
    }

    #[test]
    fn arrays_require_inline_names() {
        let ok = parse(
            r#"
name: acme
apps:
  - name: web
    host: 10.0.0.1
    image: acme-web:1.0
"#,
        );
        assert!(ok.is_ok());

        let missing: Result<ConfigFile, _> = serde_yaml::from_str(
            r#"
name: acme
apps:
  - host: 10.0.0.1
    image: acme-web:1.0
"#,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn reserved_names_rejected() {
        for name in ["proxy", "status", "init", "skiff-proxy-helper"] {
            let yaml = format!(
                "name: acme\napps:\n  {name}:\n    host: h\n    image: img:1\n"
            );
            let err = parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{name}: {err}");
        }
    }

    #[test]
    fn duplicate_workload_name_rejected() {
        let err = parse(
            r#"
name: acme
apps:
  web: { host: h, image: img:1 }
services:
  web: { host: h, image: pg:16.2 }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn host_port_conflict_cites_both_names() {
        let err = parse(
            r#"
name: acme
services:
  db1: { host: h, image: pg:16.2, ports: ["5432:5432"] }
  db2: { host: h, image: pg:15.6, ports: ["5432:5432"] }
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("port_conflict"), "{msg}");
        assert!(msg.contains("db1") && msg.contains("db2"), "{msg}");
    }

    #[test]
    fn same_host_port_on_disjoint_hosts_is_fine() {
        let config = parse(
            r#"
name: acme
services:
  db1: { host: h1, image: pg:16.2, ports: ["5432:5432"] }
  db2: { host: h2, image: pg:15.6, ports: ["5432:5432"] }
"#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn unpinned_service_image_rejected() {
        for image in ["postgres", "postgres:latest"] {
            let yaml = format!("name: acme\nservices:\n  db: {{ host: h, image: {image} }}\n");
            let err = parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("pinned"), "{image}: {err}");
        }
    }

    #[test]
    fn app_proxy_defaults() {
        let config = parse(
            "name: acme\napps:\n  web: { host: h, image: w, build: {}, ports: [\"8080\"] }\n",
        )
        .unwrap();
        let app = config.workload("web").unwrap().app_settings().unwrap().clone();
        assert_eq!(app.health_path, "/up");
        assert_eq!(app.app_port, 8080);
        assert!(app.ssl);
    }

    #[test]
    fn load_reads_yaml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skiff.yml");
        std::fs::write(&path, BASIC).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.name, "acme");

        let missing = Config::load(&dir.path().join("nope.yml"));
        assert!(missing.is_err());
    }

    #[test]
    fn network_name_is_project_scoped() {
        let config = parse(BASIC).unwrap();
        assert_eq!(config.network_name(), "acme-network");
        assert_eq!(config.workload("web").unwrap().scoped_alias("acme"), "acme-web");
    }
}
