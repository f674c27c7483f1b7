//! Persistent proxy state: routes per project, ACME settings, metadata.
//!
//! Every mutation is serialized to JSON and written with temp-file + fsync +
//! rename *before* the in-memory copy changes, so the serving path never
//! observes state that would not survive a restart. A corrupt file on boot
//! yields a fresh empty state and a loud warning, never a crash loop.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

pub const STATE_FILE: &str = "state.json";
pub const SCHEMA_VERSION: u32 = 1;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectRoutes>,
    #[serde(default)]
    pub lets_encrypt: LetsEncryptConfig,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRoutes {
    #[serde(default)]
    pub hosts: BTreeMap<String, Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Upstream as `{container-alias}:{port}`, resolved over the project
    /// network's DNS.
    pub target: String,
    pub app: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default = "default_true")]
    pub ssl_redirect: bool,
    #[serde(default = "default_true")]
    pub forward_headers: bool,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub status: CertStatus,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Set once the certificate is actually issued; `pending`/`failed`
    /// entries have neither timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LetsEncryptConfig {
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub staging: bool,
    #[serde(default = "default_account_key_path")]
    pub account_key_path: PathBuf,
}

impl Default for LetsEncryptConfig {
    fn default() -> Self {
        LetsEncryptConfig {
            directory_url: default_directory_url(),
            email: String::new(),
            staging: false,
            account_key_path: default_account_key_path(),
        }
    }
}

impl LetsEncryptConfig {
    pub fn effective_directory_url(&self) -> &str {
        if self.staging {
            LETS_ENCRYPT_STAGING
        } else {
            &self.directory_url
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            version: SCHEMA_VERSION,
            last_updated: Utc::now(),
        }
    }
}

fn default_health_path() -> String {
    "/up".to_owned()
}
fn default_true() -> bool {
    true
}
fn default_response_timeout() -> u64 {
    30
}
fn default_directory_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_owned()
}
fn default_account_key_path() -> PathBuf {
    PathBuf::from("account.json")
}

impl ProxyState {
    /// Looks a hostname up across every project's routing table.
    pub fn find_route(&self, hostname: &str) -> Option<(&str, &Route)> {
        self.projects.iter().find_map(|(project, routes)| {
            routes
                .hosts
                .get(hostname)
                .map(|route| (project.as_str(), route))
        })
    }

    pub fn route_mut(&mut self, hostname: &str) -> Option<&mut Route> {
        self.projects
            .values_mut()
            .find_map(|routes| routes.hosts.get_mut(hostname))
    }

    /// Hostnames with SSL enabled and issuance still owed: no certificate or
    /// a pending one. `failed` needs operator intervention and is excluded.
    pub fn hosts_needing_certificates(&self) -> Vec<String> {
        self.projects
            .values()
            .flat_map(|routes| routes.hosts.iter())
            .filter(|(_, route)| {
                route.ssl_enabled
                    && route
                        .certificate
                        .as_ref()
                        .is_none_or(|cert| cert.status == CertStatus::Pending)
            })
            .map(|(hostname, _)| hostname.clone())
            .collect()
    }
}

/// The single writer for proxy state. Readers clone snapshots.
pub struct StateJournal {
    path: PathBuf,
    state: RwLock<ProxyState>,
}

impl StateJournal {
    /// Loads state from `{state_dir}/state.json`. A missing file starts
    /// empty; an unparseable one starts empty with a warning.
    pub fn load(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;
        let path = state_dir.join(STATE_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<ProxyState>(&contents) {
                Ok(state) => state,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "state file is corrupt; starting with a fresh empty state"
                    );
                    ProxyState::default()
                }
            },
            Err(_) => ProxyState::default(),
        };
        Ok(StateJournal {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ProxyState {
        self.state.read().await.clone()
    }

    /// Applies a mutation: clone, mutate, persist atomically, then commit to
    /// memory. If the persist fails the in-memory state is untouched.
    pub async fn mutate<F>(&self, f: F) -> Result<ProxyState>
    where
        F: FnOnce(&mut ProxyState),
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        f(&mut next);
        next.metadata.version = SCHEMA_VERSION;
        next.metadata.last_updated = Utc::now();
        persist(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }
}

/// Write-temp + fsync + rename in the state directory.
fn persist(path: &Path, state: &ProxyState) -> Result<()> {
    let dir = path.parent().context("state path has no parent")?;
    let json = serde_json::to_string_pretty(state)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn route(app: &str) -> Route {
        Route {
            target: format!("acme-{app}:3000"),
            app: app.to_owned(),
            health_path: "/up".to_owned(),
            ssl_enabled: true,
            ssl_redirect: true,
            forward_headers: true,
            response_timeout_secs: 30,
            healthy: true,
            certificate: None,
        }
    }

    #[tokio::test]
    async fn mutations_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let journal = StateJournal::load(dir.path()).unwrap();
        journal
            .mutate(|state| {
                state
                    .projects
                    .entry("acme".to_owned())
                    .or_default()
                    .hosts
                    .insert("example.com".to_owned(), route("web"));
            })
            .await
            .unwrap();
        drop(journal);

        let reloaded = StateJournal::load(dir.path()).unwrap();
        let state = reloaded.snapshot().await;
        let (project, found) = state.find_route("example.com").unwrap();
        assert_eq!(project, "acme");
        assert_eq!(found.target, "acme-web:3000");
    }

    #[tokio::test]
    async fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
        let journal = StateJournal::load(dir.path()).unwrap();
        assert!(journal.snapshot().await.projects.is_empty());
    }

    #[tokio::test]
    async fn unknown_hostname_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = StateJournal::load(dir.path()).unwrap();
        assert!(journal.snapshot().await.find_route("nope.example").is_none());
    }

    #[tokio::test]
    async fn pending_certificates_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let journal = StateJournal::load(dir.path()).unwrap();
        let state = journal
            .mutate(|state| {
                let hosts = &mut state.projects.entry("acme".to_owned()).or_default().hosts;
                hosts.insert("a.example.com".to_owned(), route("web"));
                let mut with_cert = route("api");
                with_cert.certificate = Some(Certificate {
                    status: CertStatus::Active,
                    cert_path: "certs/b/cert.pem".into(),
                    key_path: "certs/b/key.pem".into(),
                    acquired_at: Some(Utc::now()),
                    expires_at: Some(Utc::now()),
                });
                hosts.insert("b.example.com".to_owned(), with_cert);
            })
            .await
            .unwrap();
        assert_eq!(state.hosts_needing_certificates(), vec!["a.example.com"]);
    }

    #[tokio::test]
    async fn noop_mutation_changes_only_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let journal = StateJournal::load(dir.path()).unwrap();
        journal
            .mutate(|state| {
                state
                    .projects
                    .entry("acme".to_owned())
                    .or_default()
                    .hosts
                    .insert("example.com".to_owned(), route("web"));
            })
            .await
            .unwrap();

        let strip_ts = |raw: &str| -> String {
            raw.lines()
                .filter(|line| !line.contains("last_updated"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let before = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        journal.mutate(|_| {}).await.unwrap();
        let after = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();

        assert_eq!(strip_ts(&before), strip_ts(&after));
    }

    #[test]
    fn staging_overrides_directory_url() {
        let mut le = LetsEncryptConfig::default();
        assert_eq!(le.effective_directory_url(), LETS_ENCRYPT_PRODUCTION);
        le.staging = true;
        assert_eq!(le.effective_directory_url(), LETS_ENCRYPT_STAGING);
    }
}
