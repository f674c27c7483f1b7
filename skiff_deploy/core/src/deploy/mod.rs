//! Workload deployers: blue/green for apps, stop/start for services.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Workload;
use crate::fingerprint::{Fingerprint, FingerprintKind};
use crate::runtime::{ContainerSpec, RestartPolicy, labels};
use crate::secrets::SecretStore;

pub mod app;
pub mod service;

pub use app::{AppDeployer, AppOutcome, Color};
pub use service::{ServiceDeployer, ServiceOutcome};

/// What a finished deploy did on the host.
#[derive(Debug, Clone)]
pub enum Outcome {
    App(AppOutcome),
    Service(ServiceOutcome),
}

/// Common seam over the two transition strategies; the orchestrator picks
/// one per workload and drives it without caring which.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn execute(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<Outcome>;
}

#[async_trait]
impl Deployer for AppDeployer<'_> {
    async fn execute(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<Outcome> {
        self.deploy(image_ref, fingerprint, secrets)
            .await
            .map(Outcome::App)
    }
}

#[async_trait]
impl Deployer for ServiceDeployer<'_> {
    async fn execute(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<Outcome> {
        self.deploy(image_ref, fingerprint, secrets)
            .await
            .map(Outcome::Service)
    }
}

/// A deploy that was aborted before cutover; the previous generation remains
/// authoritative.
#[derive(Debug)]
pub struct DeployAborted {
    pub cause: AbortCause,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    CreateFailed,
    Unhealthy,
    CutoverFailed,
}

impl fmt::Display for DeployAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self.cause {
            AbortCause::CreateFailed => "create_failed",
            AbortCause::Unhealthy => "unhealthy",
            AbortCause::CutoverFailed => "cutover_failed",
        };
        write!(f, "deploy aborted ({cause}): {}", self.detail)
    }
}

impl std::error::Error for DeployAborted {}

/// Resolved environment for a container: plain pairs plus secret values.
pub fn resolved_env(workload: &Workload, secrets: &SecretStore) -> Result<BTreeMap<String, String>> {
    let mut env: BTreeMap<String, String> = workload.env_plain.iter().cloned().collect();
    for (key, value) in secrets.resolve(&workload.env_secret_keys)? {
        env.insert(key, value);
    }
    Ok(env)
}

/// Labels common to every managed container of a workload.
pub fn base_labels(
    workload: &Workload,
    project: &str,
    fingerprint: &Fingerprint,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::from([
        (labels::MANAGED.to_owned(), "true".to_owned()),
        (labels::PROJECT.to_owned(), project.to_owned()),
        (labels::CONFIG_HASH.to_owned(), fingerprint.config_hash.clone()),
        (labels::SECRETS_HASH.to_owned(), fingerprint.secrets_hash.clone()),
        (
            labels::FINGERPRINT_TYPE.to_owned(),
            fingerprint.kind.to_string(),
        ),
    ]);
    if workload.is_app() {
        out.insert(labels::TYPE.to_owned(), "app".to_owned());
        out.insert(labels::APP.to_owned(), workload.name.clone());
    } else {
        out.insert(labels::TYPE.to_owned(), "service".to_owned());
        out.insert(labels::SERVICE.to_owned(), workload.name.clone());
    }
    if fingerprint.kind == FingerprintKind::External {
        if let Some(reference) = &fingerprint.image_reference {
            out.insert(labels::IMAGE_REFERENCE.to_owned(), reference.clone());
        }
    }
    out
}

/// Container spec shared by both deployers; callers add naming, aliases, and
/// kind-specific labels on top.
pub fn base_spec(
    workload: &Workload,
    image_ref: &str,
    network: &str,
    env: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
) -> ContainerSpec {
    ContainerSpec {
        name: String::new(),
        image: image_ref.to_owned(),
        ports: workload.ports.clone(),
        volumes: workload.volumes.clone(),
        env,
        network: Some(network.to_owned()),
        network_aliases: Vec::new(),
        restart: RestartPolicy::UnlessStopped,
        command: workload.command.clone(),
        labels,
    }
}
