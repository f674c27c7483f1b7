//! In-place replacement for stateful services.
//!
//! A service runs as a single container named `{project}-{name}`. The
//! config-hash label on the live container is the sole authority for "did
//! anything change": match means no-op, mismatch or a missing label means
//! stop, remove, recreate.

use anyhow::{Context, Result};

use crate::config::Workload;
use crate::fingerprint::Fingerprint;
use crate::progress::ProgressTracker;
use crate::runtime::{ContainerRuntime, labels};
use crate::secrets::SecretStore;

use super::{base_labels, base_spec, resolved_env};

const STOP_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Created,
    Replaced,
    Unchanged,
}

pub struct ServiceDeployer<'a> {
    runtime: &'a ContainerRuntime,
    project: &'a str,
    network: String,
    service: &'a Workload,
}

impl<'a> ServiceDeployer<'a> {
    pub fn new(
        runtime: &'a ContainerRuntime,
        project: &'a str,
        network: impl Into<String>,
        service: &'a Workload,
    ) -> Self {
        ServiceDeployer {
            runtime,
            project,
            network: network.into(),
            service,
        }
    }

    pub fn container_name(&self) -> String {
        format!("{}-{}", self.project, self.service.name)
    }

    pub async fn deploy(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<ServiceOutcome> {
        let name = self.container_name();
        let host = self.runtime.host();

        let outcome = match self.runtime.inspect_opt(&name).await? {
            None => {
                self.create(&name, image_ref, fingerprint, secrets).await?;
                ServiceOutcome::Created
            }
            Some(details) => {
                // Port/volume/env diffs all fold into the hash; containers
                // without the label predate hash tracking and are replaced.
                let current_hash = details.label(labels::CONFIG_HASH);
                if current_hash == Some(fingerprint.config_hash.as_str())
                    && details.state.running
                {
                    ProgressTracker::println(format!("[{host}] {name}: unchanged"));
                    return Ok(ServiceOutcome::Unchanged);
                }
                self.runtime
                    .stop(&name, STOP_GRACE_SECS)
                    .await
                    .with_context(|| format!("failed to stop {name} for replacement"))?;
                self.runtime.remove(&name).await?;
                self.create(&name, image_ref, fingerprint, secrets).await?;
                ServiceOutcome::Replaced
            }
        };
        ProgressTracker::println(format!("[{host}] {name}: {outcome:?}"));
        Ok(outcome)
    }

    async fn create(
        &self,
        name: &str,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<()> {
        let env = resolved_env(self.service, secrets)?;
        for value in env.values() {
            self.runtime.session().redact_value(value.clone());
        }
        let mut spec = base_spec(
            self.service,
            image_ref,
            &self.network,
            env,
            base_labels(self.service, self.project, fingerprint),
        );
        spec.name = name.to_owned();
        spec.network_aliases = vec![
            self.service.name.clone(),
            self.service.scoped_alias(self.project),
        ];

        self.runtime.create_container(&spec).await?;
        self.runtime
            .start(name)
            .await
            .with_context(|| format!("created {name} but failed to start it"))?;
        Ok(())
    }
}
