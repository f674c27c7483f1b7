//! Controller for the per-host edge proxy container.
//!
//! The proxy owns ports 80/443 on every host, terminates TLS, and routes by
//! hostname to project-scoped aliases. This module keeps the container itself
//! in shape (install, update, network attachment) and programs routes through
//! the proxy's own CLI via `exec`.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};

use crate::config::{PROXY_CONTAINER_NAME, PortMapping};
use crate::progress::ProgressTracker;
use crate::runtime::{ContainerRuntime, ContainerSpec, RestartPolicy};
use crate::session::DEFAULT_EXEC_TIMEOUT;

/// Host-side directories bind-mounted into the proxy. Atomic journal renames
/// depend on these paths staying stable across proxy updates.
pub const HOST_CERTS_DIR: &str = "/var/lib/skiff-proxy/certs";
pub const HOST_STATE_DIR: &str = "/var/lib/skiff-proxy/state";
const MOUNT_CERTS_DIR: &str = "/data/certs";
const MOUNT_STATE_DIR: &str = "/data/state";

/// Responses from the proxy CLI that count as a successfully programmed route.
const ROUTE_SUCCESS_MARKERS: &[&str] = &[
    "Added",
    "Updated",
    "Route deployed successfully",
    "successfully configured",
];

pub struct ProxyController<'a> {
    runtime: &'a ContainerRuntime,
    image: &'a str,
}

impl<'a> ProxyController<'a> {
    pub fn new(runtime: &'a ContainerRuntime, image: &'a str) -> Self {
        ProxyController { runtime, image }
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.runtime.container_running(PROXY_CONTAINER_NAME).await
    }

    /// Installs the proxy container if missing, starts it if stopped, and
    /// attaches it to every given project network.
    pub async fn ensure(&self, networks: &[String]) -> Result<()> {
        let host = self.runtime.host();
        if !self.runtime.container_exists(PROXY_CONTAINER_NAME).await? {
            ProgressTracker::println(format!("[{host}] installing edge proxy"));
            self.runtime.pull(self.image).await?;
            self.runtime.create_container(&self.container_spec()).await?;
            self.runtime.start(PROXY_CONTAINER_NAME).await?;
        } else if !self.is_running().await? {
            self.runtime.start(PROXY_CONTAINER_NAME).await?;
        }
        for network in networks {
            self.runtime
                .network_connect(PROXY_CONTAINER_NAME, network, &[])
                .await?;
        }
        Ok(())
    }

    /// Replaces the proxy container with the latest image while preserving
    /// certificates and routing state: snapshot the journal, stop and remove,
    /// pull, recreate with the same mounts, reconnect to every project
    /// network found on the host.
    pub async fn update(&self) -> Result<()> {
        let host = self.runtime.host();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let backup = format!("/var/lib/skiff-proxy/state-backup-{ts}.json");
        self.runtime
            .session()
            .exec(
                &[
                    "cp".to_owned(),
                    "-a".to_owned(),
                    format!("{HOST_STATE_DIR}/state.json"),
                    backup.clone(),
                ],
                DEFAULT_EXEC_TIMEOUT,
            )
            .await
            .map(|_| ProgressTracker::println(format!("[{host}] state snapshot at {backup}")))
            .unwrap_or_else(|_| {
                // No state yet is fine on a fresh host.
                ProgressTracker::println(format!("[{host}] no proxy state to snapshot"));
            });

        if self.runtime.container_exists(PROXY_CONTAINER_NAME).await? {
            self.runtime.stop(PROXY_CONTAINER_NAME, 10).await?;
            self.runtime.remove(PROXY_CONTAINER_NAME).await?;
        }
        self.runtime.pull(self.image).await?;
        self.runtime.create_container(&self.container_spec()).await?;
        self.runtime.start(PROXY_CONTAINER_NAME).await?;

        let networks = self.runtime.network_names(Some("-network")).await?;
        for network in &networks {
            self.runtime
                .network_connect(PROXY_CONTAINER_NAME, network, &[])
                .await?;
        }
        ProgressTracker::println(format!(
            "[{host}] proxy updated, reconnected to {} network(s)",
            networks.len()
        ));
        Ok(())
    }

    pub async fn deploy_route(
        &self,
        hostname: &str,
        target: &str,
        project: &str,
        health_path: &str,
        ssl: bool,
    ) -> Result<()> {
        let mut argv = vec![
            "skiff-proxy".to_owned(),
            "deploy".to_owned(),
            "--host".to_owned(),
            hostname.to_owned(),
            "--target".to_owned(),
            target.to_owned(),
            "--project".to_owned(),
            project.to_owned(),
            "--health-path".to_owned(),
            health_path.to_owned(),
        ];
        if ssl {
            argv.push("--ssl".to_owned());
        }
        let output = self
            .runtime
            .exec_in(PROXY_CONTAINER_NAME, &argv)
            .await
            .context("failed to reach the proxy CLI")?;
        if output.exit_code == 0
            && ROUTE_SUCCESS_MARKERS
                .iter()
                .any(|marker| output.stdout.contains(marker))
        {
            Ok(())
        } else {
            Err(anyhow!(
                "proxy rejected route {hostname} -> {target}: {}",
                output.stdout.trim()
            ))
        }
    }

    pub async fn remove_route(&self, hostname: &str) -> Result<()> {
        let argv = vec![
            "skiff-proxy".to_owned(),
            "remove".to_owned(),
            "--host".to_owned(),
            hostname.to_owned(),
        ];
        let output = self.runtime.exec_in(PROXY_CONTAINER_NAME, &argv).await?;
        if output.exit_code == 0 {
            Ok(())
        } else {
            bail!("failed to remove route {hostname}: {}", output.stdout.trim())
        }
    }

    /// Idempotent and commutative: marking an already-healthy route healthy
    /// is a no-op on the proxy side.
    pub async fn set_health(&self, hostname: &str, healthy: bool) -> Result<()> {
        let argv = vec![
            "skiff-proxy".to_owned(),
            "updatehealth".to_owned(),
            "--host".to_owned(),
            hostname.to_owned(),
            "--healthy".to_owned(),
            healthy.to_string(),
        ];
        let output = self.runtime.exec_in(PROXY_CONTAINER_NAME, &argv).await?;
        if output.exit_code == 0 {
            Ok(())
        } else {
            bail!(
                "failed to update health for {hostname}: {}",
                output.stdout.trim()
            )
        }
    }

    pub async fn delete_host(&self, hostname: &str) -> Result<String> {
        let argv = vec![
            "skiff-proxy".to_owned(),
            "delete-host".to_owned(),
            hostname.to_owned(),
        ];
        let output = self.runtime.exec_in(PROXY_CONTAINER_NAME, &argv).await?;
        if output.exit_code == 0 {
            Ok(output.stdout)
        } else {
            bail!("failed to delete host {hostname}: {}", output.stdout.trim())
        }
    }

    pub async fn status(&self) -> Result<String> {
        let argv = vec!["skiff-proxy".to_owned(), "status".to_owned()];
        let output = self.runtime.exec_in(PROXY_CONTAINER_NAME, &argv).await?;
        Ok(output.stdout)
    }

    pub async fn logs(&self, lines: u32) -> Result<String> {
        self.runtime.logs(PROXY_CONTAINER_NAME, lines).await
    }

    fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: PROXY_CONTAINER_NAME.to_owned(),
            image: self.image.to_owned(),
            ports: vec![
                PortMapping { host: Some(80), container: 80 },
                PortMapping { host: Some(443), container: 443 },
            ],
            volumes: vec![
                format!("{HOST_CERTS_DIR}:{MOUNT_CERTS_DIR}"),
                format!("{HOST_STATE_DIR}:{MOUNT_STATE_DIR}"),
            ],
            env: Default::default(),
            network: None,
            network_aliases: Vec::new(),
            restart: RestartPolicy::Always,
            command: None,
            labels: [("skiff.managed".to_owned(), "true".to_owned())]
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn success_markers_cover_documented_responses() {
        for response in [
            "Added route for example.com",
            "Updated route for example.com",
            "Route deployed successfully",
            "example.com successfully configured",
        ] {
            assert!(
                ROUTE_SUCCESS_MARKERS.iter().any(|m| response.contains(m)),
                "{response}"
            );
        }
        assert!(
            !ROUTE_SUCCESS_MARKERS
                .iter()
                .any(|m| "error: no such project".contains(m))
        );
    }
}
