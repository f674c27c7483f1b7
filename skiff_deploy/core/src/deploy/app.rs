//! Zero-downtime blue/green deployment for apps.
//!
//! Each deploy walks: plan the new color, prepare names, create and start the
//! new generation, health-check it through the proxy's own network path, move
//! the DNS aliases over, then drain the old generation. Any failure before
//! the alias switch tears the new generation down and leaves the old color
//! authoritative; failures during drain are warnings.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::config::{AppSettings, Workload};
use crate::fingerprint::Fingerprint;
use crate::progress::ProgressTracker;
use crate::runtime::{ContainerRuntime, labels};
use crate::secrets::SecretStore;

use super::{AbortCause, DeployAborted, base_labels, base_spec, resolved_env};

const DRAIN_GRACE_SECS: u64 = 30;
const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;
const HEALTH_PROBE_TRIES: u32 = 60;
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn opposite(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn parse(s: &str) -> Option<Color> {
        match s {
            "blue" => Some(Color::Blue),
            "green" => Some(Color::Green),
            _ => None,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Color::Blue => "blue",
            Color::Green => "green",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppOutcome {
    pub color: Color,
    pub containers: Vec<String>,
}

/// Container names for one color of an app: `{project}-{app}-{color}` for a
/// single replica, `-1..N` suffixes otherwise.
pub fn replica_names(project: &str, app: &str, color: Color, replicas: u32) -> Vec<String> {
    if replicas == 1 {
        vec![format!("{project}-{app}-{color}")]
    } else {
        (1..=replicas)
            .map(|i| format!("{project}-{app}-{color}-{i}"))
            .collect()
    }
}

pub struct AppDeployer<'a> {
    runtime: &'a ContainerRuntime,
    project: &'a str,
    network: String,
    proxy_container: &'a str,
    app: &'a Workload,
    settings: &'a AppSettings,
}

impl<'a> AppDeployer<'a> {
    pub fn new(
        runtime: &'a ContainerRuntime,
        project: &'a str,
        network: impl Into<String>,
        proxy_container: &'a str,
        app: &'a Workload,
    ) -> Result<Self> {
        let settings = app
            .app_settings()
            .ok_or_else(|| anyhow!("{:?} is not an app", app.name))?;
        Ok(AppDeployer {
            runtime,
            project,
            network: network.into(),
            proxy_container,
            app,
            settings,
        })
    }

    /// Runs the full color-flip state machine for one (app, host).
    pub async fn deploy(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
    ) -> Result<AppOutcome> {
        let host = self.runtime.host();
        let app = &self.app.name;

        // Planning: the serving color is the one holding the project alias.
        let current = self.current_color().await?;
        let new_color = current.map(Color::opposite).unwrap_or(Color::Blue);
        ProgressTracker::println(format!(
            "[{host}] {app}: deploying {new_color} (current: {})",
            current.map(|c| c.to_string()).unwrap_or_else(|| "none".to_owned()),
        ));

        // Preparing: clear out stale holders of the target names.
        let new_names = replica_names(self.project, app, new_color, self.app.replicas);
        for name in &new_names {
            if self.runtime.container_exists(name).await.unwrap_or(false) {
                let _ = self.runtime.remove(name).await;
            }
        }

        // Creating. Aliases go on at creation only when nothing serves yet;
        // otherwise they move over atomically at the switch step so no new
        // container sees routed traffic before it proved healthy.
        let aliases = self.aliases();
        let creation_aliases: &[String] = if current.is_none() { &aliases } else { &[] };
        if let Err(err) = self
            .create_generation(image_ref, fingerprint, secrets, new_color, &new_names, creation_aliases)
            .await
        {
            self.destroy(&new_names).await;
            return Err(anyhow::Error::new(DeployAborted {
                cause: AbortCause::CreateFailed,
                detail: format!("{err:#}"),
            }));
        }

        // HealthChecking; apps without published ports have nothing to probe.
        if !self.app.ports.is_empty() {
            if self.settings.health_start_period_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.settings.health_start_period_secs))
                    .await;
            }
            if let Err(err) = self.health_check_all(&new_names).await {
                self.destroy(&new_names).await;
                return Err(anyhow::Error::new(DeployAborted {
                    cause: AbortCause::Unhealthy,
                    detail: format!("{err:#}"),
                }));
            }
        }

        // Switching: move both aliases from the old generation to the new one,
        // disconnect-then-connect across the full set before anything is
        // drained. First deploys already aliased at creation.
        let old_names = match current {
            Some(old_color) => self.containers_of_color(old_color).await?,
            None => Vec::new(),
        };
        if !old_names.is_empty() {
            if let Err(err) = self.switch_aliases(&old_names, &new_names, &aliases).await {
                // Put the old generation back in front before tearing down.
                self.restore_aliases(&old_names, &aliases).await;
                self.destroy(&new_names).await;
                return Err(anyhow::Error::new(DeployAborted {
                    cause: AbortCause::CutoverFailed,
                    detail: format!("{err:#}"),
                }));
            }
        }

        // The new generation is authoritative from here on; its containers
        // carry active=true from creation and are now the sole alias holders.
        ProgressTracker::println(format!("[{host}] {app}: {new_color} is now active"));

        // Draining: errors past cutover must not fail the deploy.
        if !old_names.is_empty() {
            let stops = old_names.iter().map(|name| async move {
                self.runtime.stop(name, DRAIN_GRACE_SECS).await?;
                self.runtime.remove(name).await
            });
            for (name, result) in old_names.iter().zip(futures::future::join_all(stops).await) {
                if let Err(err) = result {
                    ProgressTracker::eprintln(format!(
                        "[{host}] {app}: warning: failed to drain {name}: {err:#}"
                    ));
                }
            }
        }

        Ok(AppOutcome {
            color: new_color,
            containers: new_names,
        })
    }

    fn aliases(&self) -> Vec<String> {
        vec![self.app.name.clone(), self.app.scoped_alias(self.project)]
    }

    /// The color currently serving: the one whose containers hold the
    /// project-scoped alias, falling back to the active label for containers
    /// that predate a completed switch.
    async fn current_color(&self) -> Result<Option<Color>> {
        let names = self.all_app_containers().await?;
        let scoped = self.app.scoped_alias(self.project);
        let mut labeled_fallback = None;
        for name in &names {
            let Some(details) = self.runtime.inspect_opt(name).await? else {
                continue;
            };
            let color = details.label(labels::COLOR).and_then(Color::parse);
            if details.aliases_on(&self.network).contains(&scoped) {
                if let Some(color) = color {
                    return Ok(Some(color));
                }
            }
            if details.label(labels::ACTIVE) == Some("true") {
                labeled_fallback = labeled_fallback.or(color);
            }
        }
        Ok(labeled_fallback)
    }

    async fn all_app_containers(&self) -> Result<Vec<String>> {
        self.runtime
            .names_by_label(
                &[
                    (labels::MANAGED.to_owned(), "true".to_owned()),
                    (labels::PROJECT.to_owned(), self.project.to_owned()),
                    (labels::APP.to_owned(), self.app.name.clone()),
                ],
                true,
            )
            .await
    }

    async fn containers_of_color(&self, color: Color) -> Result<Vec<String>> {
        self.runtime
            .names_by_label(
                &[
                    (labels::MANAGED.to_owned(), "true".to_owned()),
                    (labels::PROJECT.to_owned(), self.project.to_owned()),
                    (labels::APP.to_owned(), self.app.name.clone()),
                    (labels::COLOR.to_owned(), color.to_string()),
                ],
                true,
            )
            .await
    }

    async fn create_generation(
        &self,
        image_ref: &str,
        fingerprint: &Fingerprint,
        secrets: &SecretStore,
        color: Color,
        names: &[String],
        aliases: &[String],
    ) -> Result<()> {
        let env = resolved_env(self.app, secrets)?;
        for value in env.values() {
            self.runtime.session().redact_value(value.clone());
        }
        for (i, name) in names.iter().enumerate() {
            let mut container_labels = base_labels(self.app, self.project, fingerprint);
            container_labels.insert(labels::COLOR.to_owned(), color.to_string());
            container_labels.insert(labels::REPLICA.to_owned(), (i + 1).to_string());
            container_labels.insert(labels::ACTIVE.to_owned(), "true".to_owned());

            let mut spec = base_spec(self.app, image_ref, &self.network, env.clone(), container_labels);
            spec.name = name.clone();
            spec.network_aliases = aliases.to_vec();

            self.runtime.create_container(&spec).await?;
            self.runtime
                .start(name)
                .await
                .with_context(|| format!("created {name} but failed to start it"))?;
        }
        Ok(())
    }

    async fn health_check_all(&self, names: &[String]) -> Result<()> {
        let probes = names.iter().map(|name| self.health_check_one(name));
        futures::future::try_join_all(probes).await?;
        Ok(())
    }

    /// Probes one container over HTTP from inside the proxy container, so the
    /// check exercises the exact network path real traffic will take.
    async fn health_check_one(&self, name: &str) -> Result<()> {
        let url = format!(
            "http://{name}:{}{}",
            self.settings.app_port, self.settings.health_path
        );
        let inner = vec![
            "skiff-proxy".to_owned(),
            "probe".to_owned(),
            "--url".to_owned(),
            url.clone(),
            "--timeout".to_owned(),
            HEALTH_PROBE_TIMEOUT_SECS.to_string(),
        ];
        let mut last = String::new();
        for _ in 0..HEALTH_PROBE_TRIES {
            let output = self
                .runtime
                .exec_in_with_timeout(
                    self.proxy_container,
                    &inner,
                    Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS + 5),
                )
                .await?;
            if output.exit_code == 0 {
                return Ok(());
            }
            last = output.stdout;
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
        }
        Err(anyhow!(
            "{name} never became healthy at {url} after {HEALTH_PROBE_TRIES} tries: {last}"
        ))
    }

    /// All-or-nothing alias move: every old container loses the aliases, then
    /// every new container gains them, before any label/drain step runs. The
    /// runtime cannot atomically replace an alias set, so the brief window
    /// between disconnect and reconnect is accepted.
    async fn switch_aliases(
        &self,
        old_names: &[String],
        new_names: &[String],
        aliases: &[String],
    ) -> Result<()> {
        for name in old_names {
            self.runtime.network_disconnect(name, &self.network).await?;
            // Keep the old generation reachable by container name while it
            // serves in-flight requests during the drain grace.
            self.runtime.network_connect(name, &self.network, &[]).await?;
        }
        for name in new_names {
            self.runtime.network_disconnect(name, &self.network).await?;
            self.runtime
                .network_connect(name, &self.network, aliases)
                .await?;
        }
        Ok(())
    }

    async fn restore_aliases(&self, old_names: &[String], aliases: &[String]) {
        for name in old_names {
            let _ = self.runtime.network_disconnect(name, &self.network).await;
            let _ = self
                .runtime
                .network_connect(name, &self.network, aliases)
                .await;
        }
    }

    /// Failure-tolerant teardown of a half-created generation.
    async fn destroy(&self, names: &[String]) {
        for name in names {
            let _ = self.runtime.stop(name, 10).await;
            let _ = self.runtime.remove(name).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_replica_name_has_no_suffix() {
        assert_eq!(
            replica_names("acme", "web", Color::Blue, 1),
            vec!["acme-web-blue"]
        );
    }

    #[test]
    fn multi_replica_names_are_suffixed_from_one() {
        assert_eq!(
            replica_names("acme", "web", Color::Green, 3),
            vec!["acme-web-green-1", "acme-web-green-2", "acme-web-green-3"]
        );
    }

    #[test]
    fn opposite_color_round_trips() {
        assert_eq!(Color::Blue.opposite(), Color::Green);
        assert_eq!(Color::Green.opposite(), Color::Blue);
        assert_eq!(Color::parse("blue"), Some(Color::Blue));
        assert_eq!(Color::parse("purple"), None);
    }
}
