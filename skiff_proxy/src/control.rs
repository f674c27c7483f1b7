//! Control plane: the CLI verbs the deploy engine drives via `docker exec`.
//!
//! When the daemon is up, verbs reach it as JSON lines over a unix socket in
//! the state directory, keeping all journal writes in one process. When it
//! is not (first install, maintenance), the CLI applies the mutation to the
//! journal directly; the daemon reconciles outstanding certificate work on
//! its next boot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

use crate::acme::{CertQueue, ChallengeMap, QueueStatus};
use crate::state::{CertStatus, Certificate, StateJournal};
use crate::tls::CertStore;

pub const CONTROL_SOCKET: &str = "control.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    Deploy {
        host: String,
        target: String,
        project: String,
        health_path: String,
        ssl: bool,
    },
    Remove {
        host: String,
    },
    List,
    Status,
    UpdateHealth {
        host: String,
        healthy: bool,
    },
    DeleteHost {
        host: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub message: String,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Response { ok: true, message: message.into() }
    }

    fn err(message: impl Into<String>) -> Self {
        Response { ok: false, message: message.into() }
    }
}

/// Shared handles every command applies against.
pub struct ProxyContext {
    pub journal: Arc<StateJournal>,
    pub certs: Arc<CertStore>,
    pub queue: Arc<CertQueue>,
    pub challenges: ChallengeMap,
    pub certs_dir: PathBuf,
}

pub async fn apply(ctx: &ProxyContext, command: Command) -> Response {
    match command {
        Command::Deploy { host, target, project, health_path, ssl } => {
            deploy_route(ctx, host, target, project, health_path, ssl).await
        }
        Command::Remove { host } => {
            let result = ctx
                .journal
                .mutate(|state| {
                    for routes in state.projects.values_mut() {
                        routes.hosts.remove(&host);
                    }
                    state.projects.retain(|_, routes| !routes.hosts.is_empty());
                })
                .await;
            match result {
                Ok(_) => Response::ok(format!("Removed route for {host}")),
                Err(err) => Response::err(format!("failed to persist removal: {err:#}")),
            }
        }
        Command::List => {
            let state = ctx.journal.snapshot().await;
            let mut lines = Vec::new();
            for (project, routes) in &state.projects {
                for (hostname, route) in &routes.hosts {
                    let cert = match &route.certificate {
                        Some(cert) => format!("{:?}", cert.status).to_lowercase(),
                        None => "none".to_owned(),
                    };
                    lines.push(format!(
                        "{hostname} -> {} [project {project}] ssl={} cert={cert} healthy={}",
                        route.target, route.ssl_enabled, route.healthy
                    ));
                }
            }
            if lines.is_empty() {
                lines.push("no routes configured".to_owned());
            }
            Response::ok(lines.join("\n"))
        }
        Command::Status => {
            let state = ctx.journal.snapshot().await;
            let mut lines = vec![format!(
                "state version {} updated {}",
                state.metadata.version, state.metadata.last_updated
            )];
            let routes: usize = state.projects.values().map(|r| r.hosts.len()).sum();
            lines.push(format!("{} project(s), {routes} route(s)", state.projects.len()));
            for request in ctx.queue.snapshot() {
                let status = match request.status {
                    QueueStatus::Pending => "pending",
                    QueueStatus::Retrying => "retrying",
                    QueueStatus::Failed => "failed",
                };
                lines.push(format!(
                    "certificate {}: {status}, attempts {}, next attempt {}",
                    request.hostname, request.attempts, request.next_attempt_at
                ));
            }
            Response::ok(lines.join("\n"))
        }
        Command::UpdateHealth { host, healthy } => {
            let result = ctx
                .journal
                .mutate(|state| {
                    if let Some(route) = state.route_mut(&host) {
                        route.healthy = healthy;
                    }
                })
                .await;
            match result {
                Ok(_) => Response::ok(format!("Updated health for {host}: healthy={healthy}")),
                Err(err) => Response::err(format!("failed to persist health update: {err:#}")),
            }
        }
        Command::DeleteHost { host } => {
            let result = ctx
                .journal
                .mutate(|state| {
                    for routes in state.projects.values_mut() {
                        routes.hosts.remove(&host);
                    }
                    state.projects.retain(|_, routes| !routes.hosts.is_empty());
                })
                .await;
            match result {
                Ok(_) => {
                    ctx.certs.remove(&host);
                    let dir = ctx.certs_dir.join(&host);
                    if dir.exists() {
                        let _ = std::fs::remove_dir_all(&dir);
                    }
                    Response::ok(format!("Deleted host {host} and its certificates"))
                }
                Err(err) => Response::err(format!("failed to persist deletion: {err:#}")),
            }
        }
    }
}

async fn deploy_route(
    ctx: &ProxyContext,
    host: String,
    target: String,
    project: String,
    health_path: String,
    ssl: bool,
) -> Response {
    let cert_dir = ctx.certs_dir.join(&host);
    let app = target
        .split(':')
        .next()
        .map(|alias| {
            alias
                .strip_prefix(&format!("{project}-"))
                .unwrap_or(alias)
                .to_owned()
        })
        .unwrap_or_else(|| target.clone());

    let result = ctx
        .journal
        .mutate(|state| {
            let routes = state.projects.entry(project.clone()).or_default();
            let existing_cert = routes
                .hosts
                .get(&host)
                .and_then(|route| route.certificate.clone());
            // An active certificate survives route updates untouched.
            let certificate = match existing_cert {
                Some(cert) => Some(cert),
                None if ssl => Some(Certificate {
                    status: CertStatus::Pending,
                    cert_path: cert_dir.join("cert.pem"),
                    key_path: cert_dir.join("key.pem"),
                    acquired_at: None,
                    expires_at: None,
                }),
                None => None,
            };
            routes.hosts.insert(
                host.clone(),
                crate::state::Route {
                    target: target.clone(),
                    app: app.clone(),
                    health_path: health_path.clone(),
                    ssl_enabled: ssl,
                    ssl_redirect: ssl,
                    forward_headers: true,
                    response_timeout_secs: 30,
                    healthy: true,
                    certificate,
                },
            );
        })
        .await;

    let state = match result {
        Ok(state) => state,
        Err(err) => return Response::err(format!("failed to persist route: {err:#}")),
    };

    let needs_cert = ssl
        && state
            .find_route(&host)
            .and_then(|(_, route)| route.certificate.as_ref())
            .is_some_and(|cert| cert.status == CertStatus::Pending);
    if needs_cert {
        ctx.queue.enqueue(&host, &state.lets_encrypt.email);
    }

    Response::ok(format!(
        "Route deployed successfully: {host} -> {target} (at {})",
        Utc::now()
    ))
}

/// Daemon side: accept JSON-line commands on the control socket.
pub async fn serve(ctx: Arc<ProxyContext>, state_dir: &Path) -> Result<()> {
    let path = state_dir.join(CONTROL_SOCKET);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("cannot bind control socket {}", path.display()))?;
    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let response = match serde_json::from_str::<Command>(&line) {
                    Ok(command) => apply(&ctx, command).await,
                    Err(err) => {
                        warn!(error = %err, "rejecting malformed control command");
                        Response::err(format!("malformed command: {err}"))
                    }
                };
                let Ok(mut payload) = serde_json::to_string(&response) else {
                    break;
                };
                payload.push('\n');
                if write.write_all(payload.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Client side: one command, one response.
pub async fn send(state_dir: &Path, command: &Command) -> Result<Response> {
    let path = state_dir.join(CONTROL_SOCKET);
    let stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("proxy daemon not reachable at {}", path.display()))?;
    let (read, mut write) = stream.into_split();
    let mut payload = serde_json::to_string(command)?;
    payload.push('\n');
    write.write_all(payload.as_bytes()).await?;

    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await?
        .context("daemon closed the connection without responding")?;
    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    fn context(dir: &Path) -> ProxyContext {
        ProxyContext {
            journal: Arc::new(StateJournal::load(dir).unwrap()),
            certs: CertStore::new(),
            queue: CertQueue::new(),
            challenges: Arc::new(RwLock::new(HashMap::new())),
            certs_dir: dir.join("certs"),
        }
    }

    #[tokio::test]
    async fn deploy_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let response = apply(
            &ctx,
            Command::Deploy {
                host: "example.com".to_owned(),
                target: "acme-web:3000".to_owned(),
                project: "acme".to_owned(),
                health_path: "/up".to_owned(),
                ssl: true,
            },
        )
        .await;
        assert!(response.ok);
        assert!(response.message.contains("Route deployed successfully"));

        let list = apply(&ctx, Command::List).await;
        assert!(list.message.contains("example.com -> acme-web:3000"));
        assert!(list.message.contains("cert=pending"));

        // SSL route without a certificate gets queued.
        assert_eq!(ctx.queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn redeploy_preserves_an_active_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        ctx.journal
            .mutate(|state| {
                let routes = state.projects.entry("acme".to_owned()).or_default();
                routes.hosts.insert(
                    "example.com".to_owned(),
                    crate::state::Route {
                        target: "acme-web:3000".to_owned(),
                        app: "web".to_owned(),
                        health_path: "/up".to_owned(),
                        ssl_enabled: true,
                        ssl_redirect: true,
                        forward_headers: true,
                        response_timeout_secs: 30,
                        healthy: true,
                        certificate: Some(Certificate {
                            status: CertStatus::Active,
                            cert_path: "certs/example.com/cert.pem".into(),
                            key_path: "certs/example.com/key.pem".into(),
                            acquired_at: Some(Utc::now()),
                            expires_at: Some(Utc::now()),
                        }),
                    },
                );
            })
            .await
            .unwrap();

        let response = apply(
            &ctx,
            Command::Deploy {
                host: "example.com".to_owned(),
                target: "acme-web:4000".to_owned(),
                project: "acme".to_owned(),
                health_path: "/health".to_owned(),
                ssl: true,
            },
        )
        .await;
        assert!(response.ok);

        let state = ctx.journal.snapshot().await;
        let (_, route) = state.find_route("example.com").unwrap();
        assert_eq!(route.target, "acme-web:4000");
        assert_eq!(
            route.certificate.as_ref().unwrap().status,
            CertStatus::Active
        );
        // Nothing to issue, so nothing queued.
        assert!(ctx.queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn update_health_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        apply(
            &ctx,
            Command::Deploy {
                host: "example.com".to_owned(),
                target: "acme-web:3000".to_owned(),
                project: "acme".to_owned(),
                health_path: "/up".to_owned(),
                ssl: false,
            },
        )
        .await;

        for _ in 0..2 {
            let response = apply(
                &ctx,
                Command::UpdateHealth { host: "example.com".to_owned(), healthy: false },
            )
            .await;
            assert!(response.ok);
        }
        let state = ctx.journal.snapshot().await;
        assert!(!state.find_route("example.com").unwrap().1.healthy);
    }

    #[tokio::test]
    async fn delete_host_drops_route_and_empty_project() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        apply(
            &ctx,
            Command::Deploy {
                host: "example.com".to_owned(),
                target: "acme-web:3000".to_owned(),
                project: "acme".to_owned(),
                health_path: "/up".to_owned(),
                ssl: false,
            },
        )
        .await;
        let response = apply(&ctx, Command::DeleteHost { host: "example.com".to_owned() }).await;
        assert!(response.ok);
        let state = ctx.journal.snapshot().await;
        assert!(state.projects.is_empty());
    }
}
