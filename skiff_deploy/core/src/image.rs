//! Build, tag, push, and distribute workload images.
//!
//! Built workloads are produced on the operator machine by the external
//! builder, pushed to the configured registry under the release tag, and
//! pulled on each host. External workloads are pulled on the host as-is.
//! Registry credentials are scoped: log in, pull, log out; nothing persists.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

use crate::config::{RegistryConfig, Workload};
use crate::progress::ProgressTracker;
use crate::runtime::{ContainerRuntime, cmd};
use crate::secrets::SecretStore;
use crate::session::CommandError;

/// Image reference a host should run a workload from after distribution.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub run_ref: String,
}

/// Tags for one release of a built workload: the immutable release tag plus
/// the moving `latest` used for fingerprinting.
pub fn local_tags(repo: &str, release_id: &str) -> Vec<String> {
    vec![format!("{repo}:{release_id}"), format!("{repo}:latest")]
}

/// Fully qualified registry reference for a repo + tag.
pub fn registry_ref(registry: &RegistryConfig, repo: &str, tag: &str) -> String {
    if registry.registry == "docker.io" {
        format!("{}/{repo}:{tag}", registry.username)
    } else {
        format!("{}/{}/{repo}:{tag}", registry.registry, registry.username)
    }
}

/// Builds a workload image locally with both release and latest tags.
pub async fn build(workload: &Workload, project: &str, release_id: &str) -> Result<()> {
    let Some(build_spec) = &workload.build else {
        bail!("workload {:?} has no build section", workload.name);
    };
    let repo = workload.repo(project);
    let tags = local_tags(&repo, release_id);
    let argv = cmd::build(
        &build_spec.context,
        build_spec.dockerfile.as_deref(),
        &build_spec.args,
        build_spec.target.as_deref(),
        &build_spec.platform,
        &tags,
    );
    ProgressTracker::leaf(format!("building {repo}:{release_id}"), run_local(&argv, &[]))
        .await
        .with_context(|| format!("image build failed for {repo}"))?;
    Ok(())
}

/// Pushes the release tag to the registry, logging in locally only for the
/// duration of the push when credentials are configured.
pub async fn push(
    workload: &Workload,
    project: &str,
    release_id: &str,
    registry: &RegistryConfig,
    secrets: &SecretStore,
) -> Result<()> {
    let repo = workload.repo(project);
    let local = format!("{repo}:{release_id}");
    let remote = registry_ref(registry, &repo, release_id);

    run_local(&cmd::tag(&local, &remote), &[]).await?;

    let password = secrets.get(&registry.password_secret);
    if let Some(password) = password {
        login_local(registry, password).await?;
    }
    let result = ProgressTracker::leaf(
        format!("pushing {remote}"),
        run_local(&cmd::push(&remote), &[password.unwrap_or("")]),
    )
    .await;
    if password.is_some() {
        // Best-effort: a failed logout must not mask the push result.
        let _ = run_local(&cmd::logout(&registry.registry), &[]).await;
    }
    result.with_context(|| format!("failed to push {remote}"))?;
    Ok(())
}

/// Makes the workload's image present on the host and returns the reference
/// containers should run from.
pub async fn distribute(
    runtime: &ContainerRuntime,
    workload: &Workload,
    project: &str,
    release_id: &str,
    registry: Option<&RegistryConfig>,
    secrets: &SecretStore,
) -> Result<PreparedImage> {
    let registry = workload.registry.as_ref().or(registry);

    if workload.is_built() {
        let Some(registry) = registry else {
            bail!(
                "built workload {:?} needs a registry to distribute through",
                workload.name
            );
        };
        let repo = workload.repo(project);
        let remote = registry_ref(registry, &repo, release_id);
        let run_ref = format!("{repo}:{release_id}");

        with_host_login(runtime, Some(registry), secrets, || async {
            runtime.pull(&remote).await
        })
        .await?;
        // Retag so host-side fingerprinting sees {repo}:latest like the
        // operator machine does.
        runtime.tag(&remote, &run_ref).await?;
        runtime.tag(&remote, &format!("{repo}:latest")).await?;
        Ok(PreparedImage { run_ref })
    } else {
        with_host_login(runtime, registry, secrets, || async {
            runtime.pull(&workload.image).await
        })
        .await?;
        Ok(PreparedImage {
            run_ref: workload.image.clone(),
        })
    }
}

/// Scoped host-side login: credentials are sent over stdin, used for the
/// operation, and removed again with `logout`.
async fn with_host_login<F, Fut>(
    runtime: &ContainerRuntime,
    registry: Option<&RegistryConfig>,
    secrets: &SecretStore,
    op: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let creds = registry.and_then(|r| secrets.get(&r.password_secret).map(|p| (r, p)));
    if let Some((registry, password)) = creds {
        runtime
            .login(&registry.registry, &registry.username, password)
            .await?;
        let result = op().await;
        let _ = runtime.logout(&registry.registry).await;
        result
    } else {
        op().await
    }
}

/// Content id of a local image, or `None` when it does not exist yet.
pub async fn local_image_id(image: &str) -> Result<Option<String>> {
    match run_local(&cmd::image_id(image), &[]).await {
        Ok(out) => Ok(Some(out.trim().to_owned())),
        Err(err) => {
            let text = err
                .downcast_ref::<CommandError>()
                .map(|e| e.stderr.clone())
                .unwrap_or_default();
            if text.contains("No such") || text.contains("not found") {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

async fn login_local(registry: &RegistryConfig, password: &str) -> Result<()> {
    let argv = cmd::login(&registry.registry, &registry.username);
    let binary = which::which(&argv[0])
        .with_context(|| format!("container CLI `{}` not found on PATH", argv[0]))?;
    let mut child = Command::new(binary)
        .args(&argv[1..])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("stdin piped above");
        stdin.write_all(password.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if output.status.success() {
        // Unencrypted-credential warnings land on stderr with status 0; that
        // is success, not an error.
        Ok(())
    } else {
        bail!(
            "registry login to {} failed: {}",
            registry.registry,
            redact(&String::from_utf8_lossy(&output.stderr), &[password])
        )
    }
}

/// Runs a local command, surfacing non-zero exits as [`CommandError`] with
/// `hide` values redacted.
async fn run_local(argv: &[String], hide: &[&str]) -> Result<String> {
    let binary = which::which(&argv[0])
        .with_context(|| format!("container CLI `{}` not found on PATH", argv[0]))?;
    let output = tokio::time::timeout(
        Duration::from_secs(600),
        Command::new(binary).args(&argv[1..]).output(),
    )
    .await
    .with_context(|| format!("local command `{}` timed out", argv.join(" ")))??;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(anyhow::Error::new(CommandError {
            exit_code: output.status.code().unwrap_or(-1) as u32,
            stdout: redact(&stdout, hide),
            stderr: redact(&stderr, hide),
            command: redact(&argv.join(" "), hide),
        }))
    }
}

fn redact(text: &str, hide: &[&str]) -> String {
    let mut out = text.to_owned();
    for secret in hide {
        if !secret.is_empty() {
            out = out.replace(secret, "[REDACTED]");
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry(host: &str) -> RegistryConfig {
        RegistryConfig {
            registry: host.to_owned(),
            username: "acme".to_owned(),
            password_secret: "DOCKER_REGISTRY_PASSWORD".to_owned(),
        }
    }

    #[test]
    fn docker_hub_refs_skip_the_host() {
        assert_eq!(
            registry_ref(&registry("docker.io"), "acme-web", "17"),
            "acme/acme-web:17"
        );
        assert_eq!(
            registry_ref(&registry("ghcr.io"), "acme-web", "17"),
            "ghcr.io/acme/acme-web:17"
        );
    }

    #[test]
    fn release_always_tags_latest_too() {
        let tags = local_tags("acme-web", "1712000000");
        assert_eq!(tags, vec!["acme-web:1712000000", "acme-web:latest"]);
    }

    #[test]
    fn redact_hides_all_occurrences() {
        let out = redact("pw=hunter2 again hunter2", &["hunter2"]);
        assert!(!out.contains("hunter2"));
        assert_eq!(out.matches("[REDACTED]").count(), 2);
    }

    #[tokio::test]
    async fn missing_binary_is_a_clear_error() {
        let err = run_local(&["definitely-not-a-real-cli".to_owned()], &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }
}
