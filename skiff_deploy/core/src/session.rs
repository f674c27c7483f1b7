//! One long-lived SSH session per host.
//!
//! All remote commands for a host flow through [`HostSession::exec`], which
//! serializes them FIFO over a single authenticated connection. Failures of
//! the command surface as [`CommandError`]; failures of the transport trigger
//! reconnection with capped exponential backoff. Anything surfaced to the
//! caller has registered secrets redacted first.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_ssh2_russh::russh::client::{Config as SshClientConfig, Handle, connect};
use async_ssh2_russh::russh::keys::agent::client::AgentClient;
use async_ssh2_russh::russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use async_ssh2_russh::{AsyncChannel, NoCheckHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::util::backoff_delay;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
pub const PULL_TIMEOUT: Duration = Duration::from_secs(600);

const RECONNECT_ATTEMPTS: u32 = 5;
const REDACTED: &str = "[REDACTED]";

#[derive(Clone)]
pub enum AuthMethod {
    IdentityFile(PathBuf),
    Password(String),
    Agent,
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

/// A remote command that ran and exited non-zero.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command `{}` exited with status {}: {}",
            self.command,
            self.exit_code,
            if self.stderr.trim().is_empty() {
                self.stdout.trim()
            } else {
                self.stderr.trim()
            }
        )
    }
}

impl std::error::Error for CommandError {}

/// Authenticated connection to one host. Uses [`NoCheckHandler`]: publickey
/// authentication already protects against MITM on first-time hosts.
struct Connection {
    handle: Handle<NoCheckHandler>,
}

impl Connection {
    async fn open_channel(&self) -> Result<AsyncChannel> {
        let channel = self.handle.channel_open_session().await?;
        Ok(AsyncChannel::from(channel))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

pub struct HostSession {
    opts: ConnectionOptions,
    /// The connection plus the FIFO gate: holding this lock for the whole
    /// command keeps per-host ordering strict.
    connection: Mutex<Option<Connection>>,
    redactions: std::sync::Mutex<Vec<String>>,
}

impl HostSession {
    pub async fn connect(opts: ConnectionOptions) -> Result<Arc<Self>> {
        let connection = connect_raw(&opts)
            .await
            .with_context(|| format!("failed to connect to {}:{}", opts.host, opts.port))?;
        Ok(Arc::new(HostSession {
            opts,
            connection: Mutex::new(Some(connection)),
            redactions: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn host(&self) -> &str {
        &self.opts.host
    }

    /// Registers a sensitive value; it will never appear in surfaced errors
    /// or captured output.
    pub fn redact_value(&self, value: impl Into<String>) {
        let value = value.into();
        if value.len() < 2 {
            return;
        }
        self.redactions.lock().unwrap().push(value);
    }

    fn redact(&self, text: &str) -> String {
        let redactions = self.redactions.lock().unwrap();
        let mut out = text.to_owned();
        for secret in redactions.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Runs `argv` on the host, returning stdout on exit status 0.
    pub async fn exec(&self, argv: &[String], timeout: Duration) -> Result<String> {
        self.exec_with_stdin(argv, None, timeout).await
    }

    /// Like [`Self::exec`], optionally feeding `stdin` to the command.
    pub async fn exec_with_stdin(
        &self,
        argv: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let command = shell_join(argv);
        let mut guard = self.connection.lock().await;

        if guard.as_ref().is_none_or(Connection::is_closed) {
            *guard = Some(self.reconnect().await?);
        }
        let connection = guard.as_ref().expect("connection populated above");

        let run = async {
            let channel = connection.open_channel().await?;
            // Subscribe before exec so no early output is lost.
            let mut stdout_stream = channel.stdout();
            let mut stderr_stream = channel.stderr();
            channel.exec(true, command.as_str()).await?;

            if let Some(data) = stdin {
                let mut writer = channel.stdin();
                writer.write_all(data.as_bytes()).await?;
                writer.flush().await?;
                channel.eof().await?;
            }

            let mut stdout = String::new();
            let mut stderr = String::new();
            tokio::try_join!(
                stdout_stream.read_to_string(&mut stdout),
                stderr_stream.read_to_string(&mut stderr),
            )?;
            let exit = channel.recv_exit_status().wait().await.copied();
            Ok::<_, anyhow::Error>((exit, stdout, stderr))
        };

        let (exit, stdout, stderr) = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                // Transport-level failure; force a fresh connection next time.
                *guard = None;
                return Err(err.context(format!(
                    "transport failure on {} running `{}`",
                    self.opts.host,
                    self.redact(&command)
                )));
            }
            Err(_) => {
                *guard = None;
                bail!(
                    "command `{}` on {} timed out after {:?}",
                    self.redact(&command),
                    self.opts.host,
                    timeout
                );
            }
        };

        let Some(exit_code) = exit else {
            *guard = None;
            bail!(
                "session to {} dropped while running `{}`",
                self.opts.host,
                self.redact(&command)
            );
        };

        if exit_code == 0 {
            Ok(self.redact(&stdout))
        } else {
            Err(anyhow::Error::new(CommandError {
                exit_code,
                stdout: self.redact(&stdout),
                stderr: self.redact(&stderr),
                command: self.redact(&command),
            }))
        }
    }

    async fn reconnect(&self) -> Result<Connection> {
        let mut last_err = None;
        for attempt in 0..RECONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(
                    Duration::from_secs(1),
                    Duration::from_secs(30),
                    attempt - 1,
                ))
                .await;
            }
            match connect_raw(&self.opts).await {
                Ok(connection) => return Ok(connection),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("unreachable: no connection attempt made"))
            .context(format!(
                "giving up on {} after {RECONNECT_ATTEMPTS} connection attempts",
                self.opts.host
            )))
    }
}

async fn connect_raw(opts: &ConnectionOptions) -> Result<Connection> {
    let config = Arc::new(SshClientConfig::default());
    let addr = (opts.host.as_str(), opts.port);
    let mut handle = connect(config, addr, NoCheckHandler).await?;

    let authenticated = match &opts.auth {
        AuthMethod::IdentityFile(path) => {
            let key_pair = load_secret_key(path, None)
                .with_context(|| format!("failed to load identity file {}", path.display()))?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(
                    opts.username.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await?
                .success()
        }
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(opts.username.clone(), password.clone())
                .await?
                .success()
        }
        AuthMethod::Agent => {
            let mut agent = AgentClient::connect_env()
                .await
                .context("failed to reach ssh-agent (is SSH_AUTH_SOCK set?)")?;
            let identities = agent.request_identities().await?;
            let mut ok = false;
            for key in identities {
                let auth = handle
                    .authenticate_publickey_with(opts.username.clone(), key, None, &mut agent)
                    .await?;
                if auth.success() {
                    ok = true;
                    break;
                }
            }
            ok
        }
    };

    if authenticated {
        Ok(Connection { handle })
    } else {
        bail!("authentication rejected for {}@{}", opts.username, opts.host)
    }
}

/// Joins argv into a single remote command line with every argument escaped.
/// This is the only place command lines are assembled for the remote shell.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_escape::unix::escape(Cow::Borrowed(arg.as_str())))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shell_join_escapes_metacharacters() {
        let argv = vec![
            "docker".to_owned(),
            "run".to_owned(),
            "-e".to_owned(),
            "MSG=hello world; rm -rf /".to_owned(),
        ];
        let joined = shell_join(&argv);
        assert!(joined.starts_with("docker run -e "));
        assert!(joined.contains("'MSG=hello world; rm -rf /'"));
    }

    #[test]
    fn command_error_prefers_stderr() {
        let err = CommandError {
            exit_code: 125,
            stdout: "partial".to_owned(),
            stderr: "no such container".to_owned(),
            command: "docker inspect x".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 125"));
        assert!(msg.contains("no such container"));
    }

    #[test]
    fn auth_method_debug_never_prints_password() {
        let auth = AuthMethod::Password("hunter2".to_owned());
        assert!(!format!("{auth:?}").contains("hunter2"));
    }
}
