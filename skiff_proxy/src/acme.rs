//! Certificate issuance: a FIFO retry queue with one worker.
//!
//! Route deploys with SSL enabled enqueue their hostname; the single worker
//! drains the queue head-first, runs an HTTP-01 order, and persists the
//! outcome before the serving path can observe it. Failures back off on a
//! fixed schedule and give up after a bounded number of attempts, leaving
//! the route marked `failed` for the operator.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::state::{CertStatus, Certificate, LetsEncryptConfig, StateJournal};
use crate::tls::CertStore;

/// Backoff between attempts for one hostname: 1m, 5m, 30m, 2h, 24h (the last
/// entry repeats until the attempt cap).
const BACKOFF_SCHEDULE_SECS: [i64; 5] = [60, 300, 1800, 7200, 86_400];
const MAX_ATTEMPTS: u32 = 10;

/// Let's Encrypt issues 90-day certificates; renewal rechecks well before.
const CERT_LIFETIME_DAYS: i64 = 90;
const RENEW_BEFORE_DAYS: i64 = 30;
const RENEWAL_SCAN_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Token -> key authorization, served on :80 under
/// `/.well-known/acme-challenge/`.
pub type ChallengeMap = Arc<RwLock<HashMap<String, String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertRequest {
    pub hostname: String,
    pub email: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: QueueStatus,
}

/// FIFO within equal `next_attempt_at`; the worker is the sole writer, status
/// readers take a lock for a snapshot.
#[derive(Default)]
pub struct CertQueue {
    entries: Mutex<VecDeque<CertRequest>>,
    notify: Notify,
}

impl CertQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(CertQueue::default())
    }

    /// Queues a hostname for issuance; re-enqueueing a hostname already in
    /// the queue is a no-op.
    pub fn enqueue(&self, hostname: &str, email: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.hostname == hostname) {
            return;
        }
        entries.push_back(CertRequest {
            hostname: hostname.to_owned(),
            email: email.to_owned(),
            attempts: 0,
            next_attempt_at: Utc::now(),
            status: QueueStatus::Pending,
        });
        drop(entries);
        self.notify.notify_one();
    }

    pub fn snapshot(&self) -> Vec<CertRequest> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<CertRequest> {
        let mut entries = self.entries.lock().unwrap();
        let position = entries.iter().position(|e| e.next_attempt_at <= now)?;
        entries.remove(position)
    }

    fn next_due_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|e| (e.next_attempt_at - now).max(TimeDelta::zero()))
            .min()
            .and_then(|delta| delta.to_std().ok())
    }

    fn push_retry(&self, request: CertRequest) {
        self.entries.lock().unwrap().push_back(request);
    }

    async fn wait(&self, for_at_most: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(for_at_most) => {}
            _ = self.notify.notified() => {}
        }
    }
}

pub struct AcmeWorker {
    pub queue: Arc<CertQueue>,
    pub journal: Arc<StateJournal>,
    pub certs: Arc<CertStore>,
    pub challenges: ChallengeMap,
    pub certs_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AcmeWorker {
    /// The single issuance loop. Exactly one of these runs per proxy.
    pub async fn run(self) {
        loop {
            let now = Utc::now();
            if let Some(request) = self.queue.pop_due(now) {
                self.process(request).await;
                continue;
            }
            let sleep_for = self
                .queue
                .next_due_in(now)
                .unwrap_or(Duration::from_secs(60))
                .min(Duration::from_secs(60));
            self.queue.wait(sleep_for).await;
        }
    }

    async fn process(&self, mut request: CertRequest) {
        let hostname = request.hostname.clone();
        let state = self.journal.snapshot().await;
        // The route may have been removed between enqueue and now. Renewals
        // of active certificates still flow through here.
        let still_owed = state
            .find_route(&hostname)
            .is_some_and(|(_, route)| route.ssl_enabled);
        if !still_owed {
            return;
        }
        let le = state.lets_encrypt.clone();
        match self.order_certificate(&hostname, &request.email, &le).await {
            Ok((cert_pem, key_pem)) => {
                if let Err(err) = self.commit(&hostname, &cert_pem, &key_pem).await {
                    warn!(%hostname, error = %err, "issued a certificate but failed to commit it");
                    return;
                }
                info!(%hostname, "certificate issued");
            }
            Err(err) => {
                request.attempts += 1;
                if request.attempts >= MAX_ATTEMPTS {
                    warn!(%hostname, error = %err, attempts = request.attempts,
                        "giving up on certificate issuance; operator intervention required");
                    let _ = self
                        .journal
                        .mutate(|state| {
                            if let Some(route) = state.route_mut(&hostname) {
                                if let Some(cert) = &mut route.certificate {
                                    cert.status = CertStatus::Failed;
                                }
                            }
                        })
                        .await;
                    request.status = QueueStatus::Failed;
                    // A failed entry leaves the queue; the state file keeps
                    // the terminal status.
                } else {
                    let backoff_index =
                        (request.attempts as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
                    request.next_attempt_at =
                        Utc::now() + TimeDelta::seconds(BACKOFF_SCHEDULE_SECS[backoff_index]);
                    request.status = QueueStatus::Retrying;
                    warn!(%hostname, error = %err, attempts = request.attempts,
                        next_attempt_at = %request.next_attempt_at, "certificate order failed; will retry");
                    self.queue.push_retry(request);
                }
            }
        }
    }

    /// Persists the new certificate (files, then journal) before making it
    /// visible to the TLS resolver.
    async fn commit(&self, hostname: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let dir = self.certs_dir.join(hostname);
        std::fs::create_dir_all(&dir)?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert_pem)?;
        std::fs::write(&key_path, key_pem)?;

        let now = Utc::now();
        self.journal
            .mutate(|state| {
                if let Some(route) = state.route_mut(hostname) {
                    route.certificate = Some(Certificate {
                        status: CertStatus::Active,
                        cert_path: cert_path.clone(),
                        key_path: key_path.clone(),
                        acquired_at: Some(now),
                        expires_at: Some(now + TimeDelta::days(CERT_LIFETIME_DAYS)),
                    });
                }
            })
            .await?;

        self.certs.install_pem(hostname, cert_pem, key_pem)?;
        Ok(())
    }

    async fn order_certificate(
        &self,
        hostname: &str,
        email: &str,
        le: &LetsEncryptConfig,
    ) -> Result<(String, String)> {
        let account = self.account(email, le).await?;

        let identifier = Identifier::Dns(hostname.to_owned());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .context("failed to create ACME order")?;

        let authorizations = order.authorizations().await?;
        let mut tokens = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => bail!("authorization for {hostname} is {status:?}"),
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .context("server offered no HTTP-01 challenge")?;
            let key_auth = order.key_authorization(challenge);
            self.challenges
                .write()
                .unwrap()
                .insert(challenge.token.clone(), key_auth.as_str().to_owned());
            tokens.push(challenge.token.clone());
            order.set_challenge_ready(&challenge.url).await?;
        }

        let result = self.finalize(hostname, &mut order).await;

        let mut challenges = self.challenges.write().unwrap();
        for token in tokens {
            challenges.remove(&token);
        }
        drop(challenges);

        result
    }

    async fn finalize(
        &self,
        hostname: &str,
        order: &mut instant_acme::Order,
    ) -> Result<(String, String)> {
        let mut delay = Duration::from_millis(500);
        let mut tries = 0u32;
        loop {
            let status = order.refresh().await?.status;
            match status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => bail!("order for {hostname} became invalid"),
                _ => {}
            }
            tries += 1;
            if tries > 20 {
                bail!("order for {hostname} did not become ready in time");
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(10));
        }

        let key_pair = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![hostname.to_owned()])?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der().as_ref()).await?;

        let cert_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };
        Ok((cert_pem, key_pair.serialize_pem()))
    }

    /// Loads the persisted ACME account, creating and saving one on first use.
    async fn account(&self, email: &str, le: &LetsEncryptConfig) -> Result<Account> {
        let path = if le.account_key_path.is_absolute() {
            le.account_key_path.clone()
        } else {
            self.state_dir.join(&le.account_key_path)
        };
        if let Ok(bytes) = std::fs::read(&path) {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                .context("stored ACME account credentials are unreadable")?;
            return Account::from_credentials(credentials)
                .await
                .context("failed to restore ACME account");
        }

        let contact: Vec<String> = if email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{email}")]
        };
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            le.effective_directory_url(),
            None,
        )
        .await
        .context("failed to create ACME account")?;
        std::fs::write(&path, serde_json::to_vec(&credentials)?)
            .with_context(|| format!("failed to persist ACME account at {}", path.display()))?;
        Ok(account)
    }
}

/// Background scan re-enqueueing certificates that expire within the renewal
/// window.
pub async fn renewal_loop(queue: Arc<CertQueue>, journal: Arc<StateJournal>) {
    loop {
        tokio::time::sleep(RENEWAL_SCAN_INTERVAL).await;
        let state = journal.snapshot().await;
        let email = state.lets_encrypt.email.clone();
        let cutoff = Utc::now() + TimeDelta::days(RENEW_BEFORE_DAYS);
        for routes in state.projects.values() {
            for (hostname, route) in &routes.hosts {
                let due = route
                    .certificate
                    .as_ref()
                    .filter(|c| c.status == CertStatus::Active)
                    .and_then(|c| c.expires_at)
                    .is_some_and(|expires| expires < cutoff);
                if due {
                    info!(%hostname, "certificate enters the renewal window; re-enqueueing");
                    queue.enqueue(hostname, &email);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enqueue_is_fifo_and_deduplicated() {
        let queue = CertQueue::new();
        queue.enqueue("a.example.com", "");
        queue.enqueue("b.example.com", "");
        queue.enqueue("a.example.com", "");
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].hostname, "a.example.com");
        assert_eq!(snapshot[1].hostname, "b.example.com");
        assert!(snapshot.iter().all(|e| e.status == QueueStatus::Pending));
    }

    #[test]
    fn pop_due_skips_backed_off_entries() {
        let queue = CertQueue::new();
        queue.enqueue("a.example.com", "");
        queue.enqueue("b.example.com", "");

        let mut head = queue.pop_due(Utc::now()).unwrap();
        assert_eq!(head.hostname, "a.example.com");

        // Simulate a failure: a retries later, so b is next up.
        head.attempts = 1;
        head.status = QueueStatus::Retrying;
        head.next_attempt_at = Utc::now() + TimeDelta::seconds(60);
        queue.push_retry(head);

        let next = queue.pop_due(Utc::now()).unwrap();
        assert_eq!(next.hostname, "b.example.com");
        assert!(queue.pop_due(Utc::now()).is_none());
    }

    #[test]
    fn backoff_schedule_caps_at_a_day() {
        let last = *BACKOFF_SCHEDULE_SECS.last().unwrap();
        assert_eq!(last, 86_400);
        assert!(BACKOFF_SCHEDULE_SECS.windows(2).all(|w| w[0] < w[1]));
    }
}
