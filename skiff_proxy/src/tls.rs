//! SNI certificate store for the :443 listener.
//!
//! Certificates live on disk under the mounted certs directory; this store
//! keeps the parsed, signing-ready form and hands it to rustls per
//! connection. A hostname without an entry fails the handshake, which is the
//! documented behavior for routes whose certificate is not active yet.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, bail};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::warn;

use crate::state::{CertStatus, ProxyState};

#[derive(Default)]
pub struct CertStore {
    keys: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hostnames: Vec<String> = self.keys.read().unwrap().keys().cloned().collect();
        f.debug_struct("CertStore").field("hostnames", &hostnames).finish()
    }
}

impl CertStore {
    pub fn new() -> Arc<Self> {
        Arc::new(CertStore::default())
    }

    pub fn has(&self, hostname: &str) -> bool {
        self.keys.read().unwrap().contains_key(hostname)
    }

    pub fn install_pem(&self, hostname: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("unparseable certificate chain")?;
        if certs.is_empty() {
            bail!("certificate chain for {hostname} is empty");
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .context("unparseable private key")?
            .ok_or_else(|| anyhow::anyhow!("no private key found for {hostname}"))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .context("unsupported private key type")?;
        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        self.keys
            .write()
            .unwrap()
            .insert(hostname.to_owned(), certified);
        Ok(())
    }

    pub fn remove(&self, hostname: &str) {
        self.keys.write().unwrap().remove(hostname);
    }

    pub fn install_from_files(&self, hostname: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("cannot read {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("cannot read {}", key_path.display()))?;
        self.install_pem(hostname, &cert_pem, &key_pem)
    }

    /// Loads every active certificate referenced by the state file. Missing
    /// or unreadable files degrade that one hostname, not the whole proxy.
    pub fn load_from_state(&self, state: &ProxyState) {
        for routes in state.projects.values() {
            for (hostname, route) in &routes.hosts {
                let Some(cert) = &route.certificate else { continue };
                if cert.status != CertStatus::Active {
                    continue;
                }
                if let Err(err) =
                    self.install_from_files(hostname, &cert.cert_path, &cert.key_path)
                {
                    warn!(%hostname, error = %err, "failed to load certificate; TLS for this host is disabled until reissued");
                }
            }
        }
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.keys.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn self_signed(hostname: &str) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![hostname.to_owned()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn install_and_lookup() {
        let store = CertStore::new();
        let (cert_pem, key_pem) = self_signed("example.com");
        store.install_pem("example.com", &cert_pem, &key_pem).unwrap();
        assert!(store.has("example.com"));
        assert!(!store.has("other.example"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let store = CertStore::new();
        assert!(store.install_pem("example.com", "garbage", "garbage").is_err());
    }
}
