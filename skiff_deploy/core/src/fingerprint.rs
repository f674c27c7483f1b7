//! Change-detection fingerprints.
//!
//! A workload's fingerprint is a canonicalized, hashed view of everything
//! that should trigger a redeploy when it changes: config (with secret
//! *values* resolved), the secret set itself, and image identity. Hashes are
//! truncated SHA-256 so they stay stable enough to live in container labels.

use std::fmt;

use anyhow::Result;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::{Workload, WorkloadKind};
use crate::secrets::SecretStore;

/// Hex chars kept from the SHA-256 digest. Stability matters: the value is a
/// container label compared verbatim across releases.
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintKind {
    Built,
    External,
}

impl fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FingerprintKind::Built => "built",
            FingerprintKind::External => "external",
        })
    }
}

impl FingerprintKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "built" => Some(FingerprintKind::Built),
            "external" => Some(FingerprintKind::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    pub config_hash: String,
    pub secrets_hash: String,
    /// Content id of `{project}-{name}:latest` on the operator machine
    /// (built workloads only).
    pub local_image_id: Option<String>,
    /// Content id of the image on the target host, when observed.
    pub server_image_id: Option<String>,
    /// Verbatim image reference (external workloads only).
    pub image_reference: Option<String>,
}

/// Computes the hash parts of a workload's fingerprint. Image identities are
/// filled in by the caller, which knows where to look them up.
pub fn compute(workload: &Workload, secrets: &SecretStore, project: &str) -> Result<Fingerprint> {
    let kind = if workload.is_built() {
        FingerprintKind::Built
    } else {
        FingerprintKind::External
    };
    Ok(Fingerprint {
        kind,
        config_hash: config_hash(workload, project)?,
        secrets_hash: secrets_hash(workload, secrets),
        local_image_id: None,
        server_image_id: None,
        image_reference: match kind {
            FingerprintKind::External => Some(workload.image.clone()),
            FingerprintKind::Built => None,
        },
    })
}

pub fn config_hash(workload: &Workload, project: &str) -> Result<String> {
    let canonical = canonical_config(workload, project)?;
    Ok(digest(&serde_json::to_string(&canonical)?))
}

/// Digest over sorted `(key, present, value)` triples of the declared secret
/// keys. A key that disappears from the store changes the hash just like a
/// rotated value does.
pub fn secrets_hash(workload: &Workload, secrets: &SecretStore) -> String {
    let mut keys = workload.env_secret_keys.clone();
    keys.sort();
    keys.dedup();
    let triples: Vec<Value> = keys
        .iter()
        .map(|key| {
            let value = secrets.get(key);
            json!([key, value.is_some(), value.unwrap_or("")])
        })
        .collect();
    digest(&Value::Array(triples).to_string())
}

/// The canonical view: arrays lexicographically sorted, env as sorted
/// `(key, value)` pairs, object keys sorted by construction (`serde_json`'s
/// map is ordered). Secret entries pin the key, not the value: a rotated
/// value shows up through `secrets_hash`, while the set of injected keys is
/// config shape.
fn canonical_config(workload: &Workload, project: &str) -> Result<Value> {
    let mut env: Vec<(String, Value)> = workload
        .env_plain
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let mut secret_keys = workload.env_secret_keys.clone();
    secret_keys.sort();
    secret_keys.dedup();
    env.extend(secret_keys.into_iter().map(|k| (k, json!({ "secret": true }))));
    env.sort_by(|a, b| (a.0.as_str(), a.1.to_string()).cmp(&(b.0.as_str(), b.1.to_string())));
    let env: Vec<Value> = env.into_iter().map(|(k, v)| json!([k, v])).collect();

    let mut ports: Vec<String> = workload.ports.iter().map(|p| p.to_string()).collect();
    ports.sort();

    let mut volumes = workload.volumes.clone();
    volumes.sort();

    let image: Value = match &workload.build {
        Some(build) => {
            // Built images: identity is the build recipe, not the moving tag.
            json!({
                "repo": workload.repo(project),
                "context": build.context,
                "dockerfile": build.dockerfile,
                "args": build.args,
                "target": build.target,
                "platform": build.platform,
            })
        }
        None => json!(workload.image),
    };

    let proxy: Value = match &workload.kind {
        WorkloadKind::App(app) => {
            let mut hosts = app.proxy_hosts.clone();
            hosts.sort();
            json!({
                "hosts": hosts,
                "app_port": app.app_port,
                "ssl": app.ssl,
                "health_path": app.health_path,
                "health_start_period": app.health_start_period_secs,
            })
        }
        WorkloadKind::Service => Value::Null,
    };

    Ok(json!({
        "image": image,
        "env": env,
        "ports": ports,
        "volumes": volumes,
        "command": workload.command,
        "replicas": workload.replicas,
        "proxy": proxy,
    }))
}

fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(hash)[..HASH_LEN].to_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn workload(yaml: &str) -> (Config, SecretStore) {
        let config = Config::from_file(serde_yaml::from_str(yaml).unwrap()).unwrap();
        let secrets = SecretStore::parse("DB_PASSWORD=swordfish\nAPI_KEY=k1\n").unwrap();
        (config, secrets)
    }

    const BASE: &str = r#"
name: acme
apps:
  web:
    host: h
    image: acme-web
    build: { context: . }
    ports: ["3000"]
    environment:
      plain: ["B=2", "A=1"]
      secret: [DB_PASSWORD]
    proxy: { hosts: [example.com], app_port: 3000 }
"#;

    #[test]
    fn hash_is_twelve_hex_chars() {
        let (config, _) = workload(BASE);
        let web = config.workload("web").unwrap();
        let hash = config_hash(web, "acme").unwrap();
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reordering_arrays_does_not_change_hash() {
        let (config_a, _) = workload(BASE);
        let reordered = BASE.replace("[\"B=2\", \"A=1\"]", "[\"A=1\", \"B=2\"]");
        let (config_b, _) = workload(&reordered);
        assert_eq!(
            config_hash(config_a.workload("web").unwrap(), "acme").unwrap(),
            config_hash(config_b.workload("web").unwrap(), "acme").unwrap(),
        );
    }

    #[test]
    fn secret_value_rotation_changes_only_the_secrets_hash() {
        let (config, secrets) = workload(BASE);
        let rotated = SecretStore::parse("DB_PASSWORD=rotated\nAPI_KEY=k1\n").unwrap();
        let web = config.workload("web").unwrap();
        assert_ne!(secrets_hash(web, &secrets), secrets_hash(web, &rotated));
        // The config view pins which keys are injected, not their values, so
        // a rotation surfaces as a secrets change rather than a config one.
        assert_eq!(
            config_hash(web, "acme").unwrap(),
            config_hash(web, "acme").unwrap()
        );
    }

    #[test]
    fn adding_a_secret_key_changes_the_config_hash() {
        let (config_a, _) = workload(BASE);
        let extended = BASE.replace("secret: [DB_PASSWORD]", "secret: [DB_PASSWORD, API_KEY]");
        let (config_b, _) = workload(&extended);
        assert_ne!(
            config_hash(config_a.workload("web").unwrap(), "acme").unwrap(),
            config_hash(config_b.workload("web").unwrap(), "acme").unwrap(),
        );
    }

    #[test]
    fn missing_secret_flips_present_bit() {
        let (config, secrets) = workload(BASE);
        let web = config.workload("web").unwrap();
        let empty = SecretStore::default();
        assert_ne!(secrets_hash(web, &secrets), secrets_hash(web, &empty));
    }

    #[test]
    fn external_fingerprint_carries_reference() {
        let (config, secrets) = workload(
            "name: acme\nservices:\n  db: { host: h, image: \"postgres:16.2\" }\n",
        );
        let db = config.workload("db").unwrap();
        let fp = compute(db, &secrets, "acme").unwrap();
        assert_eq!(fp.kind, FingerprintKind::External);
        assert_eq!(fp.image_reference.as_deref(), Some("postgres:16.2"));
        assert!(fp.local_image_id.is_none());
    }

    #[test]
    fn plain_env_change_changes_config_hash_only() {
        let (config_a, secrets) = workload(BASE);
        let changed = BASE.replace("A=1", "A=9");
        let (config_b, _) = workload(&changed);
        let a = config_a.workload("web").unwrap();
        let b = config_b.workload("web").unwrap();
        assert_ne!(
            config_hash(a, "acme").unwrap(),
            config_hash(b, "acme").unwrap()
        );
        assert_eq!(secrets_hash(a, &secrets), secrets_hash(b, &secrets));
    }
}
