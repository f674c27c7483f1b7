//! Planner behavior against observed container state, end to end through the
//! public API: inspect JSON -> observed fingerprint -> redeploy decision.

use skiff_deploy::config::Config;
use skiff_deploy::fingerprint;
use skiff_deploy::plan::{self, RedeployReason};
use skiff_deploy::runtime::parse_inspect;
use skiff_deploy::secrets::SecretStore;

const CONFIG: &str = r#"
name: acme
apps:
  web:
    host: 10.0.0.1
    image: acme-web
    build: { context: . }
    replicas: 2
    ports: ["3000"]
    environment:
      secret: [DB_PASSWORD]
    proxy: { hosts: [example.com], app_port: 3000 }
"#;

fn inspect_json(config_hash: &str, secrets_hash: &str) -> String {
    format!(
        r#"[{{
            "Id": "abc",
            "Image": "sha256:feedface",
            "State": {{"Running": true, "ExitCode": 0, "StartedAt": "", "Status": "running"}},
            "Config": {{
                "Image": "acme-web:1712000000",
                "Env": [],
                "Labels": {{
                    "skiff.managed": "true",
                    "skiff.project": "acme",
                    "skiff.app": "web",
                    "skiff.config-hash": "{config_hash}",
                    "skiff.secrets-hash": "{secrets_hash}",
                    "skiff.fingerprint-type": "built",
                    "skiff.color": "blue",
                    "skiff.active": "true"
                }}
            }}
        }}]"#
    )
}

fn setup() -> (Config, SecretStore) {
    let config = Config::from_file(serde_yaml::from_str(CONFIG).unwrap()).unwrap();
    let secrets = SecretStore::parse("DB_PASSWORD=swordfish\n").unwrap();
    (config, secrets)
}

#[test]
fn matching_container_is_up_to_date() {
    let (config, secrets) = setup();
    let web = config.workload("web").unwrap();
    let mut desired = fingerprint::compute(web, &secrets, "acme").unwrap();
    desired.local_image_id = Some("sha256:feedface".to_owned());

    let details =
        parse_inspect(&inspect_json(&desired.config_hash, &desired.secrets_hash)).unwrap();
    let current = plan::observe_current(&details);
    let decision = plan::decide(current.as_ref(), &desired);
    assert!(!decision.should);
    assert_eq!(decision.reason, RedeployReason::UpToDate);
}

#[test]
fn rotated_secret_forces_a_critical_redeploy() {
    let (config, secrets) = setup();
    let web = config.workload("web").unwrap();

    // The running container was created when DB_PASSWORD was different.
    let rotated = SecretStore::parse("DB_PASSWORD=old-value\n").unwrap();
    let old = fingerprint::compute(web, &rotated, "acme").unwrap();
    let details = parse_inspect(&inspect_json(&old.config_hash, &old.secrets_hash)).unwrap();

    let mut desired = fingerprint::compute(web, &secrets, "acme").unwrap();
    desired.local_image_id = Some("sha256:feedface".to_owned());

    let current = plan::observe_current(&details);
    let decision = plan::decide(current.as_ref(), &desired);
    assert!(decision.should);
    assert_eq!(decision.reason, RedeployReason::SecretsChanged);
    assert_eq!(decision.priority, skiff_deploy::plan::Priority::Critical);
}

#[test]
fn rebuilt_local_image_forces_a_redeploy() {
    let (config, secrets) = setup();
    let web = config.workload("web").unwrap();
    let mut desired = fingerprint::compute(web, &secrets, "acme").unwrap();
    desired.local_image_id = Some("sha256:new-build".to_owned());

    let details =
        parse_inspect(&inspect_json(&desired.config_hash, &desired.secrets_hash)).unwrap();
    let current = plan::observe_current(&details);
    let decision = plan::decide(current.as_ref(), &desired);
    assert!(decision.should);
    assert_eq!(decision.reason, RedeployReason::ImageUpdated);
}

#[test]
fn container_without_hash_label_is_stale() {
    let (config, secrets) = setup();
    let web = config.workload("web").unwrap();
    let desired = fingerprint::compute(web, &secrets, "acme").unwrap();

    let details = parse_inspect(
        r#"[{
            "Id": "abc",
            "Image": "sha256:feedface",
            "State": {"Running": true, "ExitCode": 0, "StartedAt": "", "Status": "running"},
            "Config": {"Image": "acme-web:latest", "Env": [], "Labels": {"skiff.managed": "true"}}
        }]"#,
    )
    .unwrap();

    // No config-hash label: predates hash-based tracking, must redeploy.
    let current = plan::observe_current(&details);
    assert!(current.is_none());
    let decision = plan::decide(current.as_ref(), &desired);
    assert!(decision.should);
    assert_eq!(decision.reason, RedeployReason::FirstDeployment);
}
