//! Redeploy decisions: desired fingerprint vs what is running.

use std::fmt;

use crate::fingerprint::{Fingerprint, FingerprintKind};
use crate::runtime::{ContainerDetails, labels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeployReason {
    FirstDeployment,
    ConfigChanged,
    SecretsChanged,
    ImageUpdated,
    ImageVersionUpdated,
    UpToDate,
}

impl fmt::Display for RedeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedeployReason::FirstDeployment => "first_deployment",
            RedeployReason::ConfigChanged => "config_changed",
            RedeployReason::SecretsChanged => "secrets_changed",
            RedeployReason::ImageUpdated => "image_updated",
            RedeployReason::ImageVersionUpdated => "image_version_updated",
            RedeployReason::UpToDate => "up_to_date",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical,
    Normal,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub should: bool,
    pub reason: RedeployReason,
    pub priority: Priority,
}

/// Ordered rules, first match wins.
pub fn decide(current: Option<&Fingerprint>, desired: &Fingerprint) -> Decision {
    let Some(current) = current else {
        return Decision {
            should: true,
            reason: RedeployReason::FirstDeployment,
            priority: Priority::Normal,
        };
    };

    if current.config_hash != desired.config_hash {
        return Decision {
            should: true,
            reason: RedeployReason::ConfigChanged,
            priority: Priority::Critical,
        };
    }

    if current.secrets_hash != desired.secrets_hash {
        return Decision {
            should: true,
            reason: RedeployReason::SecretsChanged,
            priority: Priority::Critical,
        };
    }

    match desired.kind {
        FingerprintKind::Built => {
            let local_changed = current.local_image_id != desired.local_image_id;
            let server_behind = match (&current.server_image_id, &desired.local_image_id) {
                (Some(server), Some(local)) => server != local,
                _ => false,
            };
            if local_changed || server_behind {
                return Decision {
                    should: true,
                    reason: RedeployReason::ImageUpdated,
                    priority: Priority::Normal,
                };
            }
        }
        FingerprintKind::External => {
            if current.image_reference != desired.image_reference {
                return Decision {
                    should: true,
                    reason: RedeployReason::ImageVersionUpdated,
                    priority: Priority::Normal,
                };
            }
        }
    }

    Decision {
        should: false,
        reason: RedeployReason::UpToDate,
        priority: Priority::Optional,
    }
}

/// Reconstructs the fingerprint of a running container from its labels and
/// observed image id. A container missing the config-hash label predates
/// hash-based tracking and must be treated as stale: returns `None`, which
/// [`decide`] maps to a redeploy.
pub fn observe_current(details: &ContainerDetails) -> Option<Fingerprint> {
    let config_hash = details.label(labels::CONFIG_HASH)?.to_owned();
    let kind = details
        .label(labels::FINGERPRINT_TYPE)
        .and_then(FingerprintKind::parse)
        .unwrap_or(FingerprintKind::External);
    Some(Fingerprint {
        kind,
        config_hash,
        secrets_hash: details
            .label(labels::SECRETS_HASH)
            .unwrap_or_default()
            .to_owned(),
        local_image_id: match kind {
            // The image the container runs is the one that was local at
            // creation time; compare against today's local id.
            FingerprintKind::Built => Some(details.image_id.clone()),
            FingerprintKind::External => None,
        },
        server_image_id: Some(details.image_id.clone()),
        image_reference: details
            .label(labels::IMAGE_REFERENCE)
            .map(str::to_owned),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(kind: FingerprintKind) -> Fingerprint {
        Fingerprint {
            kind,
            config_hash: "aaaaaaaaaaaa".to_owned(),
            secrets_hash: "bbbbbbbbbbbb".to_owned(),
            local_image_id: match kind {
                FingerprintKind::Built => Some("sha256:img1".to_owned()),
                FingerprintKind::External => None,
            },
            server_image_id: None,
            image_reference: match kind {
                FingerprintKind::External => Some("postgres:16.2".to_owned()),
                FingerprintKind::Built => None,
            },
        }
    }

    #[test]
    fn no_current_means_first_deployment() {
        let decision = decide(None, &fp(FingerprintKind::Built));
        assert!(decision.should);
        assert_eq!(decision.reason, RedeployReason::FirstDeployment);
        assert_eq!(decision.priority, Priority::Normal);
    }

    #[test]
    fn config_change_wins_over_everything() {
        let mut current = fp(FingerprintKind::Built);
        current.config_hash = "cccccccccccc".to_owned();
        current.secrets_hash = "dddddddddddd".to_owned();
        current.local_image_id = Some("sha256:other".to_owned());
        let decision = decide(Some(&current), &fp(FingerprintKind::Built));
        assert_eq!(decision.reason, RedeployReason::ConfigChanged);
        assert_eq!(decision.priority, Priority::Critical);
    }

    #[test]
    fn secrets_change_is_critical() {
        let mut current = fp(FingerprintKind::Built);
        current.secrets_hash = "dddddddddddd".to_owned();
        let decision = decide(Some(&current), &fp(FingerprintKind::Built));
        assert_eq!(decision.reason, RedeployReason::SecretsChanged);
        assert_eq!(decision.priority, Priority::Critical);
    }

    #[test]
    fn rebuilt_image_triggers_image_updated() {
        let mut current = fp(FingerprintKind::Built);
        current.local_image_id = Some("sha256:stale".to_owned());
        let decision = decide(Some(&current), &fp(FingerprintKind::Built));
        assert_eq!(decision.reason, RedeployReason::ImageUpdated);
        assert_eq!(decision.priority, Priority::Normal);
    }

    #[test]
    fn server_image_behind_local_triggers_image_updated() {
        let mut current = fp(FingerprintKind::Built);
        current.server_image_id = Some("sha256:old-on-host".to_owned());
        let decision = decide(Some(&current), &fp(FingerprintKind::Built));
        assert_eq!(decision.reason, RedeployReason::ImageUpdated);
    }

    #[test]
    fn external_reference_bump_triggers_version_update() {
        let mut current = fp(FingerprintKind::External);
        current.image_reference = Some("postgres:15.6".to_owned());
        let decision = decide(Some(&current), &fp(FingerprintKind::External));
        assert_eq!(decision.reason, RedeployReason::ImageVersionUpdated);
    }

    #[test]
    fn identical_fingerprints_are_up_to_date() {
        let current = fp(FingerprintKind::External);
        let decision = decide(Some(&current), &fp(FingerprintKind::External));
        assert!(!decision.should);
        assert_eq!(decision.reason, RedeployReason::UpToDate);
        assert_eq!(decision.priority, Priority::Optional);
    }
}
