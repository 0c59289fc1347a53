//! Static reconciliation plans.
//!
//! Each pipeline command applies one [`Plan`]: a list of targets sorted by
//! [`TargetKind`] so mounts come first, policies precede the roles that
//! reference them, and secrets are written last. Policy documents live in
//! `policies/*.hcl` next to this crate's manifest.

use serde_json::{json, Map, Value};

use crate::error::PipelineError;
use crate::reconcile::{DesiredSpec, ReconciliationTarget, SecretValue, TargetKind};
use crate::vault::MountSpec;

/// Helm releases that read their secrets from `kv/data/<release>/*`.
pub const RELEASES: &[&str] = &[
    "keycloak",
    "awx",
    "crowdsec",
    "gitlab",
    "gitlab-runner",
    "harbor",
    "headlamp",
    "homepage",
    "jenkins",
    "kubescape",
    "loki",
    "matomo",
];

/// Applications `prepare` knows about.
pub const APPLICATIONS: &[&str] = &["keycloak", "gitlab", "vso"];

pub const KUBERNETES_AUTH: &str = "kubernetes";
pub const OIDC_AUTH: &str = "oidc";
pub const KV_MOUNT: &str = "kv";
pub const TRANSIT_MOUNT: &str = "transit";

const VSO: &str = "vso-auth";
const VSO_CACHE_KEY: &str = "vso-client-cache";

const ADMIN_POLICY: &str = include_str!("../policies/admin.hcl");
const VSO_POLICY: &str = include_str!("../policies/vso-auth.hcl");

const PASSWORD_POLICIES: &[(&str, &str)] = &[
    (
        "alphanumeric-password",
        include_str!("../policies/alphanumeric-password.hcl"),
    ),
    (
        "alphanumeric-special-password",
        include_str!("../policies/alphanumeric-special-password.hcl"),
    ),
    ("s3-access-key", include_str!("../policies/s3-access-key.hcl")),
    ("s3-secret-key", include_str!("../policies/s3-secret-key.hcl")),
];

/// An ordered set of targets applied in one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    name: String,
    targets: Vec<ReconciliationTarget>,
}

impl Plan {
    /// Sort `targets` by kind rank. The sort is stable, so targets of the
    /// same kind keep their listed order.
    pub fn new(name: impl Into<String>, mut targets: Vec<ReconciliationTarget>) -> Self {
        targets.sort_by_key(ReconciliationTarget::kind);
        Self {
            name: name.into(),
            targets,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn targets(&self) -> &[ReconciliationTarget] {
        &self.targets
    }

    /// Targets of one kind, in application order.
    pub fn of_kind(&self, kind: TargetKind) -> impl Iterator<Item = &ReconciliationTarget> {
        self.targets.iter().filter(move |t| t.kind() == kind)
    }
}

/// Auth methods and the KV engine. `api_server_endpoint` configures the
/// Kubernetes auth method.
#[must_use]
pub fn mounts(api_server_endpoint: &str) -> Plan {
    Plan::new(
        "mounts",
        vec![
            ReconciliationTarget::new(
                KUBERNETES_AUTH,
                DesiredSpec::AuthMethod {
                    mount: MountSpec::new(
                        "kubernetes",
                        "authenticate with Kubernetes Service Account Tokens",
                    ),
                    config: Some(json!({ "kubernetes_host": api_server_endpoint })),
                },
            ),
            ReconciliationTarget::new(
                OIDC_AUTH,
                DesiredSpec::AuthMethod {
                    mount: MountSpec::new("oidc", "authenticate with OpenID Connect"),
                    config: None,
                },
            ),
            ReconciliationTarget::new(
                KV_MOUNT,
                DesiredSpec::SecretsEngine(
                    MountSpec::new("kv-v2", "store secret values in key/value storage")
                        .with_option("version", "2"),
                ),
            ),
        ],
    )
}

/// Read-only policy per release, the `admin` policy and the password
/// policies secrets are generated from.
#[must_use]
pub fn configure() -> Plan {
    let releases = RELEASES
        .iter()
        .map(|release| ReconciliationTarget::new(*release, DesiredSpec::AclPolicy(release_policy(release))));
    let admin = ReconciliationTarget::new("admin", DesiredSpec::AclPolicy(ADMIN_POLICY.to_owned()));
    let passwords = PASSWORD_POLICIES.iter().map(|(name, policy)| {
        ReconciliationTarget::new(*name, DesiredSpec::PasswordPolicy((*policy).to_owned()))
    });

    Plan::new(
        "configure",
        releases
            .chain(std::iter::once(admin))
            .chain(passwords)
            .collect(),
    )
}

/// Role, policies and secrets for one application.
///
/// # Errors
///
/// `UnknownApplication` listing [`APPLICATIONS`].
pub fn prepare(application: &str) -> Result<Plan, PipelineError> {
    let targets = match application {
        "keycloak" => keycloak(),
        "gitlab" => gitlab(),
        "vso" => vso(),
        other => {
            return Err(PipelineError::UnknownApplication {
                name: other.to_owned(),
                known: APPLICATIONS.join(", "),
            });
        }
    };
    Ok(Plan::new(format!("prepare {application}"), targets))
}

/// `path "kv/data/<release>/*" { capabilities = ["read"] }`
#[must_use]
pub fn release_policy(release: &str) -> String {
    format!("path \"{KV_MOUNT}/data/{release}/*\" {{\n  capabilities = [\"read\"]\n}}\n")
}

fn keycloak() -> Vec<ReconciliationTarget> {
    vec![
        service_account_role("keycloak", "keycloak", "24h", &["keycloak"]),
        kv_secret(
            "keycloak/credentials/postgresql",
            &[
                ("username", literal("keycloak")),
                ("password", generated("alphanumeric-password")),
            ],
        ),
    ]
}

fn gitlab() -> Vec<ReconciliationTarget> {
    vec![
        service_account_role("gitlab", "gitlab", "24h", &["gitlab"]),
        kv_secret(
            "gitlab/config",
            &[
                ("username", literal("mg")),
                ("password", generated("alphanumeric-password")),
            ],
        ),
        kv_secret(
            "gitlab/credentials/redis",
            &[
                ("username", literal("redis")),
                ("password", generated("alphanumeric-password")),
            ],
        ),
        kv_secret(
            "gitlab/credentials/postgresql",
            &[
                ("username", literal("gitlab")),
                ("password", generated("alphanumeric-password")),
            ],
        ),
        kv_secret(
            "gitlab/credentials/minio",
            &[
                ("access_key", generated("s3-access-key")),
                ("secret_key", generated("s3-secret-key")),
            ],
        ),
    ]
}

/// Transit encryption for the Vault Secrets Operator client cache. The
/// operator's role may read every release's secrets.
fn vso() -> Vec<ReconciliationTarget> {
    let policies: Vec<&str> = RELEASES.iter().copied().chain(std::iter::once(VSO)).collect();
    vec![
        ReconciliationTarget::new(
            TRANSIT_MOUNT,
            DesiredSpec::SecretsEngine(MountSpec::new("transit", "encrypt secrets in transit")),
        ),
        ReconciliationTarget::new(
            VSO_CACHE_KEY,
            DesiredSpec::TransitKey {
                mount: TRANSIT_MOUNT.to_owned(),
            },
        ),
        ReconciliationTarget::new(VSO, DesiredSpec::AclPolicy(VSO_POLICY.to_owned())),
        service_account_role(VSO, "vault-secrets-operator", "120", &policies),
    ]
}

fn service_account_role(
    name: &str,
    service_account: &str,
    token_period: &str,
    policies: &[&str],
) -> ReconciliationTarget {
    let mut params = Map::new();
    params.insert("audience".to_owned(), Value::from("vault"));
    params.insert(
        "bound_service_account_names".to_owned(),
        json!([service_account]),
    );
    params.insert(
        "bound_service_account_namespaces".to_owned(),
        json!([service_account]),
    );
    params.insert("token_period".to_owned(), Value::from(token_period));
    params.insert("token_ttl".to_owned(), Value::from("0"));

    ReconciliationTarget::new(
        name,
        DesiredSpec::Role {
            auth_mount: KUBERNETES_AUTH.to_owned(),
            policies: policies.iter().map(|p| (*p).to_owned()).collect(),
            params,
        },
    )
}

fn kv_secret(path: &str, fields: &[(&str, SecretValue)]) -> ReconciliationTarget {
    ReconciliationTarget::new(
        path,
        DesiredSpec::KvSecret {
            mount: KV_MOUNT.to_owned(),
            fields: fields
                .iter()
                .map(|(field, value)| ((*field).to_owned(), value.clone()))
                .collect(),
        },
    )
}

fn literal(value: &str) -> SecretValue {
    SecretValue::Literal(value.to_owned())
}

fn generated(policy: &str) -> SecretValue {
    SecretValue::Generated {
        policy: policy.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reconcile::ReconciliationEngine;
    use crate::testing::FakeVault;

    fn names(plan: &Plan, kind: TargetKind) -> Vec<&str> {
        plan.of_kind(kind).map(|t| t.name.as_str()).collect()
    }

    fn is_ranked(plan: &Plan) -> bool {
        plan.targets().windows(2).all(|w| w[0].kind() <= w[1].kind())
    }

    #[test]
    fn mounts_configure_kubernetes_host() {
        let plan = mounts("https://10.96.0.1:443");
        assert_eq!(names(&plan, TargetKind::AuthMethod), ["kubernetes", "oidc"]);
        assert_eq!(names(&plan, TargetKind::SecretsEngine), ["kv"]);

        let DesiredSpec::AuthMethod { config, .. } = &plan.targets()[0].spec else {
            unreachable!("first target is the kubernetes auth method");
        };
        assert_eq!(
            config.as_ref().unwrap()["kubernetes_host"],
            "https://10.96.0.1:443"
        );
    }

    #[test]
    fn configure_has_one_policy_per_release_plus_admin() {
        let plan = configure();
        let acl = names(&plan, TargetKind::AclPolicy);
        assert_eq!(acl.len(), RELEASES.len() + 1);
        assert!(acl.contains(&"admin"));
        assert_eq!(names(&plan, TargetKind::PasswordPolicy).len(), 4);
        assert!(is_ranked(&plan));
    }

    #[test]
    fn release_policy_grants_read_on_release_prefix() {
        let policy = release_policy("harbor");
        assert!(policy.contains("path \"kv/data/harbor/*\""));
        assert!(policy.contains("capabilities = [\"read\"]"));
    }

    #[test]
    fn policy_documents_are_embedded() {
        assert!(ADMIN_POLICY.contains("sys/policies/acl/*"));
        assert!(VSO_POLICY.contains("transit/encrypt/vso-client-cache"));
        for (name, policy) in PASSWORD_POLICIES {
            assert!(policy.starts_with("length = "), "{name}");
        }
    }

    #[test]
    fn prepare_rejects_unknown_application() {
        let err = prepare("wordpress").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("wordpress"));
        assert!(msg.contains("keycloak, gitlab, vso"));
    }

    #[test]
    fn every_application_plan_is_ranked() {
        for app in APPLICATIONS {
            assert!(is_ranked(&prepare(app).unwrap()), "{app}");
        }
    }

    #[test]
    fn vso_policy_precedes_its_role() {
        let plan = prepare("vso").unwrap();
        let kinds: Vec<TargetKind> = plan.targets().iter().map(ReconciliationTarget::kind).collect();
        assert_eq!(
            kinds,
            [
                TargetKind::SecretsEngine,
                TargetKind::AclPolicy,
                TargetKind::TransitKey,
                TargetKind::Role,
            ]
        );
        let DesiredSpec::Role { policies, .. } = &plan.targets()[3].spec else {
            unreachable!("last target is the vso-auth role");
        };
        assert_eq!(policies.len(), RELEASES.len() + 1);
        assert_eq!(policies.last().map(String::as_str), Some("vso-auth"));
    }

    #[test]
    fn gitlab_minio_keys_use_s3_policies() {
        let plan = prepare("gitlab").unwrap();
        let minio = plan
            .targets()
            .iter()
            .find(|t| t.name == "gitlab/credentials/minio")
            .unwrap();
        let DesiredSpec::KvSecret { fields, .. } = &minio.spec else {
            unreachable!("minio credentials are a kv secret");
        };
        assert_eq!(fields[0].1, generated("s3-access-key"));
        assert_eq!(fields[1].1, generated("s3-secret-key"));
    }

    #[tokio::test]
    async fn keycloak_plan_applies_and_is_idempotent() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let plan = prepare("keycloak").unwrap();

        let first = engine.reconcile_all(plan.targets(), false).await.unwrap();
        assert_eq!(first.changed.len(), 2);
        let role = vault.role("kubernetes", "keycloak").unwrap();
        assert_eq!(role["token_period"], "24h");
        assert_eq!(role["bound_service_account_namespaces"], json!(["keycloak"]));

        let second = engine.reconcile_all(plan.targets(), false).await.unwrap();
        assert!(second.is_noop());
    }
}
