//! Idempotent reconciliation of Vault configuration.
//!
//! Every target follows the same three steps: list what exists, skip when
//! the name is present and `overwrite` is off, otherwise write the desired
//! spec. Listing calls treat "not found" as empty; write failures are never
//! swallowed and stop the pass.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{ReconcileError, VaultError};
use crate::vault::{MountSpec, VaultApi};

/// Kinds of configuration objects, in the order a plan applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    AuthMethod,
    SecretsEngine,
    PasswordPolicy,
    AclPolicy,
    TransitKey,
    Role,
    KvSecret,
}

impl TargetKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMethod => "auth method",
            Self::SecretsEngine => "secrets engine",
            Self::PasswordPolicy => "password policy",
            Self::AclPolicy => "ACL policy",
            Self::TransitKey => "transit key",
            Self::Role => "role",
            Self::KvSecret => "secret",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret field value: fixed, or generated from a password policy at
/// write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    Literal(String),
    Generated { policy: String },
}

/// Desired state of one target.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredSpec {
    AuthMethod {
        mount: MountSpec,
        /// Written to `auth/<path>/config` after enabling.
        config: Option<Value>,
    },
    SecretsEngine(MountSpec),
    PasswordPolicy(String),
    AclPolicy(String),
    TransitKey {
        mount: String,
    },
    Role {
        auth_mount: String,
        /// ACL policies attached to tokens issued for this role.
        policies: Vec<String>,
        /// Remaining role parameters; `token_policies` is filled in from
        /// `policies`.
        params: Map<String, Value>,
    },
    KvSecret {
        mount: String,
        fields: Vec<(String, SecretValue)>,
    },
}

/// One object to ensure. Built from the static plans, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationTarget {
    /// Mount path, policy name, role name, or secret path.
    pub name: String,
    pub spec: DesiredSpec,
}

impl ReconciliationTarget {
    pub fn new(name: impl Into<String>, spec: DesiredSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TargetKind {
        match self.spec {
            DesiredSpec::AuthMethod { .. } => TargetKind::AuthMethod,
            DesiredSpec::SecretsEngine(_) => TargetKind::SecretsEngine,
            DesiredSpec::PasswordPolicy(_) => TargetKind::PasswordPolicy,
            DesiredSpec::AclPolicy(_) => TargetKind::AclPolicy,
            DesiredSpec::TransitKey { .. } => TargetKind::TransitKey,
            DesiredSpec::Role { .. } => TargetKind::Role,
            DesiredSpec::KvSecret { .. } => TargetKind::KvSecret,
        }
    }

    fn label(&self) -> String {
        format!("{} '{}'", self.kind(), self.name)
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Applies targets against one Vault server.
pub struct ReconciliationEngine<'a> {
    vault: &'a dyn VaultApi,
}

impl<'a> ReconciliationEngine<'a> {
    #[must_use]
    pub fn new(vault: &'a dyn VaultApi) -> Self {
        Self { vault }
    }

    /// Ensure `target` exists. Returns whether anything was written.
    ///
    /// Mounts and transit keys cannot be rewritten in place: with
    /// `overwrite` an existing auth method only has its config re-applied,
    /// and an existing engine or transit key is left untouched.
    ///
    /// # Errors
    ///
    /// `List` when the existing entities cannot be read, `Write` or
    /// `Generate` when applying the desired spec fails.
    pub async fn reconcile(
        &self,
        target: &ReconciliationTarget,
        overwrite: bool,
    ) -> Result<bool, ReconcileError> {
        let kind = target.kind();
        let exists = self.exists(target).await.map_err(|source| ReconcileError::List {
            kind: kind.as_str(),
            source,
        })?;

        if exists && !overwrite {
            debug!(kind = %kind, name = %target.name, "already present");
            return Ok(false);
        }

        let changed = self.apply(target, exists).await?;
        if changed {
            info!(kind = %kind, name = %target.name, overwrite = exists, "applied");
        } else {
            debug!(kind = %kind, name = %target.name, "present and immutable");
        }
        Ok(changed)
    }

    /// Reconcile `targets` in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// `PolicyOrdering` when a role precedes an ACL policy it references in
    /// the same pass; otherwise the first target failure.
    pub async fn reconcile_all(
        &self,
        targets: &[ReconciliationTarget],
        overwrite: bool,
    ) -> Result<ReconcileSummary, ReconcileError> {
        check_policy_order(targets)?;

        let mut summary = ReconcileSummary::default();
        for target in targets {
            if self.reconcile(target, overwrite).await? {
                summary.changed.push(target.label());
            } else {
                summary.unchanged.push(target.label());
            }
        }
        Ok(summary)
    }

    async fn exists(&self, target: &ReconciliationTarget) -> Result<bool, VaultError> {
        let name = target.name.as_str();
        let listed = match &target.spec {
            DesiredSpec::AuthMethod { .. } => self.vault.list_auth_methods().await?,
            DesiredSpec::SecretsEngine(_) => self.vault.list_secrets_engines().await?,
            DesiredSpec::PasswordPolicy(_) => self.vault.list_password_policies().await?,
            DesiredSpec::AclPolicy(_) => self.vault.list_acl_policies().await?,
            DesiredSpec::TransitKey { mount } => self.vault.list_transit_keys(mount).await?,
            DesiredSpec::Role { auth_mount, .. } => self.vault.list_roles(auth_mount).await?,
            DesiredSpec::KvSecret { mount, .. } => {
                return Ok(self.vault.read_kv(mount, name).await?.is_some());
            }
        };
        Ok(listed.iter().any(|existing| existing == name))
    }

    async fn apply(
        &self,
        target: &ReconciliationTarget,
        exists: bool,
    ) -> Result<bool, ReconcileError> {
        let kind = target.kind();
        let name = target.name.as_str();
        let write_error = |source| ReconcileError::Write {
            kind: kind.as_str(),
            name: name.to_owned(),
            source,
        };

        match &target.spec {
            DesiredSpec::AuthMethod { mount, config } => {
                if !exists {
                    self.vault
                        .enable_auth_method(name, mount)
                        .await
                        .map_err(write_error)?;
                }
                if let Some(config) = config {
                    self.vault
                        .configure_auth_method(name, config)
                        .await
                        .map_err(write_error)?;
                    return Ok(true);
                }
                Ok(!exists)
            }
            DesiredSpec::SecretsEngine(mount) => {
                if exists {
                    return Ok(false);
                }
                self.vault
                    .enable_secrets_engine(name, mount)
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
            DesiredSpec::PasswordPolicy(policy) => {
                self.vault
                    .write_password_policy(name, policy)
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
            DesiredSpec::AclPolicy(policy) => {
                self.vault
                    .write_acl_policy(name, policy)
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
            DesiredSpec::TransitKey { mount } => {
                if exists {
                    return Ok(false);
                }
                self.vault
                    .create_transit_key(mount, name)
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
            DesiredSpec::Role {
                auth_mount,
                policies,
                params,
            } => {
                let mut body = params.clone();
                body.insert("token_policies".to_owned(), Value::from(policies.clone()));
                self.vault
                    .write_role(auth_mount, name, &Value::Object(body))
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
            DesiredSpec::KvSecret { mount, fields } => {
                let data = self.render_fields(name, fields).await?;
                self.vault
                    .write_kv(mount, name, &data)
                    .await
                    .map_err(write_error)?;
                Ok(true)
            }
        }
    }

    async fn render_fields(
        &self,
        name: &str,
        fields: &[(String, SecretValue)],
    ) -> Result<Map<String, Value>, ReconcileError> {
        let mut data = Map::new();
        for (field, value) in fields {
            let rendered = match value {
                SecretValue::Literal(v) => v.clone(),
                SecretValue::Generated { policy } => self
                    .vault
                    .generate_password(policy)
                    .await
                    .map_err(|source| ReconcileError::Generate {
                        policy: policy.clone(),
                        name: format!("{name}#{field}"),
                        source,
                    })?,
            };
            data.insert(field.clone(), Value::String(rendered));
        }
        Ok(data)
    }
}

/// Every ACL policy a role references must come before the role when both
/// are part of the same pass.
fn check_policy_order(targets: &[ReconciliationTarget]) -> Result<(), ReconcileError> {
    let positions: HashMap<&str, usize> = targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind() == TargetKind::AclPolicy)
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    for (index, target) in targets.iter().enumerate() {
        if let DesiredSpec::Role { policies, .. } = &target.spec {
            let unique: BTreeSet<&str> = policies.iter().map(String::as_str).collect();
            if let Some(policy) = unique
                .into_iter()
                .find(|p| positions.get(p).is_some_and(|&pos| pos > index))
            {
                return Err(ReconcileError::PolicyOrdering {
                    role: target.name.clone(),
                    policy: policy.to_owned(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::FakeVault;

    fn acl(name: &str) -> ReconciliationTarget {
        ReconciliationTarget::new(
            name,
            DesiredSpec::AclPolicy(format!("path \"kv/data/{name}/*\" {{ capabilities = [\"read\"] }}")),
        )
    }

    fn role(name: &str, policies: &[&str]) -> ReconciliationTarget {
        ReconciliationTarget::new(
            name,
            DesiredSpec::Role {
                auth_mount: "kubernetes".to_owned(),
                policies: policies.iter().map(|p| (*p).to_owned()).collect(),
                params: json!({ "bound_service_account_names": [name] })
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        )
    }

    // ── single targets ─────────────────────────────────────────────

    #[tokio::test]
    async fn second_reconcile_without_overwrite_is_unchanged() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);

        assert!(engine.reconcile(&acl("keycloak"), false).await.unwrap());
        assert!(!engine.reconcile(&acl("keycloak"), false).await.unwrap());
        assert_eq!(vault.writes(), 1);
    }

    #[tokio::test]
    async fn overwrite_rewrites_existing_policy() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);

        assert!(engine.reconcile(&acl("gitlab"), false).await.unwrap());
        assert!(engine.reconcile(&acl("gitlab"), true).await.unwrap());
        assert_eq!(vault.writes(), 2);
    }

    #[tokio::test]
    async fn missing_password_policy_listing_is_empty() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);

        let target = ReconciliationTarget::new(
            "alphanumeric-password",
            DesiredSpec::PasswordPolicy("length = 20".to_owned()),
        );
        assert!(engine.reconcile(&target, false).await.unwrap());
    }

    #[tokio::test]
    async fn existing_engine_is_left_alone_even_with_overwrite() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let kv = ReconciliationTarget::new(
            "kv",
            DesiredSpec::SecretsEngine(MountSpec::new("kv-v2", "").with_option("version", "2")),
        );

        assert!(engine.reconcile(&kv, false).await.unwrap());
        assert!(!engine.reconcile(&kv, true).await.unwrap());
        assert_eq!(vault.writes(), 1);
    }

    #[tokio::test]
    async fn auth_method_config_is_applied() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let target = ReconciliationTarget::new(
            "kubernetes",
            DesiredSpec::AuthMethod {
                mount: MountSpec::new("kubernetes", ""),
                config: Some(json!({ "kubernetes_host": "https://10.0.0.1:443" })),
            },
        );

        assert!(engine.reconcile(&target, false).await.unwrap());
        assert_eq!(
            vault.auth_config("kubernetes").unwrap()["kubernetes_host"],
            "https://10.0.0.1:443"
        );
        assert!(!engine.reconcile(&target, false).await.unwrap());
    }

    #[tokio::test]
    async fn role_carries_its_policies() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);

        engine.reconcile(&role("keycloak", &["keycloak"]), false).await.unwrap();
        let stored = vault.role("kubernetes", "keycloak").unwrap();
        assert_eq!(stored["token_policies"], json!(["keycloak"]));
        assert_eq!(stored["bound_service_account_names"], json!(["keycloak"]));
    }

    #[tokio::test]
    async fn secret_fields_are_generated_from_policy() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let target = ReconciliationTarget::new(
            "keycloak/credentials/postgresql",
            DesiredSpec::KvSecret {
                mount: "kv".to_owned(),
                fields: vec![
                    ("username".to_owned(), SecretValue::Literal("keycloak".to_owned())),
                    (
                        "password".to_owned(),
                        SecretValue::Generated {
                            policy: "alphanumeric-password".to_owned(),
                        },
                    ),
                ],
            },
        );

        assert!(engine.reconcile(&target, false).await.unwrap());
        let data = vault.kv("kv", "keycloak/credentials/postgresql").unwrap();
        assert_eq!(data["username"], "keycloak");
        assert!(data["password"].as_str().unwrap().starts_with("generated-alphanumeric-password"));

        // An existing secret keeps its generated password.
        assert!(!engine.reconcile(&target, false).await.unwrap());
        assert_eq!(vault.kv("kv", "keycloak/credentials/postgresql").unwrap(), data);
    }

    #[tokio::test]
    async fn write_failure_is_reported_with_target() {
        let vault = FakeVault::ready("hvs.root");
        vault.fail_writes_to("sys/policies/acl/broken");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);

        let err = engine.reconcile(&acl("broken"), false).await.unwrap_err();
        assert!(matches!(
            &err,
            ReconcileError::Write { name, source: VaultError::Api { status: 500, .. }, .. }
                if name == "broken"
        ));
    }

    // ── passes ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn pass_reports_summary_and_is_idempotent() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let targets = vec![acl("keycloak"), role("keycloak", &["keycloak"])];

        let first = engine.reconcile_all(&targets, false).await.unwrap();
        assert_eq!(first.changed.len(), 2);
        assert!(first.unchanged.is_empty());

        let second = engine.reconcile_all(&targets, false).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged.len(), 2);
    }

    #[tokio::test]
    async fn pass_stops_at_first_failure() {
        let vault = FakeVault::ready("hvs.root");
        vault.fail_writes_to("sys/policies/acl/awx");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let targets = vec![acl("awx"), acl("harbor")];

        assert!(engine.reconcile_all(&targets, false).await.is_err());
        assert!(!vault.has_acl_policy("harbor"));
    }

    #[tokio::test]
    async fn role_before_its_policy_is_rejected() {
        let vault = FakeVault::ready("hvs.root");
        let client = vault.client("vault-0", Some("hvs.root"));
        let engine = ReconciliationEngine::new(&client);
        let targets = vec![role("vso-auth", &["vso-auth"]), acl("vso-auth")];

        let err = engine.reconcile_all(&targets, false).await.unwrap_err();
        assert!(matches!(err, ReconcileError::PolicyOrdering { .. }));
        assert_eq!(vault.writes(), 0);
    }

    #[test]
    fn kinds_are_ranked_policies_before_roles() {
        assert!(TargetKind::AuthMethod < TargetKind::SecretsEngine);
        assert!(TargetKind::PasswordPolicy < TargetKind::AclPolicy);
        assert!(TargetKind::AclPolicy < TargetKind::Role);
        assert!(TargetKind::Role < TargetKind::KvSecret);
    }
}
