//! Auto-unseal detection.
//!
//! Vault reads its server configuration from a mounted config map. A `seal`
//! stanza naming an external key-management mechanism means the cluster
//! unseals itself, so manual key submission must be skipped and
//! initialization must request recovery shares.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, PodRef};
use crate::error::ClusterError;

/// Seal types that unseal automatically. `shamir` is deliberately absent.
pub const AUTO_UNSEAL_MECHANISMS: &[&str] = &[
    "awskms",
    "azurekeyvault",
    "gcpckms",
    "ocikms",
    "alicloudkms",
    "transit",
    "pkcs11",
    "kmip",
];

/// Where an auto-unseal stanza was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoUnseal {
    pub mechanism: String,
    pub pod: String,
    pub config_map: String,
}

/// The auto-unseal mechanism configured in `config`, if any.
///
/// Accepts HCL (`seal "awskms" { ... }`, quoted or bare label) and JSON
/// (`"seal": {"awskms": ...}`). Seal blocks marked `disabled` belong to a
/// seal migration and are ignored.
#[must_use]
pub fn detect_mechanism(config: &str) -> Option<String> {
    if let Ok(Value::Object(root)) = serde_json::from_str::<Value>(config) {
        return detect_json(root.get("seal")?);
    }
    detect_hcl(config)
}

fn detect_json(seal: &Value) -> Option<String> {
    match seal {
        Value::Object(stanzas) => stanzas
            .iter()
            .find(|(kind, body)| is_auto_unseal(kind) && !json_disabled(body))
            .map(|(kind, _)| kind.clone()),
        Value::Array(items) => items.iter().find_map(detect_json),
        _ => None,
    }
}

fn json_disabled(body: &Value) -> bool {
    match body.get("disabled") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn detect_hcl(config: &str) -> Option<String> {
    let body = match hcl::parse(config) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "config is neither JSON nor HCL, skipping");
            return None;
        }
    };
    body.blocks()
        .filter(|block| block.identifier() == "seal" && !hcl_disabled(&block.body))
        .filter_map(|block| block.labels().first())
        .map(|label| label.as_str())
        .find(|kind| is_auto_unseal(kind))
        .map(ToOwned::to_owned)
}

fn hcl_disabled(body: &hcl::Body) -> bool {
    body.attributes()
        .find(|attr| attr.key() == "disabled")
        .is_some_and(|attr| match attr.expr() {
            hcl::Expression::Bool(b) => *b,
            hcl::Expression::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
}

fn is_auto_unseal(mechanism: &str) -> bool {
    AUTO_UNSEAL_MECHANISMS.contains(&mechanism.trim().to_lowercase().as_str())
}

/// Inspect the config maps mounted by every pod for an auto-unseal stanza.
///
/// # Errors
///
/// Returns the cluster error if a config map cannot be read. Config maps
/// that do not exist are treated as empty.
pub async fn detect(
    cluster: &dyn ClusterApi,
    pods: &[PodRef],
) -> Result<Option<AutoUnseal>, ClusterError> {
    for pod in pods {
        for config_map in &pod.config_maps {
            let values = cluster.config_map_data(&pod.namespace, config_map).await?;
            if let Some(mechanism) = values.iter().find_map(|v| detect_mechanism(v)) {
                info!(pod = %pod.name, config_map = %config_map, mechanism = %mechanism, "auto-unseal configured");
                return Ok(Some(AutoUnseal {
                    mechanism,
                    pod: pod.name.clone(),
                    config_map: config_map.clone(),
                }));
            }
        }
    }
    debug!(pods = pods.len(), "no auto-unseal stanza found");
    Ok(None)
}
