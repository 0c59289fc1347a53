//! Threshold unsealing across every Vault replica.
//!
//! Pods are processed one at a time. For each pod the coordinator waits for
//! `Running`, opens a dedicated tunnel, and submits keys in generation order
//! until the replica reports unsealed. The first failing pod stops the run;
//! its tunnel is closed before the error is returned.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::PodRef;
use crate::error::UnsealError;
use crate::pods::PodLocator;
use crate::tunnel::TunnelManager;
use crate::vault::{VaultApi, VaultConnector};

/// What happened on one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealReport {
    pub pod: String,
    /// Number of keys submitted. Zero when the replica was already unsealed.
    pub submitted: usize,
    pub already_unsealed: bool,
    /// Time spent waiting for the pod to reach `Running`.
    pub waited: Duration,
}

/// Distributes unseal key submissions over the replicas.
#[derive(Clone)]
pub struct UnsealCoordinator {
    locator: PodLocator,
    tunnels: TunnelManager,
    connector: Arc<dyn VaultConnector>,
}

impl UnsealCoordinator {
    #[must_use]
    pub fn new(
        locator: PodLocator,
        tunnels: TunnelManager,
        connector: Arc<dyn VaultConnector>,
    ) -> Self {
        Self {
            locator,
            tunnels,
            connector,
        }
    }

    /// Unseal every pod in order, submitting at most `threshold` keys each.
    ///
    /// # Errors
    ///
    /// `InsufficientKeys` before touching any pod, otherwise the first pod
    /// failure.
    pub async fn unseal(
        &self,
        cancel: &CancellationToken,
        pods: &[PodRef],
        threshold: usize,
        keys: &[String],
    ) -> Result<Vec<UnsealReport>, UnsealError> {
        if threshold == 0 || keys.len() < threshold {
            return Err(UnsealError::InsufficientKeys {
                threshold,
                available: keys.len(),
            });
        }

        let mut reports = Vec::with_capacity(pods.len());
        for pod in pods {
            let report = self.unseal_pod(cancel, pod, &keys[..threshold]).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn unseal_pod(
        &self,
        cancel: &CancellationToken,
        pod: &PodRef,
        keys: &[String],
    ) -> Result<UnsealReport, UnsealError> {
        let (fresh, waited) = self
            .locator
            .wait_until_running(pod, cancel)
            .await
            .map_err(|source| UnsealError::Discovery {
                pod: pod.name.clone(),
                source,
            })?;

        let mut tunnel = self
            .tunnels
            .open(cancel, &fresh)
            .await
            .map_err(|source| UnsealError::Tunnel {
                pod: pod.name.clone(),
                source,
            })?;

        let outcome = match self.connector.connect(&tunnel, None) {
            Ok(vault) => submit_keys(vault.as_ref(), &pod.name, keys).await,
            Err(source) => Err(UnsealError::Vault {
                pod: pod.name.clone(),
                source,
            }),
        };

        if let Err(e) = tunnel.close().await {
            warn!(pod = %pod.name, error = %e, "tunnel reported a failure while closing");
        }

        let (submitted, already_unsealed) = outcome?;
        Ok(UnsealReport {
            pod: pod.name.clone(),
            submitted,
            already_unsealed,
            waited,
        })
    }
}

/// Submit keys until the replica reports unsealed. Returns the number of
/// submissions and whether it was unsealed before the first one.
async fn submit_keys(
    vault: &dyn VaultApi,
    pod: &str,
    keys: &[String],
) -> Result<(usize, bool), UnsealError> {
    let vault_error = |source| UnsealError::Vault {
        pod: pod.to_owned(),
        source,
    };

    let status = vault.seal_status().await.map_err(vault_error)?;
    if !status.sealed {
        info!(pod, "already unsealed");
        return Ok((0, true));
    }

    let mut submitted = 0;
    for key in keys {
        vault.unseal(key).await.map_err(vault_error)?;
        submitted += 1;

        let status = vault.seal_status().await.map_err(vault_error)?;
        debug!(pod, submitted, progress = status.progress, "unseal key submitted");
        if !status.sealed {
            info!(pod, submitted, "unsealed");
            return Ok((submitted, false));
        }
    }

    Err(UnsealError::StillSealed {
        pod: pod.to_owned(),
        submitted,
    })
}
