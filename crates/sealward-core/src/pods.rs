//! Pod discovery and leader selection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{ClusterApi, PodRef};
use crate::config::ToolkitConfig;
use crate::error::DiscoveryError;

/// Finds Vault pods, checks the namespace invariant, and picks the leader.
#[derive(Clone)]
pub struct PodLocator {
    cluster: Arc<dyn ClusterApi>,
    default_label: String,
    active_label: String,
    poll_interval: Duration,
    startup_timeout: Duration,
}

impl PodLocator {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &ToolkitConfig) -> Self {
        Self {
            cluster,
            default_label: config.label.clone(),
            active_label: config.active_label.clone(),
            poll_interval: config.pod_poll_interval,
            startup_timeout: config.pod_startup_timeout,
        }
    }

    /// Label selector used when the caller passes an empty one.
    #[must_use]
    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    /// List pods matching `selector` (or the default label when empty),
    /// cluster-wide when `namespace_hint` is empty.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NoPods` when nothing matches, or the
    /// underlying cluster error.
    pub async fn find_pods(
        &self,
        namespace_hint: &str,
        selector: &str,
    ) -> Result<Vec<PodRef>, DiscoveryError> {
        let selector = if selector.is_empty() {
            self.default_label.as_str()
        } else {
            selector
        };
        let namespace = (!namespace_hint.is_empty()).then_some(namespace_hint);

        let pods = self.cluster.list_pods(namespace, selector).await?;
        if pods.is_empty() {
            return Err(DiscoveryError::NoPods {
                selector: selector.to_owned(),
                scope: namespace.map_or_else(
                    || "all namespaces".to_owned(),
                    |ns| format!("namespace '{ns}'"),
                ),
            });
        }

        debug!(selector, count = pods.len(), "discovered pods");
        Ok(pods)
    }

    /// Select the leader among `pods`, all of which live in `namespace`.
    ///
    /// A single candidate wins outright. Otherwise the pods are re-queried
    /// with `label` combined with the active-replica label: one match is the
    /// leader, several are ambiguous, none falls back to the ordinal-zero pod.
    ///
    /// # Errors
    ///
    /// Returns `LeaderAmbiguous`, `UnfamiliarNaming`, or a cluster error.
    pub async fn select_leader(
        &self,
        pods: &[PodRef],
        namespace: &str,
        label: &str,
    ) -> Result<PodRef, DiscoveryError> {
        let label = if label.is_empty() {
            self.default_label.as_str()
        } else {
            label
        };

        match pods {
            [] => {
                return Err(DiscoveryError::NoPods {
                    selector: label.to_owned(),
                    scope: format!("namespace '{namespace}'"),
                });
            }
            [only] => return Ok(only.clone()),
            _ => {}
        }

        let selector = format!("{label},{}", self.active_label);
        let active = self.cluster.list_pods(Some(namespace), &selector).await?;

        match active.len() {
            1 => {
                let leader = active.into_iter().next().ok_or_else(|| {
                    DiscoveryError::LeaderAmbiguous {
                        selector: selector.clone(),
                        count: 0,
                    }
                })?;
                info!(pod = %leader.name, namespace, "leader selected by active label");
                Ok(leader)
            }
            0 => {
                let leader = ordinal_zero(pods).ok_or_else(|| DiscoveryError::UnfamiliarNaming {
                    pods: pods.iter().map(|p| p.name.clone()).collect(),
                })?;
                info!(pod = %leader.name, namespace, "leader selected by ordinal");
                Ok(leader.clone())
            }
            count => Err(DiscoveryError::LeaderAmbiguous { selector, count }),
        }
    }

    /// Poll the pod until it reports `Running`, returning its fresh snapshot
    /// and the time spent waiting.
    ///
    /// # Errors
    ///
    /// Returns `PodStartupTimeout` when the deadline passes, `Cancelled` when
    /// `cancel` fires, or a cluster error.
    pub async fn wait_until_running(
        &self,
        pod: &PodRef,
        cancel: &CancellationToken,
    ) -> Result<(PodRef, Duration), DiscoveryError> {
        let started = Instant::now();
        loop {
            let current = self.cluster.get_pod(&pod.namespace, &pod.name).await?;
            if current.is_running() {
                let elapsed = started.elapsed();
                debug!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "pod is running"
                );
                return Ok((current, elapsed));
            }

            if started.elapsed() >= self.startup_timeout {
                return Err(DiscoveryError::PodStartupTimeout {
                    namespace: pod.namespace.clone(),
                    pod: pod.name.clone(),
                    phase: current.phase.to_string(),
                    timeout: self.startup_timeout,
                });
            }

            debug!(pod = %pod.name, phase = %current.phase, "waiting for pod");
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(DiscoveryError::Cancelled {
                        namespace: pod.namespace.clone(),
                        pod: pod.name.clone(),
                    });
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// The single namespace shared by `pods`, or `explicit` when one was given.
///
/// # Errors
///
/// Returns `MultipleNamespaces` when the pods span several namespaces and no
/// explicit namespace was passed, or `NoPods` for an empty set.
pub fn ensure_single_namespace(
    pods: &[PodRef],
    explicit: &str,
    selector: &str,
) -> Result<String, DiscoveryError> {
    if !explicit.is_empty() {
        return Ok(explicit.to_owned());
    }

    let namespaces: BTreeSet<&str> = pods.iter().map(|p| p.namespace.as_str()).collect();
    let mut iter = namespaces.iter();
    match (iter.next(), iter.next()) {
        (Some(ns), None) => Ok((*ns).to_owned()),
        (None, _) => Err(DiscoveryError::NoPods {
            selector: selector.to_owned(),
            scope: "all namespaces".to_owned(),
        }),
        (Some(_), Some(_)) => Err(DiscoveryError::MultipleNamespaces {
            selector: selector.to_owned(),
            namespaces: namespaces.iter().map(|ns| (*ns).to_owned()).collect(),
        }),
    }
}

/// The pod whose name encodes ordinal zero: a `-0` suffix first, then any
/// name containing `0`.
fn ordinal_zero(pods: &[PodRef]) -> Option<&PodRef> {
    pods.iter()
        .find(|p| p.name.rsplit_once('-').is_some_and(|(_, ord)| ord == "0"))
        .or_else(|| pods.iter().find(|p| p.name.contains('0')))
}
