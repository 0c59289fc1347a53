//! Stage composition for every command.
//!
//! Each command runs the same prefix (discover pods, enforce a single
//! namespace, pick the leader, wait for it to run) and then either drives
//! the bootstrap state machine or applies one reconciliation plan through a
//! tunnel that is closed before the command returns.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::bootstrap::{BootstrapOutcome, BootstrapParams, BootstrapStateMachine};
use crate::cluster::{ClusterApi, KubeCluster, PodPhase, PodRef};
use crate::config::ToolkitConfig;
use crate::credentials::CredentialStore;
use crate::environment::Environment;
use crate::error::PipelineError;
use crate::plans::{self, Plan};
use crate::pods::{ensure_single_namespace, PodLocator};
use crate::reconcile::{ReconcileSummary, ReconciliationEngine};
use crate::sink::YamlSecretFileSink;
use crate::tunnel::{FallbackDialer, PodDialer, TunnelManager};
use crate::unseal::UnsealCoordinator;
use crate::vault::{HttpVaultConnector, SealStatus, VaultConnector};

/// Which pods a command targets.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Empty means every namespace.
    pub namespace: String,
    /// Empty means the configured default label.
    pub label: String,
}

/// Options shared by the reconciling commands.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub environment: Environment,
    /// Falls back to the cached root token when unset.
    pub token: Option<String>,
    pub overwrite: bool,
}

/// Seal state of one pod as seen by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodStatus {
    pub pod: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// `None` for pods that are not running.
    pub seal: Option<SealStatus>,
}

struct Located {
    namespace: String,
    leader: PodRef,
    pods: Vec<PodRef>,
}

/// Wires the collaborators together and runs commands.
pub struct Pipeline {
    cluster: Arc<dyn ClusterApi>,
    locator: PodLocator,
    tunnels: TunnelManager,
    connector: Arc<dyn VaultConnector>,
    store: CredentialStore,
}

impl Pipeline {
    pub fn new(
        config: &ToolkitConfig,
        cluster: Arc<dyn ClusterApi>,
        dialer: Arc<dyn PodDialer>,
        connector: Arc<dyn VaultConnector>,
    ) -> Self {
        Self {
            locator: PodLocator::new(Arc::clone(&cluster), config),
            tunnels: TunnelManager::new(dialer, config),
            store: CredentialStore::new(&config.cache_dir),
            cluster,
            connector,
        }
    }

    /// A pipeline against the cluster from the ambient kubeconfig, tunnelling
    /// with WebSocket port-forward and falling back to exec.
    ///
    /// # Errors
    ///
    /// Returns a cluster error if no kubeconfig can be loaded.
    pub async fn kubernetes(config: &ToolkitConfig) -> Result<Self, PipelineError> {
        let cluster = KubeCluster::try_default().await?;
        let dialer = Arc::new(FallbackDialer::kubernetes(&cluster.client()));
        let connector = Arc::new(HttpVaultConnector::new(config));
        Ok(Self::new(config, Arc::new(cluster), dialer, connector))
    }

    #[must_use]
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Initialize and unseal the cluster, or unseal it with cached
    /// credentials when it was initialized before. The root token is merged
    /// into `secret_file` after a fresh initialization.
    ///
    /// # Errors
    ///
    /// Any discovery or bootstrap failure.
    pub async fn initialize(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        params: &BootstrapParams,
        secret_file: Option<&Path>,
    ) -> Result<BootstrapOutcome, PipelineError> {
        let located = self.locate(selection).await?;
        let (leader, _) = self.locator.wait_until_running(&located.leader, cancel).await?;
        if params.environment.is_production() {
            warn!(namespace = %located.namespace, "bootstrapping a production cluster");
        }

        let unsealer = UnsealCoordinator::new(
            self.locator.clone(),
            self.tunnels.clone(),
            Arc::clone(&self.connector),
        );
        let mut machine = BootstrapStateMachine::new(
            Arc::clone(&self.cluster),
            self.tunnels.clone(),
            Arc::clone(&self.connector),
            self.store.clone(),
            unsealer,
        );
        if let Some(path) = secret_file {
            machine = machine.with_sink(Arc::new(YamlSecretFileSink::new(path)));
        }

        let outcome = machine.run(cancel, &leader, &located.pods, params).await?;
        info!(state = %outcome.state, pods = located.pods.len(), "initialize finished");
        Ok(outcome)
    }

    /// Enable the auth methods and the KV engine.
    ///
    /// # Errors
    ///
    /// Discovery, credential, tunnel or reconciliation failures.
    pub async fn mounts(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        options: &ReconcileOptions,
    ) -> Result<ReconcileSummary, PipelineError> {
        let endpoint = self.cluster.api_server_endpoint().await?;
        self.apply(cancel, selection, options, &plans::mounts(&endpoint))
            .await
    }

    /// Write release, admin and password policies.
    ///
    /// # Errors
    ///
    /// Discovery, credential, tunnel or reconciliation failures.
    pub async fn configure(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        options: &ReconcileOptions,
    ) -> Result<ReconcileSummary, PipelineError> {
        self.apply(cancel, selection, options, &plans::configure())
            .await
    }

    /// Prepare Vault for `application`.
    ///
    /// # Errors
    ///
    /// `UnknownApplication` before any cluster call, then discovery,
    /// credential, tunnel or reconciliation failures.
    pub async fn prepare(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        application: &str,
        options: &ReconcileOptions,
    ) -> Result<ReconcileSummary, PipelineError> {
        let plan = plans::prepare(application)?;
        self.apply(cancel, selection, options, &plan).await
    }

    /// Seal status of every discovered pod. Read-only.
    ///
    /// # Errors
    ///
    /// Discovery, tunnel or Vault failures.
    pub async fn status(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
    ) -> Result<Vec<PodStatus>, PipelineError> {
        let located = self.locate(selection).await?;

        let mut statuses = Vec::with_capacity(located.pods.len());
        for pod in &located.pods {
            let seal = if pod.is_running() {
                let mut tunnel = self.tunnels.open(cancel, pod).await?;
                let status = match self.connector.connect(&tunnel, None) {
                    Ok(vault) => vault.seal_status().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = tunnel.close().await {
                    warn!(pod = %pod.name, error = %e, "tunnel reported a failure while closing");
                }
                Some(status?)
            } else {
                None
            };
            statuses.push(PodStatus {
                pod: pod.name.clone(),
                namespace: pod.namespace.clone(),
                phase: pod.phase,
                seal,
            });
        }
        Ok(statuses)
    }

    async fn locate(&self, selection: &Selection) -> Result<Located, PipelineError> {
        let selector = if selection.label.is_empty() {
            self.locator.default_label().to_owned()
        } else {
            selection.label.clone()
        };

        let pods = self.locator.find_pods(&selection.namespace, &selector).await?;
        let namespace = ensure_single_namespace(&pods, &selection.namespace, &selector)?;
        let pods: Vec<PodRef> = pods.into_iter().filter(|p| p.namespace == namespace).collect();
        let leader = self.locator.select_leader(&pods, &namespace, &selector).await?;
        info!(
            namespace = %namespace,
            leader = %leader.name,
            pods = pods.len(),
            "located Vault pods"
        );
        Ok(Located {
            namespace,
            leader,
            pods,
        })
    }

    async fn token(&self, options: &ReconcileOptions) -> Result<Zeroizing<String>, PipelineError> {
        if let Some(token) = options.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Zeroizing::new(token.to_owned()));
        }
        let credentials = self.store.read(options.environment).await.map_err(|source| {
            PipelineError::MissingCredentials {
                environment: options.environment.to_string(),
                source,
            }
        })?;
        Ok(Zeroizing::new(credentials.token.clone()))
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        selection: &Selection,
        options: &ReconcileOptions,
        plan: &Plan,
    ) -> Result<ReconcileSummary, PipelineError> {
        let located = self.locate(selection).await?;
        let (leader, _) = self.locator.wait_until_running(&located.leader, cancel).await?;
        let token = self.token(options).await?;

        let mut tunnel = self.tunnels.open(cancel, &leader).await?;
        let result = match self.connector.connect(&tunnel, Some(token.as_str())) {
            Ok(vault) => ReconciliationEngine::new(vault.as_ref())
                .reconcile_all(plan.targets(), options.overwrite)
                .await
                .map_err(PipelineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = tunnel.close().await {
            warn!(pod = %leader.name, error = %e, "tunnel reported a failure while closing");
        }

        let summary = result?;
        info!(
            plan = plan.name(),
            changed = summary.changed.len(),
            unchanged = summary.unchanged.len(),
            "plan applied"
        );
        Ok(summary)
    }
}
