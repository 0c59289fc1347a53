//! Initialize/unseal state machine.
//!
//! ```text
//! Unknown ──query──▶ AlreadyInitialized ─────────────────┐
//!    │                                                    ▼
//!    └────────────▶ NeedsInitialization ─▶ Initializing ─▶ Initialized
//!                                                         │
//!                      ┌──────── unseal decision ◀────────┘
//!                      ▼                    ▼
//!               AutoUnsealSkipped      NeedsUnseal ─▶ Ready
//! ```
//!
//! Every run re-reads the cluster state, so a second run against an already
//! bootstrapped cluster loads the cached credentials instead of initializing
//! and reaches the same terminal state.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::autounseal::{self, AutoUnseal};
use crate::cluster::{ClusterApi, PodRef};
use crate::credentials::{BootstrapCredentials, CredentialStore};
use crate::environment::Environment;
use crate::error::{BootstrapError, DiscoveryError};
use crate::sink::TokenSink;
use crate::tunnel::TunnelManager;
use crate::unseal::{UnsealCoordinator, UnsealReport};
use crate::vault::{InitRequest, InitResponse, VaultApi, VaultConnector};

/// States of the bootstrap lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unknown,
    AlreadyInitialized,
    NeedsInitialization,
    Initializing,
    Initialized,
    AutoUnsealSkipped,
    NeedsUnseal,
    Ready,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::AlreadyInitialized => "already-initialized",
            Self::NeedsInitialization => "needs-initialization",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::AutoUnsealSkipped => "auto-unseal-skipped",
            Self::NeedsUnseal => "needs-unseal",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Operator-supplied parameters for a bootstrap run.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapParams {
    pub environment: Environment,
    pub shares: u8,
    pub threshold: u8,
    /// Request recovery shares instead of unseal shares. Forced on when an
    /// auto-unseal stanza is detected.
    pub high_availability: bool,
}

impl BootstrapParams {
    /// # Errors
    ///
    /// `InvalidParameters` unless `1 <= threshold <= shares`.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.shares == 0 {
            return Err(BootstrapError::InvalidParameters {
                reason: "key shares must be at least 1".to_owned(),
            });
        }
        if self.threshold == 0 || self.threshold > self.shares {
            return Err(BootstrapError::InvalidParameters {
                reason: format!(
                    "threshold must be between 1 and the number of shares ({}), got {}",
                    self.shares, self.threshold
                ),
            });
        }
        Ok(())
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct BootstrapOutcome {
    /// `Ready` or `AutoUnsealSkipped`.
    pub state: BootstrapState,
    /// Whether this run performed the initialization.
    pub initialized_now: bool,
    /// Where the credentials were written, when this run wrote them.
    pub credentials_path: Option<PathBuf>,
    pub auto_unseal: Option<AutoUnseal>,
    pub unsealed: Vec<UnsealReport>,
}

/// Drives a Vault cluster from any state to unsealed.
pub struct BootstrapStateMachine {
    cluster: Arc<dyn ClusterApi>,
    tunnels: TunnelManager,
    connector: Arc<dyn VaultConnector>,
    store: CredentialStore,
    unsealer: UnsealCoordinator,
    sink: Option<Arc<dyn TokenSink>>,
    state: BootstrapState,
}

impl BootstrapStateMachine {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tunnels: TunnelManager,
        connector: Arc<dyn VaultConnector>,
        store: CredentialStore,
        unsealer: UnsealCoordinator,
    ) -> Self {
        Self {
            cluster,
            tunnels,
            connector,
            store,
            unsealer,
            sink: None,
            state: BootstrapState::Unknown,
        }
    }

    /// Forward the root token to `sink` after a fresh initialization.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    fn transition(&mut self, next: BootstrapState) {
        debug!(from = %self.state, to = %next, "bootstrap transition");
        self.state = next;
    }

    /// Run the lifecycle against `leader`, then unseal all `pods`.
    ///
    /// `pods` must all live in the leader's namespace and include the
    /// leader. Any error leaves the machine in `Failed`.
    ///
    /// # Errors
    ///
    /// Returns the first failure: invalid parameters, discovery, tunnel,
    /// Vault API, credential persistence, sink, or unseal errors.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        leader: &PodRef,
        pods: &[PodRef],
        params: &BootstrapParams,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        self.state = BootstrapState::Unknown;
        let result = self.drive(cancel, leader, pods, params).await;
        if result.is_err() {
            self.transition(BootstrapState::Failed);
        }
        result
    }

    async fn drive(
        &mut self,
        cancel: &CancellationToken,
        leader: &PodRef,
        pods: &[PodRef],
        params: &BootstrapParams,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        params.validate()?;

        // Checked on every run: an already initialized cluster still needs
        // the unseal decision today.
        let auto_unseal = autounseal::detect(self.cluster.as_ref(), pods)
            .await
            .map_err(DiscoveryError::from)?;
        let recovery = params.high_availability || auto_unseal.is_some();
        if auto_unseal.is_some() && !params.high_availability {
            info!("auto-unseal detected, requesting recovery shares");
        }

        let mut tunnel = self.tunnels.open(cancel, leader).await?;
        let initialization = match self.connector.connect(&tunnel, None) {
            Ok(vault) => self.initialize(vault.as_ref(), params, recovery).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = tunnel.close().await {
            warn!(pod = %leader.name, error = %e, "tunnel reported a failure while closing");
        }
        let (credentials, credentials_path, threshold) = initialization?;
        let initialized_now = credentials_path.is_some();

        if let Some(auto) = auto_unseal {
            self.transition(BootstrapState::AutoUnsealSkipped);
            info!(mechanism = %auto.mechanism, "skipping manual unseal");
            return Ok(BootstrapOutcome {
                state: BootstrapState::AutoUnsealSkipped,
                initialized_now,
                credentials_path,
                auto_unseal: Some(auto),
                unsealed: Vec::new(),
            });
        }

        self.transition(BootstrapState::NeedsUnseal);
        let unsealed = self
            .unsealer
            .unseal(cancel, pods, threshold, &credentials.keys)
            .await?;

        self.transition(BootstrapState::Ready);
        Ok(BootstrapOutcome {
            state: BootstrapState::Ready,
            initialized_now,
            credentials_path,
            auto_unseal: None,
            unsealed,
        })
    }

    /// Initialize through `vault` when needed, otherwise reload the cached
    /// credentials. Returns the credentials, the record path when written by
    /// this call, and the unseal threshold reported by Vault.
    async fn initialize(
        &mut self,
        vault: &dyn VaultApi,
        params: &BootstrapParams,
        recovery: bool,
    ) -> Result<(BootstrapCredentials, Option<PathBuf>, usize), BootstrapError> {
        let status = vault.seal_status().await?;

        if status.initialized {
            self.transition(BootstrapState::AlreadyInitialized);
            let credentials = self.store.read(params.environment).await.map_err(|source| {
                BootstrapError::MissingCredentials {
                    environment: params.environment.to_string(),
                    source,
                }
            })?;
            let threshold = effective_threshold(status.threshold, params.threshold);
            return Ok((credentials, None, threshold));
        }

        self.transition(BootstrapState::NeedsInitialization);
        self.transition(BootstrapState::Initializing);
        let request = InitRequest {
            shares: params.shares,
            threshold: params.threshold,
            recovery,
        };
        info!(
            shares = params.shares,
            threshold = params.threshold,
            recovery,
            "initializing Vault"
        );
        let response = vault.init(&request).await?;
        let credentials = credentials_from(&response)?;

        // Vault hands out the keys exactly once, so a failed write keeps
        // them in the error for the caller to show.
        let path = match self.store.write(params.environment, &credentials).await {
            Ok(path) => path,
            Err(source) => {
                let path = self.store.path(params.environment);
                error!(
                    path = %path.display(),
                    error = %source,
                    "Vault was initialized but its credentials could not be saved"
                );
                return Err(BootstrapError::CredentialsNotSaved {
                    path,
                    source,
                    credentials: Box::new(credentials),
                });
            }
        };
        if let Some(sink) = &self.sink {
            sink.store_token(&credentials.token).await?;
        }
        self.transition(BootstrapState::Initialized);

        let status = vault.seal_status().await?;
        let threshold = effective_threshold(status.threshold, params.threshold);
        Ok((credentials, Some(path), threshold))
    }
}

fn effective_threshold(reported: usize, requested: u8) -> usize {
    if reported > 0 {
        reported
    } else {
        usize::from(requested)
    }
}

/// Unseal keys when present, recovery keys otherwise.
fn credentials_from(response: &InitResponse) -> Result<BootstrapCredentials, BootstrapError> {
    let (keys, keys_base64) = if response.keys.is_empty() {
        (&response.recovery_keys, &response.recovery_keys_base64)
    } else {
        (&response.keys, &response.keys_base64)
    };
    if keys.is_empty() {
        return Err(BootstrapError::IncompleteInitResponse {
            what: "unseal or recovery keys",
        });
    }
    if response.root_token.is_empty() {
        return Err(BootstrapError::IncompleteInitResponse { what: "root token" });
    }
    Ok(BootstrapCredentials::new(
        keys.clone(),
        keys_base64.clone(),
        response.root_token.clone(),
    ))
}
