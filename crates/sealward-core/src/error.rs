//! Error types for `sealward-core`.
//!
//! One enum per component. Variants carry the context an operator needs to
//! correct their input (label selector, namespaces, pod name, path, HTTP
//! status). Unseal keys and tokens never appear in an error message.

use std::path::PathBuf;
use std::time::Duration;

use crate::credentials::BootstrapCredentials;

/// Errors from pod discovery and leader selection.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// No pod matched the label selector.
    #[error("no Vault pods found for label selector '{selector}' in {scope}")]
    NoPods { selector: String, scope: String },

    /// Matching pods live in more than one namespace and none was given.
    #[error(
        "discovered Vault pods in multiple namespaces {namespaces:?} for label selector \
         '{selector}'; set the namespace option"
    )]
    MultipleNamespaces {
        selector: String,
        namespaces: Vec<String>,
    },

    /// More than one pod carries the active/leader label.
    #[error("could not determine Vault leader pod: label selector '{selector}' matched {count} pods")]
    LeaderAmbiguous { selector: String, count: usize },

    /// No active-labeled pod and no pod name encodes ordinal zero.
    #[error(
        "could not determine Vault leader pod: unfamiliar naming scheme, none of {pods:?} \
         has ordinal 0"
    )]
    UnfamiliarNaming { pods: Vec<String> },

    /// The pod did not reach `Running` before the deadline.
    #[error("pod {namespace}/{pod} did not reach Running within {timeout:?} (last phase: {phase})")]
    PodStartupTimeout {
        namespace: String,
        pod: String,
        phase: String,
        timeout: Duration,
    },

    /// The operation was cancelled by the operator.
    #[error("cancelled while waiting for pod {namespace}/{pod}")]
    Cancelled { namespace: String, pod: String },

    /// The Kubernetes API returned an error.
    #[error("kubernetes API error: {0}")]
    Cluster(#[from] ClusterError),
}

/// Errors from the Kubernetes API seam.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A request to the Kubernetes API failed.
    #[error("{operation} failed: {reason}")]
    Request { operation: String, reason: String },

    /// A requested object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// The object exists but lacks a field we rely on.
    #[error("{kind} {namespace}/{name} is missing {field}")]
    MissingField {
        kind: &'static str,
        namespace: String,
        name: String,
        field: &'static str,
    },
}

/// Errors from opening, running, or closing a tunnel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    /// Port forwarding was requested for a pod that is not running.
    #[error("unable to forward ports to pod {pod}: phase is {phase}, not Running")]
    PodNotRunning { pod: String, phase: String },

    /// The pod's first container declares no port.
    #[error("pod {pod} declares no container port to forward")]
    NoContainerPort { pod: String },

    /// Binding the local listener failed.
    #[error("could not bind local tunnel port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The transport upgrade (WebSocket/SPDY negotiation) was refused.
    #[error("transport upgrade to pod {pod} failed: {reason}")]
    Upgrade { pod: String, reason: String },

    /// Establishing the stream to the pod failed.
    #[error("could not open stream to {pod}:{port}: {reason}")]
    Dial { pod: String, port: u16, reason: String },

    /// The tunnel did not signal readiness in time.
    #[error("tunnel to pod {pod} not ready after {timeout:?}")]
    ReadyTimeout { pod: String, timeout: Duration },

    /// The background forwarding loop failed.
    #[error("tunnel to pod {pod} failed: {reason}")]
    Forwarding { pod: String, reason: String },

    /// The tunnel was stopped by cancellation before it became ready.
    #[error("tunnel to pod {pod} cancelled")]
    Cancelled { pod: String },
}

impl TunnelError {
    /// Whether this failure is a protocol-negotiation problem that a legacy
    /// transport may succeed at.
    #[must_use]
    pub fn is_upgrade_failure(&self) -> bool {
        matches!(self, Self::Upgrade { .. })
    }
}

/// Errors from the Vault HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Vault answered with a non-success status.
    #[error("vault API error {status} on {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    /// No token is configured for an authenticated call.
    #[error("no Vault token configured for {path}")]
    MissingToken { path: String },

    /// The request never produced a response.
    #[error("vault request to {path} failed: {source}")]
    Network {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The response body could not be decoded.
    #[error("vault response from {path} could not be decoded: {reason}")]
    Decode { path: String, reason: String },

    /// Building the HTTP client failed.
    #[error("vault client configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Whether Vault reported that the requested object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

/// Errors from the on-disk credential cache.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No record exists yet (expected on a first run).
    #[error("no credentials recorded at {}", path.display())]
    NotFound { path: PathBuf },

    /// A record exists but cannot be decoded.
    #[error("credential record at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Reading or writing the record failed.
    #[error("credential I/O on {} failed: {reason}", path.display())]
    Io { path: PathBuf, reason: String },
}

/// Errors from forwarding the root token to a secret file.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Reading or writing the secret file failed.
    #[error("secret file {} I/O failed: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    /// The secret file is not a YAML mapping.
    #[error("secret file {} is not a YAML mapping: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}

/// Errors from the init/unseal state machine.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Share/threshold parameters are out of range.
    #[error("invalid seal parameters: {reason}")]
    InvalidParameters { reason: String },

    /// Vault is initialized but no credentials are cached for this environment.
    #[error(
        "Vault is already initialized but credentials for environment '{environment}' could not \
         be loaded ({source}). Initialization must be (re-)run through sealward"
    )]
    MissingCredentials {
        environment: String,
        #[source]
        source: CredentialError,
    },

    /// Vault was initialized but the credential record could not be
    /// written. Vault will not return the keys again, so they travel here.
    #[error(
        "Vault was initialized but its credentials could not be saved to {} ({source}). \
         The unseal keys and root token are only available from this run",
        path.display()
    )]
    CredentialsNotSaved {
        path: PathBuf,
        #[source]
        source: CredentialError,
        credentials: Box<BootstrapCredentials>,
    },

    /// The init response carried no usable key material.
    #[error("initialize response contained no {what}")]
    IncompleteInitResponse { what: &'static str },

    /// Discovery or waiting on a pod failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Opening or running a tunnel failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// A Vault API call failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Persisting credentials failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Forwarding the root token failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Unsealing one of the replicas failed.
    #[error(transparent)]
    Unseal(#[from] UnsealError),
}

impl BootstrapError {
    /// Key material from an initialization whose record could not be saved.
    #[must_use]
    pub fn unsaved_credentials(&self) -> Option<&BootstrapCredentials> {
        match self {
            Self::CredentialsNotSaved { credentials, .. } => Some(&**credentials),
            _ => None,
        }
    }
}

/// Errors from the unseal coordinator.
#[derive(Debug, thiserror::Error)]
pub enum UnsealError {
    /// Fewer keys than the threshold are available.
    #[error("need {threshold} unseal keys but only {available} are available")]
    InsufficientKeys { threshold: usize, available: usize },

    /// The threshold was reached and the pod is still sealed.
    #[error("pod {pod} still sealed after submitting {submitted} keys")]
    StillSealed { pod: String, submitted: usize },

    /// Waiting for the pod failed.
    #[error("pod {pod}: {source}")]
    Discovery {
        pod: String,
        #[source]
        source: DiscoveryError,
    },

    /// The tunnel to the pod failed.
    #[error("pod {pod}: {source}")]
    Tunnel {
        pod: String,
        #[source]
        source: TunnelError,
    },

    /// A Vault call against the pod failed.
    #[error("pod {pod}: {source}")]
    Vault {
        pod: String,
        #[source]
        source: VaultError,
    },
}

/// Errors from the reconciliation engine.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Listing the existing entities failed.
    #[error("could not list {kind}: {source}")]
    List {
        kind: &'static str,
        #[source]
        source: VaultError,
    },

    /// Writing the desired entity failed.
    #[error("could not write {kind} '{name}': {source}")]
    Write {
        kind: &'static str,
        name: String,
        #[source]
        source: VaultError,
    },

    /// Generating a password for a secret field failed.
    #[error("could not generate password from policy '{policy}' for '{name}': {source}")]
    Generate {
        policy: String,
        name: String,
        #[source]
        source: VaultError,
    },

    /// A role referenced a policy that was not reconciled before it.
    #[error("role '{role}' references policy '{policy}' which is not ordered before it")]
    PolicyOrdering { role: String, policy: String },
}

/// Errors from a whole pipeline command.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The requested application has no preparation plan.
    #[error("unknown application '{name}', known applications: {known}")]
    UnknownApplication { name: String, known: String },

    /// No token was given and none is cached.
    #[error(
        "token option is unset and credentials for environment '{environment}' could not be \
         read ({source})"
    )]
    MissingCredentials {
        environment: String,
        #[source]
        source: CredentialError,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl PipelineError {
    /// See [`BootstrapError::unsaved_credentials`].
    #[must_use]
    pub fn unsaved_credentials(&self) -> Option<&BootstrapCredentials> {
        match self {
            Self::Bootstrap(e) => e.unsaved_credentials(),
            _ => None,
        }
    }
}
