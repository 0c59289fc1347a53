//! Kubernetes API seam.
//!
//! [`ClusterApi`] is the narrow slice of the orchestrator API the toolkit
//! consumes. [`KubeCluster`] implements it on top of a `kube::Client`; tests
//! use the in-memory fake from the `testing` module.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use crate::error::ClusterError;

/// Lifecycle phase of a pod, as reported in `status.phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the API server.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a discovered pod. Re-fetched every run, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// First declared port of the first container.
    pub container_port: Option<u16>,
    /// Name of the first container.
    pub container_name: Option<String>,
    /// Names of config maps mounted as volumes.
    pub config_maps: Vec<String>,
}

impl PodRef {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&Pod> for PodRef {
    fn from(pod: &Pod) -> Self {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let phase = PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));

        let first_container = pod.spec.as_ref().and_then(|s| s.containers.first());
        let container_port = first_container
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
            .and_then(|p| u16::try_from(p.container_port).ok());
        let container_name = first_container.map(|c| c.name.clone());

        let config_maps = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .filter_map(|v| v.config_map.as_ref().map(|cm| cm.name.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name,
            namespace,
            phase,
            container_port,
            container_name,
            config_maps,
        }
    }
}

/// Orchestrator operations the toolkit depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods matching `selector`, cluster-wide when `namespace` is `None`.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<PodRef>, ClusterError>;

    /// Fetch a single pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodRef, ClusterError>;

    /// All data values of a config map, or an empty list when it does not exist.
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ClusterError>;

    /// In-cluster API server URL, taken from the `default/kubernetes` service.
    async fn api_server_endpoint(&self) -> Result<String, ClusterError>;
}

/// [`ClusterApi`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Request` if no usable configuration is found.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| request_error("load kubeconfig", &e))?;
        Ok(Self::new(client))
    }

    /// The underlying client, shared with the tunnel dialers.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn request_error(operation: &str, err: &kube::Error) -> ClusterError {
    ClusterError::Request {
        operation: operation.to_owned(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<PodRef>, ClusterError> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| request_error("list pods", &e))?;

        debug!(selector, count = list.items.len(), "listed pods");
        Ok(list.items.iter().map(PodRef::from).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodRef, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Ok(PodRef::from(&pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(ClusterError::NotFound {
                kind: "pod",
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            }),
            Err(e) => Err(request_error("get pod", &e)),
        }
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(cm.data.map(|d| d.into_values().collect()).unwrap_or_default()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, config_map = %name, "config map not found");
                Ok(Vec::new())
            }
            Err(e) => Err(request_error("get config map", &e)),
        }
    }

    async fn api_server_endpoint(&self) -> Result<String, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), "default");
        let svc = match api.get("kubernetes").await {
            Ok(s) => s,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(ClusterError::NotFound {
                    kind: "service",
                    namespace: "default".to_owned(),
                    name: "kubernetes".to_owned(),
                });
            }
            Err(e) => return Err(request_error("get service", &e)),
        };

        let missing = |field| ClusterError::MissingField {
            kind: "service",
            namespace: "default".to_owned(),
            name: "kubernetes".to_owned(),
            field,
        };
        let spec = svc.spec.ok_or_else(|| missing("spec"))?;
        let ip = spec.cluster_ip.ok_or_else(|| missing("spec.clusterIP"))?;
        let port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.port)
            .ok_or_else(|| missing("spec.ports"))?;

        Ok(format!("https://{ip}:{port}"))
    }
}
