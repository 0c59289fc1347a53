//! In-memory stand-ins for the cluster, transport and Vault seams.
#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cluster::{ClusterApi, PodPhase, PodRef};
use crate::error::{ClusterError, TunnelError, VaultError};
use crate::tunnel::{PodDialer, PodStream, Tunnel};
use crate::vault::{
    InitRequest, InitResponse, MountSpec, SealStatus, VaultApi, VaultConnector,
};

pub const API_SERVER: &str = "https://10.96.0.1:443";

/// A running Vault pod exposing 8200.
pub fn pod(name: &str, namespace: &str) -> PodRef {
    PodRef {
        name: name.to_owned(),
        namespace: namespace.to_owned(),
        phase: PodPhase::Running,
        container_port: Some(8200),
        container_name: Some("vault".to_owned()),
        config_maps: Vec::new(),
    }
}

// ── cluster ────────────────────────────────────────────────────────

struct FakePod {
    pod: PodRef,
    labels: Vec<String>,
    /// Phase to switch to once `remaining` more reads have happened.
    pending: Option<(PodPhase, usize)>,
}

#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<Vec<FakePod>>,
    config_maps: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl FakeCluster {
    pub fn add_pod(&self, pod: PodRef, labels: &[&str]) {
        self.pods.lock().unwrap().push(FakePod {
            pod,
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
            pending: None,
        });
    }

    /// Switch `name` to `phase` after `reads` calls to `get_pod`.
    pub fn set_phase_after(&self, name: &str, phase: PodPhase, reads: usize) {
        let mut pods = self.pods.lock().unwrap();
        if let Some(p) = pods.iter_mut().find(|p| p.pod.name == name) {
            p.pending = Some((phase, reads));
        }
    }

    pub fn add_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        self.config_maps.lock().unwrap().insert(
            (namespace.to_owned(), name.to_owned()),
            data.iter().map(|(_, v)| (*v).to_owned()).collect(),
        );
    }
}

fn matches_selector(labels: &[String], selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| labels.iter().any(|l| l == term))
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<PodRef>, ClusterError> {
        let pods = self.pods.lock().unwrap();
        Ok(pods
            .iter()
            .filter(|p| namespace.is_none_or(|ns| p.pod.namespace == ns))
            .filter(|p| matches_selector(&p.labels, selector))
            .map(|p| p.pod.clone())
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodRef, ClusterError> {
        let mut pods = self.pods.lock().unwrap();
        let found = pods
            .iter_mut()
            .find(|p| p.pod.namespace == namespace && p.pod.name == name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod",
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })?;

        if let Some((phase, remaining)) = found.pending.take() {
            if remaining == 0 {
                found.pod.phase = phase;
            } else {
                found.pending = Some((phase, remaining - 1));
            }
        }
        Ok(found.pod.clone())
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn api_server_endpoint(&self) -> Result<String, ClusterError> {
        Ok(API_SERVER.to_owned())
    }
}

// ── transport ──────────────────────────────────────────────────────

/// Dials in-memory streams that echo every byte back.
#[derive(Default)]
pub struct EchoDialer {
    dials: AtomicUsize,
}

impl EchoDialer {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodDialer for EchoDialer {
    async fn dial(&self, _pod: &PodRef, _port: u16) -> Result<PodStream, TunnelError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(PodStream::new(client))
    }
}

// ── vault ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Replica {
    sealed: bool,
    accepted: Vec<String>,
    submissions: Vec<String>,
}

#[derive(Default)]
struct VaultState {
    initialized: bool,
    keys: Vec<String>,
    threshold: usize,
    shares: usize,
    root_token: String,
    /// Replicas not listed in `replicas` report unsealed.
    auto_unsealed: bool,
    replicas: HashMap<String, Replica>,
    init_requests: Vec<InitRequest>,

    writes: usize,
    fail_writes: HashSet<String>,
    generated: usize,

    acl_policies: BTreeMap<String, String>,
    password_policies: BTreeMap<String, String>,
    auth_methods: BTreeMap<String, (MountSpec, Option<Value>)>,
    engines: BTreeMap<String, MountSpec>,
    roles: BTreeMap<(String, String), Value>,
    kv: BTreeMap<(String, String), Map<String, Value>>,
    transit_keys: BTreeMap<String, Vec<String>>,
}

impl VaultState {
    fn replica(&mut self, pod: &str) -> &mut Replica {
        let sealed = !self.auto_unsealed;
        self.replicas.entry(pod.to_owned()).or_insert_with(|| Replica {
            sealed,
            ..Replica::default()
        })
    }

    fn status(&mut self, pod: &str) -> SealStatus {
        if !self.initialized {
            return SealStatus {
                initialized: false,
                sealed: true,
                ..SealStatus::default()
            };
        }
        let (threshold, shares) = (self.threshold, self.shares);
        let replica = self.replica(pod);
        SealStatus {
            initialized: true,
            sealed: replica.sealed,
            threshold,
            shares,
            progress: replica.accepted.len(),
        }
    }
}

/// A Vault cluster with one shared storage backend and per-pod seal state.
pub struct FakeVault {
    state: Arc<Mutex<VaultState>>,
}

impl FakeVault {
    fn with_state(state: VaultState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Never initialized; `init` issues `key-N` shares and `hvs.fake-root`.
    pub fn uninitialized() -> Self {
        Self::with_state(VaultState {
            root_token: "hvs.fake-root".to_owned(),
            ..VaultState::default()
        })
    }

    /// Initialized elsewhere with `keys`; every replica starts sealed.
    pub fn initialized(keys: Vec<String>, threshold: usize, root_token: &str) -> Self {
        Self::with_state(VaultState {
            initialized: true,
            shares: keys.len(),
            keys,
            threshold,
            root_token: root_token.to_owned(),
            ..VaultState::default()
        })
    }

    /// Initialized and unsealed on every replica.
    pub fn ready(root_token: &str) -> Self {
        Self::with_state(VaultState {
            initialized: true,
            shares: 1,
            threshold: 1,
            root_token: root_token.to_owned(),
            auto_unsealed: true,
            ..VaultState::default()
        })
    }

    pub fn mark_unsealed(&self, pod: &str) {
        self.state.lock().unwrap().replica(pod).sealed = false;
    }

    /// Keys submitted to `pod`, in order, including rejected ones.
    pub fn submissions(&self, pod: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .replicas
            .get(pod)
            .map(|r| r.submissions.clone())
            .unwrap_or_default()
    }

    pub fn init_requests(&self) -> Vec<InitRequest> {
        self.state.lock().unwrap().init_requests.clone()
    }

    pub fn root_token(&self) -> String {
        self.state.lock().unwrap().root_token.clone()
    }

    /// A client talking to `pod`.
    pub fn client(&self, pod: &str, token: Option<&str>) -> FakeVaultClient {
        FakeVaultClient {
            state: Arc::clone(&self.state),
            pod: pod.to_owned(),
            token: token.map(ToOwned::to_owned),
        }
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Make writes to `path` fail with HTTP 500.
    pub fn fail_writes_to(&self, path: &str) {
        self.state.lock().unwrap().fail_writes.insert(path.to_owned());
    }

    pub fn auth_config(&self, path: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .auth_methods
            .get(path)
            .and_then(|(_, config)| config.clone())
    }

    pub fn has_auth_method(&self, path: &str) -> bool {
        self.state.lock().unwrap().auth_methods.contains_key(path)
    }

    pub fn role(&self, mount: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(&(mount.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn kv(&self, mount: &str, path: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .unwrap()
            .kv
            .get(&(mount.to_owned(), path.to_owned()))
            .cloned()
    }

    pub fn has_acl_policy(&self, name: &str) -> bool {
        self.state.lock().unwrap().acl_policies.contains_key(name)
    }
}

pub struct FakeVaultClient {
    state: Arc<Mutex<VaultState>>,
    pod: String,
    token: Option<String>,
}

fn api_error(status: u16, path: &str, message: &str) -> VaultError {
    VaultError::Api {
        status,
        path: path.to_owned(),
        message: message.to_owned(),
    }
}

impl FakeVaultClient {
    fn authorize(&self, state: &VaultState, path: &str) -> Result<(), VaultError> {
        match &self.token {
            None => Err(VaultError::MissingToken {
                path: path.to_owned(),
            }),
            Some(token) if *token == state.root_token => Ok(()),
            Some(_) => Err(api_error(403, path, "permission denied")),
        }
    }

    fn read<T>(&self, path: &str, f: impl FnOnce(&VaultState) -> T) -> Result<T, VaultError> {
        let state = self.state.lock().unwrap();
        self.authorize(&state, path)?;
        Ok(f(&state))
    }

    fn write(
        &self,
        path: &str,
        f: impl FnOnce(&mut VaultState) -> Result<(), VaultError>,
    ) -> Result<(), VaultError> {
        let mut state = self.state.lock().unwrap();
        self.authorize(&state, path)?;
        if state.fail_writes.contains(path) {
            return Err(api_error(500, path, "internal error"));
        }
        f(&mut state)?;
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl VaultApi for FakeVaultClient {
    async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        Ok(self.state.lock().unwrap().status(&self.pod))
    }

    async fn init(&self, request: &InitRequest) -> Result<InitResponse, VaultError> {
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            return Err(api_error(400, "sys/init", "Vault is already initialized"));
        }
        state.init_requests.push(*request);
        state.initialized = true;
        state.shares = usize::from(request.shares);
        state.threshold = usize::from(request.threshold);
        state.keys = (1..=state.shares).map(|i| format!("key-{i}")).collect();
        state.auto_unsealed = request.recovery;

        let encoded: Vec<String> = (1..=state.shares).map(|i| format!("b64-{i}")).collect();
        let mut response = InitResponse::default();
        if request.recovery {
            response.recovery_keys = state.keys.clone();
            response.recovery_keys_base64 = encoded;
        } else {
            response.keys = state.keys.clone();
            response.keys_base64 = encoded;
        }
        response.root_token = state.root_token.clone();
        Ok(response)
    }

    async fn unseal(&self, key: &str) -> Result<SealStatus, VaultError> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            return Err(api_error(400, "sys/unseal", "Vault is not initialized"));
        }
        let valid = state.keys.iter().any(|k| k == key);
        let threshold = state.threshold;
        let replica = state.replica(&self.pod);
        replica.submissions.push(key.to_owned());
        if replica.sealed && valid && !replica.accepted.iter().any(|k| k == key) {
            replica.accepted.push(key.to_owned());
            if replica.accepted.len() >= threshold {
                replica.sealed = false;
                replica.accepted.clear();
            }
        }
        Ok(state.status(&self.pod))
    }

    async fn list_acl_policies(&self) -> Result<Vec<String>, VaultError> {
        self.read("sys/policies/acl", |s| s.acl_policies.keys().cloned().collect())
    }

    async fn write_acl_policy(&self, name: &str, policy: &str) -> Result<(), VaultError> {
        self.write(&format!("sys/policies/acl/{name}"), |s| {
            s.acl_policies.insert(name.to_owned(), policy.to_owned());
            Ok(())
        })
    }

    async fn list_password_policies(&self) -> Result<Vec<String>, VaultError> {
        self.read("sys/policies/password", |s| {
            s.password_policies.keys().cloned().collect()
        })
    }

    async fn write_password_policy(&self, name: &str, policy: &str) -> Result<(), VaultError> {
        self.write(&format!("sys/policies/password/{name}"), |s| {
            s.password_policies.insert(name.to_owned(), policy.to_owned());
            Ok(())
        })
    }

    async fn generate_password(&self, policy: &str) -> Result<String, VaultError> {
        let path = format!("sys/policies/password/{policy}/generate");
        let mut state = self.state.lock().unwrap();
        self.authorize(&state, &path)?;
        state.generated += 1;
        Ok(format!("generated-{policy}-{}", state.generated))
    }

    async fn list_auth_methods(&self) -> Result<Vec<String>, VaultError> {
        self.read("sys/auth", |s| {
            std::iter::once("token".to_owned())
                .chain(s.auth_methods.keys().cloned())
                .collect()
        })
    }

    async fn enable_auth_method(&self, path: &str, spec: &MountSpec) -> Result<(), VaultError> {
        let full = format!("sys/auth/{path}");
        self.write(&full, |s| {
            if s.auth_methods.contains_key(path) {
                return Err(api_error(400, &full, "path is already in use"));
            }
            s.auth_methods.insert(path.to_owned(), (spec.clone(), None));
            Ok(())
        })
    }

    async fn configure_auth_method(&self, path: &str, config: &Value) -> Result<(), VaultError> {
        let full = format!("auth/{path}/config");
        self.write(&full, |s| match s.auth_methods.get_mut(path) {
            Some((_, current)) => {
                *current = Some(config.clone());
                Ok(())
            }
            None => Err(api_error(404, &full, "no handler for route")),
        })
    }

    async fn list_secrets_engines(&self) -> Result<Vec<String>, VaultError> {
        self.read("sys/mounts", |s| {
            ["cubbyhole", "identity", "sys"]
                .iter()
                .map(|m| (*m).to_owned())
                .chain(s.engines.keys().cloned())
                .collect()
        })
    }

    async fn enable_secrets_engine(
        &self,
        path: &str,
        spec: &MountSpec,
    ) -> Result<(), VaultError> {
        let full = format!("sys/mounts/{path}");
        self.write(&full, |s| {
            if s.engines.contains_key(path) {
                return Err(api_error(400, &full, "path is already in use"));
            }
            s.engines.insert(path.to_owned(), spec.clone());
            Ok(())
        })
    }

    async fn list_roles(&self, auth_mount: &str) -> Result<Vec<String>, VaultError> {
        self.read(&format!("auth/{auth_mount}/role"), |s| {
            s.roles
                .keys()
                .filter(|(mount, _)| mount == auth_mount)
                .map(|(_, name)| name.clone())
                .collect()
        })
    }

    async fn write_role(
        &self,
        auth_mount: &str,
        name: &str,
        role: &Value,
    ) -> Result<(), VaultError> {
        self.write(&format!("auth/{auth_mount}/role/{name}"), |s| {
            s.roles
                .insert((auth_mount.to_owned(), name.to_owned()), role.clone());
            Ok(())
        })
    }

    async fn read_kv(
        &self,
        mount: &str,
        path: &str,
    ) -> Result<Option<Map<String, Value>>, VaultError> {
        self.read(&format!("{mount}/data/{path}"), |s| {
            s.kv.get(&(mount.to_owned(), path.to_owned())).cloned()
        })
    }

    async fn write_kv(
        &self,
        mount: &str,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<(), VaultError> {
        self.write(&format!("{mount}/data/{path}"), |s| {
            s.kv.insert((mount.to_owned(), path.to_owned()), data.clone());
            Ok(())
        })
    }

    async fn list_transit_keys(&self, mount: &str) -> Result<Vec<String>, VaultError> {
        self.read(&format!("{mount}/keys"), |s| {
            s.transit_keys.get(mount).cloned().unwrap_or_default()
        })
    }

    async fn create_transit_key(&self, mount: &str, name: &str) -> Result<(), VaultError> {
        let full = format!("{mount}/keys/{name}");
        self.write(&full, |s| {
            if !s.engines.contains_key(mount) {
                return Err(api_error(404, &full, "no handler for route"));
            }
            s.transit_keys
                .entry(mount.to_owned())
                .or_default()
                .push(name.to_owned());
            Ok(())
        })
    }
}

/// Connects [`FakeVaultClient`]s by the tunnel's pod name.
pub struct FakeConnector {
    vault: Arc<FakeVault>,
}

impl FakeConnector {
    pub fn new(vault: Arc<FakeVault>) -> Self {
        Self { vault }
    }
}

impl VaultConnector for FakeConnector {
    fn connect(
        &self,
        tunnel: &Tunnel,
        token: Option<&str>,
    ) -> Result<Box<dyn VaultApi>, VaultError> {
        Ok(Box::new(self.vault.client(&tunnel.pod().name, token)))
    }
}
