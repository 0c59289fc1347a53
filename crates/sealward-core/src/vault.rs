//! Vault HTTP API seam.
//!
//! [`VaultApi`] lists every call the toolkit makes against Vault.
//! [`HttpVaultClient`] implements it with `reqwest`; [`HttpVaultConnector`]
//! binds a client to an open tunnel. Listing calls go through
//! `list_or_empty`, which treats HTTP 404 as an empty result. No other
//! not-found response is swallowed.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{ToolkitConfig, VaultScheme};
use crate::error::VaultError;
use crate::tunnel::Tunnel;

/// Seal state as reported by `sys/seal-status`. Always read fresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SealStatus {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub sealed: bool,
    /// Number of key shares required to unseal.
    #[serde(default, rename = "t")]
    pub threshold: usize,
    /// Total number of key shares.
    #[serde(default, rename = "n")]
    pub shares: usize,
    /// Shares submitted towards the current unseal attempt.
    #[serde(default)]
    pub progress: usize,
}

/// Parameters for `sys/init`.
///
/// Plain shares and recovery shares are mutually exclusive: Shamir sealing
/// only accepts the former, auto-unseal/HA only the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRequest {
    pub shares: u8,
    pub threshold: u8,
    pub recovery: bool,
}

impl InitRequest {
    /// JSON body sent to `sys/init`.
    #[must_use]
    pub fn body(&self) -> Value {
        if self.recovery {
            json!({
                "recovery_shares": self.shares,
                "recovery_threshold": self.threshold,
            })
        } else {
            json!({
                "secret_shares": self.shares,
                "secret_threshold": self.threshold,
            })
        }
    }
}

/// Key material returned by `sys/init`.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    #[serde(default)]
    pub recovery_keys: Vec<String>,
    #[serde(default)]
    pub recovery_keys_base64: Vec<String>,
    #[serde(default)]
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &self.keys.len())
            .field("recovery_keys", &self.recovery_keys.len())
            .field("root_token", &"[REDACTED]")
            .finish()
    }
}

/// An auth method or secrets engine to enable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl MountSpec {
    #[must_use]
    pub fn new(kind: &str, description: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            description: description.to_owned(),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Operations against a single Vault server.
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn seal_status(&self) -> Result<SealStatus, VaultError>;
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, VaultError>;
    async fn unseal(&self, key: &str) -> Result<SealStatus, VaultError>;

    async fn list_acl_policies(&self) -> Result<Vec<String>, VaultError>;
    async fn write_acl_policy(&self, name: &str, policy: &str) -> Result<(), VaultError>;

    async fn list_password_policies(&self) -> Result<Vec<String>, VaultError>;
    async fn write_password_policy(&self, name: &str, policy: &str) -> Result<(), VaultError>;
    async fn generate_password(&self, policy: &str) -> Result<String, VaultError>;

    /// Enabled auth method paths, without the trailing slash.
    async fn list_auth_methods(&self) -> Result<Vec<String>, VaultError>;
    async fn enable_auth_method(&self, path: &str, spec: &MountSpec) -> Result<(), VaultError>;
    async fn configure_auth_method(&self, path: &str, config: &Value) -> Result<(), VaultError>;

    /// Enabled secrets engine paths, without the trailing slash.
    async fn list_secrets_engines(&self) -> Result<Vec<String>, VaultError>;
    async fn enable_secrets_engine(&self, path: &str, spec: &MountSpec)
    -> Result<(), VaultError>;

    async fn list_roles(&self, auth_mount: &str) -> Result<Vec<String>, VaultError>;
    async fn write_role(&self, auth_mount: &str, name: &str, role: &Value)
    -> Result<(), VaultError>;

    /// Current data of a KV v2 secret, `None` when it does not exist.
    async fn read_kv(
        &self,
        mount: &str,
        path: &str,
    ) -> Result<Option<Map<String, Value>>, VaultError>;
    async fn write_kv(
        &self,
        mount: &str,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<(), VaultError>;

    async fn list_transit_keys(&self, mount: &str) -> Result<Vec<String>, VaultError>;
    async fn create_transit_key(&self, mount: &str, name: &str) -> Result<(), VaultError>;
}

/// Builds a [`VaultApi`] bound to an open tunnel.
pub trait VaultConnector: Send + Sync {
    /// # Errors
    ///
    /// Returns `VaultError::Config` if the client cannot be built.
    fn connect(&self, tunnel: &Tunnel, token: Option<&str>)
    -> Result<Box<dyn VaultApi>, VaultError>;
}

/// Connects [`HttpVaultClient`]s to tunnels.
#[derive(Debug, Clone)]
pub struct HttpVaultConnector {
    scheme: VaultScheme,
    timeout: Duration,
}

impl HttpVaultConnector {
    #[must_use]
    pub fn new(config: &ToolkitConfig) -> Self {
        Self {
            scheme: config.vault_scheme,
            timeout: config.request_timeout,
        }
    }
}

impl VaultConnector for HttpVaultConnector {
    fn connect(
        &self,
        tunnel: &Tunnel,
        token: Option<&str>,
    ) -> Result<Box<dyn VaultApi>, VaultError> {
        let base_url = format!("{}://{}", self.scheme.as_str(), tunnel.local_addr());
        let client = HttpVaultClient::new(
            &base_url,
            token.map(ToOwned::to_owned),
            self.timeout,
            self.scheme == VaultScheme::Https,
        )?;
        Ok(Box::new(client))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KeyList {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct GeneratedPassword {
    password: String,
}

/// `reqwest`-backed Vault client.
pub struct HttpVaultClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpVaultClient {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:8200`).
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, VaultError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sealward/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        authenticated: bool,
    ) -> Result<Value, VaultError> {
        let url = format!("{}/v1/{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);

        if authenticated {
            let token = self.token.as_deref().ok_or_else(|| VaultError::MissingToken {
                path: path.to_owned(),
            })?;
            req = req.header("X-Vault-Token", token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|source| VaultError::Network {
            path: path.to_owned(),
            source,
        })?;
        let status = resp.status();
        debug!(%method, path, status = status.as_u16(), "vault request");

        let text = resp.text().await.map_err(|source| VaultError::Network {
            path: path.to_owned(),
            source,
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .filter(|b| !b.errors.is_empty())
                .map_or_else(|| format!("HTTP {}", status.as_u16()), |b| b.errors.join("; "));
            return Err(VaultError::Api {
                status: status.as_u16(),
                path: path.to_owned(),
                message,
            });
        }

        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| VaultError::Decode {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        authenticated: bool,
    ) -> Result<T, VaultError> {
        let value = self.request(Method::GET, path, None, authenticated).await?;
        decode(path, value)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(), VaultError> {
        self.request(Method::POST, path, Some(body), true).await?;
        Ok(())
    }

    /// `LIST` a collection; 404 means the collection is empty.
    async fn list_or_empty(&self, path: &str) -> Result<Vec<String>, VaultError> {
        let list_path = format!("{path}?list=true");
        match self.get::<DataEnvelope<KeyList>>(&list_path, true).await {
            Ok(envelope) => Ok(envelope.data.keys),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Mount paths from `sys/auth` or `sys/mounts`.
    async fn mount_paths(&self, path: &str) -> Result<Vec<String>, VaultError> {
        let envelope: DataEnvelope<Map<String, Value>> = self.get(path, true).await?;
        Ok(envelope
            .data
            .keys()
            .map(|k| k.trim_end_matches('/').to_owned())
            .collect())
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, value: Value) -> Result<T, VaultError> {
    serde_json::from_value(value).map_err(|e| VaultError::Decode {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl VaultApi for HttpVaultClient {
    async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        self.get("sys/seal-status", false).await
    }

    async fn init(&self, request: &InitRequest) -> Result<InitResponse, VaultError> {
        let value = self
            .request(Method::PUT, "sys/init", Some(&request.body()), false)
            .await?;
        decode("sys/init", value)
    }

    async fn unseal(&self, key: &str) -> Result<SealStatus, VaultError> {
        let value = self
            .request(Method::PUT, "sys/unseal", Some(&json!({ "key": key })), false)
            .await?;
        decode("sys/unseal", value)
    }

    async fn list_acl_policies(&self) -> Result<Vec<String>, VaultError> {
        self.list_or_empty("sys/policies/acl").await
    }

    async fn write_acl_policy(&self, name: &str, policy: &str) -> Result<(), VaultError> {
        self.post(
            &format!("sys/policies/acl/{name}"),
            &json!({ "policy": policy }),
        )
        .await
    }

    async fn list_password_policies(&self) -> Result<Vec<String>, VaultError> {
        self.list_or_empty("sys/policies/password").await
    }

    async fn write_password_policy(&self, name: &str, policy: &str) -> Result<(), VaultError> {
        self.post(
            &format!("sys/policies/password/{name}"),
            &json!({ "policy": policy }),
        )
        .await
    }

    async fn generate_password(&self, policy: &str) -> Result<String, VaultError> {
        let envelope: DataEnvelope<GeneratedPassword> = self
            .get(&format!("sys/policies/password/{policy}/generate"), true)
            .await?;
        Ok(envelope.data.password)
    }

    async fn list_auth_methods(&self) -> Result<Vec<String>, VaultError> {
        self.mount_paths("sys/auth").await
    }

    async fn enable_auth_method(&self, path: &str, spec: &MountSpec) -> Result<(), VaultError> {
        let body = serde_json::to_value(spec).map_err(|e| VaultError::Decode {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        self.post(&format!("sys/auth/{path}"), &body).await
    }

    async fn configure_auth_method(&self, path: &str, config: &Value) -> Result<(), VaultError> {
        self.post(&format!("auth/{path}/config"), config).await
    }

    async fn list_secrets_engines(&self) -> Result<Vec<String>, VaultError> {
        self.mount_paths("sys/mounts").await
    }

    async fn enable_secrets_engine(
        &self,
        path: &str,
        spec: &MountSpec,
    ) -> Result<(), VaultError> {
        let body = serde_json::to_value(spec).map_err(|e| VaultError::Decode {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        self.post(&format!("sys/mounts/{path}"), &body).await
    }

    async fn list_roles(&self, auth_mount: &str) -> Result<Vec<String>, VaultError> {
        self.list_or_empty(&format!("auth/{auth_mount}/role")).await
    }

    async fn write_role(
        &self,
        auth_mount: &str,
        name: &str,
        role: &Value,
    ) -> Result<(), VaultError> {
        self.post(&format!("auth/{auth_mount}/role/{name}"), role)
            .await
    }

    async fn read_kv(
        &self,
        mount: &str,
        path: &str,
    ) -> Result<Option<Map<String, Value>>, VaultError> {
        #[derive(Deserialize)]
        struct KvData {
            #[serde(default)]
            data: Option<Map<String, Value>>,
        }

        let full = format!("{mount}/data/{path}");
        match self.get::<DataEnvelope<KvData>>(&full, true).await {
            Ok(envelope) => Ok(envelope.data.data),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_kv(
        &self,
        mount: &str,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<(), VaultError> {
        self.post(&format!("{mount}/data/{path}"), &json!({ "data": data }))
            .await
    }

    async fn list_transit_keys(&self, mount: &str) -> Result<Vec<String>, VaultError> {
        self.list_or_empty(&format!("{mount}/keys")).await
    }

    async fn create_transit_key(&self, mount: &str, name: &str) -> Result<(), VaultError> {
        self.post(&format!("{mount}/keys/{name}"), &json!({})).await
    }
}
