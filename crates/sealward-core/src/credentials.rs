//! Durable per-environment credential cache.
//!
//! The bootstrap credentials are the only state this toolkit owns. They are
//! written once, right after Vault is initialized, and reloaded on every
//! later run. Records live at
//! `<cache-root>/<environment>/<kind>-credentials.json`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::environment::Environment;
use crate::error::CredentialError;

/// Deployment kind used when none is given.
pub const DEFAULT_KIND: &str = "vault";

/// Unseal keys and root token produced by `sys/init`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct BootstrapCredentials {
    /// Unseal (or recovery) keys, hex encoded, in generation order.
    pub keys: Vec<String>,
    /// The same keys, base64 encoded.
    #[serde(default)]
    pub keys_base64: Vec<String>,
    /// Initial root token.
    pub token: String,
    /// When the record was first written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub created: Option<DateTime<Utc>>,
}

impl BootstrapCredentials {
    #[must_use]
    pub fn new(keys: Vec<String>, keys_base64: Vec<String>, token: String) -> Self {
        Self {
            keys,
            keys_base64,
            token,
            created: None,
        }
    }
}

impl fmt::Debug for BootstrapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapCredentials")
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("token", &"[REDACTED]")
            .field("created", &self.created)
            .finish()
    }
}

/// Reads and writes [`BootstrapCredentials`] under a cache root.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
    kind: String,
}

impl CredentialStore {
    /// Store for the default `vault` deployment kind.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_kind(root, DEFAULT_KIND)
    }

    pub fn with_kind(root: impl Into<PathBuf>, kind: &str) -> Self {
        Self {
            root: root.into(),
            kind: kind.to_owned(),
        }
    }

    /// Record location for `environment`.
    #[must_use]
    pub fn path(&self, environment: Environment) -> PathBuf {
        self.root
            .join(environment.as_str())
            .join(format!("{}-credentials.json", self.kind))
    }

    /// Persist `credentials` for `environment`, stamping `created` when unset.
    ///
    /// The record is written to a temporary file next to the target and
    /// renamed into place, so readers never see a partial record.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Io` on any filesystem failure.
    pub async fn write(
        &self,
        environment: Environment,
        credentials: &BootstrapCredentials,
    ) -> Result<PathBuf, CredentialError> {
        let path = self.path(environment);
        let mut record = credentials.clone();
        if record.created.is_none() {
            record.created = Some(Utc::now());
        }

        let mut json = serde_json::to_vec_pretty(&record).map_err(|e| CredentialError::Io {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let result = write_atomic(&path, &json).await;
        json.zeroize();
        result.map_err(|reason| CredentialError::Io {
            path: path.clone(),
            reason,
        })?;

        info!(environment = %environment, path = %path.display(), "credentials written");
        Ok(path)
    }

    /// Load the record for `environment`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no record exists, `Corrupt` when it cannot be
    /// decoded, `Io` on other read failures.
    pub async fn read(
        &self,
        environment: Environment,
    ) -> Result<BootstrapCredentials, CredentialError> {
        let path = self.path(environment);
        let mut content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound { path });
            }
            Err(e) => {
                return Err(CredentialError::Io {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let parsed = serde_json::from_slice::<BootstrapCredentials>(&content);
        content.zeroize();
        let credentials = parsed.map_err(|e| CredentialError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if credentials.keys.is_empty() || credentials.token.is_empty() {
            return Err(CredentialError::Corrupt {
                path,
                reason: "record has no keys or no token".to_owned(),
            });
        }

        debug!(environment = %environment, path = %path.display(), "credentials loaded");
        Ok(credentials)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename. The file is
/// created owner-only on Unix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let dir = path
        .parent()
        .ok_or_else(|| "path has no parent directory".to_owned())?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let written = async {
        let mut file = options.open(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(format!("failed to write {}: {e}", path.display()));
    }
    Ok(())
}
