//! Root-token sinks.
//!
//! After a fresh initialization the root token can be forwarded into an
//! operator-supplied secret-values file (e.g. the encrypted values file a
//! deployment pipeline consumes). Unseal keys are never forwarded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::info;
use zeroize::Zeroize;

use crate::credentials::write_atomic;
use crate::error::SinkError;

/// Destination for the root token.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn store_token(&self, token: &str) -> Result<(), SinkError>;
}

/// Merges `vault.token` into a YAML secret-values file, keeping every other key.
#[derive(Debug, Clone)]
pub struct YamlSecretFileSink {
    path: PathBuf,
}

impl YamlSecretFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn format_error(&self, reason: impl ToString) -> SinkError {
        SinkError::Format {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl TokenSink for YamlSecretFileSink {
    async fn store_token(&self, token: &str) -> Result<(), SinkError> {
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(SinkError::Io {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let mut root = if existing.trim().is_empty() {
            Mapping::new()
        } else {
            match serde_yaml::from_str::<Value>(&existing).map_err(|e| self.format_error(e))? {
                Value::Mapping(m) => m,
                Value::Null => Mapping::new(),
                _ => return Err(self.format_error("top-level value is not a mapping")),
            }
        };

        let vault_key = Value::from("vault");
        let mut vault = match root.remove(&vault_key) {
            Some(Value::Mapping(m)) => m,
            None | Some(Value::Null) => Mapping::new(),
            Some(_) => return Err(self.format_error("'vault' is not a mapping")),
        };
        vault.insert(Value::from("token"), Value::from(token));
        root.insert(vault_key, Value::Mapping(vault));

        let mut rendered = serde_yaml::to_string(&root).map_err(|e| self.format_error(e))?;
        let result = write_atomic(&self.path, rendered.as_bytes()).await;
        rendered.zeroize();
        result.map_err(|reason| SinkError::Io {
            path: self.path.clone(),
            reason,
        })?;

        info!(path = %self.path.display(), "root token written to secret file");
        Ok(())
    }
}
