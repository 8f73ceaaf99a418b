//! TLS client credentials keyed by charge point identity

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ocpp::messages::OcppError;

/// Environment variable holding the initial keystore as a JSON array
pub const KEYSTORE_ENV: &str = "SSL_CLIENT_KEYSTORE";

/// PEM key and certificate files for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub key: PathBuf,
    pub cert: PathBuf,
}

pub trait KeyStore: Send + Sync + 'static {
    fn lookup(&self, identity: &str) -> Option<KeyPair>;

    /// Persist a PEM key and certificate for `identity` and use them for the
    /// next `wss://` connect. `name_postfix` keeps successive pairs apart.
    fn save(
        &self,
        identity: &str,
        key_pem: &str,
        cert_pem: &str,
        name_postfix: &str,
    ) -> Result<KeyPair, OcppError> {
        let _ = (key_pem, cert_pem, name_postfix);
        Err(OcppError::Collaborator(format!(
            "keystore cannot store credentials for {}",
            identity
        )))
    }
}

#[derive(Deserialize)]
struct KeyStoreEntry {
    id: String,
    key: PathBuf,
    cert: PathBuf,
}

/// In-memory keystore; saved pairs are written below `dir`
#[derive(Debug)]
pub struct StaticKeyStore {
    entries: RwLock<HashMap<String, KeyPair>>,
    dir: PathBuf,
}

impl Default for StaticKeyStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dir: std::env::temp_dir(),
        }
    }
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that `save` writes into (the system temp dir by default)
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Parse `[{"id": "...", "key": "...", "cert": "..."}]`
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<KeyStoreEntry> = serde_json::from_str(json)?;
        let store = Self::new();
        for entry in entries {
            store.insert(
                entry.id,
                KeyPair {
                    key: entry.key,
                    cert: entry.cert,
                },
            );
        }
        Ok(store)
    }

    /// Load from `SSL_CLIENT_KEYSTORE`; empty when the variable is unset
    pub fn from_env() -> Result<Self, serde_json::Error> {
        match std::env::var(KEYSTORE_ENV) {
            Ok(json) if !json.trim().is_empty() => Self::from_json(&json),
            _ => Ok(Self::new()),
        }
    }

    /// Set or replace the pair for an identity
    pub fn insert(&self, identity: impl Into<String>, pair: KeyPair) {
        self.entries.write().insert(identity.into(), pair);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyStore for StaticKeyStore {
    fn lookup(&self, identity: &str) -> Option<KeyPair> {
        self.entries.read().get(identity).cloned()
    }

    fn save(
        &self,
        identity: &str,
        key_pem: &str,
        cert_pem: &str,
        name_postfix: &str,
    ) -> Result<KeyPair, OcppError> {
        let pair = KeyPair {
            key: self.dir.join(format!("{}{}.key", identity, name_postfix)),
            cert: self.dir.join(format!("{}{}.cert", identity, name_postfix)),
        };
        std::fs::write(&pair.key, key_pem)?;
        std::fs::write(&pair.cert, cert_pem)?;

        info!("[{}] Saved client credentials to {}", identity, pair.cert.display());
        self.insert(identity, pair.clone());
        Ok(pair)
    }
}
