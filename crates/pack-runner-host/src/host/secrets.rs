use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Environment;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret backend `{0}` is not allowed when PACK_RUNNER_ENV=prod")]
    NotAllowedInProd(&'static str),
    #[error("failed to load secrets from {path}: {message}")]
    File { path: PathBuf, message: String },
    #[error("secret backend failure: {0}")]
    Backend(String),
}

/// Read-only key/value source consulted once when an instance starts.
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError>;
}

/// Stands in for a secret value in text that leaves the instance.
pub const REDACTED: &str = "<redacted>";

/// Values resolved for one instance. `Debug` prints names only.
#[derive(Clone, Default)]
pub struct ResolvedSecrets {
    values: BTreeMap<String, String>,
}

impl ResolvedSecrets {
    /// Resolve every name; `Err` carries the names the store could not supply.
    pub fn resolve(
        store: &dyn SecretStore,
        names: &[String],
    ) -> Result<Result<Self, Vec<String>>, SecretError> {
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();
        for name in names {
            match store.get(name)? {
                Some(value) => {
                    values.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(Ok(Self { values }))
        } else {
            Ok(Err(missing))
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Name of the first secret whose value appears in `text`.
    pub fn exposed_in(&self, text: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, value)| !value.is_empty() && text.contains(value.as_str()))
            .map(|(name, _)| name.as_str())
    }

    /// `text` with every secret value replaced by [`REDACTED`].
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<&str> = self
            .values
            .values()
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .collect();
        // Longest first so a secret containing another is replaced whole.
        values.sort_by_key(|value| std::cmp::Reverse(value.len()));
        values
            .into_iter()
            .fold(text.to_string(), |acc, value| acc.replace(value, REDACTED))
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                .collect(),
        )
    }
}

impl fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.values.keys().map(|name| format!("{name}=<redacted>")))
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: RwLock::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(name.into(), value.into());
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(self.values.read().get(name).cloned())
    }
}

/// Process environment lookup. Only available outside prod.
#[derive(Debug, Default)]
pub struct EnvSecretStore {
    _private: (),
}

impl EnvSecretStore {
    pub fn new(environment: Environment) -> Result<Self, SecretError> {
        if environment.is_prod() {
            return Err(SecretError::NotAllowedInProd("env"));
        }
        Ok(Self { _private: () })
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(std::env::var(name).ok())
    }
}

/// JSON object of string values, read once when opened.
#[derive(Debug)]
pub struct FileSecretStore {
    values: BTreeMap<String, String>,
}

impl FileSecretStore {
    pub fn open(path: &Path) -> Result<Self, SecretError> {
        let file_error = |message: String| SecretError::File {
            path: path.to_path_buf(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|err| file_error(err.to_string()))?;
        let values: BTreeMap<String, String> =
            serde_json::from_str(&raw).map_err(|err| file_error(err.to_string()))?;
        Ok(Self { values })
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(self.values.get(name).cloned())
    }
}

/// First store that knows a name wins.
pub struct ChainSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl ChainSecretStore {
    pub fn new(stores: Vec<Arc<dyn SecretStore>>) -> Self {
        Self { stores }
    }
}

impl SecretStore for ChainSecretStore {
    fn get(&self, name: &str) -> Result<Option<String>, SecretError> {
        for store in &self.stores {
            if let Some(value) = store.get(name)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SecretsBackend {
    #[default]
    Memory,
    Env,
    File { path: PathBuf },
}

impl SecretsBackend {
    /// Build the backend for the environment named by `PACK_RUNNER_ENV`.
    pub fn build_store(&self) -> Result<Arc<dyn SecretStore>, SecretError> {
        self.build_store_for(Environment::from_env())
    }

    pub fn build_store_for(
        &self,
        environment: Environment,
    ) -> Result<Arc<dyn SecretStore>, SecretError> {
        Ok(match self {
            SecretsBackend::Memory => Arc::new(MemorySecretStore::new()),
            SecretsBackend::Env => Arc::new(EnvSecretStore::new(environment)?),
            SecretsBackend::File { path } => Arc::new(FileSecretStore::open(path)?),
        })
    }
}

impl fmt::Display for SecretsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretsBackend::Memory => f.write_str("memory"),
            SecretsBackend::Env => f.write_str("env"),
            SecretsBackend::File { path } => write!(f, "file:{}", path.display()),
        }
    }
}

/// Names declared twice are resolved once.
pub(crate) fn unique_names(names: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_reports_every_missing_name() {
        let store = MemorySecretStore::with_values([("API_TOKEN", "t0k3n")]);
        let names = vec!["API_TOKEN".to_string(), "DB_URL".into(), "REGION".into()];
        let missing = ResolvedSecrets::resolve(&store, &names).unwrap().unwrap_err();
        assert_eq!(missing, vec!["DB_URL".to_string(), "REGION".into()]);
    }

    #[test]
    fn redaction_replaces_values_and_finds_exposures() {
        let store = MemorySecretStore::with_values([("A", "s3cr3t"), ("B", "s3cr3t-long"), ("E", "")]);
        let names = vec!["A".to_string(), "B".into(), "E".into()];
        let secrets = ResolvedSecrets::resolve(&store, &names).unwrap().unwrap();

        assert_eq!(
            secrets.redact("url?a=s3cr3t&b=s3cr3t-long"),
            "url?a=<redacted>&b=<redacted>"
        );
        assert_eq!(secrets.exposed_in("value=s3cr3t"), Some("A"));
        assert_eq!(secrets.exposed_in("nothing here"), None);
    }

    #[test]
    fn debug_output_redacts_values() {
        let store = MemorySecretStore::with_values([("API_TOKEN", "super-secret")]);
        let resolved = ResolvedSecrets::resolve(&store, &["API_TOKEN".to_string()])
            .unwrap()
            .unwrap();
        let rendered = format!("{resolved:?}");
        assert!(rendered.contains("API_TOKEN"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn chain_prefers_earlier_stores() {
        let first: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::with_values([("A", "1")]));
        let second: Arc<dyn SecretStore> =
            Arc::new(MemorySecretStore::with_values([("A", "2"), ("B", "3")]));
        let chain = ChainSecretStore::new(vec![first, second]);
        assert_eq!(chain.get("A").unwrap().as_deref(), Some("1"));
        assert_eq!(chain.get("B").unwrap().as_deref(), Some("3"));
        assert_eq!(chain.get("C").unwrap(), None);
    }

    #[test]
    fn file_store_reads_json_map() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("secrets.json");
        std::fs::write(&path, r#"{"API_TOKEN": "abc"}"#).unwrap();
        let store = SecretsBackend::File { path: path.clone() }
            .build_store_for(Environment::Prod)
            .unwrap();
        assert_eq!(store.get("API_TOKEN").unwrap().as_deref(), Some("abc"));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileSecretStore::open(&path),
            Err(SecretError::File { .. })
        ));
    }

    #[test]
    fn env_store_is_rejected_for_prod() {
        assert!(matches!(
            EnvSecretStore::new(Environment::Prod),
            Err(SecretError::NotAllowedInProd("env"))
        ));
        assert!(EnvSecretStore::new(Environment::Local).is_ok());
    }
}
