//! Secret-store capability.
//!
//! A hosting platform may or may not provide managed secrets. Callers ask
//! through [`SecretStore::try_get`] and get `None` back when the store is
//! absent, so probing never fails.

use crate::config::layer::{Contribution, Source};
use crate::config::{Origin, Vars};
use anyhow::Context;
use std::path::{Path, PathBuf};

const STREAMLIT_DIR: &str = ".streamlit";
const STREAMLIT_SECRETS_FILE: &str = "secrets.toml";

pub trait SecretStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn try_get(&self, key: &str) -> Option<String>;
}

/// A runtime without any secret store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretStore for NoSecrets {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn try_get(&self, _key: &str) -> Option<String> {
        None
    }
}

/// In-memory secrets, for embedding applications and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    entries: Vars,
}

impl StaticSecrets {
    pub fn new<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SecretStore for StaticSecrets {
    fn name(&self) -> &'static str {
        "static"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn try_get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// Secrets from Streamlit `secrets.toml` files. Only top-level string values
/// are exposed; tables and other value types are ignored.
#[derive(Debug, Clone, Default)]
pub struct StreamlitSecrets {
    entries: Option<Vars>,
}

impl StreamlitSecrets {
    /// `~/.streamlit/secrets.toml` then `<project_root>/.streamlit/secrets.toml`;
    /// project entries win.
    pub fn discover(project_root: &Path) -> Self {
        let global = dirs::home_dir()
            .map(|home| home.join(STREAMLIT_DIR).join(STREAMLIT_SECRETS_FILE));
        let project = project_root.join(STREAMLIT_DIR).join(STREAMLIT_SECRETS_FILE);
        Self::from_files(global.into_iter().chain(std::iter::once(project)))
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::from_files(std::iter::once(path.into()))
    }

    /// Later files override earlier ones. The store is unavailable when no
    /// file could be read.
    pub fn from_files(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut entries: Option<Vars> = None;
        for path in paths {
            match read_secrets_toml(&path) {
                Ok(Some(vars)) => entries.get_or_insert_with(Vars::new).extend(vars),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "ignoring unreadable secrets file"
                    );
                }
            }
        }
        Self { entries }
    }
}

impl SecretStore for StreamlitSecrets {
    fn name(&self) -> &'static str {
        "streamlit"
    }

    fn is_available(&self) -> bool {
        self.entries.is_some()
    }

    fn try_get(&self, key: &str) -> Option<String> {
        self.entries.as_ref()?.get(key).cloned()
    }
}

fn read_secrets_toml(path: &Path) -> anyhow::Result<Option<Vars>> {
    if !path.is_file() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let table = text
        .parse::<toml::Table>()
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let vars = table
        .into_iter()
        .filter_map(|(key, value)| match value {
            toml::Value::String(s) => Some((key, s)),
            _ => None,
        })
        .collect();
    Ok(Some(vars))
}

/// Copies the named keys out of a secret store.
pub struct SecretStoreSource {
    store: Box<dyn SecretStore>,
    keys: Vec<String>,
}

impl SecretStoreSource {
    pub fn new(store: impl SecretStore + 'static, keys: &[&str]) -> Self {
        Self::boxed(Box::new(store), keys)
    }

    pub fn boxed(store: Box<dyn SecretStore>, keys: &[&str]) -> Self {
        Self {
            store,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Source for SecretStoreSource {
    fn name(&self) -> &'static str {
        "secret_store"
    }

    fn load(&self) -> anyhow::Result<Option<Contribution>> {
        if !self.store.is_available() {
            tracing::debug!(store = self.store.name(), "secret store unavailable");
            return Ok(None);
        }

        let vars: Vars = self
            .keys
            .iter()
            .filter_map(|key| self.store.try_get(key).map(|value| (key.clone(), value)))
            .collect();
        if vars.is_empty() {
            return Ok(None);
        }

        Ok(Some(Contribution {
            vars,
            origin: Origin::SecretStore {
                store: self.store.name(),
            },
        }))
    }
}
