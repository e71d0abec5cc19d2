//! Layered configuration for the Groq chat client.
//!
//! Values are resolved once at startup from, in order: the nearest `.env`,
//! a fallback `venv/.env`, a platform secret store, the process environment
//! and finally built-in defaults. See [`Resolver`] for the layering rules.

use anyhow::Context;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub mod dotenv;
pub mod error;
pub mod layer;
pub mod resolver;
pub mod secrets;

pub use dotenv::{DotenvFile, NearestDotenv};
pub use error::LayerError;
pub use layer::{Condition, Contribution, Layer, Merge, Source};
pub use resolver::{process_env, Resolver, ResolverOptions, SecretsMode};
pub use secrets::{NoSecrets, SecretStore, SecretStoreSource, StaticSecrets, StreamlitSecrets};

pub const API_KEY_VAR: &str = "GROQ_API_KEY";
pub const MODEL_NAME_VAR: &str = "MODEL_NAME";
pub const SENTRY_DSN_VAR: &str = "SENTRY_DSN";

pub const DEFAULT_MODEL_NAME: &str = "llama-3.1-8b-instant";
pub const DOTENV_FILENAME: &str = ".env";
pub const DEFAULT_VENV_DIR: &str = "venv";

/// Working key/value table used while layering sources.
pub type Vars = BTreeMap<String, String>;

/// Where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Dotenv { path: PathBuf },
    VenvDotenv { path: PathBuf },
    SecretStore { store: &'static str },
    ProcessEnv,
    Default,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Dotenv { path } => write!(f, "dotenv file {}", path.display()),
            Origin::VenvDotenv { path } => write!(f, "venv dotenv file {}", path.display()),
            Origin::SecretStore { store } => write!(f, "secret store ({store})"),
            Origin::ProcessEnv => f.write_str("process environment"),
            Origin::Default => f.write_str("built-in default"),
        }
    }
}

/// A variable counts as unset when it is missing or empty.
pub(crate) fn non_empty<'a>(vars: &'a Vars, key: &str) -> Option<&'a str> {
    vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

pub(crate) fn is_missing(vars: &Vars, key: &str) -> bool {
    non_empty(vars, key).is_none()
}

/// Resolved configuration. Built once and passed around by reference.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    api_key: Option<String>,
    api_key_origin: Option<Origin>,
    model_name: String,
    model_name_origin: Origin,
    sentry_dsn: Option<String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_origin", &self.api_key_origin)
            .field("model_name", &self.model_name)
            .field("model_name_origin", &self.model_name_origin)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Settings {
    pub(crate) fn from_resolved(vars: &Vars, origins: &BTreeMap<String, Origin>) -> Self {
        let origin_of = |key: &str| origins.get(key).cloned().unwrap_or(Origin::ProcessEnv);

        let api_key = non_empty(vars, API_KEY_VAR).map(str::to_string);
        let api_key_origin = api_key.as_ref().map(|_| origin_of(API_KEY_VAR));

        let (model_name, model_name_origin) = match non_empty(vars, MODEL_NAME_VAR) {
            Some(name) => (name.to_string(), origin_of(MODEL_NAME_VAR)),
            None => (DEFAULT_MODEL_NAME.to_string(), Origin::Default),
        };

        Self {
            api_key,
            api_key_origin,
            model_name,
            model_name_origin,
            sentry_dsn: non_empty(vars, SENTRY_DSN_VAR).map(str::to_string),
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().context("GROQ_API_KEY is required")
    }

    pub fn sentry_dsn(&self) -> Option<&str> {
        self.sentry_dsn.as_deref()
    }

    /// Provenance of `GROQ_API_KEY` or `MODEL_NAME`; `None` for any other key
    /// or for an api key that was never set.
    pub fn origin_of(&self, key: &str) -> Option<&Origin> {
        match key {
            API_KEY_VAR => self.api_key_origin.as_ref(),
            MODEL_NAME_VAR => Some(&self.model_name_origin),
            _ => None,
        }
    }

    /// Api key with everything but the last four characters masked.
    pub fn redacted_api_key(&self) -> Option<String> {
        let key = self.api_key.as_deref()?;
        let chars: Vec<char> = key.chars().collect();
        if chars.len() <= 8 {
            return Some("****".to_string());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        Some(format!("****{tail}"))
    }

    pub fn to_json(&self, include_secret: bool) -> serde_json::Value {
        let api_key = if include_secret {
            self.api_key.clone()
        } else {
            self.redacted_api_key()
        };

        serde_json::json!({
            "groq_api_key": api_key,
            "groq_api_key_origin": self.api_key_origin,
            "model_name": self.model_name,
            "model_name_origin": self.model_name_origin,
        })
    }

    /// Write the resolved values back into the process environment for code
    /// that reads `GROQ_API_KEY` / `MODEL_NAME` directly.
    ///
    /// Must run before other threads start reading the environment.
    pub fn export_to_process_env(&self) {
        if let Some(key) = self.api_key.as_deref() {
            std::env::set_var(API_KEY_VAR, key);
        }
        std::env::set_var(MODEL_NAME_VAR, &self.model_name);
    }
}

static SETTINGS: OnceCell<Settings> = OnceCell::new();

/// Resolve the process-wide settings with `options`, exporting them to the
/// process environment. Only the first call resolves; later calls return the
/// stored value and ignore their options.
pub fn init(options: ResolverOptions) -> &'static Settings {
    if let Some(settings) = SETTINGS.get() {
        tracing::debug!("settings already initialised; ignoring new resolver options");
        return settings;
    }

    SETTINGS.get_or_init(|| {
        let settings = Resolver::standard(&options).resolve();
        settings.export_to_process_env();
        settings
    })
}

/// Process-wide settings, resolved with default options on first access.
pub fn settings() -> &'static Settings {
    match SETTINGS.get() {
        Some(settings) => settings,
        None => init(ResolverOptions::default()),
    }
}
