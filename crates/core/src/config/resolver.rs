use crate::config::dotenv::{find_upward, DotenvFile, NearestDotenv};
use crate::config::layer::{Layer, Merge};
use crate::config::secrets::{SecretStore, SecretStoreSource, StreamlitSecrets};
use crate::config::{Origin, Settings, Vars, API_KEY_VAR, DEFAULT_VENV_DIR, DOTENV_FILENAME};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which secret store the standard layering consults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecretsMode {
    /// Streamlit `secrets.toml` under the home and project directories.
    #[default]
    Streamlit,
    /// A single `secrets.toml`-style file.
    File(PathBuf),
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Where the `.env` search starts. `None` skips the search.
    pub start_dir: Option<PathBuf>,
    /// The upward search stops after this directory.
    pub search_ceiling: Option<PathBuf>,
    /// Parent of the virtual-environment directory. When unset, the directory
    /// holding the nearest `.env`; failing that, the nearest ancestor of
    /// `start_dir` containing `<venv_dir>/.env`; failing that, `start_dir`.
    pub project_root: Option<PathBuf>,
    pub venv_dir: String,
    pub secrets: SecretsMode,
    /// Base environment. `None` snapshots the process environment.
    pub env: Option<Vars>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            start_dir: std::env::current_dir().ok(),
            search_ceiling: None,
            project_root: None,
            venv_dir: DEFAULT_VENV_DIR.to_string(),
            secrets: SecretsMode::default(),
            env: None,
        }
    }
}

impl ResolverOptions {
    fn project_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.project_root {
            return Some(root.clone());
        }

        let start = self.start_dir.as_deref()?;
        let ceiling = self.search_ceiling.as_deref();
        if let Some(dotenv) = find_upward(start, DOTENV_FILENAME, ceiling) {
            return dotenv.parent().map(Path::to_path_buf);
        }

        let venv_dotenv = Path::new(&self.venv_dir).join(DOTENV_FILENAME);
        find_upward(start, &venv_dotenv, ceiling)
            .and_then(|found| found.parent()?.parent().map(Path::to_path_buf))
            .or_else(|| Some(start.to_path_buf()))
    }
}

/// Snapshot of the process environment. Entries that are not valid unicode
/// are dropped.
pub fn process_env() -> Vars {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Folds layers over a base environment, left to right. A layer that fails is
/// logged and skipped; resolution itself never fails.
#[derive(Debug)]
pub struct Resolver {
    base: Vars,
    layers: Vec<Layer>,
}

impl Resolver {
    pub fn new(base: Vars) -> Self {
        Self {
            base,
            layers: Vec::new(),
        }
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Nearest `.env` (override), then `<project_root>/<venv_dir>/.env` while
    /// `GROQ_API_KEY` is missing (override), then the secret store while it is
    /// still missing (fill-missing).
    pub fn standard(options: &ResolverOptions) -> Self {
        let base = options.env.clone().unwrap_or_else(process_env);
        let mut resolver = Self::new(base);

        if let Some(start_dir) = &options.start_dir {
            let mut nearest = NearestDotenv::new(start_dir);
            if let Some(ceiling) = &options.search_ceiling {
                nearest = nearest.with_ceiling(ceiling);
            }
            resolver = resolver.layer(Layer::new(nearest));
        }

        let project_root = options.project_root();
        if let Some(root) = &project_root {
            let venv = DotenvFile::venv(root, &options.venv_dir);
            resolver = resolver.layer(Layer::new(venv).when_missing(API_KEY_VAR));
        } else {
            tracing::debug!("no project root; venv dotenv fallback disabled");
        }

        let store: Option<Box<dyn SecretStore>> = match &options.secrets {
            SecretsMode::Streamlit => project_root
                .as_deref()
                .map(|root| -> Box<dyn SecretStore> { Box::new(StreamlitSecrets::discover(root)) }),
            SecretsMode::File(path) => Some(Box::new(StreamlitSecrets::from_file(path))),
            SecretsMode::Disabled => None,
        };
        if let Some(store) = store {
            resolver = resolver.layer(
                Layer::new(SecretStoreSource::boxed(store, &[API_KEY_VAR]))
                    .merge(Merge::FillMissing)
                    .when_missing(API_KEY_VAR),
            );
        }

        resolver
    }

    /// The final working table and the origin of every entry a layer touched.
    /// Entries absent from the origin map came from the base environment.
    pub fn resolve_vars(&self) -> (Vars, BTreeMap<String, Origin>) {
        let mut vars = self.base.clone();
        let mut origins = BTreeMap::new();

        for layer in &self.layers {
            if !layer.condition.holds(&vars) {
                tracing::debug!(layer = layer.name(), "config layer skipped; condition not met");
                continue;
            }

            match layer.source.load() {
                Ok(Some(contribution)) => {
                    let origin = contribution.origin.clone();
                    let applied = layer.merge.apply(&mut vars, &mut origins, contribution);
                    tracing::debug!(layer = layer.name(), %origin, applied, "config layer applied");
                }
                Ok(None) => {
                    tracing::debug!(layer = layer.name(), "config layer had nothing to contribute");
                }
                Err(err) => {
                    tracing::debug!(
                        layer = layer.name(),
                        error = %format!("{err:#}"),
                        "config layer failed; skipping"
                    );
                }
            }
        }

        (vars, origins)
    }

    pub fn resolve(&self) -> Settings {
        let (vars, origins) = self.resolve_vars();
        let settings = Settings::from_resolved(&vars, &origins);

        tracing::debug!(
            model_name = settings.model_name(),
            api_key_present = settings.api_key().is_some(),
            api_key_origin = ?settings.origin_of(API_KEY_VAR),
            "configuration resolved"
        );

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::layer::{Contribution, Source};
    use crate::config::secrets::StaticSecrets;
    use crate::config::{DEFAULT_MODEL_NAME, MODEL_NAME_VAR};
    use std::fs;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn options(root: &Path, env: Vars) -> ResolverOptions {
        ResolverOptions {
            start_dir: Some(root.to_path_buf()),
            search_ceiling: Some(root.to_path_buf()),
            project_root: Some(root.to_path_buf()),
            venv_dir: DEFAULT_VENV_DIR.to_string(),
            secrets: SecretsMode::Disabled,
            env: Some(env),
        }
    }

    fn write_venv_env(root: &Path, contents: &str) {
        fs::create_dir_all(root.join("venv")).unwrap();
        fs::write(root.join("venv").join(".env"), contents).unwrap();
    }

    struct BrokenSource;

    impl Source for BrokenSource {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn load(&self) -> anyhow::Result<Option<Contribution>> {
            anyhow::bail!("dotenv support unavailable")
        }
    }

    #[test]
    fn project_dotenv_overrides_process_env() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".env"), "GROQ_API_KEY=from-file\n").unwrap();

        let settings =
            Resolver::standard(&options(root.path(), vars(&[(API_KEY_VAR, "from-env")]))).resolve();
        assert_eq!(settings.api_key(), Some("from-file"));
        assert_eq!(
            settings.origin_of(API_KEY_VAR),
            Some(&Origin::Dotenv {
                path: root.path().join(".env")
            })
        );
    }

    #[test]
    fn dotenv_is_found_from_a_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        fs::create_dir_all(&app).unwrap();
        fs::write(root.path().join(".env"), "GROQ_API_KEY=from-root\n").unwrap();

        let mut opts = options(root.path(), Vars::new());
        opts.start_dir = Some(app);
        let settings = Resolver::standard(&opts).resolve();
        assert_eq!(settings.api_key(), Some("from-root"));
    }

    #[test]
    fn venv_fallback_used_when_primary_lacks_key() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".env"), "MODEL_NAME=primary-model\n").unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=from-venv\n");

        let settings = Resolver::standard(&options(root.path(), Vars::new())).resolve();
        assert_eq!(settings.api_key(), Some("from-venv"));
        assert_eq!(settings.model_name(), "primary-model");
    }

    #[test]
    fn venv_fallback_used_when_primary_missing() {
        let root = tempfile::tempdir().unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=from-venv\nMODEL_NAME=venv-model\n");

        let settings = Resolver::standard(&options(root.path(), Vars::new())).resolve();
        assert_eq!(settings.api_key(), Some("from-venv"));
        assert_eq!(settings.model_name(), "venv-model");
    }

    #[test]
    fn venv_fallback_skipped_when_key_present() {
        let root = tempfile::tempdir().unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=from-venv\nMODEL_NAME=venv-model\n");

        let settings =
            Resolver::standard(&options(root.path(), vars(&[(API_KEY_VAR, "from-env")]))).resolve();
        assert_eq!(settings.api_key(), Some("from-env"));
        assert_eq!(settings.model_name(), DEFAULT_MODEL_NAME);
    }

    #[test]
    fn venv_dir_is_configurable() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(".venv")).unwrap();
        fs::write(root.path().join(".venv").join(".env"), "GROQ_API_KEY=dot-venv\n").unwrap();

        let mut opts = options(root.path(), Vars::new());
        opts.venv_dir = ".venv".to_string();
        assert_eq!(Resolver::standard(&opts).resolve().api_key(), Some("dot-venv"));
    }

    #[test]
    fn venv_fallback_found_from_a_subdirectory() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        fs::create_dir_all(&app).unwrap();
        fs::write(root.path().join(".env"), "MODEL_NAME=m\n").unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=from-venv\n");

        let mut opts = options(root.path(), Vars::new());
        opts.start_dir = Some(app);
        opts.project_root = None;
        let settings = Resolver::standard(&opts).resolve();
        assert_eq!(settings.api_key(), Some("from-venv"));
        assert_eq!(settings.model_name(), "m");
        assert_eq!(
            settings.origin_of(API_KEY_VAR),
            Some(&Origin::VenvDotenv {
                path: root.path().join("venv").join(".env")
            })
        );
    }

    #[test]
    fn venv_fallback_found_without_a_project_dotenv() {
        let root = tempfile::tempdir().unwrap();
        let pages = root.path().join("app").join("pages");
        fs::create_dir_all(&pages).unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=from-venv\n");

        let mut opts = options(root.path(), Vars::new());
        opts.start_dir = Some(pages.clone());
        opts.project_root = None;
        assert_eq!(opts.project_root(), Some(root.path().to_path_buf()));
        assert_eq!(Resolver::standard(&opts).resolve().api_key(), Some("from-venv"));

        fs::remove_dir_all(root.path().join("venv")).unwrap();
        assert_eq!(opts.project_root(), Some(pages));
    }

    #[test]
    fn process_env_used_when_no_file_defines_key() {
        let root = tempfile::tempdir().unwrap();
        let settings =
            Resolver::standard(&options(root.path(), vars(&[(API_KEY_VAR, "from-env")]))).resolve();
        assert_eq!(settings.api_key(), Some("from-env"));
        assert_eq!(settings.origin_of(API_KEY_VAR), Some(&Origin::ProcessEnv));
    }

    #[test]
    fn nothing_defined_leaves_key_absent() {
        let root = tempfile::tempdir().unwrap();
        let settings = Resolver::standard(&options(root.path(), Vars::new())).resolve();
        assert_eq!(settings.api_key(), None);
        assert_eq!(settings.origin_of(API_KEY_VAR), None);
        assert_eq!(settings.model_name(), DEFAULT_MODEL_NAME);
    }

    #[test]
    fn model_name_from_any_source() {
        let root = tempfile::tempdir().unwrap();
        let settings =
            Resolver::standard(&options(root.path(), vars(&[(MODEL_NAME_VAR, "foo")]))).resolve();
        assert_eq!(settings.model_name(), "foo");

        fs::write(root.path().join(".env"), "MODEL_NAME=bar\n").unwrap();
        let settings =
            Resolver::standard(&options(root.path(), vars(&[(MODEL_NAME_VAR, "foo")]))).resolve();
        assert_eq!(settings.model_name(), "bar");
    }

    #[test]
    fn secret_store_fills_missing_key_only() {
        let root = tempfile::tempdir().unwrap();
        let secrets = root.path().join("secrets.toml");
        fs::write(&secrets, "GROQ_API_KEY = \"from-secrets\"\n").unwrap();

        let mut opts = options(root.path(), Vars::new());
        opts.secrets = SecretsMode::File(secrets);
        let settings = Resolver::standard(&opts).resolve();
        assert_eq!(settings.api_key(), Some("from-secrets"));
        assert_eq!(
            settings.origin_of(API_KEY_VAR),
            Some(&Origin::SecretStore { store: "streamlit" })
        );

        opts.env = Some(vars(&[(API_KEY_VAR, "from-env")]));
        assert_eq!(Resolver::standard(&opts).resolve().api_key(), Some("from-env"));
    }

    #[test]
    fn streamlit_mode_reads_project_secrets() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(".streamlit")).unwrap();
        fs::write(
            root.path().join(".streamlit").join("secrets.toml"),
            "GROQ_API_KEY = \"project-secret\"\n",
        )
        .unwrap();

        let mut opts = options(root.path(), Vars::new());
        opts.secrets = SecretsMode::Streamlit;
        assert_eq!(Resolver::standard(&opts).resolve().api_key(), Some("project-secret"));
    }

    #[test]
    fn failing_layer_does_not_abort_resolution() {
        let settings = Resolver::new(vars(&[(API_KEY_VAR, "from-env")]))
            .layer(Layer::new(BrokenSource))
            .layer(
                Layer::new(SecretStoreSource::new(
                    StaticSecrets::new([(API_KEY_VAR, "unused")]),
                    &[API_KEY_VAR],
                ))
                .merge(Merge::FillMissing)
                .when_missing(API_KEY_VAR),
            )
            .resolve();
        assert_eq!(settings.api_key(), Some("from-env"));
        assert_eq!(settings.model_name(), DEFAULT_MODEL_NAME);

        let settings = Resolver::new(Vars::new()).layer(Layer::new(BrokenSource)).resolve();
        assert_eq!(settings.api_key(), None);
        assert_eq!(settings.model_name(), DEFAULT_MODEL_NAME);
    }

    #[test]
    fn unreadable_dotenv_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        // A directory named `.env` is not a file, so the search passes over it.
        fs::create_dir_all(root.path().join(".env")).unwrap();
        fs::write(root.path().join("venv.env"), [0xff, 0xfe, 0x00]).unwrap();

        let settings = Resolver::new(vars(&[(MODEL_NAME_VAR, "kept")]))
            .layer(Layer::new(NearestDotenv::new(root.path()).with_ceiling(root.path())))
            .layer(Layer::new(DotenvFile::new(root.path().join("venv.env"))))
            .resolve();
        assert_eq!(settings.model_name(), "kept");
        assert_eq!(settings.api_key(), None);
    }

    #[test]
    fn resolving_twice_is_stable() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".env"), "MODEL_NAME=stable\n").unwrap();
        write_venv_env(root.path(), "GROQ_API_KEY=venv-key\n");

        let resolver = Resolver::standard(&options(root.path(), Vars::new()));
        assert_eq!(resolver.resolve(), resolver.resolve());
    }

    #[test]
    fn missing_start_dir_skips_search() {
        let opts = ResolverOptions {
            start_dir: None,
            search_ceiling: None,
            project_root: None,
            venv_dir: DEFAULT_VENV_DIR.to_string(),
            secrets: SecretsMode::Streamlit,
            env: Some(vars(&[(API_KEY_VAR, "only-env")])),
        };
        let resolver = Resolver::standard(&opts);
        assert!(resolver.layers.is_empty());
        assert_eq!(resolver.resolve().api_key(), Some("only-env"));
    }
}
