use crate::config::error::LayerError;
use crate::config::layer::{Contribution, Source};
use crate::config::{Origin, Vars, DOTENV_FILENAME};
use std::path::{Path, PathBuf};

/// Nearest `filename` in `start` or one of its ancestors. The walk stops after
/// `ceiling` when it is given and is an ancestor of `start`.
pub fn find_upward(
    start: &Path,
    filename: impl AsRef<Path>,
    ceiling: Option<&Path>,
) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(filename.as_ref());
        if candidate.is_file() {
            return Some(candidate);
        }
        if ceiling.is_some_and(|c| c == dir) {
            break;
        }
    }
    None
}

/// Parse a dotenv file into a table. Lines that fail to parse are skipped;
/// only an unreadable file is an error.
///
/// `${VAR}` references are expanded by dotenvy against earlier entries of the
/// same file and the real process environment, not against an injected base
/// table such as `ResolverOptions::env`.
pub fn read_dotenv(path: &Path) -> anyhow::Result<Vars> {
    let iter = dotenvy::from_path_iter(path).map_err(|err| LayerError {
        layer: "dotenv",
        stage: "open",
        path: Some(path.to_path_buf()),
        detail: err.to_string(),
    })?;

    let mut vars = Vars::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(dotenvy::Error::LineParse(line, index)) => {
                tracing::debug!(
                    path = %path.display(),
                    index,
                    line_len = line.len(),
                    "skipping malformed dotenv line"
                );
            }
            Err(err) => {
                return Err(LayerError {
                    layer: "dotenv",
                    stage: "read",
                    path: Some(path.to_path_buf()),
                    detail: err.to_string(),
                }
                .into());
            }
        }
    }

    Ok(vars)
}

/// The nearest `.env` found by walking upward from a start directory.
#[derive(Debug, Clone)]
pub struct NearestDotenv {
    start_dir: PathBuf,
    filename: String,
    ceiling: Option<PathBuf>,
}

impl NearestDotenv {
    pub fn new(start_dir: impl Into<PathBuf>) -> Self {
        Self {
            start_dir: start_dir.into(),
            filename: DOTENV_FILENAME.to_string(),
            ceiling: None,
        }
    }

    pub fn with_ceiling(mut self, ceiling: impl Into<PathBuf>) -> Self {
        self.ceiling = Some(ceiling.into());
        self
    }
}

impl Source for NearestDotenv {
    fn name(&self) -> &'static str {
        "nearest_dotenv"
    }

    fn load(&self) -> anyhow::Result<Option<Contribution>> {
        let Some(path) = find_upward(&self.start_dir, &self.filename, self.ceiling.as_deref())
        else {
            return Ok(None);
        };

        let vars = read_dotenv(&path)?;
        Ok(Some(Contribution {
            vars,
            origin: Origin::Dotenv { path },
        }))
    }
}

/// A dotenv file at a fixed path. A missing file contributes nothing.
#[derive(Debug, Clone)]
pub struct DotenvFile {
    path: PathBuf,
    origin: fn(PathBuf) -> Origin,
}

impl DotenvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: |path| Origin::Dotenv { path },
        }
    }

    /// `<project_root>/<venv_dir>/.env`.
    pub fn venv(project_root: &Path, venv_dir: &str) -> Self {
        Self {
            path: project_root.join(venv_dir).join(DOTENV_FILENAME),
            origin: |path| Origin::VenvDotenv { path },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for DotenvFile {
    fn name(&self) -> &'static str {
        "dotenv_file"
    }

    fn load(&self) -> anyhow::Result<Option<Contribution>> {
        if !self.path.is_file() {
            return Ok(None);
        }

        let vars = read_dotenv(&self.path)?;
        Ok(Some(Contribution {
            vars,
            origin: (self.origin)(self.path.clone()),
        }))
    }
}
