use std::fmt;
use std::path::PathBuf;

/// Failure of a single configuration layer. Never escapes the resolver; it is
/// logged and the layer is skipped.
#[derive(Debug)]
pub struct LayerError {
    pub layer: &'static str,
    pub stage: &'static str,
    pub path: Option<PathBuf>,
    pub detail: String,
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "config layer error (layer={}, stage={}, path={}): {}",
                self.layer,
                self.stage,
                path.display(),
                self.detail
            ),
            None => write!(
                f,
                "config layer error (layer={}, stage={}): {}",
                self.layer, self.stage, self.detail
            ),
        }
    }
}

impl std::error::Error for LayerError {}
