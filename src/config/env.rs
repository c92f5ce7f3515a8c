use crate::error::{DevServeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Env files read when no explicit selection is made, lowest precedence first.
pub const DEFAULT_ENV_FILES: [&str; 3] = [".env", ".env.local", ".env.development"];

/// Source of the environment variables handed to the server process.
///
/// Reloaded on every rebuild so edits to env files take effect without
/// restarting the whole session.
#[async_trait]
pub trait EnvSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>>;
}

/// Reads dotenv files from the project root.
pub struct DotenvSource {
    root: PathBuf,
    selection: Option<PathBuf>,
}

impl DotenvSource {
    pub fn new(root: impl Into<PathBuf>, selection: Option<String>) -> Self {
        let root = root.into();
        let selection = selection.map(|file| {
            let path = PathBuf::from(file);
            if path.is_absolute() { path } else { root.join(path) }
        });
        Self { root, selection }
    }

    /// Files that will be read, in the order their values are applied.
    pub fn env_files(&self) -> Vec<PathBuf> {
        match &self.selection {
            Some(path) => vec![path.clone()],
            None => DEFAULT_ENV_FILES.iter().map(|f| self.root.join(f)).collect(),
        }
    }

    fn read_file(path: &Path, vars: &mut HashMap<String, String>) -> Result<()> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            DevServeError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;

        for item in iter {
            let (key, value) = item.map_err(|e| {
                DevServeError::ConfigError(format!("Invalid entry in {}: {e}", path.display()))
            })?;
            vars.insert(key, value);
        }
        Ok(())
    }
}

#[async_trait]
impl EnvSource for DotenvSource {
    async fn load(&self) -> Result<HashMap<String, String>> {
        let mut vars = HashMap::new();

        for path in self.env_files() {
            if !path.is_file() {
                continue;
            }
            debug!("Loading environment from {}", path.display());
            Self::read_file(&path, &mut vars)?;
        }

        Ok(vars)
    }
}
