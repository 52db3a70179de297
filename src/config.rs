/// Engine configuration, loaded from RON. Paths inside the file are
/// resolved against the directory that holds it.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::refine::RefinementConfig;
use crate::core::rules::CategorySets;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "Engine")]
pub struct EngineConfig {
    pub templates: PathBuf,
    pub field_mappings: PathBuf,
    pub guide: PathBuf,
    /// SQLite database the binaries read records from and save to.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub categories: CategorySets,
    #[serde(default)]
    pub refinement: RefinementConfig,
    /// Run refinement by default.
    #[serde(default)]
    pub refine: bool,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<EngineConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse_ron(&contents, base)
    }

    /// Parse a config string, resolving relative paths against `base`.
    pub fn parse_ron(input: &str, base: &Path) -> Result<EngineConfig, ConfigError> {
        let mut config: EngineConfig = ron::from_str(input)?;
        config.templates = resolve(base, &config.templates);
        config.field_mappings = resolve(base, &config.field_mappings);
        config.guide = resolve(base, &config.guide);
        config.database = config.database.as_deref().map(|db| resolve(base, db));
        Ok(config)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
