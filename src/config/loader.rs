//! Configuration loading from disk.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::config::schema::{BackendConfig, BalancerConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Backends file parse error: {0}")]
    Backends(#[from] serde_json::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
///
/// A relative `backends_file` is resolved against the config file's directory.
pub fn load_config(path: &Path) -> Result<BalancerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: BalancerConfig = toml::from_str(&content)?;

    if let Some(file) = config.backends_file.clone() {
        let resolved = match path.parent() {
            Some(dir) if file.is_relative() => dir.join(&file),
            _ => file,
        };
        config.backends.extend(read_backends_file(&resolved)?);
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse and validate configuration held in memory.
pub fn parse_config(content: &str) -> Result<BalancerConfig, ConfigError> {
    let config: BalancerConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Read a JSON array of `{"host": .., "port": .., "weight": ..}` entries.
///
/// A missing file yields an empty list; a malformed one is an error.
pub fn read_backends_file(path: &Path) -> Result<Vec<BackendConfig>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Backends file not found, starting with none");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}
