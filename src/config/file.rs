//! TOML configuration file loading
//!
//! Supports `~/.config/chat-relay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay under the
//! environment.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfigFile {
    /// Homeserver connection
    #[serde(default)]
    pub matrix: MatrixFileConfig,

    /// Generation backend
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Reply behavior
    #[serde(default)]
    pub relay: RelayFileConfig,
}

/// Homeserver connection settings
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixFileConfig {
    /// Homeserver base URL (e.g. "<https://matrix.example.org>")
    pub homeserver: Option<String>,
    /// Full user id (e.g. "@henry:example.org")
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub password: Option<String>,
    /// Where the resumption cursor is kept
    pub sync_token_file: Option<PathBuf>,
}

/// Generation backend settings
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "claude-sonnet-4-20250514")
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Replaces the built-in persona prompt
    pub system_prompt: Option<String>,
}

/// Reply behavior settings
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayFileConfig {
    pub context_message_count: Option<usize>,
    pub allowed_domain: Option<String>,
    pub owner_id: Option<String>,
    pub max_concurrent_handlers: Option<usize>,
}

/// Load the TOML config file
///
/// With an explicit `path`, a missing or malformed file is an error. Without
/// one, the standard path is tried and problems only fall back to defaults.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<RelayConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(RelayConfigFile::default());
    };

    if !path.exists() {
        return Ok(RelayConfigFile::default());
    }

    let config = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RelayConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RelayConfigFile::default()
        }
    };

    Ok(config)
}

/// Return the config file path: `~/.config/chat-relay/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("chat-relay").join("config.toml"))
}
