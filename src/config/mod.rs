//! Configuration management for the relay
//!
//! Values come from environment variables, then the optional TOML file, then
//! built-in defaults.

pub mod file;

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::identity::Identity;
use crate::llm::DEFAULT_MODEL;
use crate::reply::DEFAULT_CONTEXT_MESSAGES;
use crate::{Error, Result};

pub use file::RelayConfigFile;

/// Default location of the resumption cursor
pub const DEFAULT_SYNC_TOKEN_FILE: &str = "sync_token.txt";

/// Relay configuration
#[derive(Clone)]
pub struct Config {
    /// Homeserver base URL
    pub homeserver: String,

    /// The assistant's full user id
    pub user_id: String,

    /// Access token (`RELAY_ACCESS_TOKEN`)
    pub access_token: Option<SecretString>,

    /// Password for a fresh login on connect (`RELAY_PASSWORD`)
    pub password: Option<SecretString>,

    /// Resumption cursor file
    pub sync_token_file: PathBuf,

    /// Anthropic API key (`ANTHROPIC_API_KEY`)
    pub anthropic_api_key: Option<SecretString>,

    /// LLM model identifier
    pub llm_model: String,

    /// Replacement persona prompt (file only)
    pub system_prompt: Option<String>,

    /// Prior messages requested as context
    pub context_message_count: usize,

    /// Only senders from this server are answered
    pub allowed_domain: String,

    /// Recipient of periodic status reports
    pub owner_id: Option<String>,

    /// Cap on concurrently running reply handlers
    pub max_concurrent_handlers: Option<usize>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |set: bool| if set { "[REDACTED]" } else { "<unset>" };
        f.debug_struct("Config")
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .field("access_token", &redact(self.access_token.is_some()))
            .field("password", &redact(self.password.is_some()))
            .field("sync_token_file", &self.sync_token_file)
            .field("anthropic_api_key", &redact(self.anthropic_api_key.is_some()))
            .field("llm_model", &self.llm_model)
            .field("system_prompt", &self.system_prompt.as_ref().map(|_| "<custom>"))
            .field("context_message_count", &self.context_message_count)
            .field("allowed_domain", &self.allowed_domain)
            .field("owner_id", &self.owner_id)
            .field("max_concurrent_handlers", &self.max_concurrent_handlers)
            .finish()
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is unusable, a numeric
    /// setting does not parse, or required connection settings are missing
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Empty environment values count as unset.
    ///
    /// # Errors
    ///
    /// See [`Config::load`]
    pub fn from_sources<F>(fc: RelayConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let homeserver = var("RELAY_HOMESERVER")
            .or(fc.matrix.homeserver)
            .ok_or_else(|| Error::Config("RELAY_HOMESERVER must be set".to_string()))?;

        let user_id = var("RELAY_USER_ID")
            .or(fc.matrix.user_id)
            .ok_or_else(|| Error::Config("RELAY_USER_ID must be set".to_string()))?;

        let access_token = var("RELAY_ACCESS_TOKEN")
            .or(fc.matrix.access_token)
            .map(SecretString::from);
        let password = var("RELAY_PASSWORD")
            .or(fc.matrix.password)
            .map(SecretString::from);

        if access_token.is_none() && password.is_none() {
            return Err(Error::Config(
                "either RELAY_ACCESS_TOKEN or RELAY_PASSWORD must be set".to_string(),
            ));
        }

        let context_message_count = match var("RELAY_CONTEXT_MESSAGE_COUNT") {
            Some(raw) => parse_count("RELAY_CONTEXT_MESSAGE_COUNT", &raw)?,
            None => fc
                .relay
                .context_message_count
                .unwrap_or(DEFAULT_CONTEXT_MESSAGES),
        };

        let max_concurrent_handlers = match var("RELAY_MAX_CONCURRENT_HANDLERS") {
            Some(raw) => Some(parse_count("RELAY_MAX_CONCURRENT_HANDLERS", &raw)?),
            None => fc.relay.max_concurrent_handlers,
        }
        .filter(|&n| n > 0);

        let allowed_domain = match var("RELAY_ALLOWED_DOMAIN").or(fc.relay.allowed_domain) {
            Some(domain) => domain,
            None => Identity::new(user_id.as_str())
                .domain()
                .map(ToString::to_string)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "cannot derive allowed domain from {user_id}; set RELAY_ALLOWED_DOMAIN"
                    ))
                })?,
        };

        Ok(Self {
            homeserver,
            user_id,
            access_token,
            password,
            sync_token_file: var("RELAY_SYNC_TOKEN_FILE")
                .map(PathBuf::from)
                .or(fc.matrix.sync_token_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYNC_TOKEN_FILE)),
            anthropic_api_key: var("ANTHROPIC_API_KEY")
                .or(fc.llm.api_key)
                .map(SecretString::from),
            llm_model: var("RELAY_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: fc.llm.system_prompt,
            context_message_count,
            allowed_domain,
            owner_id: var("RELAY_OWNER_ID").or(fc.relay.owner_id),
            max_concurrent_handlers,
        })
    }

    /// The API key, required for running the relay
    ///
    /// # Errors
    ///
    /// Returns error if no key is configured
    pub fn require_api_key(&self) -> Result<&SecretString> {
        self.anthropic_api_key
            .as_ref()
            .ok_or_else(|| Error::Config("ANTHROPIC_API_KEY must be set".to_string()))
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("RELAY_HOMESERVER", "https://matrix.example.org"),
        ("RELAY_USER_ID", "@henry:example.org"),
        ("RELAY_ACCESS_TOKEN", "syt_secret"),
    ];

    #[test]
    fn defaults_are_applied() {
        let config = Config::from_sources(RelayConfigFile::default(), env(BASE)).unwrap();

        assert_eq!(config.sync_token_file, PathBuf::from("sync_token.txt"));
        assert_eq!(config.context_message_count, 10);
        assert_eq!(config.allowed_domain, "example.org");
        assert_eq!(config.llm_model, DEFAULT_MODEL);
        assert!(config.max_concurrent_handlers.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn missing_homeserver_is_rejected() {
        let result = Config::from_sources(
            RelayConfigFile::default(),
            env(&[
                ("RELAY_USER_ID", "@henry:example.org"),
                ("RELAY_ACCESS_TOKEN", "t"),
            ]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn credential_is_required() {
        let result = Config::from_sources(
            RelayConfigFile::default(),
            env(&[
                ("RELAY_HOMESERVER", "https://matrix.example.org"),
                ("RELAY_USER_ID", "@henry:example.org"),
                ("RELAY_ACCESS_TOKEN", ""),
            ]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn password_alone_is_enough() {
        let config = Config::from_sources(
            RelayConfigFile::default(),
            env(&[
                ("RELAY_HOMESERVER", "https://matrix.example.org"),
                ("RELAY_USER_ID", "@henry:example.org"),
                ("RELAY_PASSWORD", "hunter2"),
            ]),
        )
        .unwrap();
        assert_eq!(config.password.unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn non_numeric_context_count_is_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("RELAY_CONTEXT_MESSAGE_COUNT", "lots"));
        let result = Config::from_sources(RelayConfigFile::default(), env(&pairs));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn environment_overrides_file() {
        let mut fc = RelayConfigFile::default();
        fc.matrix.homeserver = Some("https://file.example.org".to_string());
        fc.relay.context_message_count = Some(3);
        fc.relay.allowed_domain = Some("file.example.org".to_string());

        let mut pairs = BASE.to_vec();
        pairs.push(("RELAY_CONTEXT_MESSAGE_COUNT", "20"));
        let config = Config::from_sources(fc, env(&pairs)).unwrap();

        assert_eq!(config.homeserver, "https://matrix.example.org");
        assert_eq!(config.context_message_count, 20);
        assert_eq!(config.allowed_domain, "file.example.org");
    }

    #[test]
    fn zero_handler_cap_means_unbounded() {
        let mut pairs = BASE.to_vec();
        pairs.push(("RELAY_MAX_CONCURRENT_HANDLERS", "0"));
        let config = Config::from_sources(RelayConfigFile::default(), env(&pairs)).unwrap();
        assert!(config.max_concurrent_handlers.is_none());
    }

    #[test]
    fn user_without_domain_needs_explicit_allowed_domain() {
        let result = Config::from_sources(
            RelayConfigFile::default(),
            env(&[
                ("RELAY_HOMESERVER", "https://matrix.example.org"),
                ("RELAY_USER_ID", "henry"),
                ("RELAY_ACCESS_TOKEN", "t"),
            ]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn api_key_required_for_run() {
        let config = Config::from_sources(RelayConfigFile::default(), env(BASE)).unwrap();
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = Config::from_sources(RelayConfigFile::default(), env(BASE)).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("syt_secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
