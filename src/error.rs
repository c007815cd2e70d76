//! Error types for the chat relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Text fragments that identify a rejected or expired credential
///
/// Only homeserver error codes and messages; bare status numbers also show up
/// inside request URLs (sync cursors) and would misfire.
const AUTH_FAILURE_SIGNATURES: &[&str] = &["M_UNKNOWN_TOKEN", "M_MISSING_TOKEN", "Invalid access token"];

/// Errors that can occur in the relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not reach or set up the homeserver session
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential rejected by the homeserver
    #[error("authentication error: {0}")]
    Auth(String),

    /// Event stream terminated
    #[error("stream error: {0}")]
    Stream(String),

    /// History or membership lookup failed
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Message or typing notification could not be delivered
    #[error("send error: {0}")]
    Send(String),

    /// Language-model backend failure
    #[error("generation error: {0}")]
    Generation(String),

    /// Room join failed
    #[error("join error: {0}")]
    Join(String),

    /// Room invite failed
    #[error("invite error: {0}")]
    Invite(String),

    /// Room creation failed
    #[error("create room error: {0}")]
    Create(String),

    /// Message handling failed for a single inbound message
    #[error("handler error: {0}")]
    Handler(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error means the session credential is no longer valid
    ///
    /// Transport adapters should report rejected credentials as [`Error::Auth`],
    /// but errors that only carry the homeserver's text are matched by signature.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        if matches!(self, Self::Auth(_)) {
            return true;
        }

        let text = self.to_string();
        AUTH_FAILURE_SIGNATURES
            .iter()
            .any(|signature| text.contains(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_variant_is_auth_failure() {
        assert!(Error::Auth("token expired".to_string()).is_auth_failure());
    }

    #[test]
    fn stream_error_with_unknown_token_signature() {
        let err = Error::Stream("M_UNKNOWN_TOKEN: Invalid macaroon passed.".to_string());
        assert!(err.is_auth_failure());
    }

    #[test]
    fn stream_error_with_invalid_token_message() {
        let err = Error::Stream("sync failed: Invalid access token passed.".to_string());
        assert!(err.is_auth_failure());
    }

    #[test]
    fn timeout_with_cursor_containing_status_digits_is_transient() {
        let err = Error::Stream(
            "Matrix sync request failed: error sending request for url \
             (https://hs.example.org/_matrix/client/v3/sync?timeout=30000&since=s4015_22_7): \
             operation timed out"
                .to_string(),
        );
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn http_status_text_alone_is_not_auth_failure() {
        let err = Error::Connection("GET /joined_rooms failed after 401 ms".to_string());
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn timeout_is_transient() {
        let err = Error::Stream("sync request timed out".to_string());
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn connection_reset_is_transient() {
        let err = Error::Connection("connection reset by peer".to_string());
        assert!(!err.is_auth_failure());
    }
}
