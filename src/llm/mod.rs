//! Language-model backends

mod anthropic;

use async_trait::async_trait;

pub use anthropic::{AnthropicGenerator, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT};

use crate::Result;
use crate::event::ConversationMessage;

/// Produces a reply for a conversation window
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate the assistant's next message
    ///
    /// `context` is chronological and ends with the message being answered.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Generation`] if the backend fails or returns no text
    async fn generate(&self, context: &[ConversationMessage]) -> Result<String>;
}
