//! Anthropic Messages API client
//!
//! Each context entry is sent with a `<date time> <sender>:` prefix so the
//! model can tell speakers apart in group rooms. The system prompt gets a
//! per-request addendum with the current date taken from the newest entry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::Generator;
use crate::event::{ConversationMessage, Role};
use crate::{Error, Result};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const MAX_TOKENS: u32 = 1024;
const TEMPERATURE: f32 = 0.7;

/// Bound on a single generation request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Persona used when none is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful, friendly assistant taking part in an instant-messaging \
conversation. Keep replies concise and easy to read on a phone. Reply in the \
language the user writes in. Use the earlier messages for context and refer \
back to them when it helps. Ask a clarifying question when a request is \
ambiguous. Format code with fenced code blocks.";

/// Generator backed by the Anthropic Messages API
pub struct AnthropicGenerator {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    system_prompt: String,
}

/// Anthropic message request
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message>,
}

/// A message in the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

/// Anthropic message response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ResponseContent>,
}

/// Response content block
#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicGenerator {
    /// Create a new generator
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Anthropic API key required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    /// Use a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Replace the base system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
    async fn generate(&self, context: &[ConversationMessage]) -> Result<String> {
        let now = Utc::now();
        let messages = to_api_messages(context, &Local, now);
        if messages.is_empty() {
            return Err(Error::Generation("no user message in context".to_string()));
        }

        let system = system_prompt(&self.system_prompt, context, &Local, now);
        let request = MessageRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            system: &system,
            messages,
        };

        tracing::debug!(
            model = %self.model,
            entries = context.len(),
            sent = request.messages.len(),
            "requesting completion"
        );

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("API error {status}: {body}")));
        }

        let result: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("Parse error: {e}")))?;

        let text = result
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(Error::Generation("Empty response from API".to_string()));
        }

        Ok(text)
    }
}

/// Convert a context window into alternating API messages
///
/// Consecutive entries with the same role are joined; the conversation must
/// open with a user turn, so leading assistant entries are dropped.
fn to_api_messages<Tz>(
    context: &[ConversationMessage],
    tz: &Tz,
    now: DateTime<Utc>,
) -> Vec<Message>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut messages: Vec<Message> = Vec::with_capacity(context.len());

    for entry in context
        .iter()
        .skip_while(|entry| entry.role == Role::Assistant)
    {
        let content = prefixed(entry, tz, now);
        match messages.last_mut() {
            Some(last) if last.role == entry.role.as_str() => {
                last.content.push('\n');
                last.content.push_str(&content);
            }
            _ => messages.push(Message {
                role: entry.role.as_str(),
                content,
            }),
        }
    }

    messages
}

/// Render `<date time> <sender>: <content>`
fn prefixed<Tz>(entry: &ConversationMessage, tz: &Tz, now: DateTime<Utc>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let at = local_time(entry.timestamp, tz, now);
    let sender = if entry.sender_id.is_empty() {
        match entry.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    } else {
        entry.sender_id.as_str()
    };

    format!(
        "{} {sender}: {}",
        at.format("%Y-%m-%d %H:%M:%S"),
        entry.content
    )
}

/// Base prompt plus the date addendum
fn system_prompt<Tz>(
    base: &str,
    context: &[ConversationMessage],
    tz: &Tz,
    now: DateTime<Utc>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let newest = context.iter().map(|m| m.timestamp).max().unwrap_or(0);
    let at = local_time(newest, tz, now);

    format!(
        "{base}\n\n\
         IMPORTANT:\n\
         1. Messages are shown as '<date> <time> <sender>: <text>'. Never start your reply with such a prefix; reply with the message text only.\n\
         2. If asked for the current date, it is {}.\n\
         3. If asked for the current time, it is {}.",
        at.format("%Y-%m-%d"),
        at.format("%H:%M")
    )
}

/// Millisecond timestamp in `tz`, falling back to `now` when unset
fn local_time<Tz: TimeZone>(timestamp: i64, tz: &Tz, now: DateTime<Utc>) -> DateTime<Tz> {
    let utc = if timestamp > 0 {
        DateTime::from_timestamp_millis(timestamp).unwrap_or(now)
    } else {
        now
    };
    utc.with_timezone(tz)
}
