//! Per-message reply flow
//!
//! Decides whether an inbound message deserves an answer, assembles context,
//! asks the generator and sends the result back to the room.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::Channel;
use crate::event::{ConversationMessage, Event, RoomType, now_millis};
use crate::history::{ContextRequest, build_context};
use crate::identity::{Identity, is_from_domain};
use crate::llm::Generator;
use crate::mention::{is_addressed, strip_mentions};
use crate::session::MessageHandler;
use crate::{Error, Result};

/// Sent to the room when the generator fails
pub const APOLOGY: &str = "Sorry, I'm having trouble thinking right now.";

/// How long the typing indicator lasts unless cleared
pub const TYPING_TIMEOUT_MS: u64 = 30_000;

/// Bound on a single generation call
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on context assembly
pub const CONTEXT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on each homeserver call made while answering
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Prior messages requested when none is configured
pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;

/// Reply tunables
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    /// Only senders from this server are answered
    pub allowed_domain: String,
    /// Number of prior messages requested for context
    pub context_messages: usize,
    pub typing_timeout_ms: u64,
    pub generation_timeout: Duration,
    pub context_timeout: Duration,
    /// Bound on membership lookups, typing updates and sends
    pub request_timeout: Duration,
}

impl ReplyConfig {
    #[must_use]
    pub fn new(allowed_domain: impl Into<String>) -> Self {
        Self {
            allowed_domain: allowed_domain.into(),
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            typing_timeout_ms: TYPING_TIMEOUT_MS,
            generation_timeout: GENERATION_TIMEOUT,
            context_timeout: CONTEXT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Answers messages addressed to the assistant
pub struct ReplyHandler {
    channel: Arc<dyn Channel>,
    generator: Arc<dyn Generator>,
    identity: Identity,
    config: ReplyConfig,
}

impl ReplyHandler {
    #[must_use]
    pub fn new(
        channel: Arc<dyn Channel>,
        generator: Arc<dyn Generator>,
        identity: Identity,
        config: ReplyConfig,
    ) -> Self {
        Self {
            channel,
            generator,
            identity,
            config,
        }
    }

    /// Handle a message received now
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handler`] if the room type cannot be determined, the
    /// generator fails, or the reply cannot be sent
    pub async fn handle_message(&self, sender_id: &str, room_id: &str, content: &str) -> Result<()> {
        self.handle_message_at(sender_id, room_id, content, now_millis())
            .await
    }

    /// Handle a message sent at `timestamp` (milliseconds since the Unix epoch)
    ///
    /// # Errors
    ///
    /// See [`ReplyHandler::handle_message`]
    pub async fn handle_message_at(
        &self,
        sender_id: &str,
        room_id: &str,
        content: &str,
        timestamp: i64,
    ) -> Result<()> {
        if content.is_empty() {
            return Ok(());
        }

        if !is_from_domain(sender_id, &self.config.allowed_domain) {
            tracing::debug!(sender = %sender_id, "ignoring sender outside allowed domain");
            return Ok(());
        }

        let members = self
            .bounded(self.channel.fetch_membership(room_id))
            .await
            .map_err(|e| Error::Handler(format!("failed to determine room type: {e}")))?;
        let room_type = RoomType::from_member_count(members);

        if !is_addressed(content, room_type, &self.identity) {
            tracing::trace!(room = %room_id, "message not addressed to us");
            return Ok(());
        }

        let message = match room_type {
            RoomType::Group => strip_mentions(content, &self.identity),
            RoomType::Direct => content.to_string(),
        };
        if message.is_empty() {
            tracing::debug!(room = %room_id, "nothing left after removing mention");
            return Ok(());
        }

        tracing::info!(room = %room_id, sender = %sender_id, %room_type, "answering message");

        let context = self
            .assemble_context(room_id, room_type, sender_id, &message, timestamp)
            .await;

        if let Err(e) = self
            .bounded(
                self.channel
                    .set_typing(room_id, true, self.config.typing_timeout_ms),
            )
            .await
        {
            tracing::warn!(room = %room_id, error = %e, "failed to start typing indicator");
        }

        let generated = match tokio::time::timeout(
            self.config.generation_timeout,
            self.generator.generate(&context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Generation("generation timed out".to_string())),
        };

        if let Err(e) = self.bounded(self.channel.set_typing(room_id, false, 0)).await {
            tracing::warn!(room = %room_id, error = %e, "failed to stop typing indicator");
        }

        let reply = match generated {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(room = %room_id, error = %e, "generation failed");
                if let Err(send_err) = self.bounded(self.channel.send(room_id, APOLOGY)).await {
                    tracing::warn!(room = %room_id, error = %send_err, "failed to send apology");
                }
                return Err(Error::Handler(format!("generation failed: {e}")));
            }
        };

        self.bounded(self.channel.send(room_id, &reply))
            .await
            .map_err(|e| Error::Handler(format!("failed to send reply: {e}")))?;

        tracing::debug!(room = %room_id, len = reply.len(), "reply sent");
        Ok(())
    }

    /// Await a homeserver call for at most `request_timeout`
    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.request_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Connection(format!(
                    "homeserver did not answer within {:?}",
                    self.config.request_timeout
                )))
            })
    }

    /// Build the context window, falling back to the message alone
    async fn assemble_context(
        &self,
        room_id: &str,
        room_type: RoomType,
        sender_id: &str,
        message: &str,
        timestamp: i64,
    ) -> Vec<ConversationMessage> {
        let request = ContextRequest {
            room_id,
            room_type,
            sender_id,
            current_message: message,
            current_timestamp: timestamp,
            window_size: self.config.context_messages,
        };

        let channel = Arc::clone(&self.channel);
        let fetch = move |room: String, count: usize| async move {
            channel.fetch_history(&room, count).await
        };

        match tokio::time::timeout(
            self.config.context_timeout,
            build_context(&request, &self.identity, fetch),
        )
        .await
        {
            Ok(context) => context,
            Err(_) => {
                tracing::warn!(room = %room_id, "context assembly timed out, using current message only");
                vec![ConversationMessage::user(message, timestamp, sender_id)]
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, event: Event) -> Result<()> {
        let timestamp = if event.timestamp > 0 {
            event.timestamp
        } else {
            now_millis()
        };

        self.handle_message_at(&event.sender_id, &event.room_id, &event.body, timestamp)
            .await
    }
}
