//! Process wiring: builds the transport, generator and session from config

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, MatrixChannel};
use crate::config::Config;
use crate::cursor::FileCursorStore;
use crate::identity::Identity;
use crate::llm::AnthropicGenerator;
use crate::reply::{ReplyConfig, ReplyHandler};
use crate::rooms::{RoomWatcher, invite_user, join_room};
use crate::session::{SessionConfig, SessionLoop};
use crate::Result;

/// Bound on the logout performed at shutdown
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A joined room as shown by the debug command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: String,
    /// `None` when the member list could not be fetched
    pub members: Option<usize>,
}

/// Relay daemon
pub struct Daemon {
    config: Config,
    channel: Arc<dyn Channel>,
}

impl Daemon {
    /// Create a daemon talking to the configured homeserver
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: Config) -> Result<Self> {
        let channel = MatrixChannel::new(
            &config.homeserver,
            config.user_id.clone(),
            config
                .access_token
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new())),
            config.password.clone(),
        )?;

        Ok(Self::with_channel(config, Arc::new(channel)))
    }

    /// Create a daemon over an existing transport
    #[must_use]
    pub fn with_channel(config: Config, channel: Arc<dyn Channel>) -> Self {
        Self { config, channel }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Run the relay until `cancel` fires or the credential is rejected
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing, the initial connection fails,
    /// or the homeserver rejects the credential
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut generator = AnthropicGenerator::new(self.config.require_api_key()?.clone())?
            .with_model(self.config.llm_model.clone());
        if let Some(prompt) = &self.config.system_prompt {
            generator = generator.with_system_prompt(prompt.clone());
        }

        let identity = Identity::new(self.config.user_id.as_str());

        let mut reply_config = ReplyConfig::new(self.config.allowed_domain.clone());
        reply_config.context_messages = self.config.context_message_count;

        let handler = Arc::new(ReplyHandler::new(
            Arc::clone(&self.channel),
            Arc::new(generator),
            identity.clone(),
            reply_config,
        ));

        let store = Arc::new(FileCursorStore::new(self.config.sync_token_file.clone()));

        let session_config = SessionConfig {
            max_concurrent_handlers: self.config.max_concurrent_handlers,
            ..SessionConfig::default()
        };

        tracing::info!(
            user = %identity,
            homeserver = %self.config.homeserver,
            model = %self.config.llm_model,
            context_messages = self.config.context_message_count,
            allowed_domain = %self.config.allowed_domain,
            "starting relay"
        );

        let mut session = SessionLoop::new(
            Arc::clone(&self.channel),
            handler,
            store,
            identity,
            session_config,
        );

        let watcher_cancel = cancel.child_token();
        let watcher = tokio::spawn(
            RoomWatcher::new(Arc::clone(&self.channel), self.config.owner_id.clone())
                .run(watcher_cancel.clone()),
        );

        let result = session.run(&cancel).await;

        watcher_cancel.cancel();
        if let Err(e) = watcher.await {
            tracing::warn!(error = %e, "room watcher task failed");
        }

        self.disconnect().await;
        result
    }

    /// Connect and join a room
    ///
    /// # Errors
    ///
    /// Returns error if connecting or joining fails
    pub async fn join(&self, room_id: &str) -> Result<String> {
        self.channel.connect().await?;
        let result = join_room(self.channel.as_ref(), room_id).await;
        self.disconnect().await;
        result
    }

    /// Connect and invite a user
    ///
    /// # Errors
    ///
    /// Returns error if connecting, creating the room, or inviting fails
    pub async fn invite(&self, user_id: &str, room_id: Option<&str>, create: bool) -> Result<String> {
        self.channel.connect().await?;
        let result = invite_user(self.channel.as_ref(), user_id, room_id, create).await;
        self.disconnect().await;
        result
    }

    /// Connect and summarize joined rooms
    ///
    /// # Errors
    ///
    /// Returns error if connecting or listing rooms fails
    pub async fn debug(&self) -> Result<Vec<RoomSummary>> {
        self.channel.connect().await?;

        let rooms = match self.channel.joined_rooms().await {
            Ok(rooms) => rooms,
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        };

        let mut summaries = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let members = match self.channel.fetch_membership(&room_id).await {
                Ok(count) => Some(count),
                Err(e) => {
                    tracing::warn!(room = %room_id, error = %e, "failed to fetch members");
                    None
                }
            };
            summaries.push(RoomSummary { room_id, members });
        }

        self.disconnect().await;
        Ok(summaries)
    }

    /// End the homeserver session, bounded by [`DISCONNECT_TIMEOUT`]
    async fn disconnect(&self) {
        match tokio::time::timeout(DISCONNECT_TIMEOUT, self.channel.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "disconnect failed"),
            Err(_) => tracing::warn!("disconnect timed out"),
        }
    }
}
