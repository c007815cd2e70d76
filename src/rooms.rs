//! Room maintenance: periodic membership report, manual join and invite

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, NewRoom};
use crate::{Error, Result};

/// Interval between room checks
pub const ROOM_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before the first room check
pub const ROOM_CHECK_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Every this many checks the status is reported to the owner
const STATUS_REPORT_EVERY: u64 = 10;

/// Periodically lists joined rooms and reports the count
pub struct RoomWatcher {
    channel: Arc<dyn Channel>,
    owner_id: Option<String>,
    interval: Duration,
    initial_delay: Duration,
}

impl RoomWatcher {
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>, owner_id: Option<String>) -> Self {
        Self {
            channel,
            owner_id,
            interval: ROOM_CHECK_INTERVAL,
            initial_delay: ROOM_CHECK_INITIAL_DELAY,
        }
    }

    /// Override the check cadence
    #[must_use]
    pub const fn with_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    /// Run until cancelled; returns the number of completed checks
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        tokio::select! {
            () = cancel.cancelled() => return 0,
            () = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.interval);
        let mut checks = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A stalled homeserver call must not outlive cancellation
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.check(checks + 1) => checks += 1,
            }
        }

        tracing::debug!(checks, "room watcher stopped");
        checks
    }

    async fn check(&self, attempt: u64) {
        match self.channel.joined_rooms().await {
            Ok(rooms) => {
                tracing::debug!(attempt, rooms = rooms.len(), "room check");
                if attempt % STATUS_REPORT_EVERY == 0 {
                    tracing::info!(
                        owner = self.owner_id.as_deref().unwrap_or("-"),
                        rooms = rooms.len(),
                        "status: currently in {} rooms",
                        rooms.len()
                    );
                }
            }
            Err(e) => tracing::warn!(attempt, error = %e, "failed to list joined rooms"),
        }
    }
}

/// Join a room by id or alias
///
/// If joining a room id (`!…`) fails, a fresh direct room is created instead
/// and its id returned.
///
/// # Errors
///
/// Returns [`Error::Join`] if the join fails and no fallback applies, or
/// [`Error::Create`] if the fallback fails too
pub async fn join_room(channel: &dyn Channel, room_id: &str) -> Result<String> {
    tracing::info!(room = %room_id, "joining room");

    match channel.join(room_id).await {
        Ok(()) => Ok(room_id.to_string()),
        Err(e) if room_id.starts_with('!') => {
            tracing::warn!(room = %room_id, error = %e, "join failed, creating a direct room instead");
            let room = NewRoom {
                name: "New Direct Chat".to_string(),
                topic: "Chat created by join command".to_string(),
                invitees: Vec::new(),
                is_direct: true,
            };
            let created = channel
                .create_room(&room)
                .await
                .map_err(|ce| Error::Create(format!("join failed ({e}) and fallback failed: {ce}")))?;
            tracing::info!(room = %created, requested = %room_id, "created room in place of join");
            Ok(created)
        }
        Err(e) => Err(match e {
            Error::Join(_) => e,
            other => Error::Join(other.to_string()),
        }),
    }
}

/// Invite a user, creating a private direct room when asked or when no room is given
///
/// A welcome line is sent afterwards; failing to send it is only logged.
///
/// # Errors
///
/// Returns [`Error::Create`] or [`Error::Invite`] if the room cannot be
/// created or the invite is rejected
pub async fn invite_user(
    channel: &dyn Channel,
    user_id: &str,
    room_id: Option<&str>,
    create: bool,
) -> Result<String> {
    let target = match room_id {
        Some(room_id) if !create && !room_id.is_empty() => {
            tracing::info!(room = %room_id, user = %user_id, "inviting user");
            channel.invite(room_id, user_id).await.map_err(|e| match e {
                Error::Invite(_) => e,
                other => Error::Invite(other.to_string()),
            })?;
            room_id.to_string()
        }
        _ => {
            tracing::info!(user = %user_id, "creating room for user");
            let room = NewRoom {
                name: "Direct Chat".to_string(),
                topic: format!("Conversation with {user_id}"),
                invitees: vec![user_id.to_string()],
                is_direct: true,
            };
            channel.create_room(&room).await.map_err(|e| match e {
                Error::Create(_) => e,
                other => Error::Create(other.to_string()),
            })?
        }
    };

    let welcome = format!("Hello {user_id}! Mention me or message me here to start a conversation.");
    if let Err(e) = channel.send(&target, &welcome).await {
        tracing::warn!(room = %target, error = %e, "failed to send welcome message");
    }

    tracing::info!(room = %target, user = %user_id, "user invited");
    Ok(target)
}
