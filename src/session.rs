//! Long-running event session
//!
//! Consumes the transport's event stream, filters out backlog and already-seen
//! events, dispatches messages to a [`MessageHandler`] without waiting for it,
//! and reconnects after transient stream failures. A rejected credential ends
//! the session and forgets the resumption cursor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, SyncItem};
use crate::cursor::CursorStore;
use crate::event::{Event, now_millis};
use crate::identity::Identity;
use crate::{Error, Result};

/// Delay between a stream failure and the next attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Receives qualifying message events
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message
    ///
    /// # Errors
    ///
    /// Errors are logged by the session and never stop it
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Where the session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Authenticating,
    Streaming,
    Backoff,
    /// Ended by cancellation or a rejected credential
    Terminated,
}

/// Backlog cutoff and high-water mark for delivered events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    startup_time: i64,
    last_processed_time: i64,
}

impl SessionState {
    /// Start a session at `startup_time` (milliseconds since the Unix epoch)
    #[must_use]
    pub const fn new(startup_time: i64) -> Self {
        Self {
            startup_time,
            last_processed_time: startup_time,
        }
    }

    #[must_use]
    pub const fn startup_time(&self) -> i64 {
        self.startup_time
    }

    #[must_use]
    pub const fn last_processed_time(&self) -> i64 {
        self.last_processed_time
    }

    /// Decide whether an event with `timestamp` is new, advancing the watermark if so
    ///
    /// Events without a timestamp (0) are always admitted and leave the
    /// watermark alone.
    pub fn admit(&mut self, timestamp: i64) -> bool {
        if timestamp <= 0 {
            return true;
        }
        if timestamp < self.startup_time || timestamp <= self.last_processed_time {
            return false;
        }
        self.last_processed_time = timestamp;
        true
    }
}

/// Session tunables
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait between a stream termination and the next stream
    pub reconnect_delay: Duration,
    /// Upper bound on concurrently running handlers; `None` for no bound
    pub max_concurrent_handlers: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            max_concurrent_handlers: None,
        }
    }
}

/// How a single stream ended
enum StreamEnd {
    Cancelled,
    Closed,
    Failed(Error),
}

/// Drives one identity's event stream until cancellation or credential loss
pub struct SessionLoop {
    channel: Arc<dyn Channel>,
    handler: Arc<dyn MessageHandler>,
    store: Arc<dyn CursorStore>,
    identity: Identity,
    config: SessionConfig,
    state: SessionState,
    cursor: Option<String>,
    phase: Phase,
    limiter: Option<Arc<Semaphore>>,
}

impl SessionLoop {
    /// Create a session that starts now
    #[must_use]
    pub fn new(
        channel: Arc<dyn Channel>,
        handler: Arc<dyn MessageHandler>,
        store: Arc<dyn CursorStore>,
        identity: Identity,
        config: SessionConfig,
    ) -> Self {
        let limiter = config
            .max_concurrent_handlers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Self {
            channel,
            handler,
            store,
            identity,
            config,
            state: SessionState::new(now_millis()),
            cursor: None,
            phase: Phase::Disconnected,
            limiter,
        }
    }

    /// Override the startup time used as backlog cutoff
    #[must_use]
    pub const fn with_startup_time(mut self, startup_time: i64) -> Self {
        self.state = SessionState::new(startup_time);
        self
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// The resumption cursor currently held in memory
    #[must_use]
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Run until cancelled or the credential is rejected
    ///
    /// Returns `Ok(())` on cancellation. The stored cursor is kept on
    /// cancellation and cleared on credential rejection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the credential is rejected, or the
    /// connection error if the initial connect fails for another reason
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.cursor = match self.store.load() {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load resumption cursor, starting fresh");
                None
            }
        };
        if let Some(cursor) = &self.cursor {
            tracing::info!(cursor = %cursor, "resuming from stored cursor");
        }

        self.phase = Phase::Authenticating;
        let connected = tokio::select! {
            () = cancel.cancelled() => None,
            result = self.channel.connect() => Some(result),
        };

        let Some(connected) = connected else {
            self.terminate();
            return Ok(());
        };

        if let Err(e) = connected {
            if e.is_auth_failure() {
                return Err(self.reject_credential(e));
            }
            self.phase = Phase::Disconnected;
            return Err(e);
        }

        tracing::info!(
            channel = self.channel.name(),
            user = %self.identity,
            startup_time = self.state.startup_time(),
            "session started"
        );

        loop {
            self.phase = Phase::Streaming;
            match self.consume(cancel).await {
                StreamEnd::Cancelled => {
                    self.persist_cursor();
                    self.terminate();
                    return Ok(());
                }
                StreamEnd::Failed(e) if e.is_auth_failure() => {
                    return Err(self.reject_credential(e));
                }
                StreamEnd::Failed(e) => {
                    tracing::warn!(error = %e, "event stream failed, reconnecting");
                }
                StreamEnd::Closed => {
                    tracing::warn!("event stream ended without error, reconnecting");
                }
            }

            self.persist_cursor();
            self.phase = Phase::Backoff;

            tokio::select! {
                () = cancel.cancelled() => {
                    self.terminate();
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Read one stream until it ends
    async fn consume(&mut self, cancel: &CancellationToken) -> StreamEnd {
        let mut stream = self.channel.stream_events(self.cursor.clone());

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };

            match item {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(SyncItem::Cursor(cursor))) => {
                    if self.cursor.as_deref() != Some(cursor.as_str()) {
                        self.cursor = Some(cursor);
                        self.persist_cursor();
                    }
                }
                Some(Ok(SyncItem::Event(event))) => self.on_event(event),
            }
        }
    }

    /// Filter one event and route it
    fn on_event(&mut self, event: Event) {
        if !self.state.admit(event.timestamp) {
            tracing::trace!(event_id = %event.id, timestamp = event.timestamp, "skipping stale event");
            return;
        }

        if event.is_invite_for(self.identity.as_str()) {
            self.spawn_join(event.room_id);
            return;
        }

        if event.is_message() && !self.identity.is(&event.sender_id) {
            self.dispatch(event);
        }
    }

    /// Join a room we were invited to without holding up intake
    fn spawn_join(&self, room_id: String) {
        let channel = Arc::clone(&self.channel);
        tracing::info!(room = %room_id, "invited, joining");

        tokio::spawn(async move {
            if let Err(e) = channel.join(&room_id).await {
                tracing::warn!(room = %room_id, error = %e, "failed to join after invite");
            }
        });
    }

    /// Hand a message to the handler on its own task
    fn dispatch(&self, event: Event) {
        let handler = Arc::clone(&self.handler);
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let room = event.room_id.clone();
            let event_id = event.id.clone();
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(room = %room, event_id = %event_id, error = %e, "message handling failed");
            }
        });
    }

    fn persist_cursor(&self) {
        let Some(cursor) = &self.cursor else {
            return;
        };
        if let Err(e) = self.store.save(cursor) {
            tracing::warn!(error = %e, "failed to persist resumption cursor");
        }
    }

    /// Forget the cursor everywhere and end the session
    fn reject_credential(&mut self, e: Error) -> Error {
        tracing::error!(error = %e, "credential rejected, ending session");
        self.cursor = None;
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear resumption cursor");
        }
        self.phase = Phase::Terminated;

        match e {
            Error::Auth(_) => e,
            other => Error::Auth(other.to_string()),
        }
    }

    fn terminate(&mut self) {
        tracing::info!("session stopped");
        self.phase = Phase::Terminated;
    }
}
