//! Messaging transport
//!
//! The relay talks to the messaging network only through the [`Channel`]
//! trait. Events arrive as a pull-based stream that ends with either nothing
//! (clean termination) or an error.

mod matrix;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use matrix::MatrixChannel;

use crate::Result;
use crate::event::Event;

/// An item yielded by a live event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncItem {
    /// An event delivered by the homeserver
    Event(Event),
    /// End of a stream segment; everything up to this cursor has been delivered
    Cursor(String),
}

/// Live event stream
///
/// `None` means the stream ended without an error; `Some(Err(_))` is the
/// terminating error and no further items follow it.
pub type EventStream = BoxStream<'static, Result<SyncItem>>;

/// Parameters for creating a room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRoom {
    pub name: String,
    pub topic: String,
    pub invitees: Vec<String>,
    pub is_direct: bool,
}

/// Trait for messaging transports
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &'static str;

    /// Authenticate and prepare the session
    ///
    /// A rejected credential must be reported as [`crate::Error::Auth`].
    async fn connect(&self) -> Result<()>;

    /// End the session
    async fn disconnect(&self) -> Result<()>;

    /// Open a live event stream, resuming after `since` when given
    fn stream_events(&self, since: Option<String>) -> EventStream;

    /// Send a text message to a room
    async fn send(&self, room_id: &str, text: &str) -> Result<()>;

    /// Start or stop the typing indicator
    async fn set_typing(&self, room_id: &str, typing: bool, timeout_ms: u64) -> Result<()>;

    /// Join a room by id or alias
    async fn join(&self, room_id: &str) -> Result<()>;

    /// Invite a user into a room
    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()>;

    /// Create a room and return its id
    async fn create_room(&self, room: &NewRoom) -> Result<String>;

    /// Fetch up to `count` recent message events, newest first
    async fn fetch_history(&self, room_id: &str, count: usize) -> Result<Vec<Event>>;

    /// Count the joined members of a room
    async fn fetch_membership(&self, room_id: &str) -> Result<usize>;

    /// List the rooms this identity has joined
    async fn joined_rooms(&self) -> Result<Vec<String>>;
}
