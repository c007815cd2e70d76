//! Room events and the conversation messages derived from them

use std::fmt;

use serde::{Deserialize, Serialize};

/// Membership state carried by a membership-change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    /// Parse the wire value of a membership field
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Self::Invite),
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            "knock" => Some(Self::Knock),
            _ => None,
        }
    }
}

/// What an event represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A chat message
    Message,
    /// A membership change for `target`
    Membership {
        membership: Membership,
        target: String,
    },
    /// Any other event type, keyed by its wire type
    Other(String),
}

/// An immutable event delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub kind: EventKind,
    /// Milliseconds since the Unix epoch; 0 when the transport did not provide one
    pub timestamp: i64,
    /// Text body, empty for non-message events
    pub body: String,
}

impl Event {
    /// Create a message event
    #[must_use]
    pub fn message(
        id: impl Into<String>,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        timestamp: i64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            kind: EventKind::Message,
            timestamp,
            body: body.into(),
        }
    }

    /// Create a membership-change event
    #[must_use]
    pub fn membership(
        id: impl Into<String>,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        timestamp: i64,
        membership: Membership,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            kind: EventKind::Membership {
                membership,
                target: target.into(),
            },
            timestamp,
            body: String::new(),
        }
    }

    #[must_use]
    pub const fn is_message(&self) -> bool {
        matches!(self.kind, EventKind::Message)
    }

    /// Whether this is an invitation addressed to `user_id`
    #[must_use]
    pub fn is_invite_for(&self, user_id: &str) -> bool {
        matches!(
            &self.kind,
            EventKind::Membership { membership: Membership::Invite, target } if target == user_id
        )
    }
}

/// Who authored a conversation message, from the model's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in a context window fed to the generation backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub sender_id: String,
}

impl ConversationMessage {
    #[must_use]
    pub fn user(content: impl Into<String>, timestamp: i64, sender_id: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
            sender_id: sender_id.into(),
        }
    }

    #[must_use]
    pub fn assistant(
        content: impl Into<String>,
        timestamp: i64,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
            sender_id: sender_id.into(),
        }
    }
}

/// Whether a room is a one-to-one conversation or a group
///
/// Derived from the joined member count every time it is needed; a room can
/// change type as members join or leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    Direct,
    Group,
}

impl RoomType {
    /// Exactly two joined members make a direct room
    #[must_use]
    pub const fn from_member_count(joined: usize) -> Self {
        if joined == 2 { Self::Direct } else { Self::Group }
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Group => f.write_str("group"),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
