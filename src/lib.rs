//! Chat Relay - answers chat messages with a language model
//!
//! This library provides the pieces of the relay:
//! - Mention detection and context-window assembly
//! - A reconnecting event session with a persisted resumption cursor
//! - The per-message reply flow
//! - Matrix and Anthropic adapters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Matrix homeserver                   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ /sync
//! ┌────────────────────▼────────────────────────────────┐
//! │  SessionLoop  →  ReplyHandler  →  history / mention  │
//! │  CursorStore      RoomWatcher                        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Generator (Anthropic)                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod channels;
pub mod config;
pub mod cursor;
pub mod daemon;
pub mod error;
pub mod event;
pub mod history;
pub mod identity;
pub mod llm;
pub mod mention;
pub mod reply;
pub mod rooms;
pub mod session;

pub use channels::{Channel, EventStream, MatrixChannel, NewRoom, SyncItem};
pub use config::Config;
pub use cursor::{CursorStore, FileCursorStore};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use event::{ConversationMessage, Event, EventKind, Membership, Role, RoomType};
pub use identity::Identity;
pub use llm::{AnthropicGenerator, Generator};
pub use reply::ReplyHandler;
pub use session::{MessageHandler, SessionLoop};
