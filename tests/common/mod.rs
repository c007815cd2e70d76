//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_relay::{
    Channel, ConversationMessage, CursorStore, Error, Event, EventStream, Generator,
    MessageHandler, NewRoom, Result, SyncItem,
};
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, Notify};

pub const BOT: &str = "@henry:example.org";
pub const ALICE: &str = "@alice:example.org";
pub const ROOM: &str = "!room:example.org";

/// Mock transport with scripted streams and recorded calls
#[derive(Default)]
pub struct MockChannel {
    /// One entry per `stream_events` call; once exhausted the stream stays open
    pub scripts: std::sync::Mutex<VecDeque<Vec<Result<SyncItem>>>>,
    /// `since` argument of every `stream_events` call
    pub stream_calls: std::sync::Mutex<Vec<Option<String>>>,
    pub connect_error: std::sync::Mutex<Option<Error>>,

    pub members: usize,
    pub membership_fails: bool,
    pub history: Vec<Event>,
    pub history_fails: bool,
    pub history_delay: Option<Duration>,
    pub typing_fails: bool,
    pub join_fails: bool,
    /// Membership lookups for this room never complete
    pub stalled_room: Option<&'static str>,
    /// `joined_rooms` never completes
    pub rooms_hang: bool,

    pub sent: Mutex<Vec<(String, String)>>,
    pub typing: Mutex<Vec<(String, bool)>>,
    pub joined: Mutex<Vec<String>>,
    pub invited: Mutex<Vec<(String, String)>>,
    pub created: Mutex<Vec<NewRoom>>,
    pub membership_calls: Mutex<usize>,
}

impl MockChannel {
    /// A channel whose rooms have `members` joined members
    pub fn with_members(members: usize) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    /// Queue the items of the next stream
    pub fn script(&self, items: Vec<Result<SyncItem>>) {
        self.scripts.lock().unwrap().push_back(items);
    }

    pub fn fail_connect(&self, error: Error) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    pub fn stream_calls(&self) -> Vec<Option<String>> {
        self.stream_calls.lock().unwrap().clone()
    }

    pub async fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        match self.connect_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn stream_events(&self, since: Option<String>) -> EventStream {
        self.stream_calls.lock().unwrap().push(since);
        match self.scripts.lock().unwrap().pop_front() {
            Some(items) => stream::iter(items).boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn send(&self, room_id: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((room_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, typing: bool, _timeout_ms: u64) -> Result<()> {
        if self.typing_fails {
            return Err(Error::Send("typing rejected".to_string()));
        }
        self.typing.lock().await.push((room_id.to_string(), typing));
        Ok(())
    }

    async fn join(&self, room_id: &str) -> Result<()> {
        if self.join_fails {
            return Err(Error::Join("join rejected".to_string()));
        }
        self.joined.lock().await.push(room_id.to_string());
        Ok(())
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.invited
            .lock()
            .await
            .push((room_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn create_room(&self, room: &NewRoom) -> Result<String> {
        let mut created = self.created.lock().await;
        created.push(room.clone());
        Ok(format!("!created{}:example.org", created.len()))
    }

    async fn fetch_history(&self, _room_id: &str, count: usize) -> Result<Vec<Event>> {
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        if self.history_fails {
            return Err(Error::Fetch("history unavailable".to_string()));
        }
        Ok(self.history.iter().take(count).cloned().collect())
    }

    async fn fetch_membership(&self, room_id: &str) -> Result<usize> {
        *self.membership_calls.lock().await += 1;
        if self.stalled_room == Some(room_id) {
            std::future::pending::<()>().await;
        }
        if self.membership_fails {
            return Err(Error::Fetch("members unavailable".to_string()));
        }
        Ok(self.members)
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        if self.rooms_hang {
            std::future::pending::<()>().await;
        }
        Ok(vec![ROOM.to_string()])
    }
}

/// Mock generator returning a fixed reply or failing
pub struct MockGenerator {
    reply: Option<String>,
    delay: Option<Duration>,
    pub calls: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl MockGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn contexts(&self) -> Vec<Vec<ConversationMessage>> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, context: &[ConversationMessage]) -> Result<String> {
        self.calls.lock().await.push(context.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| Error::Generation("backend unavailable".to_string()))
    }
}

/// In-memory cursor store recording every write
#[derive(Default)]
pub struct MemoryCursorStore {
    value: std::sync::Mutex<Option<String>>,
    writes: std::sync::Mutex<Vec<String>>,
}

impl MemoryCursorStore {
    pub fn holding(cursor: &str) -> Self {
        Self {
            value: std::sync::Mutex::new(Some(cursor.to_string())),
            writes: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.value.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.value())
    }

    fn save(&self, cursor: &str) -> Result<()> {
        self.writes.lock().unwrap().push(cursor.to_string());
        *self.value.lock().unwrap() = (!cursor.is_empty()).then(|| cursor.to_string());
        Ok(())
    }
}

/// Handler recording every event it receives
///
/// With a gate, each call records its event and then waits on the gate
/// forever, simulating a stuck backend.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<Event>>,
    gate: Option<Arc<Notify>>,
}

impl RecordingHandler {
    pub fn blocking() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            gate: Some(Arc::new(Notify::new())),
        }
    }

    pub async fn bodies(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, event: Event) -> Result<()> {
        self.events.lock().await.push(event);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn message(id: &str, sender: &str, ts: i64, body: &str) -> Result<SyncItem> {
    Ok(SyncItem::Event(Event::message(id, ROOM, sender, ts, body)))
}

pub fn cursor(token: &str) -> Result<SyncItem> {
    Ok(SyncItem::Cursor(token.to_string()))
}
