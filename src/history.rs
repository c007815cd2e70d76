//! Conversation window assembly
//!
//! Turns a reverse-chronological, possibly incomplete history fetch into an
//! ordered, deduplicated, role-tagged context window ending with the message
//! currently being answered.

use std::future::Future;

use crate::event::{ConversationMessage, Event, RoomType};
use crate::identity::Identity;
use crate::mention::strip_mentions;
use crate::Result;

/// Two entries with equal content and sender this close together are the same message
pub const DEDUP_WINDOW_MS: i64 = 5000;

/// The message being answered and where it came from
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub room_id: &'a str,
    pub room_type: RoomType,
    pub sender_id: &'a str,
    /// Text to answer, already stripped of the assistant's mentions
    pub current_message: &'a str,
    /// Milliseconds since the Unix epoch
    pub current_timestamp: i64,
    /// Number of prior messages to request
    pub window_size: usize,
}

/// Build the context window for `request`
///
/// `fetch` is called once with the room id and window size and must return
/// message events newest first. A failed fetch degrades to a window holding
/// only the current message; the error is logged, never returned.
pub async fn build_context<F, Fut>(
    request: &ContextRequest<'_>,
    identity: &Identity,
    fetch: F,
) -> Vec<ConversationMessage>
where
    F: FnOnce(String, usize) -> Fut,
    Fut: Future<Output = Result<Vec<Event>>>,
{
    let history = match fetch(request.room_id.to_string(), request.window_size).await {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(room = %request.room_id, error = %e, "history fetch failed, using current message only");
            Vec::new()
        }
    };

    let fetched = history.len();
    let mut window = reconcile(history, request.window_size, request.room_type, identity);
    tracing::debug!(
        room = %request.room_id,
        fetched,
        kept = window.len(),
        "reconciled room history"
    );

    append_current(&mut window, request);
    window
}

/// Convert newest-first history into chronological conversation messages
///
/// Keeps at most `window_size` of the newest message events, drops empty
/// bodies, tags roles, and in group rooms strips the assistant's mentions
/// from user messages (dropping any that become empty).
#[must_use]
pub fn reconcile(
    history: Vec<Event>,
    window_size: usize,
    room_type: RoomType,
    identity: &Identity,
) -> Vec<ConversationMessage> {
    let mut window: Vec<ConversationMessage> = history
        .into_iter()
        .filter(|event| event.is_message() && !event.body.is_empty())
        .take(window_size)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .filter_map(|event| to_conversation_message(event, room_type, identity))
        .collect();

    // Stable, so equal timestamps keep delivery order
    window.sort_by_key(|message| message.timestamp);
    window
}

fn to_conversation_message(
    event: Event,
    room_type: RoomType,
    identity: &Identity,
) -> Option<ConversationMessage> {
    if identity.is(&event.sender_id) {
        return Some(ConversationMessage::assistant(
            event.body,
            event.timestamp,
            event.sender_id,
        ));
    }

    let content = match room_type {
        RoomType::Group => strip_mentions(&event.body, identity),
        RoomType::Direct => event.body,
    };

    if content.is_empty() {
        return None;
    }

    Some(ConversationMessage::user(
        content,
        event.timestamp,
        event.sender_id,
    ))
}

/// Append the current message unless history already ends with it
fn append_current(window: &mut Vec<ConversationMessage>, request: &ContextRequest<'_>) {
    let already_present = window.last().is_some_and(|last| {
        last.content == request.current_message
            && last.sender_id == request.sender_id
            && last.timestamp.abs_diff(request.current_timestamp) < DEDUP_WINDOW_MS.unsigned_abs()
    });

    if already_present {
        tracing::debug!(room = %request.room_id, "current message already in history");
        return;
    }

    window.push(ConversationMessage::user(
        request.current_message,
        request.current_timestamp,
        request.sender_id,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Membership, Role};
    use crate::Error;

    const ROOM: &str = "!room:example.org";
    const BOT: &str = "@henry:example.org";
    const ALICE: &str = "@alice:example.org";

    fn identity() -> Identity {
        Identity::new(BOT)
    }

    fn msg(id: &str, sender: &str, ts: i64, body: &str) -> Event {
        Event::message(id, ROOM, sender, ts, body)
    }

    fn request<'a>(room_type: RoomType, current: &'a str, ts: i64) -> ContextRequest<'a> {
        ContextRequest {
            room_id: ROOM,
            room_type,
            sender_id: ALICE,
            current_message: current,
            current_timestamp: ts,
            window_size: 10,
        }
    }

    async fn build(req: &ContextRequest<'_>, history: Vec<Event>) -> Vec<ConversationMessage> {
        build_context(req, &identity(), |_, _| async move { Ok(history) }).await
    }

    #[tokio::test]
    async fn history_is_returned_oldest_first() {
        let history = vec![
            msg("$3", ALICE, 3000, "third"),
            msg("$2", BOT, 2000, "second"),
            msg("$1", ALICE, 1000, "first"),
        ];
        let req = request(RoomType::Direct, "fourth", 100_000);

        let window = build(&req, history).await;
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third", "fourth"]);
        assert!(window.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn roles_follow_sender() {
        let history = vec![msg("$2", BOT, 2000, "hi there"), msg("$1", ALICE, 1000, "hello")];
        let req = request(RoomType::Direct, "how are you", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window[0].role, Role::User);
        assert_eq!(window[1].role, Role::Assistant);
        assert_eq!(window[2].role, Role::User);
    }

    #[tokio::test]
    async fn empty_bodies_and_non_messages_are_dropped() {
        let history = vec![
            msg("$3", ALICE, 3000, ""),
            Event::membership("$2", ROOM, ALICE, 2000, Membership::Join, ALICE),
            msg("$1", ALICE, 1000, "kept"),
        ];
        let req = request(RoomType::Direct, "now", 100_000);

        let window = build(&req, history).await;
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["kept", "now"]);
    }

    #[tokio::test]
    async fn all_non_message_history_degrades_to_current() {
        let history = vec![
            Event::membership("$2", ROOM, ALICE, 2000, Membership::Join, ALICE),
            Event::membership("$1", ROOM, BOT, 1000, Membership::Join, BOT),
        ];
        let req = request(RoomType::Group, "question", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "question");
    }

    #[tokio::test]
    async fn fetch_failure_yields_current_message_only() {
        let req = request(RoomType::Direct, "hello", 100_000);
        let window = build_context(&req, &identity(), |_, _| async {
            Err(Error::Fetch("homeserver unavailable".to_string()))
        })
        .await;

        assert_eq!(window, vec![ConversationMessage::user("hello", 100_000, ALICE)]);
    }

    #[tokio::test]
    async fn fetch_receives_room_and_window_size() {
        let req = request(RoomType::Direct, "hello", 100_000);
        let window = build_context(&req, &identity(), |room, count| async move {
            assert_eq!(room, ROOM);
            assert_eq!(count, 10);
            Ok(Vec::new())
        })
        .await;
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn group_history_has_mentions_stripped() {
        let history = vec![
            msg("$2", ALICE, 2000, "henry"),
            msg("$1", ALICE, 1000, "henry, what is rust?"),
        ];
        let req = request(RoomType::Group, "thanks", 100_000);

        let window = build(&req, history).await;
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["what is rust?", "thanks"]);
    }

    #[tokio::test]
    async fn direct_history_is_not_stripped() {
        let history = vec![msg("$1", ALICE, 1000, "henry, what is rust?")];
        let req = request(RoomType::Direct, "thanks", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window[0].content, "henry, what is rust?");
    }

    #[tokio::test]
    async fn assistant_messages_are_never_stripped() {
        let history = vec![msg("$1", BOT, 1000, "henry here, at your service")];
        let req = request(RoomType::Group, "thanks", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window[0].content, "henry here, at your service");
    }

    #[tokio::test]
    async fn current_message_in_history_is_not_duplicated() {
        let history = vec![
            msg("$2", ALICE, 99_000, "what time is it"),
            msg("$1", BOT, 50_000, "hello"),
        ];
        let req = request(RoomType::Direct, "what time is it", 100_000);

        let window = build(&req, history).await;
        let matching = window.iter().filter(|m| m.content == "what time is it").count();
        assert_eq!(matching, 1);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn old_identical_message_is_kept_separately() {
        let history = vec![msg("$1", ALICE, 10_000, "ping")];
        let req = request(RoomType::Direct, "ping", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].timestamp, 100_000);
    }

    #[tokio::test]
    async fn identical_text_from_other_sender_is_kept() {
        let history = vec![msg("$1", "@bob:example.org", 99_500, "ping")];
        let req = request(RoomType::Direct, "ping", 100_000);

        let window = build(&req, history).await;
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn window_keeps_newest_events() {
        let history = vec![
            msg("$3", ALICE, 3000, "c"),
            msg("$2", ALICE, 2000, "b"),
            msg("$1", ALICE, 1000, "a"),
        ];
        let window = reconcile(history, 2, RoomType::Direct, &identity());
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["b", "c"]);
    }

    #[test]
    fn out_of_order_delivery_is_sorted_with_stable_ties() {
        let history = vec![
            msg("$4", ALICE, 2000, "late tie"),
            msg("$3", ALICE, 3000, "newest"),
            msg("$2", ALICE, 2000, "early tie"),
            msg("$1", ALICE, 1000, "oldest"),
        ];
        let window = reconcile(history, 10, RoomType::Direct, &identity());
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["oldest", "early tie", "late tie", "newest"]);
    }
}
