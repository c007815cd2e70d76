//! Matrix channel adapter using Client-Server API
//!
//! Uses the Matrix Client-Server API with long-polling /sync for receiving events

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Channel, EventStream, NewRoom, SyncItem};
use crate::event::{Event, EventKind, Membership};
use crate::identity::Identity;
use crate::{Error, Result};

/// Long-poll duration requested from /sync
const SYNC_POLL_TIMEOUT_MS: u64 = 30_000;

/// Client-side bound on a single /sync request
const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on any other homeserver request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the startup connectivity probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra history events requested to make up for filtered ones
const HISTORY_OVERFETCH: usize = 10;

/// Matrix channel adapter
pub struct MatrixChannel {
    homeserver_url: String,
    user_id: String,
    password: Option<SecretString>,
    access_token: RwLock<SecretString>,
    client: reqwest::Client,
}

/// Matrix sync response
#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Option<RoomsResponse>,
}

/// Rooms in sync response
#[derive(Debug, Default, Deserialize)]
struct RoomsResponse {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, InvitedRoom>,
}

/// A joined room in sync response
#[derive(Debug, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Option<EventList>,
}

/// A room we are invited to
#[derive(Debug, Deserialize)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: Option<EventList>,
}

/// Timeline or stripped state events
#[derive(Debug, Default, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

/// A room event
#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    event_id: Option<String>,
    sender: String,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
}

/// /messages response
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<RoomEvent>,
}

/// /joined_members response
#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, serde_json::Value>,
}

/// /joined_rooms response
#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
    #[serde(default)]
    joined_rooms: Vec<String>,
}

/// /createRoom response
#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: String,
}

/// Login response
#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
}

/// Whoami response
#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

/// Password login request
#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    login_type: &'a str,
    identifier: UserIdentifier<'a>,
    password: &'a str,
}

/// User identifier for password login
#[derive(Debug, Serialize)]
struct UserIdentifier<'a> {
    #[serde(rename = "type")]
    id_type: &'a str,
    user: &'a str,
}

/// Message send request
#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    msgtype: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    formatted_body: Option<String>,
}

/// Typing notification request
#[derive(Debug, Serialize)]
struct TypingRequest {
    typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

/// Invite request
#[derive(Debug, Serialize)]
struct InviteRequest<'a> {
    user_id: &'a str,
}

/// Room creation request
#[derive(Debug, Serialize)]
struct CreateRoomRequest<'a> {
    preset: &'a str,
    name: &'a str,
    topic: &'a str,
    invite: &'a [String],
    is_direct: bool,
}

impl MatrixChannel {
    /// Create a new Matrix channel adapter
    ///
    /// # Arguments
    ///
    /// * `homeserver_url` - Matrix homeserver URL (e.g., "<https://matrix.org>")
    /// * `user_id` - Full Matrix user ID (e.g., "@bot:matrix.org")
    /// * `access_token` - Access token; may be empty when a password is given
    /// * `password` - Password for a fresh login on every connect
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        homeserver_url: &str,
        user_id: impl Into<String>,
        access_token: SecretString,
        password: Option<SecretString>,
    ) -> Result<Self> {
        // Normalize homeserver URL (remove trailing slash)
        let homeserver_url = homeserver_url.trim_end_matches('/').to_string();

        // The /sync long poll and the probe override this per request
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            homeserver_url,
            user_id: user_id.into(),
            password,
            access_token: RwLock::new(access_token),
            client,
        })
    }

    /// Build API endpoint URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.homeserver_url, path)
    }

    /// Current access token
    fn token(&self) -> String {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .expose_secret()
            .to_string()
    }

    /// Log in with the configured password and store the new access token
    async fn login(&self, password: &SecretString) -> Result<()> {
        let localpart = Identity::new(self.user_id.as_str()).local_name().to_string();
        tracing::info!(user = %localpart, "Matrix password login");

        let request = LoginRequest {
            login_type: "m.login.password",
            identifier: UserIdentifier {
                id_type: "m.id.user",
                user: &localpart,
            },
            password: password.expose_secret(),
        };

        let response = self
            .client
            .post(self.api_url("/login"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Matrix login request failed: {e}")))?;

        let response = check_status(response, Error::Connection).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("Matrix login parse error: {e}")))?;

        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = SecretString::from(login.access_token);
        tracing::info!(user_id = %login.user_id, "Matrix logged in");
        Ok(())
    }

    /// Verify the configured access token
    async fn whoami(&self) -> Result<()> {
        let response = self
            .client
            .get(self.api_url("/account/whoami"))
            .bearer_auth(self.token())
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Matrix request failed: {e}")))?;

        let response = check_status(response, Error::Connection).await?;
        let whoami: WhoamiResponse = response
            .json()
            .await
            .map_err(|e| Error::Connection(format!("Matrix parse error: {e}")))?;

        tracing::info!(
            user_id = %whoami.user_id,
            homeserver = %self.homeserver_url,
            "Matrix authenticated"
        );
        Ok(())
    }

    /// Check connectivity with a short sync in the background
    ///
    /// The result is only logged; startup does not wait for it.
    fn spawn_probe(&self, token: String) {
        let url = format!(
            "{}?timeout=0&filter={}",
            self.api_url("/sync"),
            urlencoding::encode(r#"{"room":{"timeline":{"limit":0}}}"#)
        );
        let client = self.client.clone();

        tokio::spawn(async move {
            match client
                .get(&url)
                .bearer_auth(&token)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(r) if r.status().is_success() => tracing::debug!("Matrix connectivity probe ok"),
                Ok(r) => tracing::warn!(status = %r.status(), "Matrix connectivity probe failed"),
                Err(e) if e.is_timeout() => tracing::debug!("Matrix connectivity probe still pending"),
                Err(e) => tracing::warn!(error = %e, "Matrix connectivity probe failed"),
            }
        });
    }

    /// Generate a transaction ID for message sending
    fn txn_id() -> String {
        format!("relay_{}", uuid::Uuid::new_v4())
    }

    /// Send an authenticated PUT/POST with a JSON body and check the status
    async fn send_json<T: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &T,
        err: fn(String) -> Error,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .request(method, url)
            .bearer_auth(self.token())
            .json(body)
            .send()
            .await
            .map_err(|e| err(format!("request failed: {e}")))?;

        check_status(response, err).await
    }

    /// Send an authenticated GET and check the status
    async fn get(&self, url: &str, err: fn(String) -> Error) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token())
            .send()
            .await
            .map_err(|e| err(format!("request failed: {e}")))?;

        check_status(response, err).await
    }
}

#[async_trait]
impl Channel for MatrixChannel {
    fn name(&self) -> &'static str {
        "matrix"
    }

    async fn connect(&self) -> Result<()> {
        // Prefer a fresh login; a stored token may have expired
        if let Some(password) = &self.password {
            self.login(password).await?;
        } else if self.token().is_empty() {
            return Err(Error::Auth(
                "no access token or password available".to_string(),
            ));
        } else {
            self.whoami().await?;
        }

        self.spawn_probe(self.token());
        tracing::info!("Matrix channel connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // A configured access token outlives the process; only end sessions we created
        if self.password.is_some() {
            self.send_json(
                reqwest::Method::POST,
                &self.api_url("/logout"),
                &serde_json::json!({}),
                Error::Connection,
            )
            .await?;
        }

        tracing::info!("Matrix channel disconnected");
        Ok(())
    }

    fn stream_events(&self, since: Option<String>) -> EventStream {
        let (tx, rx) = mpsc::channel(100);
        let sync_url = self.api_url("/sync");
        let client = self.client.clone();

        tokio::spawn(sync_loop(client, sync_url, self.token(), since, tx));

        Box::pin(ReceiverStream::new(rx))
    }

    async fn send(&self, room_id: &str, text: &str) -> Result<()> {
        let url = format!(
            "{}/rooms/{}/send/m.room.message/{}",
            self.api_url(""),
            urlencoding::encode(room_id),
            Self::txn_id()
        );

        // Add an HTML rendering when the reply carries code blocks
        let (format, formatted_body) = if text.contains("```") {
            (Some("org.matrix.custom.html"), Some(convert_to_html(text)))
        } else {
            (None, None)
        };

        let request = MessageRequest {
            msgtype: "m.text",
            body: text,
            format,
            formatted_body,
        };

        self.send_json(reqwest::Method::PUT, &url, &request, Error::Send)
            .await?;

        tracing::debug!(room = %room_id, "Matrix message sent");
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, typing: bool, timeout_ms: u64) -> Result<()> {
        let url = format!(
            "{}/rooms/{}/typing/{}",
            self.api_url(""),
            urlencoding::encode(room_id),
            urlencoding::encode(&self.user_id)
        );

        let request = TypingRequest {
            typing,
            timeout: typing.then_some(timeout_ms),
        };

        self.send_json(reqwest::Method::PUT, &url, &request, Error::Send)
            .await?;
        Ok(())
    }

    async fn join(&self, room_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/join/{}", urlencoding::encode(room_id)));
        self.send_json(
            reqwest::Method::POST,
            &url,
            &serde_json::json!({}),
            Error::Join,
        )
        .await?;

        tracing::info!(room = %room_id, "Matrix room joined");
        Ok(())
    }

    async fn invite(&self, room_id: &str, user_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/rooms/{}/invite", urlencoding::encode(room_id)));
        self.send_json(
            reqwest::Method::POST,
            &url,
            &InviteRequest { user_id },
            Error::Invite,
        )
        .await?;
        Ok(())
    }

    async fn create_room(&self, room: &NewRoom) -> Result<String> {
        let request = CreateRoomRequest {
            preset: "private_chat",
            name: &room.name,
            topic: &room.topic,
            invite: &room.invitees,
            is_direct: room.is_direct,
        };

        let response = self
            .send_json(
                reqwest::Method::POST,
                &self.api_url("/createRoom"),
                &request,
                Error::Create,
            )
            .await?;

        let created: CreateRoomResponse = response
            .json()
            .await
            .map_err(|e| Error::Create(format!("Matrix parse error: {e}")))?;
        Ok(created.room_id)
    }

    async fn fetch_history(&self, room_id: &str, count: usize) -> Result<Vec<Event>> {
        let filter = urlencoding::encode(r#"{"types":["m.room.message"]}"#);
        let url = format!(
            "{}?dir=b&limit={}&filter={filter}",
            self.api_url(&format!("/rooms/{}/messages", urlencoding::encode(room_id))),
            count + HISTORY_OVERFETCH
        );

        let response = self.get(&url, Error::Fetch).await?;
        let messages: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("Matrix parse error: {e}")))?;

        let events: Vec<Event> = messages
            .chunk
            .into_iter()
            .map(|raw| to_event(room_id, raw))
            .filter(|event| event.is_message() && !event.body.is_empty())
            .take(count)
            .collect();

        if events.is_empty() {
            tracing::warn!(room = %room_id, "no usable messages in room history");
        }

        Ok(events)
    }

    async fn fetch_membership(&self, room_id: &str) -> Result<usize> {
        let url = self.api_url(&format!(
            "/rooms/{}/joined_members",
            urlencoding::encode(room_id)
        ));

        let response = self.get(&url, Error::Fetch).await?;
        let members: JoinedMembersResponse = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("Matrix parse error: {e}")))?;
        Ok(members.joined.len())
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let response = self.get(&self.api_url("/joined_rooms"), Error::Fetch).await?;
        let rooms: JoinedRoomsResponse = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("Matrix parse error: {e}")))?;
        Ok(rooms.joined_rooms)
    }
}

/// Long-poll /sync until a request fails or the receiver goes away
async fn sync_loop(
    client: reqwest::Client,
    sync_url: String,
    access_token: String,
    since: Option<String>,
    tx: mpsc::Sender<Result<SyncItem>>,
) {
    let mut current = since;

    loop {
        let mut url = format!("{sync_url}?timeout={SYNC_POLL_TIMEOUT_MS}");
        if let Some(token) = &current {
            use std::fmt::Write;
            let _ = write!(url, "&since={}", urlencoding::encode(token));
        }

        let sync = match poll_once(&client, &url, &access_token).await {
            Ok(sync) => sync,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let next_batch = sync.next_batch.clone();
        for event in events_from_sync(sync) {
            if tx.send(Ok(SyncItem::Event(event))).await.is_err() {
                return;
            }
        }

        if tx.send(Ok(SyncItem::Cursor(next_batch.clone()))).await.is_err() {
            return;
        }
        current = Some(next_batch);
    }
}

/// One /sync request
async fn poll_once(client: &reqwest::Client, url: &str, access_token: &str) -> Result<SyncResponse> {
    let response = client
        .get(url)
        .bearer_auth(access_token)
        .timeout(SYNC_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Stream(format!("Matrix sync request failed: {e}")))?;

    let response = check_status(response, Error::Stream).await?;
    response
        .json()
        .await
        .map_err(|e| Error::Stream(format!("Matrix sync parse error: {e}")))
}

/// Flatten a sync response into events, oldest first
///
/// Invites carry stripped state without timestamps and come first.
fn events_from_sync(sync: SyncResponse) -> Vec<Event> {
    let Some(rooms) = sync.rooms else {
        return Vec::new();
    };

    let mut events = Vec::new();

    for (room_id, room) in rooms.invite {
        for raw in room.invite_state.unwrap_or_default().events {
            events.push(to_event(&room_id, raw));
        }
    }

    for (room_id, room) in rooms.join {
        for raw in room.timeline.unwrap_or_default().events {
            events.push(to_event(&room_id, raw));
        }
    }

    events.sort_by_key(|event| event.timestamp);
    events
}

/// Convert a wire event into the relay's event model
fn to_event(room_id: &str, raw: RoomEvent) -> Event {
    let text = |key: &str| {
        raw.content
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
    };

    let (kind, body) = match raw.event_type.as_str() {
        "m.room.message" => (EventKind::Message, text("body").unwrap_or_default()),
        "m.room.member" => {
            let membership = text("membership").and_then(|m| Membership::parse(&m));
            match (membership, raw.state_key.clone()) {
                (Some(membership), Some(target)) => {
                    (EventKind::Membership { membership, target }, String::new())
                }
                _ => (EventKind::Other(raw.event_type.clone()), String::new()),
            }
        }
        other => (EventKind::Other(other.to_string()), String::new()),
    };

    Event {
        id: raw.event_id.unwrap_or_default(),
        room_id: room_id.to_string(),
        sender_id: raw.sender,
        kind,
        timestamp: raw.origin_server_ts,
        body,
    }
}

/// Map a non-success response to an error
///
/// Rejected credentials become [`Error::Auth`]; anything else goes through `err`.
async fn check_status(
    response: reqwest::Response,
    err: fn(String) -> Error,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || body.contains("M_UNKNOWN_TOKEN") {
        return Err(Error::Auth(format!("{status} - {body}")));
    }

    Err(err(format!("{status} - {body}")))
}

/// Convert markdown content to HTML for Matrix `formatted_body`
fn convert_to_html(content: &str) -> String {
    use std::fmt::Write;

    let mut html = String::new();
    let mut in_code_block = false;
    let mut code_lang = String::new();
    let mut code_content = String::new();

    for line in content.lines() {
        if line.starts_with("```") {
            if in_code_block {
                let escaped_code = html_escape(&code_content);
                if code_lang.is_empty() {
                    let _ = write!(html, "<pre><code>{}</code></pre>", escaped_code.trim());
                } else {
                    let _ = write!(
                        html,
                        "<pre><code class=\"language-{}\">{}</code></pre>",
                        html_escape(&code_lang),
                        escaped_code.trim()
                    );
                }
                code_content.clear();
                code_lang.clear();
                in_code_block = false;
            } else {
                code_lang = line.trim_start_matches('`').to_string();
                in_code_block = true;
            }
        } else if in_code_block {
            if !code_content.is_empty() {
                code_content.push('\n');
            }
            code_content.push_str(line);
        } else {
            if !html.is_empty() && !html.ends_with("</pre>") {
                html.push_str("<br>");
            }
            html.push_str(&html_escape(line));
        }
    }

    html
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
