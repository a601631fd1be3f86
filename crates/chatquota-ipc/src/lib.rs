//! chatquota IPC
//!
//! Event bus and platform contract shared by the adapter and the engine

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::info;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub room_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Sticker,
    Animation,
    Video,
    VideoNote,
    Voice,
    Document,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub channel: String,
    pub room_id: i64,
    #[serde(default)]
    pub room_title: Option<String>,
    pub message_id: i64,
    #[serde(default)]
    pub sender: Option<SenderInfo>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media: Option<MediaKind>,
    /// Client-assigned id shared by every message of one album.
    #[serde(default)]
    pub album_id: Option<String>,
}

impl InboundMessage {
    pub fn new(channel: &str, room_id: i64, message_id: i64) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            room_id,
            room_title: None,
            message_id,
            sender: None,
            text: None,
            caption: None,
            media: None,
            album_id: None,
        }
    }

    pub fn with_sender(mut self, sender: SenderInfo) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_room_title(mut self, title: &str) -> Self {
        self.room_title = Some(title.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_caption(mut self, caption: &str) -> Self {
        self.caption = Some(caption.to_string());
        self
    }

    pub fn with_media(mut self, media: MediaKind) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_album_id(mut self, album_id: &str) -> Self {
        self.album_id = Some(album_id.to_string());
        self
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn handle(&self) -> MessageHandle {
        MessageHandle {
            room_id: self.room_id,
            message_id: self.message_id,
        }
    }

    /// Text, else caption, else empty.
    pub fn body_text(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }

    pub fn has_media_without_caption(&self) -> bool {
        self.media.is_some() && self.body_text().trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    pub fn is_admin(&self) -> bool {
        matches!(self, MemberStatus::Creator | MemberStatus::Administrator)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "creator" => Some(MemberStatus::Creator),
            "administrator" => Some(MemberStatus::Administrator),
            "member" => Some(MemberStatus::Member),
            "restricted" => Some(MemberStatus::Restricted),
            "left" => Some(MemberStatus::Left),
            "kicked" => Some(MemberStatus::Kicked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "message")]
    Message(InboundMessage),

    /// The bot's own status in a room changed.
    #[serde(rename = "bot_membership")]
    BotMembership {
        room_id: i64,
        #[serde(default)]
        room_title: Option<String>,
        status: MemberStatus,
    },
}

impl BusEvent {
    /// Trace id for log correlation. Membership changes carry none.
    pub fn trace_id(&self) -> &str {
        match self {
            BusEvent::Message(message) => &message.trace_id,
            BusEvent::BotMembership { .. } => "-",
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictUntil {
    Until(DateTime<Utc>),
    Indefinite,
}

/// Operations the engine issues against the chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn delete_message(&self, handle: MessageHandle) -> Result<()>;

    async fn send_text(&self, room_id: i64, text: &str) -> Result<MessageHandle>;

    async fn restrict_member(&self, room_id: i64, user_id: i64, until: RestrictUntil)
        -> Result<()>;

    async fn unrestrict_member(&self, room_id: i64, user_id: i64) -> Result<()>;

    async fn member_status(&self, room_id: i64, user_id: i64) -> Result<MemberStatus>;
}

/// Platform that only logs. Used when no bot token is configured.
pub struct OfflinePlatform;

#[async_trait]
impl ChatPlatform for OfflinePlatform {
    async fn delete_message(&self, handle: MessageHandle) -> Result<()> {
        info!(
            "offline: delete message {} in room {}",
            handle.message_id, handle.room_id
        );
        Ok(())
    }

    async fn send_text(&self, room_id: i64, text: &str) -> Result<MessageHandle> {
        info!("offline: send to room {}: {}", room_id, text);
        Ok(MessageHandle {
            room_id,
            message_id: 0,
        })
    }

    async fn restrict_member(
        &self,
        room_id: i64,
        user_id: i64,
        until: RestrictUntil,
    ) -> Result<()> {
        info!(
            "offline: restrict user {} in room {} ({:?})",
            user_id, room_id, until
        );
        Ok(())
    }

    async fn unrestrict_member(&self, room_id: i64, user_id: i64) -> Result<()> {
        info!("offline: unrestrict user {} in room {}", user_id, room_id);
        Ok(())
    }

    async fn member_status(&self, _room_id: i64, _user_id: i64) -> Result<MemberStatus> {
        Ok(MemberStatus::Member)
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, event: BusEvent) -> anyhow::Result<()> {
        self.inbound.send(event)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
