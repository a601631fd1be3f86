use chatquota_ipc::{BusEvent, InboundMessage, MediaKind, MemberStatus, SenderInfo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub my_chat_member: Option<TelegramChatMemberUpdated>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramFile>>,
    #[serde(default)]
    pub sticker: Option<TelegramFile>,
    #[serde(default)]
    pub animation: Option<TelegramFile>,
    #[serde(default)]
    pub video: Option<TelegramFile>,
    #[serde(default)]
    pub video_note: Option<TelegramFile>,
    #[serde(default)]
    pub voice: Option<TelegramFile>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
    #[serde(default)]
    pub audio: Option<TelegramFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
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

/// The bot's own membership changed in a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChatMemberUpdated {
    pub chat: TelegramChat,
    pub new_chat_member: TelegramChatMember,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChatMember {
    pub status: String,
    #[serde(default)]
    pub user: Option<TelegramUser>,
}

impl TelegramMessage {
    pub fn media_kind(&self) -> Option<MediaKind> {
        if self.photo.as_ref().is_some_and(|sizes| !sizes.is_empty()) {
            Some(MediaKind::Photo)
        } else if self.sticker.is_some() {
            Some(MediaKind::Sticker)
        } else if self.animation.is_some() {
            // Animations also carry a `document` field.
            Some(MediaKind::Animation)
        } else if self.video.is_some() {
            Some(MediaKind::Video)
        } else if self.video_note.is_some() {
            Some(MediaKind::VideoNote)
        } else if self.voice.is_some() {
            Some(MediaKind::Voice)
        } else if self.document.is_some() {
            Some(MediaKind::Document)
        } else if self.audio.is_some() {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    /// Service messages without text or media yield `None`.
    pub fn to_inbound(&self) -> Option<InboundMessage> {
        let media = self.media_kind();
        if self.text.is_none() && self.caption.is_none() && media.is_none() {
            return None;
        }

        let mut inbound = InboundMessage::new("telegram", self.chat.id, self.message_id);
        inbound.room_title = self.chat.title.clone();
        inbound.sender = self.from.as_ref().map(|user| SenderInfo {
            id: user.id,
            is_bot: user.is_bot,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        });
        inbound.text = self.text.clone();
        inbound.caption = self.caption.clone();
        inbound.media = media;
        inbound.album_id = self.media_group_id.clone();
        Some(inbound)
    }
}

impl TelegramUpdate {
    pub fn to_event(&self) -> Option<BusEvent> {
        if let Some(message) = &self.message {
            return message.to_inbound().map(BusEvent::Message);
        }
        self.my_chat_member.as_ref().map(|change| BusEvent::BotMembership {
            room_id: change.chat.id,
            room_title: change.chat.title.clone(),
            status: MemberStatus::parse(&change.new_chat_member.status)
                .unwrap_or(MemberStatus::Member),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> TelegramUpdate {
        serde_json::from_str(json).expect("valid update")
    }

    #[test]
    fn album_photo_becomes_inbound_media() {
        let event = update(
            r#"{
                "update_id": 10,
                "message": {
                    "message_id": 501,
                    "chat": {"id": -1001234567890, "type": "supergroup", "title": "Market"},
                    "from": {"id": 42, "is_bot": false, "first_name": "Ivan", "username": "ivan"},
                    "media_group_id": "13579",
                    "photo": [{"file_id": "small"}, {"file_id": "large"}]
                }
            }"#,
        )
        .to_event();

        let Some(BusEvent::Message(message)) = event else {
            panic!("expected message event");
        };
        assert_eq!(message.room_id, -1001234567890);
        assert_eq!(message.room_title.as_deref(), Some("Market"));
        assert_eq!(message.media, Some(MediaKind::Photo));
        assert_eq!(message.album_id.as_deref(), Some("13579"));
        assert!(message.has_media_without_caption());
        let sender = message.sender.expect("sender");
        assert_eq!(sender.id, 42);
        assert_eq!(sender.username.as_deref(), Some("ivan"));
    }

    #[test]
    fn animation_wins_over_its_document() {
        let message: TelegramMessage = serde_json::from_str(
            r#"{
                "message_id": 7,
                "chat": {"id": -1001, "type": "group"},
                "animation": {"file_id": "gif"},
                "document": {"file_id": "gif"},
                "caption": "Продаю"
            }"#,
        )
        .expect("valid message");
        assert_eq!(message.media_kind(), Some(MediaKind::Animation));
        let inbound = message.to_inbound().expect("inbound");
        assert_eq!(inbound.body_text(), "Продаю");
    }

    #[test]
    fn service_messages_are_dropped() {
        let event = update(
            r#"{
                "update_id": 11,
                "message": {
                    "message_id": 502,
                    "chat": {"id": -1001234567890, "type": "supergroup"},
                    "from": {"id": 42}
                }
            }"#,
        )
        .to_event();
        assert!(event.is_none());
    }

    #[test]
    fn bot_membership_change_is_forwarded() {
        let event = update(
            r#"{
                "update_id": 12,
                "my_chat_member": {
                    "chat": {"id": -1001234567890, "type": "supergroup", "title": "Market"},
                    "from": {"id": 1},
                    "new_chat_member": {"status": "left", "user": {"id": 999, "is_bot": true}}
                }
            }"#,
        )
        .to_event();

        match event {
            Some(BusEvent::BotMembership {
                room_id, status, ..
            }) => {
                assert_eq!(room_id, -1001234567890);
                assert_eq!(status, MemberStatus::Left);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
