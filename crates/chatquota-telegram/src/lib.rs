//! chatquota Telegram Adapter
//!
//! Bot API long polling with offset persistence and client recreation, plus the
//! moderation actions the engine issues

pub mod updates;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chatquota_config::TelegramConfig;
use chatquota_ipc::{BusEvent, ChatPlatform, EventBus, MemberStatus, MessageHandle, RestrictUntil};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};
use updates::TelegramUpdate;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ChatMemberInfo {
    status: String,
}

pub struct TelegramAdapter {
    client: Client,
    config: TelegramConfig,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            api_url: format!("{}/bot{}", TELEGRAM_API_BASE, config.bot_token),
            config: config.clone(),
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.config.account_tag()))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let path = self.offset_path();
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!("Failed to create runtime dir {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = fs::write(&path, format!("{}\n", offset)).await {
            warn!("Failed to persist Telegram offset: {}", e);
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        client: &Client,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/{}", self.api_url, method);
        let resp = client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow!("telegram {} read failed: {}", method, e))?;
        parse_response(method, status, &body)
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "my_chat_member"],
        });
        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }
        self.call(client, "getUpdates", &payload).await
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                match Self::build_client() {
                    Ok(fresh) => {
                        debug!("Recreated HTTP client to prevent stale connections");
                        client = fresh;
                    }
                    Err(e) => warn!("Keeping previous HTTP client: {}", e),
                }
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;
                self.dispatch(&update);
            }
        }
    }

    fn dispatch(&self, update: &TelegramUpdate) {
        let Some(event) = update.to_event() else {
            return;
        };

        let room_id = match &event {
            BusEvent::Message(message) => message.room_id,
            BusEvent::BotMembership { room_id, .. } => *room_id,
        };
        if !self.config.is_chat_allowed(room_id) {
            debug!("Skipping update from unauthorized chat {}", room_id);
            return;
        }

        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(event) {
                    warn!("Failed to publish update {} to event bus: {}", update.update_id, e);
                }
            }
            None => info!("No event bus configured, update {} not forwarded", update.update_id),
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let member_commands = serde_json::json!([
            { "command": "mystatus", "description": "Мой статус и лимит" },
            { "command": "stats", "description": "Статистика чата" },
            { "command": "rules", "description": "Правила чата" },
            { "command": "help", "description": "Помощь" }
        ]);
        let payload = serde_json::json!({
            "commands": member_commands,
            "scope": { "type": "all_group_chats" },
        });
        let _: bool = self.call(client, "setMyCommands", &payload).await?;

        let mut admin_commands = vec![
            serde_json::json!({ "command": "resetcounter", "description": "Сбросить счетчики пустых сообщений" }),
            serde_json::json!({ "command": "resetempty", "description": "Сбросить счетчик пользователя" }),
            serde_json::json!({ "command": "unblock", "description": "Разблокировать пользователя" }),
            serde_json::json!({ "command": "setlimit", "description": "Установить лимит пользователю" }),
        ];
        if let Some(items) = member_commands.as_array() {
            admin_commands.extend(items.iter().cloned());
        }
        let payload = serde_json::json!({
            "commands": admin_commands,
            "scope": { "type": "all_chat_administrators" },
        });
        let _: bool = self.call(client, "setMyCommands", &payload).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatPlatform for TelegramAdapter {
    async fn delete_message(&self, handle: MessageHandle) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": handle.room_id,
            "message_id": handle.message_id,
        });
        let _: bool = self.call(&self.client, "deleteMessage", &payload).await?;
        Ok(())
    }

    async fn send_text(&self, room_id: i64, text: &str) -> Result<MessageHandle> {
        let payload = serde_json::json!({
            "chat_id": room_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let sent: SentMessage = self.call(&self.client, "sendMessage", &payload).await?;
        Ok(MessageHandle {
            room_id,
            message_id: sent.message_id,
        })
    }

    async fn restrict_member(
        &self,
        room_id: i64,
        user_id: i64,
        until: RestrictUntil,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": room_id,
            "user_id": user_id,
            "permissions": muted_permissions(),
            "until_date": until_date(until),
        });
        let _: bool = self
            .call(&self.client, "restrictChatMember", &payload)
            .await?;
        Ok(())
    }

    async fn unrestrict_member(&self, room_id: i64, user_id: i64) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": room_id,
            "user_id": user_id,
            "permissions": member_permissions(),
        });
        let _: bool = self
            .call(&self.client, "restrictChatMember", &payload)
            .await?;
        Ok(())
    }

    async fn member_status(&self, room_id: i64, user_id: i64) -> Result<MemberStatus> {
        let payload = serde_json::json!({
            "chat_id": room_id,
            "user_id": user_id,
        });
        let member: ChatMemberInfo = self.call(&self.client, "getChatMember", &payload).await?;
        Ok(MemberStatus::parse(&member.status).unwrap_or(MemberStatus::Member))
    }
}

fn parse_response<T: DeserializeOwned>(method: &str, status: StatusCode, body: &str) -> Result<T> {
    let parsed: ApiResponse<T> = serde_json::from_str(body)
        .map_err(|e| anyhow!("telegram {} HTTP {} decode failed: {}", method, status, e))?;

    if !parsed.ok {
        return Err(anyhow!(
            "telegram {} HTTP {}: {}",
            method,
            status,
            parsed.description.unwrap_or_else(|| "ok=false".to_string())
        ));
    }
    parsed
        .result
        .ok_or_else(|| anyhow!("telegram {} returned no result", method))
}

/// Unix seconds for `until_date`. Zero means forever.
fn until_date(until: RestrictUntil) -> i64 {
    match until {
        RestrictUntil::Until(at) => at.timestamp(),
        RestrictUntil::Indefinite => 0,
    }
}

fn muted_permissions() -> serde_json::Value {
    permissions(false)
}

fn member_permissions() -> serde_json::Value {
    permissions(true)
}

fn permissions(can_post: bool) -> serde_json::Value {
    serde_json::json!({
        "can_send_messages": can_post,
        "can_send_audios": can_post,
        "can_send_documents": can_post,
        "can_send_photos": can_post,
        "can_send_videos": can_post,
        "can_send_video_notes": can_post,
        "can_send_voice_notes": can_post,
        "can_send_polls": can_post,
        "can_send_other_messages": can_post,
        "can_add_web_page_previews": can_post,
        "can_invite_users": can_post,
        "can_change_info": false,
        "can_pin_messages": false,
    })
}
