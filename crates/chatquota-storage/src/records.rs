use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MembershipKey {
    pub user_id: i64,
    pub room_id: i64,
}

impl MembershipKey {
    pub fn new(user_id: i64, room_id: i64) -> Self {
        Self { user_id, room_id }
    }
}

impl std::fmt::Display for MembershipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user={} room={}", self.user_id, self.room_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: i64,
    pub title: Option<String>,
    /// `None` falls back to the global default limit.
    pub message_limit: Option<u32>,
    pub exclude_words: Vec<String>,
    pub exclude_use_regex: Option<bool>,
    /// `None` falls back to the global banned word list.
    pub banned_words: Option<Vec<String>>,
    pub notification_overrides: HashMap<String, String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_global_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteReason {
    Quota,
    BannedWord,
    EmptyMedia,
}

impl MuteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MuteReason::Quota => "quota",
            MuteReason::BannedWord => "banned_word",
            MuteReason::EmptyMedia => "empty_media",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "quota" => Some(MuteReason::Quota),
            "banned_word" => Some(MuteReason::BannedWord),
            "empty_media" => Some(MuteReason::EmptyMedia),
            _ => None,
        }
    }
}

/// Mute columns written by `Storage::set_mute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteSetting {
    None,
    Until(DateTime<Utc>, MuteReason),
    Indefinite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: i64,
    pub room_id: i64,
    pub message_count: u32,
    pub custom_limit: Option<u32>,
    pub temp_limit: Option<u32>,
    pub temp_limit_expires_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    /// `None` while muted means the mute lasts until the monthly reset.
    pub mute_until: Option<DateTime<Utc>>,
    pub mute_reason: Option<MuteReason>,
    pub muted_at: Option<DateTime<Utc>>,
    pub last_reset_at: DateTime<Utc>,
    pub last_temp_reset_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn new(key: MembershipKey, now: DateTime<Utc>) -> Self {
        Self {
            user_id: key.user_id,
            room_id: key.room_id,
            message_count: 0,
            custom_limit: None,
            temp_limit: None,
            temp_limit_expires_at: None,
            is_muted: false,
            mute_until: None,
            mute_reason: None,
            muted_at: None,
            last_reset_at: now,
            last_temp_reset_at: None,
        }
    }

    pub fn key(&self) -> MembershipKey {
        MembershipKey::new(self.user_id, self.room_id)
    }

    /// Temporary limit and its expiry must be set or cleared together.
    pub fn has_inconsistent_temp_limit(&self) -> bool {
        self.temp_limit.is_some() != self.temp_limit_expires_at.is_some()
    }

    pub fn clear_temp_limit(&mut self) {
        self.temp_limit = None;
        self.temp_limit_expires_at = None;
    }

    pub fn apply_mute(&mut self, setting: MuteSetting, now: DateTime<Utc>) {
        match setting {
            MuteSetting::None => {
                self.is_muted = false;
                self.mute_until = None;
                self.mute_reason = None;
                self.muted_at = None;
            }
            MuteSetting::Until(until, reason) => {
                self.is_muted = true;
                self.mute_until = Some(until);
                self.mute_reason = Some(reason);
                self.muted_at = Some(now);
            }
            MuteSetting::Indefinite => {
                self.is_muted = true;
                self.mute_until = None;
                self.mute_reason = Some(MuteReason::Quota);
                self.muted_at = Some(now);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub contact_link: String,
    pub default_message_limit: u32,
    pub default_min_length: u32,
    pub default_exclude_words: Vec<String>,
    pub default_exclude_use_regex: bool,
    pub default_banned_words: Vec<String>,
    pub default_notifications: HashMap<String, String>,
    pub auto_unblock_days: u32,
    pub security_log_enabled: bool,
}

pub const SEED_MESSAGE_LIMIT: u32 = 5;
pub const SEED_MIN_LENGTH: u32 = 20;
pub const SEED_BANNED_WORDS: &[&str] = &["хуй", "пизда", "еблан", "мудак", "сука", "блять"];

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            contact_link: String::new(),
            default_message_limit: SEED_MESSAGE_LIMIT,
            default_min_length: SEED_MIN_LENGTH,
            default_exclude_words: Vec::new(),
            default_exclude_use_regex: false,
            default_banned_words: SEED_BANNED_WORDS.iter().map(|w| w.to_string()).collect(),
            default_notifications: HashMap::new(),
            auto_unblock_days: 0,
            security_log_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action: String,
    pub user_id: Option<i64>,
    pub room_id: Option<i64>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a batch update over memberships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub updated: usize,
    pub unmuted: Vec<MembershipKey>,
}
