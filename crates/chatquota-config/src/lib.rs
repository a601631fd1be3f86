//! chatquota Configuration
//!
//! TOML configuration for the moderation bot, its scheduler and the global settings seed

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    /// When set, only these rooms are moderated.
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
}

impl TelegramConfig {
    pub fn account_tag(&self) -> String {
        let token = self.bot_token.trim();
        token.split(':').next().unwrap_or(token).trim().to_string()
    }

    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&chat_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_album_debounce_ms")]
    pub album_debounce_ms: u64,
    #[serde(default = "default_album_max_items")]
    pub album_max_items: usize,
    #[serde(default = "default_album_history_limit")]
    pub album_history_limit: usize,
    #[serde(default = "default_album_stale_secs")]
    pub album_stale_secs: u64,
    #[serde(default = "default_max_inflight_events")]
    pub max_inflight_events: usize,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Empty-media strikes untouched for this long are forgotten by the prune pass.
    #[serde(default = "default_strike_idle_secs")]
    pub strike_idle_secs: u64,
    #[serde(default)]
    pub notice_ttl: NoticeTtlConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            album_debounce_ms: default_album_debounce_ms(),
            album_max_items: default_album_max_items(),
            album_history_limit: default_album_history_limit(),
            album_stale_secs: default_album_stale_secs(),
            max_inflight_events: default_max_inflight_events(),
            prune_interval_secs: default_prune_interval_secs(),
            strike_idle_secs: default_strike_idle_secs(),
            notice_ttl: NoticeTtlConfig::default(),
        }
    }
}

/// Seconds a transient notice stays visible before it is deleted. Zero keeps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeTtlConfig {
    #[serde(default = "default_empty_warning_secs")]
    pub empty_warning_secs: u64,
    #[serde(default = "default_quota_warning_secs")]
    pub quota_warning_secs: u64,
    #[serde(default = "default_limit_notice_secs")]
    pub limit_notice_secs: u64,
    #[serde(default = "default_blocked_notice_secs")]
    pub blocked_notice_secs: u64,
    #[serde(default = "default_banned_notice_secs")]
    pub banned_notice_secs: u64,
    #[serde(default = "default_command_reply_secs")]
    pub command_reply_secs: u64,
}

impl Default for NoticeTtlConfig {
    fn default() -> Self {
        Self {
            empty_warning_secs: default_empty_warning_secs(),
            quota_warning_secs: default_quota_warning_secs(),
            limit_notice_secs: default_limit_notice_secs(),
            blocked_notice_secs: default_blocked_notice_secs(),
            banned_notice_secs: default_banned_notice_secs(),
            command_reply_secs: default_command_reply_secs(),
        }
    }
}

impl NoticeTtlConfig {
    /// All notices stay in the room.
    pub fn disabled() -> Self {
        Self {
            empty_warning_secs: 0,
            quota_warning_secs: 0,
            limit_notice_secs: 0,
            blocked_notice_secs: 0,
            banned_notice_secs: 0,
            command_reply_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_monthly_reset_schedule")]
    pub monthly_reset: String,
    #[serde(default = "default_auto_unblock_schedule")]
    pub auto_unblock: String,
    #[serde(default = "default_temporary_limits_schedule")]
    pub temporary_limits: String,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            monthly_reset: default_monthly_reset_schedule(),
            auto_unblock: default_auto_unblock_schedule(),
            temporary_limits: default_temporary_limits_schedule(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

/// Seed for the global settings row, applied once when the row is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub contact_link: String,
    #[serde(default = "default_message_limit")]
    pub message_limit: u32,
    #[serde(default = "default_min_message_length")]
    pub min_message_length: u32,
    #[serde(default = "default_banned_words")]
    pub banned_words: Vec<String>,
    #[serde(default)]
    pub exclude_words: Vec<String>,
    #[serde(default)]
    pub exclude_use_regex: bool,
    #[serde(default)]
    pub auto_unblock_days: u32,
    #[serde(default = "default_true")]
    pub security_log_enabled: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            contact_link: String::new(),
            message_limit: default_message_limit(),
            min_message_length: default_min_message_length(),
            banned_words: default_banned_words(),
            exclude_words: Vec::new(),
            exclude_use_regex: false,
            auto_unblock_days: 0,
            security_log_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_album_debounce_ms() -> u64 {
    1500
}

fn default_album_max_items() -> usize {
    10
}

fn default_album_history_limit() -> usize {
    100
}

fn default_album_stale_secs() -> u64 {
    60
}

fn default_max_inflight_events() -> usize {
    32
}

fn default_prune_interval_secs() -> u64 {
    300
}

fn default_strike_idle_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_empty_warning_secs() -> u64 {
    60
}

fn default_quota_warning_secs() -> u64 {
    15
}

fn default_limit_notice_secs() -> u64 {
    15
}

fn default_blocked_notice_secs() -> u64 {
    5
}

fn default_banned_notice_secs() -> u64 {
    60
}

fn default_command_reply_secs() -> u64 {
    15
}

fn default_monthly_reset_schedule() -> String {
    "0 1 0 1 * *".to_string()
}

fn default_auto_unblock_schedule() -> String {
    "0 */10 * * * *".to_string()
}

fn default_temporary_limits_schedule() -> String {
    "0 0 * * * *".to_string()
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_message_limit() -> u32 {
    5
}

fn default_min_message_length() -> u32 {
    20
}

fn default_banned_words() -> Vec<String> {
    ["хуй", "пизда", "еблан", "мудак", "сука", "блять"]
        .iter()
        .map(|w| w.to_string())
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chatquota").join("config.toml"))
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Some(expand_home(dir)),
            _ => dirs::data_local_dir().map(|dir| dir.join("chatquota")),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(telegram) = &self.telegram {
            if telegram.bot_token.trim().is_empty() {
                anyhow::bail!("telegram.bot_token cannot be empty");
            }
            if !telegram.bot_token.contains(':') {
                anyhow::bail!("telegram.bot_token has invalid format (expected <id>:<secret>)");
            }
            if let Some(timeout) = telegram.poll_timeout_secs {
                if timeout == 0 || timeout > 300 {
                    anyhow::bail!("telegram.poll_timeout_secs must be in range 1..=300");
                }
            }
            if let Some(chats) = &telegram.allowed_chats {
                let mut seen = HashSet::new();
                for chat in chats {
                    if !seen.insert(*chat) {
                        anyhow::bail!("telegram.allowed_chats contains duplicate chat {}", chat);
                    }
                }
            }
        }

        let moderation = &self.moderation;
        if !(100..=60_000).contains(&moderation.album_debounce_ms) {
            anyhow::bail!("moderation.album_debounce_ms must be in range 100..=60000");
        }
        if moderation.album_max_items == 0 {
            anyhow::bail!("moderation.album_max_items must be > 0");
        }
        if moderation.max_inflight_events == 0 {
            anyhow::bail!("moderation.max_inflight_events must be > 0");
        }
        if moderation.prune_interval_secs == 0 {
            anyhow::bail!("moderation.prune_interval_secs must be > 0");
        }

        for (name, expr) in [
            ("schedule.monthly_reset", &self.schedule.monthly_reset),
            ("schedule.auto_unblock", &self.schedule.auto_unblock),
            ("schedule.temporary_limits", &self.schedule.temporary_limits),
        ] {
            if expr.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
        }
        if self.schedule.check_interval_secs == 0 || self.schedule.check_interval_secs > 3600 {
            anyhow::bail!("schedule.check_interval_secs must be in range 1..=3600");
        }

        let defaults = &self.defaults;
        if !(1..=1000).contains(&defaults.message_limit) {
            anyhow::bail!("defaults.message_limit must be in range 1..=1000");
        }
        if defaults.min_message_length > 4096 {
            anyhow::bail!("defaults.min_message_length must be <= 4096");
        }
        if defaults.auto_unblock_days > 365 {
            anyhow::bail!("defaults.auto_unblock_days must be <= 365");
        }

        Ok(())
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub const TEMPLATE: &str = r#"[core]
# data_dir = "~/.local/share/chatquota"
log_level = "info"

[telegram]
bot_token = "123456:replace-me"
poll_timeout_secs = 60
# allowed_chats = [-1001234567890]

[moderation]
album_debounce_ms = 1500
# strike_idle_secs = 604800

[moderation.notice_ttl]
empty_warning_secs = 60
quota_warning_secs = 15
limit_notice_secs = 15
blocked_notice_secs = 5

[schedule]
monthly_reset = "0 1 0 1 * *"
auto_unblock = "0 */10 * * * *"
temporary_limits = "0 0 * * * *"

[defaults]
contact_link = ""
message_limit = 5
min_message_length = 20
"#;

#[cfg(test)]
mod tests {
    use super::{Config, TEMPLATE};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert!(cfg.telegram.is_none());
        assert_eq!(cfg.moderation.album_debounce_ms, 1500);
        assert_eq!(cfg.moderation.notice_ttl.blocked_notice_secs, 5);
        assert_eq!(cfg.moderation.strike_idle_secs, 604_800);
        assert_eq!(cfg.defaults.message_limit, 5);
        assert_eq!(cfg.defaults.min_message_length, 20);
        assert!(cfg.defaults.security_log_enabled);
        assert_eq!(cfg.defaults.banned_words.len(), 6);
        assert_eq!(cfg.schedule.monthly_reset, "0 1 0 1 * *");
    }

    #[test]
    fn template_is_valid() {
        let cfg = parse_config(TEMPLATE);
        assert!(cfg.validate().is_ok());
        let telegram = cfg.telegram.expect("telegram section");
        assert_eq!(telegram.account_tag(), "123456");
    }

    #[test]
    fn validate_rejects_empty_bot_token() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "  "
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_debounce() {
        let cfg = parse_config(
            r#"
[moderation]
album_debounce_ms = 5
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_limit_outside_range() {
        let cfg = parse_config(
            r#"
[defaults]
message_limit = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_schedule() {
        let cfg = parse_config(
            r#"
[schedule]
auto_unblock = ""
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn allowed_chats_filter() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:abc"
allowed_chats = [-1001]
"#,
        );
        let telegram = cfg.telegram.expect("telegram section");
        assert!(telegram.is_chat_allowed(-1001));
        assert!(!telegram.is_chat_allowed(-1002));
    }
}
