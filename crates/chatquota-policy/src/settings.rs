use crate::notices::NoticeTemplates;
use chatquota_storage::{GlobalSettings, RoomRecord, SEED_MESSAGE_LIMIT, SEED_MIN_LENGTH};

/// Fully resolved moderation inputs for one room.
///
/// Every field is populated: room values win when set and non-empty, then the global row, then
/// the compiled-in seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub limit: u32,
    pub min_length: usize,
    pub banned_words: Vec<String>,
    pub exclusions: Vec<String>,
    pub exclusions_use_regex: bool,
    pub notices: NoticeTemplates,
    pub contact_link: String,
    pub auto_unblock_days: u32,
    pub security_log_enabled: bool,
}

impl EffectiveSettings {
    pub fn resolve(room: Option<&RoomRecord>, global: Option<&GlobalSettings>) -> Self {
        let seed = GlobalSettings::default();
        let global = global.unwrap_or(&seed);

        let limit = room
            .and_then(|r| r.message_limit)
            .filter(|limit| *limit > 0)
            .or(Some(global.default_message_limit).filter(|limit| *limit > 0))
            .unwrap_or(SEED_MESSAGE_LIMIT);

        let min_length = Some(global.default_min_length)
            .filter(|length| *length > 0)
            .unwrap_or(SEED_MIN_LENGTH) as usize;

        let banned_words = room
            .and_then(|r| r.banned_words.as_deref())
            .and_then(non_blank)
            .or_else(|| non_blank(&global.default_banned_words))
            .unwrap_or_else(|| non_blank(&seed.default_banned_words).unwrap_or_default());

        let exclusions = room
            .and_then(|r| non_blank(&r.exclude_words))
            .or_else(|| non_blank(&global.default_exclude_words))
            .unwrap_or_default();

        let exclusions_use_regex = room
            .and_then(|r| r.exclude_use_regex)
            .unwrap_or(global.default_exclude_use_regex);

        let notices = NoticeTemplates::resolve(
            room.map(|r| &r.notification_overrides),
            Some(&global.default_notifications),
        );

        Self {
            limit,
            min_length,
            banned_words,
            exclusions,
            exclusions_use_regex,
            notices,
            contact_link: global.contact_link.clone(),
            auto_unblock_days: global.auto_unblock_days,
            security_log_enabled: global.security_log_enabled,
        }
    }

    /// Compiled-in defaults, used when the store cannot be read.
    pub fn seed() -> Self {
        Self::resolve(None, None)
    }
}

fn non_blank(items: &[String]) -> Option<Vec<String>> {
    let cleaned: Vec<String> = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::EffectiveSettings;
    use crate::NoticeKind;
    use chatquota_storage::{GlobalSettings, RoomRecord};
    use std::collections::HashMap;

    fn room() -> RoomRecord {
        RoomRecord {
            id: -1001,
            title: None,
            message_limit: None,
            exclude_words: Vec::new(),
            exclude_use_regex: None,
            banned_words: None,
            notification_overrides: HashMap::new(),
            is_active: true,
        }
    }

    #[test]
    fn seed_is_fully_populated() {
        let seed = EffectiveSettings::seed();
        assert_eq!(seed.limit, 5);
        assert_eq!(seed.min_length, 20);
        assert!(!seed.banned_words.is_empty());
        assert!(seed.exclusions.is_empty());
        assert!(!seed.exclusions_use_regex);
        assert!(seed.security_log_enabled);
    }

    #[test]
    fn room_values_override_global() {
        let global = GlobalSettings {
            default_message_limit: 9,
            default_exclude_words: vec!["#ad".to_string()],
            ..GlobalSettings::default()
        };
        let mut r = room();
        r.message_limit = Some(3);
        r.banned_words = Some(vec!["spam".to_string()]);
        r.exclude_words = vec!["price".to_string()];
        r.exclude_use_regex = Some(true);

        let settings = EffectiveSettings::resolve(Some(&r), Some(&global));
        assert_eq!(settings.limit, 3);
        assert_eq!(settings.banned_words, vec!["spam".to_string()]);
        assert_eq!(settings.exclusions, vec!["price".to_string()]);
        assert!(settings.exclusions_use_regex);
    }

    #[test]
    fn empty_room_values_fall_back_to_global() {
        let global = GlobalSettings {
            default_message_limit: 9,
            default_banned_words: vec!["scam".to_string()],
            default_exclude_words: vec!["#ad".to_string()],
            default_exclude_use_regex: true,
            ..GlobalSettings::default()
        };
        let mut r = room();
        r.banned_words = Some(vec!["  ".to_string()]);
        r.exclude_words = vec![String::new()];

        let settings = EffectiveSettings::resolve(Some(&r), Some(&global));
        assert_eq!(settings.limit, 9);
        assert_eq!(settings.banned_words, vec!["scam".to_string()]);
        assert_eq!(settings.exclusions, vec!["#ad".to_string()]);
        assert!(settings.exclusions_use_regex);
    }

    #[test]
    fn empty_global_lists_fall_back_to_seed() {
        let global = GlobalSettings {
            default_message_limit: 0,
            default_banned_words: Vec::new(),
            ..GlobalSettings::default()
        };
        let settings = EffectiveSettings::resolve(None, Some(&global));
        assert_eq!(settings.limit, 5);
        assert_eq!(settings.banned_words, EffectiveSettings::seed().banned_words);
    }

    #[test]
    fn zero_min_length_falls_back_to_seed() {
        let global = GlobalSettings {
            default_min_length: 0,
            ..GlobalSettings::default()
        };
        let settings = EffectiveSettings::resolve(None, Some(&global));
        assert_eq!(settings.min_length, 20);

        let global = GlobalSettings {
            default_min_length: 35,
            ..GlobalSettings::default()
        };
        let settings = EffectiveSettings::resolve(None, Some(&global));
        assert_eq!(settings.min_length, 35);
    }

    #[test]
    fn notices_layer_room_over_global() {
        let mut global = GlobalSettings::default();
        global
            .default_notifications
            .insert("limit_exceeded".to_string(), "global limit".to_string());
        global
            .default_notifications
            .insert("user_blocked".to_string(), "global blocked".to_string());
        let mut r = room();
        r.notification_overrides
            .insert("limit_exceeded".to_string(), "room limit".to_string());

        let settings = EffectiveSettings::resolve(Some(&r), Some(&global));
        assert_eq!(settings.notices.get(NoticeKind::LimitExceeded), "room limit");
        assert_eq!(settings.notices.get(NoticeKind::UserBlocked), "global blocked");
        assert_eq!(
            settings.notices.get(NoticeKind::QuotaWarning),
            NoticeKind::QuotaWarning.fallback()
        );
    }
}
