//! Commands any room member may send, and the texts they answer with

use crate::mute::{MuteState, STRIKE_THRESHOLD, TIMED_MUTE_DAYS};
use chatquota_policy::{format_mute_until, EffectiveSettings};

/// Lowercased first word of a slash command with any `@bot` suffix removed.
pub fn command_word(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let name = first.split('@').next().unwrap_or(first);
    Some(name.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberCommand {
    Status,
    Stats,
    Rules,
    Help,
}

impl MemberCommand {
    /// Accepts both the Latin and the Russian spelling.
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "/mystatus" | "/мойстатус" => Some(MemberCommand::Status),
            "/stats" | "/статистика" => Some(MemberCommand::Stats),
            "/rules" | "/правила" => Some(MemberCommand::Rules),
            "/help" | "/помощь" => Some(MemberCommand::Help),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MemberCommand::Status => "mystatus",
            MemberCommand::Stats => "stats",
            MemberCommand::Rules => "rules",
            MemberCommand::Help => "help",
        }
    }
}

/// One member's standing in a room, as shown by `/mystatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusView {
    pub count: u32,
    pub limit: u32,
    pub empty_strikes: u32,
    pub mute: MuteState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub messages: u64,
    pub members: usize,
    pub muted: usize,
    pub strike_holders: usize,
}

pub const ADMIN_STATUS_TEXT: &str = "👑 Вы администратор этого чата!";

pub fn status_text(view: &StatusView, contact_link: &str) -> String {
    let mut text = format!(
        "👤 <b>Ваш статус</b>\n\n\
         • Сообщений: {}\n\
         • Лимит: {}\n\
         • Осталось: {}\n\
         • Пустых сообщений: {}/{}\n",
        view.count,
        view.limit,
        view.limit.saturating_sub(view.count),
        view.empty_strikes,
        STRIKE_THRESHOLD
    );
    match view.mute {
        MuteState::Unmuted => text.push_str("• Статус: 🟢 Активен"),
        MuteState::Until(until) => {
            text.push_str(&format!(
                "• Статус: 🔴 Заблокирован до {}",
                format_mute_until(&until)
            ));
        }
        MuteState::Indefinite => {
            text.push_str("• Статус: 🔴 Заблокирован до сброса лимита");
        }
    }
    if view.mute.is_muted() {
        text.push_str("\n\n⚠️ Вы заблокированы и не можете писать в чат.");
        if !contact_link.is_empty() {
            text.push_str(&format!("\n📞 Для разблокировки: {}", contact_link));
        }
    }
    text
}

pub fn stats_text(stats: &RoomStats) -> String {
    format!(
        "📊 <b>Статистика чата</b>\n\n\
         💬 Сообщений всего: {}\n\
         👥 Пользователей: {}\n\
         🚫 Заблокировано: {}\n\
         🗑️ Активных счетчиков пустых сообщений: {}",
        stats.messages, stats.members, stats.muted, stats.strike_holders
    )
}

pub fn rules_text(settings: &EffectiveSettings) -> String {
    format!(
        "📜 <b>Правила чата</b>\n\n\
         <b>1. Лимит сообщений</b>\n\
         • {limit} бесплатных сообщений в месяц\n\
         • Счетчик обнуляется 1-го числа каждого месяца\n\n\
         <b>2. Качество сообщений</b>\n\
         • Минимальная длина текста: {min_length} символов\n\
         • Медиа без подписи считается пустым сообщением\n\
         • Не более {strikes} пустых сообщений подряд\n\n\
         <b>3. Запрещенный контент</b>\n\
         • Нецензурная лексика и оскорбления\n\n\
         <b>4. Наказания</b>\n\
         • Исчерпан лимит: блокировка до начала следующего месяца\n\
         • Запрещенное слово: блокировка на {days} дня\n\
         • {strikes} пустых сообщения: блокировка на {days} дня\n\n\
         📞 По вопросам обращайтесь к администраторам",
        limit = settings.limit,
        min_length = settings.min_length,
        strikes = STRIKE_THRESHOLD,
        days = TIMED_MUTE_DAYS,
    )
}

pub fn help_text(settings: &EffectiveSettings) -> String {
    format!(
        "❓ <b>Помощь по боту в этой группе</b>\n\n\
         Бот следит за лимитом сообщений и качеством объявлений.\n\
         • Лимит: {limit} сообщений в месяц\n\
         • Минимальная длина текста: {min_length} символов\n\
         • Запрещенные слова: блокировка на {days} дня\n\
         • Пустые медиа: не более {strikes} подряд\n\n\
         <b>Команды:</b>\n\
         /mystatus (/мойстатус) - ваш статус\n\
         /stats (/статистика) - статистика чата\n\
         /rules (/правила) - правила чата\n\
         /help - эта справка",
        limit = settings.limit,
        min_length = settings.min_length,
        days = TIMED_MUTE_DAYS,
        strikes = STRIKE_THRESHOLD,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn command_words_are_normalized() {
        assert_eq!(command_word("/MyStatus@chatquota_bot"), Some("/mystatus".to_string()));
        assert_eq!(command_word("  /правила  please"), Some("/правила".to_string()));
        assert_eq!(command_word("hello /help"), None);
        assert_eq!(command_word(""), None);

        assert_eq!(MemberCommand::parse("/мойстатус"), Some(MemberCommand::Status));
        assert_eq!(MemberCommand::parse("/статистика"), Some(MemberCommand::Stats));
        assert_eq!(MemberCommand::parse("/unblock"), None);
    }

    #[test]
    fn status_shows_remaining_and_mute() {
        let view = StatusView {
            count: 7,
            limit: 5,
            empty_strikes: 1,
            mute: MuteState::Unmuted,
        };
        let text = status_text(&view, "");
        assert!(text.contains("Осталось: 0"), "{}", text);
        assert!(text.contains("Пустых сообщений: 1/3"));
        assert!(text.contains("🟢 Активен"));

        let until = Utc
            .with_ymd_and_hms(2026, 3, 13, 12, 0, 0)
            .single()
            .expect("date");
        let muted = StatusView {
            mute: MuteState::Until(until),
            ..view
        };
        let text = status_text(&muted, "@admin");
        assert!(text.contains("🔴 Заблокирован до"));
        assert!(text.contains("@admin"));
    }

    #[test]
    fn rules_follow_room_settings() {
        let mut settings = EffectiveSettings::seed();
        settings.limit = 12;
        settings.min_length = 30;
        let text = rules_text(&settings);
        assert!(text.contains("12 бесплатных сообщений"));
        assert!(text.contains("30 символов"));
        assert!(help_text(&settings).contains("Лимит: 12"));
    }
}
