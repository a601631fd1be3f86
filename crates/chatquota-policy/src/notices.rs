use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    EmptyMessage,
    QuotaWarning,
    LimitExceeded,
    UserBlocked,
    EmptyMessageBlocked,
    SwearWordBlocked,
}

impl NoticeKind {
    pub const ALL: [NoticeKind; 6] = [
        NoticeKind::EmptyMessage,
        NoticeKind::QuotaWarning,
        NoticeKind::LimitExceeded,
        NoticeKind::UserBlocked,
        NoticeKind::EmptyMessageBlocked,
        NoticeKind::SwearWordBlocked,
    ];

    /// Key used in the stored notification maps.
    pub fn key(&self) -> &'static str {
        match self {
            NoticeKind::EmptyMessage => "empty_message",
            NoticeKind::QuotaWarning => "warning_3_messages",
            NoticeKind::LimitExceeded => "limit_exceeded",
            NoticeKind::UserBlocked => "user_blocked",
            NoticeKind::EmptyMessageBlocked => "empty_message_blocked",
            NoticeKind::SwearWordBlocked => "swear_word_blocked",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key.trim())
    }

    pub fn fallback(&self) -> &'static str {
        match self {
            NoticeKind::EmptyMessage => {
                "⚠️ <b>Внимание!</b>\n\
                 Просто картинки/стикеры/видео без текста нельзя отправлять в чат.\n\
                 Оформите объявление текстом или добавьте описание к медиа."
            }
            NoticeKind::QuotaWarning => {
                "⚠️ <b>Внимание!</b>\n\n\
                 У вас осталось {N} бесплатных сообщений в этом месяце."
            }
            NoticeKind::LimitExceeded => {
                "🚫 <b>Лимит сообщений исчерпан</b>\n\n\
                 Вы использовали все {user_limit} сообщений в этом месяце.\n\
                 Доступ восстановится 1-го числа следующего месяца.\n\n\
                 📞 Для покупки дополнительных сообщений: {contact_link}"
            }
            NoticeKind::UserBlocked => {
                "🚫 <b>Вы заблокированы</b>\n\n\
                 Блокировка действует до: {mute_until}\n\n\
                 📞 Администратор может снять блокировку досрочно. {contact_link}"
            }
            NoticeKind::EmptyMessageBlocked => {
                "🚫 <b>Блокировка за пустые сообщения</b>\n\n\
                 Вы отправили 3 пустых медиа-сообщения подряд без текста.\n\
                 Заблокирован до: {mute_until}\n\n\
                 📞 Администратор может снять блокировку досрочно."
            }
            NoticeKind::SwearWordBlocked => {
                "🚫 <b>Блокировка за запрещенное слово</b>\n\n\
                 Обнаружено запрещенное слово: <code>{word}</code>\n\
                 {text}\n\
                 Вы заблокированы до: {mute_until}\n\
                 📞 Администратор может снять блокировку досрочно."
            }
        }
    }
}

/// Notice texts for one room, one per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeTemplates {
    texts: HashMap<NoticeKind, String>,
}

impl NoticeTemplates {
    /// Room override, then global default, then the compiled fallback.
    pub fn resolve(
        room: Option<&HashMap<String, String>>,
        global: Option<&HashMap<String, String>>,
    ) -> Self {
        let pick = |layer: Option<&HashMap<String, String>>, kind: NoticeKind| {
            layer
                .and_then(|map| map.get(kind.key()))
                .filter(|text| !text.trim().is_empty())
                .cloned()
        };

        let texts = NoticeKind::ALL
            .into_iter()
            .map(|kind| {
                let text = pick(room, kind)
                    .or_else(|| pick(global, kind))
                    .unwrap_or_else(|| kind.fallback().to_string());
                (kind, text)
            })
            .collect();

        Self { texts }
    }

    pub fn get(&self, kind: NoticeKind) -> &str {
        self.texts
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.fallback())
    }
}

impl Default for NoticeTemplates {
    fn default() -> Self {
        Self::resolve(None, None)
    }
}

/// Replaces `{name}` placeholders. Unknown placeholders stay as written.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}

pub fn format_mute_until(until: &DateTime<Utc>) -> String {
    until.format("%d.%m.%Y %H:%M").to_string()
}

pub fn mask_word(word: &str) -> String {
    "*".repeat(word.chars().count())
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
