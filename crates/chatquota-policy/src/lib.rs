//! chatquota Policy
//!
//! Settings resolution, content classification, limit input and notice templates

mod classifier;
mod limit_input;
mod notices;
mod settings;

pub use classifier::{
    classify, find_banned_word, mask_banned_words, matches_exclusion, text_length, Classification,
};
pub use limit_input::{LimitInput, LimitInputError, MAX_CUSTOM_LIMIT, MAX_TEMPORARY_DAYS};
pub use notices::{escape_html, format_mute_until, mask_word, render, NoticeKind, NoticeTemplates};
pub use settings::EffectiveSettings;

/// Group and channel ids are negative; private chats are positive.
pub fn is_group_room(room_id: i64) -> bool {
    if room_id > 0 {
        return false;
    }
    let repr = room_id.to_string();
    if repr.len() == 10 && repr.starts_with("-5") {
        return false;
    }
    if repr.len() == 11 && repr.starts_with("-1") {
        return false;
    }
    room_id < -99
}

#[cfg(test)]
mod tests {
    use super::is_group_room;

    #[test]
    fn private_chats_are_not_rooms() {
        assert!(!is_group_room(123456789));
        assert!(!is_group_room(0));
        assert!(!is_group_room(-42));
    }

    #[test]
    fn supergroups_and_legacy_groups_are_rooms() {
        assert!(is_group_room(-1001234567890));
        assert!(is_group_room(-123456789));
        assert!(is_group_room(-100));
    }

    #[test]
    fn malformed_negative_ids_are_rejected() {
        assert!(!is_group_room(-512345678));
        assert!(!is_group_room(-1234567890));
    }
}
