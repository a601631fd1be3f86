use chatquota_policy::LimitInputError;
use chatquota_storage::MembershipKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("settings for room {room_id} unavailable, using seed defaults: {reason}")]
    ConfigurationUnavailable { room_id: i64, reason: String },

    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{action} failed in room {room_id}{}: {reason}", user_suffix(.user_id))]
    PlatformActionFailed {
        action: &'static str,
        room_id: i64,
        user_id: Option<i64>,
        reason: String,
    },

    #[error("membership {key} has a temporary limit without its expiry or the reverse")]
    InconsistentMembership { key: MembershipKey },

    #[error("invalid limit input: {0}")]
    InvalidLimitInput(#[from] LimitInputError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn user_suffix(user_id: &Option<i64>) -> String {
    match user_id {
        Some(id) => format!(" for user {}", id),
        None => String::new(),
    }
}
