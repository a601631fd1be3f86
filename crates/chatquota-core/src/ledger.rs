use crate::error::EngineError;
use crate::mute::MuteState;
use crate::store::QuotaStore;
use anyhow::Result;
use chatquota_storage::{Membership, MembershipKey, MuteSetting};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Count at which the "messages used" warning goes out, whatever the limit.
pub const WARNING_THRESHOLD: u32 = 3;

/// Membership after time-based transitions were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refresh {
    pub membership: Membership,
    pub temp_limit_expired: bool,
    /// A mute ended here: an elapsed timed mute, or a quota mute ended by temporary-limit expiry.
    pub mute_lifted: bool,
    pub healed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    /// Increment the counter.
    Count,
    /// Restart the counter at zero.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Blocked {
        state: MuteState,
        limit: u32,
    },
    Admitted {
        count: u32,
        limit: u32,
        warned: bool,
        muted_now: bool,
    },
}

/// Loads the membership and settles everything that depends only on the clock: a half-set
/// temporary limit is cleared, an expired one starts a fresh counting period, and a timed
/// mute past its deadline is lifted.
pub fn refresh(store: &dyn QuotaStore, key: MembershipKey, now: DateTime<Utc>) -> Result<Refresh> {
    let mut membership = store.get_or_create_membership(key, now)?;
    let mut changed = false;
    let mut healed = false;
    let mut temp_limit_expired = false;
    let mut mute_lifted = false;

    if membership.has_inconsistent_temp_limit() {
        warn!("{}, clearing both fields", EngineError::InconsistentMembership { key });
        membership.clear_temp_limit();
        healed = true;
        changed = true;
    }

    if let Some(expires_at) = membership.temp_limit_expires_at {
        if expires_at <= now {
            membership.clear_temp_limit();
            membership.message_count = 0;
            membership.last_reset_at = now;
            membership.last_temp_reset_at = Some(now);
            if MuteState::of(&membership) == MuteState::Indefinite {
                membership.apply_mute(MuteSetting::None, now);
                mute_lifted = true;
            }
            temp_limit_expired = true;
            changed = true;
        }
    }

    if MuteState::of(&membership).has_elapsed(now) {
        membership.apply_mute(MuteSetting::None, now);
        mute_lifted = true;
        changed = true;
    }

    if changed {
        store.save_membership(&membership)?;
    }

    Ok(Refresh {
        membership,
        temp_limit_expired,
        mute_lifted,
        healed,
    })
}

/// Temporary limit while valid, then the permanent one, then the room limit.
pub fn effective_limit(membership: &Membership, room_limit: u32, now: DateTime<Utc>) -> u32 {
    match (membership.temp_limit, membership.temp_limit_expires_at) {
        (Some(limit), Some(expires_at)) if expires_at > now && limit > 0 => limit,
        _ => membership
            .custom_limit
            .filter(|limit| *limit > 0)
            .unwrap_or(room_limit),
    }
}

/// Applies one admitted submission to a refreshed membership.
pub fn admit(
    store: &dyn QuotaStore,
    membership: &Membership,
    room_limit: u32,
    tally: Tally,
    now: DateTime<Utc>,
) -> Result<Admission> {
    let key = membership.key();
    let limit = effective_limit(membership, room_limit, now);

    let state = MuteState::of(membership);
    if state.is_muted() {
        return Ok(Admission::Blocked { state, limit });
    }

    match tally {
        Tally::Reset => {
            store.reset_count(key, now)?;
            Ok(Admission::Admitted {
                count: 0,
                limit,
                warned: false,
                muted_now: false,
            })
        }
        Tally::Count => {
            let count = store.increment_count(key)?;
            let muted_now = count >= limit;
            if muted_now {
                store.set_mute(key, MuteSetting::Indefinite, now)?;
            }
            Ok(Admission::Admitted {
                count,
                limit,
                warned: count == WARNING_THRESHOLD,
                muted_now,
            })
        }
    }
}
