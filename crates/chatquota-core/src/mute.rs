use chatquota_storage::{Membership, MembershipKey};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::time::{Duration as StdDuration, Instant};

/// Empty-media submissions tolerated before a timed mute.
pub const STRIKE_THRESHOLD: u32 = 3;
/// Length of banned-word and empty-media mutes.
pub const TIMED_MUTE_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteState {
    Unmuted,
    Until(DateTime<Utc>),
    /// Quota mute, lifted by the monthly reset or an admin.
    Indefinite,
}

impl MuteState {
    pub fn of(membership: &Membership) -> Self {
        if !membership.is_muted {
            return MuteState::Unmuted;
        }
        match membership.mute_until {
            Some(until) => MuteState::Until(until),
            None => MuteState::Indefinite,
        }
    }

    pub fn is_muted(&self) -> bool {
        !matches!(self, MuteState::Unmuted)
    }

    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, MuteState::Until(until) if *until <= now)
    }
}

pub fn timed_mute_until(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(TIMED_MUTE_DAYS)
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Platform restriction end for a quota mute: day 1 of the next month, 00:01 UTC.
pub fn first_day_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 1, 0)
        .single()
        .unwrap_or_else(|| now + Duration::days(31))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strike {
    /// Strikes counted including this one.
    pub count: u32,
    /// The threshold was reached and the book was cleared for this key.
    pub mute: bool,
}

/// In-memory empty-media strike counters. Lost on restart.
#[derive(Debug, Default)]
pub struct StrikeBook {
    /// Count and time of the latest strike.
    strikes: HashMap<MembershipKey, (u32, Instant)>,
}

impl StrikeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: MembershipKey, now: Instant) -> Strike {
        let count = self.get(key) + 1;
        if count >= STRIKE_THRESHOLD {
            self.strikes.remove(&key);
            return Strike { count, mute: true };
        }
        self.strikes.insert(key, (count, now));
        Strike { count, mute: false }
    }

    pub fn get(&self, key: MembershipKey) -> u32 {
        self.strikes.get(&key).map_or(0, |(count, _)| *count)
    }

    /// Returns true when the key had strikes.
    pub fn clear(&mut self, key: MembershipKey) -> bool {
        self.strikes.remove(&key).is_some()
    }

    pub fn clear_room(&mut self, room_id: i64) -> usize {
        let before = self.strikes.len();
        self.strikes.retain(|key, _| key.room_id != room_id);
        before - self.strikes.len()
    }

    /// Keys in the room with at least one strike.
    pub fn room_len(&self, room_id: i64) -> usize {
        self.strikes.keys().filter(|key| key.room_id == room_id).count()
    }

    /// Forgets counters whose latest strike is older than `max_idle`.
    pub fn prune(&mut self, now: Instant, max_idle: StdDuration) -> usize {
        let before = self.strikes.len();
        self.strikes
            .retain(|_, (_, last)| now.saturating_duration_since(*last) < max_idle);
        before - self.strikes.len()
    }

    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }
}
