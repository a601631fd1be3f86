use anyhow::Result;
use chatquota_policy::EffectiveSettings;
use chatquota_storage::{
    ActionLogEntry, GlobalSettings, Membership, MembershipKey, MuteSetting, RoomRecord, Storage,
    SweepOutcome, UserProfile, UserRecord,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persistence operations the engine relies on.
pub trait QuotaStore: Send {
    fn get_room(&self, room_id: i64) -> Result<Option<RoomRecord>>;

    fn get_or_create_room(
        &self,
        room_id: i64,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RoomRecord>;

    fn set_room_active(&self, room_id: i64, active: bool) -> Result<bool>;

    fn get_or_create_user(&self, profile: &UserProfile, now: DateTime<Utc>) -> Result<UserRecord>;

    fn get_or_create_membership(&self, key: MembershipKey, now: DateTime<Utc>)
        -> Result<Membership>;

    fn save_membership(&self, membership: &Membership) -> Result<()>;

    fn list_memberships(&self, room_id: i64) -> Result<Vec<Membership>>;

    fn increment_count(&self, key: MembershipKey) -> Result<u32>;

    fn reset_count(&self, key: MembershipKey, now: DateTime<Utc>) -> Result<()>;

    fn set_mute(&self, key: MembershipKey, setting: MuteSetting, now: DateTime<Utc>) -> Result<()>;

    fn set_temporary_limit(
        &self,
        key: MembershipKey,
        limit: Option<(u32, DateTime<Utc>)>,
    ) -> Result<()>;

    fn set_permanent_limit(&self, key: MembershipKey, limit: Option<u32>) -> Result<()>;

    fn global_settings(&self) -> Result<GlobalSettings>;

    fn append_action_log(&self, entry: &ActionLogEntry) -> Result<()>;

    fn monthly_reset(&self, period_start: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<SweepOutcome>;

    fn release_expired_mutes(
        &self,
        now: DateTime<Utc>,
        indefinite_cutoff: Option<DateTime<Utc>>,
    ) -> Result<SweepOutcome>;

    fn expire_temporary_limits(&self, now: DateTime<Utc>) -> Result<SweepOutcome>;

    fn get_effective_settings(&self, room_id: i64) -> Result<EffectiveSettings> {
        let room = self.get_room(room_id)?;
        let global = self.global_settings()?;
        Ok(EffectiveSettings::resolve(room.as_ref(), Some(&global)))
    }

    fn deactivate_room(&self, room_id: i64) -> Result<bool> {
        self.set_room_active(room_id, false)
    }
}

pub type SharedStore = Arc<Mutex<dyn QuotaStore>>;

pub fn shared(storage: Storage) -> SharedStore {
    Arc::new(Mutex::new(storage))
}

impl QuotaStore for Storage {
    fn get_room(&self, room_id: i64) -> Result<Option<RoomRecord>> {
        Storage::get_room(self, room_id)
    }

    fn get_or_create_room(
        &self,
        room_id: i64,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RoomRecord> {
        Storage::get_or_create_room(self, room_id, title, now)
    }

    fn set_room_active(&self, room_id: i64, active: bool) -> Result<bool> {
        Storage::set_room_active(self, room_id, active)
    }

    fn get_or_create_user(&self, profile: &UserProfile, now: DateTime<Utc>) -> Result<UserRecord> {
        Storage::get_or_create_user(self, profile, now)
    }

    fn get_or_create_membership(
        &self,
        key: MembershipKey,
        now: DateTime<Utc>,
    ) -> Result<Membership> {
        Storage::get_or_create_membership(self, key, now)
    }

    fn save_membership(&self, membership: &Membership) -> Result<()> {
        Storage::save_membership(self, membership)
    }

    fn list_memberships(&self, room_id: i64) -> Result<Vec<Membership>> {
        Storage::list_memberships(self, room_id)
    }

    fn increment_count(&self, key: MembershipKey) -> Result<u32> {
        Storage::increment_count(self, key)
    }

    fn reset_count(&self, key: MembershipKey, now: DateTime<Utc>) -> Result<()> {
        Storage::reset_count(self, key, now)
    }

    fn set_mute(&self, key: MembershipKey, setting: MuteSetting, now: DateTime<Utc>) -> Result<()> {
        Storage::set_mute(self, key, setting, now)
    }

    fn set_temporary_limit(
        &self,
        key: MembershipKey,
        limit: Option<(u32, DateTime<Utc>)>,
    ) -> Result<()> {
        Storage::set_temporary_limit(self, key, limit)
    }

    fn set_permanent_limit(&self, key: MembershipKey, limit: Option<u32>) -> Result<()> {
        Storage::set_permanent_limit(self, key, limit)
    }

    fn global_settings(&self) -> Result<GlobalSettings> {
        Storage::global_settings(self)
    }

    fn append_action_log(&self, entry: &ActionLogEntry) -> Result<()> {
        Storage::append_action_log(self, entry)
    }

    fn monthly_reset(
        &self,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        Storage::monthly_reset(self, period_start, now)
    }

    fn release_expired_mutes(
        &self,
        now: DateTime<Utc>,
        indefinite_cutoff: Option<DateTime<Utc>>,
    ) -> Result<SweepOutcome> {
        Storage::release_expired_mutes(self, now, indefinite_cutoff)
    }

    fn expire_temporary_limits(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        Storage::expire_temporary_limits(self, now)
    }
}
