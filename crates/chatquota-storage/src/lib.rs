//! chatquota Storage
//!
//! SQLite persistence for rooms, users, memberships, global settings and the action log

mod records;

pub use records::{
    ActionLogEntry, GlobalSettings, Membership, MembershipKey, MuteReason, MuteSetting,
    RoomRecord, SweepOutcome, UserProfile, UserRecord, SEED_BANNED_WORDS, SEED_MESSAGE_LIMIT,
    SEED_MIN_LENGTH,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

const MEMBERSHIP_COLUMNS: &str = "user_id, room_id, message_count, custom_limit, temp_limit, \
     temp_limit_expires_at, is_muted, mute_until, mute_reason, muted_at, last_reset_at, \
     last_temp_reset_at";

const ROOM_COLUMNS: &str = "id, title, message_limit, exclude_words, exclude_use_regex, \
     banned_words, notification_overrides, is_active";

pub struct Storage {
    conn: rusqlite::Connection,
    seed: GlobalSettings,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY,
                title TEXT,
                message_limit INTEGER,
                exclude_words TEXT NOT NULL DEFAULT '[]',
                exclude_use_regex INTEGER,
                banned_words TEXT,
                notification_overrides TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                is_global_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memberships (
                user_id INTEGER NOT NULL,
                room_id INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                custom_limit INTEGER,
                temp_limit INTEGER,
                temp_limit_expires_at TEXT,
                is_muted INTEGER NOT NULL DEFAULT 0,
                mute_until TEXT,
                last_reset_at TEXT NOT NULL,
                last_temp_reset_at TEXT,
                PRIMARY KEY (user_id, room_id)
            );

            CREATE TABLE IF NOT EXISTS global_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                contact_link TEXT NOT NULL DEFAULT '',
                default_message_limit INTEGER NOT NULL,
                default_min_length INTEGER NOT NULL,
                default_exclude_words TEXT NOT NULL DEFAULT '[]',
                default_exclude_use_regex INTEGER NOT NULL DEFAULT 0,
                default_banned_words TEXT NOT NULL DEFAULT '[]',
                default_notifications TEXT NOT NULL DEFAULT '{}',
                auto_unblock_days INTEGER NOT NULL DEFAULT 0,
                security_log_enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                user_id INTEGER,
                room_id INTEGER,
                details TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_action_log_room
            ON action_log(room_id, id);
            ",
        )?;

        Self::ensure_membership_schema(&conn)?;

        Ok(Self {
            conn,
            seed: GlobalSettings::default(),
        })
    }

    /// Values written when the global settings row is first created.
    pub fn with_global_seed(mut self, seed: GlobalSettings) -> Self {
        self.seed = seed;
        self
    }

    fn ensure_membership_schema(conn: &rusqlite::Connection) -> Result<()> {
        let mut has_mute_reason = false;
        let mut has_muted_at = false;
        let mut stmt = conn.prepare("PRAGMA table_info(memberships)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for col in columns {
            let col = col?;
            if col.eq_ignore_ascii_case("mute_reason") {
                has_mute_reason = true;
            } else if col.eq_ignore_ascii_case("muted_at") {
                has_muted_at = true;
            }
        }

        if !has_mute_reason {
            conn.execute("ALTER TABLE memberships ADD COLUMN mute_reason TEXT", [])?;
        }
        if !has_muted_at {
            conn.execute("ALTER TABLE memberships ADD COLUMN muted_at TEXT", [])?;
        }

        // Rows muted before reasons were tracked: a set deadline means a timed mute.
        conn.execute(
            "UPDATE memberships
             SET mute_reason = CASE WHEN mute_until IS NULL THEN 'quota' ELSE 'empty_media' END
             WHERE is_muted = 1 AND mute_reason IS NULL",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memberships_muted
             ON memberships(is_muted, mute_until)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memberships_temp_limit
             ON memberships(temp_limit_expires_at)",
            [],
        )?;

        Ok(())
    }

    // Global settings

    pub fn global_settings(&self) -> Result<GlobalSettings> {
        if let Some(settings) = self.load_global_settings()? {
            return Ok(settings);
        }
        self.save_global_settings(&self.seed)?;
        Ok(self.seed.clone())
    }

    fn load_global_settings(&self) -> Result<Option<GlobalSettings>> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_link, default_message_limit, default_min_length, default_exclude_words,
                    default_exclude_use_regex, default_banned_words, default_notifications,
                    auto_unblock_days, security_log_enabled
             FROM global_settings WHERE id = 1",
        )?;
        let settings = stmt
            .query_row([], |row| {
                Ok(GlobalSettings {
                    contact_link: row.get(0)?,
                    default_message_limit: row.get(1)?,
                    default_min_length: row.get(2)?,
                    default_exclude_words: json_at(row, 3)?,
                    default_exclude_use_regex: row.get(4)?,
                    default_banned_words: json_at(row, 5)?,
                    default_notifications: json_at(row, 6)?,
                    auto_unblock_days: row.get(7)?,
                    security_log_enabled: row.get(8)?,
                })
            })
            .optional()?;
        Ok(settings)
    }

    pub fn save_global_settings(&self, settings: &GlobalSettings) -> Result<()> {
        self.conn.execute(
            "INSERT INTO global_settings (id, contact_link, default_message_limit, default_min_length,
                 default_exclude_words, default_exclude_use_regex, default_banned_words,
                 default_notifications, auto_unblock_days, security_log_enabled)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 contact_link = excluded.contact_link,
                 default_message_limit = excluded.default_message_limit,
                 default_min_length = excluded.default_min_length,
                 default_exclude_words = excluded.default_exclude_words,
                 default_exclude_use_regex = excluded.default_exclude_use_regex,
                 default_banned_words = excluded.default_banned_words,
                 default_notifications = excluded.default_notifications,
                 auto_unblock_days = excluded.auto_unblock_days,
                 security_log_enabled = excluded.security_log_enabled",
            (
                &settings.contact_link,
                settings.default_message_limit,
                settings.default_min_length,
                serde_json::to_string(&settings.default_exclude_words)?,
                settings.default_exclude_use_regex,
                serde_json::to_string(&settings.default_banned_words)?,
                serde_json::to_string(&settings.default_notifications)?,
                settings.auto_unblock_days,
                settings.security_log_enabled,
            ),
        )?;
        Ok(())
    }

    // Rooms

    pub fn get_room(&self, room_id: i64) -> Result<Option<RoomRecord>> {
        let sql = format!("SELECT {} FROM rooms WHERE id = ?1", ROOM_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let room = stmt.query_row([room_id], room_from_row).optional()?;
        Ok(room)
    }

    /// Creates the room on first sight and refreshes its title when a new one is seen.
    pub fn get_or_create_room(
        &self,
        room_id: i64,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RoomRecord> {
        self.conn.execute(
            "INSERT OR IGNORE INTO rooms (id, title, created_at) VALUES (?1, ?2, ?3)",
            (room_id, title, fmt_ts(&now)),
        )?;
        if let Some(title) = title {
            self.conn.execute(
                "UPDATE rooms SET title = ?2 WHERE id = ?1 AND (title IS NULL OR title != ?2)",
                (room_id, title),
            )?;
        }
        self.get_room(room_id)?
            .ok_or_else(|| anyhow!("room {} missing after insert", room_id))
    }

    pub fn save_room(&self, room: &RoomRecord) -> Result<()> {
        let banned_words = room
            .banned_words
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed = self.conn.execute(
            "UPDATE rooms SET title = ?2, message_limit = ?3, exclude_words = ?4,
                 exclude_use_regex = ?5, banned_words = ?6, notification_overrides = ?7,
                 is_active = ?8
             WHERE id = ?1",
            (
                room.id,
                &room.title,
                room.message_limit,
                serde_json::to_string(&room.exclude_words)?,
                room.exclude_use_regex,
                banned_words,
                serde_json::to_string(&room.notification_overrides)?,
                room.is_active,
            ),
        )?;
        if changed == 0 {
            return Err(anyhow!("room {} not found", room.id));
        }
        Ok(())
    }

    /// Returns true when the flag actually changed.
    pub fn set_room_active(&self, room_id: i64, active: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE rooms SET is_active = ?2 WHERE id = ?1 AND is_active != ?2",
            (room_id, active),
        )?;
        Ok(changed > 0)
    }

    pub fn list_rooms(&self) -> Result<Vec<RoomRecord>> {
        let sql = format!("SELECT {} FROM rooms ORDER BY id", ROOM_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rooms = stmt.query_map([], room_from_row)?;

        let mut result = Vec::new();
        for room in rooms {
            result.push(room?);
        }
        Ok(result)
    }

    // Users

    pub fn get_or_create_user(&self, profile: &UserProfile, now: DateTime<Utc>) -> Result<UserRecord> {
        self.conn.execute(
            "INSERT INTO users (id, username, first_name, last_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name",
            (
                profile.id,
                &profile.username,
                &profile.first_name,
                &profile.last_name,
                fmt_ts(&now),
            ),
        )?;

        let user = self.conn.query_row(
            "SELECT id, username, first_name, last_name, is_global_admin FROM users WHERE id = ?1",
            [profile.id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    is_global_admin: row.get(4)?,
                })
            },
        )?;
        Ok(user)
    }

    // Memberships

    pub fn get_membership(&self, key: MembershipKey) -> Result<Option<Membership>> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE user_id = ?1 AND room_id = ?2",
            MEMBERSHIP_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let membership = stmt
            .query_row((key.user_id, key.room_id), membership_from_row)
            .optional()?;
        Ok(membership)
    }

    pub fn get_or_create_membership(
        &self,
        key: MembershipKey,
        now: DateTime<Utc>,
    ) -> Result<Membership> {
        self.conn.execute(
            "INSERT OR IGNORE INTO memberships (user_id, room_id, last_reset_at) VALUES (?1, ?2, ?3)",
            (key.user_id, key.room_id, fmt_ts(&now)),
        )?;
        self.get_membership(key)?
            .ok_or_else(|| anyhow!("membership {} missing after insert", key))
    }

    pub fn save_membership(&self, m: &Membership) -> Result<()> {
        self.conn.execute(
            "INSERT INTO memberships (user_id, room_id, message_count, custom_limit, temp_limit,
                 temp_limit_expires_at, is_muted, mute_until, mute_reason, muted_at,
                 last_reset_at, last_temp_reset_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(user_id, room_id) DO UPDATE SET
                 message_count = excluded.message_count,
                 custom_limit = excluded.custom_limit,
                 temp_limit = excluded.temp_limit,
                 temp_limit_expires_at = excluded.temp_limit_expires_at,
                 is_muted = excluded.is_muted,
                 mute_until = excluded.mute_until,
                 mute_reason = excluded.mute_reason,
                 muted_at = excluded.muted_at,
                 last_reset_at = excluded.last_reset_at,
                 last_temp_reset_at = excluded.last_temp_reset_at",
            (
                m.user_id,
                m.room_id,
                m.message_count,
                m.custom_limit,
                m.temp_limit,
                m.temp_limit_expires_at.as_ref().map(fmt_ts),
                m.is_muted,
                m.mute_until.as_ref().map(fmt_ts),
                m.mute_reason.map(|r| r.as_str()),
                m.muted_at.as_ref().map(fmt_ts),
                fmt_ts(&m.last_reset_at),
                m.last_temp_reset_at.as_ref().map(fmt_ts),
            ),
        )?;
        Ok(())
    }

    pub fn increment_count(&self, key: MembershipKey) -> Result<u32> {
        let count = self.conn.query_row(
            "UPDATE memberships SET message_count = message_count + 1
             WHERE user_id = ?1 AND room_id = ?2
             RETURNING message_count",
            (key.user_id, key.room_id),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn reset_count(&self, key: MembershipKey, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE memberships SET message_count = 0, last_reset_at = ?3
             WHERE user_id = ?1 AND room_id = ?2",
            (key.user_id, key.room_id, fmt_ts(&now)),
        )?;
        Ok(())
    }

    pub fn set_mute(&self, key: MembershipKey, setting: MuteSetting, now: DateTime<Utc>) -> Result<()> {
        let mut membership = self.get_or_create_membership(key, now)?;
        membership.apply_mute(setting, now);
        self.save_membership(&membership)
    }

    /// Sets or clears the temporary limit together with its expiry.
    pub fn set_temporary_limit(
        &self,
        key: MembershipKey,
        limit: Option<(u32, DateTime<Utc>)>,
    ) -> Result<()> {
        let (value, expires) = match limit {
            Some((value, expires)) => (Some(value), Some(fmt_ts(&expires))),
            None => (None, None),
        };
        self.conn.execute(
            "UPDATE memberships SET temp_limit = ?3, temp_limit_expires_at = ?4
             WHERE user_id = ?1 AND room_id = ?2",
            (key.user_id, key.room_id, value, expires),
        )?;
        Ok(())
    }

    pub fn set_permanent_limit(&self, key: MembershipKey, limit: Option<u32>) -> Result<()> {
        self.conn.execute(
            "UPDATE memberships SET custom_limit = ?3 WHERE user_id = ?1 AND room_id = ?2",
            (key.user_id, key.room_id, limit),
        )?;
        Ok(())
    }

    pub fn list_memberships(&self, room_id: i64) -> Result<Vec<Membership>> {
        let sql = format!(
            "SELECT {} FROM memberships WHERE room_id = ?1 ORDER BY user_id",
            MEMBERSHIP_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([room_id], membership_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // Sweeps

    /// Starts a fresh counting period for memberships without a temporary limit whose last
    /// reset predates `period_start`. Quota mutes on those rows are lifted.
    pub fn monthly_reset(
        &self,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SweepOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let start = fmt_ts(&period_start);

        let unmuted = collect_keys(
            &tx,
            "SELECT user_id, room_id FROM memberships
             WHERE temp_limit IS NULL AND last_reset_at < ?1
               AND is_muted = 1 AND mute_until IS NULL",
            (&start,),
        )?;

        let updated = tx.execute(
            "UPDATE memberships SET message_count = 0, last_reset_at = ?2
             WHERE temp_limit IS NULL AND last_reset_at < ?1",
            (&start, fmt_ts(&now)),
        )?;

        for key in &unmuted {
            clear_mute(&tx, *key)?;
        }
        tx.commit()?;

        Ok(SweepOutcome { updated, unmuted })
    }

    /// Lifts timed mutes that ended at or before `now`. With `indefinite_cutoff`, quota mutes
    /// that started at or before the cutoff are lifted too and their counter restarts.
    pub fn release_expired_mutes(
        &self,
        now: DateTime<Utc>,
        indefinite_cutoff: Option<DateTime<Utc>>,
    ) -> Result<SweepOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let now_ts = fmt_ts(&now);

        let mut unmuted = collect_keys(
            &tx,
            "SELECT user_id, room_id FROM memberships
             WHERE is_muted = 1 AND mute_until IS NOT NULL AND mute_until <= ?1",
            (&now_ts,),
        )?;

        let stale = match indefinite_cutoff {
            Some(cutoff) => collect_keys(
                &tx,
                "SELECT user_id, room_id FROM memberships
                 WHERE is_muted = 1 AND mute_until IS NULL
                   AND muted_at IS NOT NULL AND muted_at <= ?1",
                (fmt_ts(&cutoff),),
            )?,
            None => Vec::new(),
        };

        for key in &unmuted {
            clear_mute(&tx, *key)?;
        }
        for key in &stale {
            clear_mute(&tx, *key)?;
            tx.execute(
                "UPDATE memberships SET message_count = 0, last_reset_at = ?3
                 WHERE user_id = ?1 AND room_id = ?2",
                (key.user_id, key.room_id, &now_ts),
            )?;
        }
        tx.commit()?;

        unmuted.extend(stale);
        Ok(SweepOutcome {
            updated: unmuted.len(),
            unmuted,
        })
    }

    /// Clears temporary limits whose expiry passed, starting a fresh counting period, and heals
    /// rows where only one of limit and expiry is set.
    pub fn expire_temporary_limits(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        let now_ts = fmt_ts(&now);

        tx.execute(
            "UPDATE memberships SET temp_limit = NULL, temp_limit_expires_at = NULL
             WHERE (temp_limit IS NULL) != (temp_limit_expires_at IS NULL)",
            [],
        )?;

        let unmuted = collect_keys(
            &tx,
            "SELECT user_id, room_id FROM memberships
             WHERE temp_limit_expires_at IS NOT NULL AND temp_limit_expires_at <= ?1
               AND is_muted = 1 AND mute_until IS NULL",
            (&now_ts,),
        )?;

        let updated = tx.execute(
            "UPDATE memberships
             SET temp_limit = NULL, temp_limit_expires_at = NULL, message_count = 0,
                 last_reset_at = ?1, last_temp_reset_at = ?1
             WHERE temp_limit_expires_at IS NOT NULL AND temp_limit_expires_at <= ?1",
            (&now_ts,),
        )?;

        for key in &unmuted {
            clear_mute(&tx, *key)?;
        }
        tx.commit()?;

        Ok(SweepOutcome { updated, unmuted })
    }

    // Action log

    pub fn append_action_log(&self, entry: &ActionLogEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO action_log (action, user_id, room_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &entry.action,
                entry.user_id,
                entry.room_id,
                &entry.details,
                fmt_ts(&entry.created_at),
            ),
        )?;
        Ok(())
    }

    pub fn list_actions(&self, room_id: Option<i64>, limit: usize) -> Result<Vec<ActionLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT action, user_id, room_id, details, created_at
             FROM action_log
             WHERE ?1 IS NULL OR room_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((room_id, limit as i64), |row| {
            Ok(ActionLogEntry {
                action: row.get(0)?,
                user_id: row.get(1)?,
                room_id: row.get(2)?,
                details: row.get(3)?,
                created_at: ts_at(row, 4)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn clear_mute(conn: &rusqlite::Connection, key: MembershipKey) -> Result<()> {
    conn.execute(
        "UPDATE memberships
         SET is_muted = 0, mute_until = NULL, mute_reason = NULL, muted_at = NULL
         WHERE user_id = ?1 AND room_id = ?2",
        (key.user_id, key.room_id),
    )?;
    Ok(())
}

fn collect_keys<P: rusqlite::Params>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: P,
) -> Result<Vec<MembershipKey>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| Ok(MembershipKey::new(row.get(0)?, row.get(1)?)))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRecord> {
    let banned_words: Option<String> = row.get(5)?;
    let banned_words = match banned_words {
        Some(raw) => Some(parse_json(5, &raw)?),
        None => None,
    };
    Ok(RoomRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        message_limit: row.get(2)?,
        exclude_words: json_at(row, 3)?,
        exclude_use_regex: row.get(4)?,
        banned_words,
        notification_overrides: json_at::<HashMap<String, String>>(row, 6)?,
        is_active: row.get(7)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    let mute_reason: Option<String> = row.get(8)?;
    Ok(Membership {
        user_id: row.get(0)?,
        room_id: row.get(1)?,
        message_count: row.get(2)?,
        custom_limit: row.get(3)?,
        temp_limit: row.get(4)?,
        temp_limit_expires_at: opt_ts_at(row, 5)?,
        is_muted: row.get(6)?,
        mute_until: opt_ts_at(row, 7)?,
        mute_reason: mute_reason.as_deref().and_then(MuteReason::parse),
        muted_at: opt_ts_at(row, 9)?,
        last_reset_at: ts_at(row, 10)?,
        last_temp_reset_at: opt_ts_at(row, 11)?,
    })
}

pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| parse_ts(idx, &value)).transpose()
}

fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse_json(idx, &raw)
}
