use crate::album::{AlbumAggregator, AlbumKey, AlbumPush};
use crate::clock::{Clock, SystemClock};
use crate::commands::{self, MemberCommand, RoomStats, StatusView};
use crate::error::EngineError;
use crate::ledger::{self, Admission, Refresh, Tally};
use crate::mute::{self, MuteState, StrikeBook, STRIKE_THRESHOLD};
use crate::reaper::NoticeReaper;
use crate::store::SharedStore;
use chatquota_config::{Config, ModerationConfig, NoticeTtlConfig};
use chatquota_ipc::{
    BusEvent, ChatPlatform, InboundMessage, MemberStatus, MessageHandle, RestrictUntil, SenderInfo,
};
use chatquota_policy::{
    classify, escape_html, format_mute_until, is_group_room, mask_banned_words, mask_word, render,
    Classification, EffectiveSettings, LimitInput, NoticeKind,
};
use chatquota_storage::{
    ActionLogEntry, MembershipKey, MuteReason, MuteSetting, SweepOutcome, UserProfile,
};
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Characters of the offending message quoted in a banned-word notice.
const BANNED_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub album_debounce: Duration,
    pub album_max_items: usize,
    pub album_history_limit: usize,
    pub album_stale: Duration,
    pub notice_ttl: NoticeTtlConfig,
    /// Idle time after which an empty-media strike counter is dropped.
    pub strike_idle: Duration,
    /// When set, rooms outside the list are ignored.
    pub allowed_chats: Option<Vec<i64>>,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        let allowed_chats = config
            .telegram
            .as_ref()
            .and_then(|telegram| telegram.allowed_chats.clone());
        Self::from_moderation(&config.moderation, allowed_chats)
    }

    fn from_moderation(moderation: &ModerationConfig, allowed_chats: Option<Vec<i64>>) -> Self {
        Self {
            album_debounce: Duration::from_millis(moderation.album_debounce_ms),
            album_max_items: moderation.album_max_items,
            album_history_limit: moderation.album_history_limit,
            album_stale: Duration::from_secs(moderation.album_stale_secs),
            notice_ttl: moderation.notice_ttl.clone(),
            strike_idle: Duration::from_secs(moderation.strike_idle_secs),
            allowed_chats,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_moderation(&ModerationConfig::default(), None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSender,
    BotSender,
    NotAGroup,
    NotAllowed,
    RoomInactive,
    Admin,
    AlbumFull,
    AlbumClosed,
}

/// What the engine did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    /// Held in an album buffer until the debounce timer fires.
    Buffered,
    IgnoredShort,
    Counted {
        count: u32,
        limit: u32,
        warned: bool,
        muted: bool,
    },
    Excepted,
    Blocked,
    EmptyMedia {
        strikes: u32,
        muted: bool,
    },
    Banned {
        word: String,
    },
    /// Empty media or banned content from an already muted user.
    DeletedWhileMuted,
    Command,
    RoomStatus {
        active: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub input: LimitInput,
    pub lifted_mute: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub updated: usize,
    pub unmuted: usize,
    pub unrestrict_failures: usize,
}

/// One logical submission: a single message or a whole album.
struct Submission {
    key: MembershipKey,
    handles: Vec<MessageHandle>,
    text: String,
    has_media_without_caption: bool,
    album: bool,
    trace_id: String,
}

#[derive(Clone)]
pub struct ModerationEngine {
    store: SharedStore,
    platform: Arc<dyn ChatPlatform>,
    clock: Arc<dyn Clock>,
    options: Arc<EngineOptions>,
    albums: Arc<Mutex<AlbumAggregator>>,
    strikes: Arc<Mutex<StrikeBook>>,
    key_locks: Arc<Mutex<HashMap<MembershipKey, Arc<Mutex<()>>>>>,
    reaper: NoticeReaper,
}

impl ModerationEngine {
    pub fn new(store: SharedStore, platform: Arc<dyn ChatPlatform>, options: EngineOptions) -> Self {
        let albums = AlbumAggregator::new(
            options.album_max_items,
            options.album_history_limit,
            options.album_stale,
        );
        Self {
            store,
            reaper: NoticeReaper::new(Arc::clone(&platform)),
            platform,
            clock: Arc::new(SystemClock),
            options: Arc::new(options),
            albums: Arc::new(Mutex::new(albums)),
            strikes: Arc::new(Mutex::new(StrikeBook::new())),
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn handle_event(&self, event: BusEvent) -> EngineResult<Outcome> {
        match event {
            BusEvent::Message(message) => self.handle_message(message).await,
            BusEvent::BotMembership {
                room_id,
                room_title,
                status,
            } => {
                self.handle_bot_membership(room_id, room_title.as_deref(), status)
                    .await
            }
        }
    }

    pub async fn handle_message(&self, message: InboundMessage) -> EngineResult<Outcome> {
        let sender = match &message.sender {
            Some(sender) => sender.clone(),
            None => return Ok(Outcome::Skipped(SkipReason::NoSender)),
        };
        if sender.is_bot {
            return Ok(Outcome::Skipped(SkipReason::BotSender));
        }
        if !is_group_room(message.room_id) {
            return Ok(Outcome::Skipped(SkipReason::NotAGroup));
        }
        if !self.is_room_allowed(message.room_id) {
            return Ok(Outcome::Skipped(SkipReason::NotAllowed));
        }

        let now = self.now();
        let room_active = {
            let store = self.store.lock().await;
            store
                .get_or_create_room(message.room_id, message.room_title.as_deref(), now)?
                .is_active
        };
        if !room_active {
            return Ok(Outcome::Skipped(SkipReason::RoomInactive));
        }

        let is_admin = self.is_admin(message.room_id, sender.id).await;
        if let Some(word) = commands::command_word(message.body_text()) {
            if let Some(command) = MemberCommand::parse(&word) {
                return self
                    .member_command(&message, &sender, command, is_admin)
                    .await;
            }
            if is_admin {
                return self.handle_command(&message).await;
            }
        }
        if is_admin {
            return Ok(Outcome::Skipped(SkipReason::Admin));
        }

        let key = MembershipKey::new(sender.id, message.room_id);
        {
            let store = self.store.lock().await;
            store.get_or_create_user(&profile_of(&sender), now)?;
            store.get_or_create_membership(key, now)?;
        }

        let lock = self.key_lock(key).await;
        let _guard = lock.lock_owned().await;

        if let Some(album_id) = message.album_id.as_deref() {
            let album_key = AlbumKey::new(message.room_id, album_id);
            let pushed = self
                .albums
                .lock()
                .await
                .push(album_key.clone(), &message, Instant::now());
            return Ok(match pushed {
                AlbumPush::Opened => {
                    debug!(
                        "Album {} opened (user={}, trace_id={})",
                        album_key, sender.id, message.trace_id
                    );
                    self.schedule_album(album_key);
                    Outcome::Buffered
                }
                AlbumPush::Appended => Outcome::Buffered,
                AlbumPush::Full => Outcome::Skipped(SkipReason::AlbumFull),
                AlbumPush::Closed => Outcome::Skipped(SkipReason::AlbumClosed),
            });
        }

        let submission = Submission {
            key,
            handles: vec![message.handle()],
            text: message.body_text().to_string(),
            has_media_without_caption: message.has_media_without_caption(),
            album: false,
            trace_id: message.trace_id.clone(),
        };
        self.process(submission).await
    }

    fn schedule_album(&self, key: AlbumKey) {
        let engine = self.clone();
        let delay = self.options.album_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = engine.fire_album(&key).await {
                error!("Error processing album {}: {}", key, e);
            }
        });
    }

    /// Classifies a buffered album once. Later calls for the same key return `None`.
    pub async fn fire_album(&self, key: &AlbumKey) -> EngineResult<Option<Outcome>> {
        let taken = self.albums.lock().await.take(key, Instant::now());
        let Some(buffer) = taken else {
            return Ok(None);
        };

        let member = MembershipKey::new(buffer.sender.id, key.room_id);
        let lock = self.key_lock(member).await;
        let _guard = lock.lock_owned().await;

        debug!(
            "Album {} closed with {} items (trace_id={})",
            key,
            buffer.handles.len(),
            buffer.trace_id
        );
        let submission = Submission {
            key: member,
            text: buffer.text().to_string(),
            has_media_without_caption: buffer.has_media_without_caption(),
            handles: buffer.handles,
            album: true,
            trace_id: buffer.trace_id,
        };
        self.process(submission).await.map(Some)
    }

    async fn process(&self, submission: Submission) -> EngineResult<Outcome> {
        let now = self.now();
        let key = submission.key;
        let settings = self.effective_settings(key.room_id).await;
        let classification = classify(
            &submission.text,
            submission.has_media_without_caption,
            &settings,
        );
        debug!(
            "Classified submission as {} (user={}, room={}, trace_id={})",
            classification.label(),
            key.user_id,
            key.room_id,
            submission.trace_id
        );

        let tally = match classification {
            Classification::Count => Some(Tally::Count),
            Classification::Excepted { .. } => Some(Tally::Reset),
            _ => None,
        };

        let (refreshed, admission) = {
            let store = self.store.lock().await;
            let refreshed = ledger::refresh(&*store, key, now)?;
            let admission = match tally {
                Some(tally) => Some(ledger::admit(
                    &*store,
                    &refreshed.membership,
                    settings.limit,
                    tally,
                    now,
                )?),
                None => None,
            };
            (refreshed, admission)
        };
        self.settle_refresh(&refreshed, &settings).await;
        let muted = MuteState::of(&refreshed.membership).is_muted();

        match (classification, admission) {
            (Classification::IgnoreEmptyMedia, _) if muted => {
                self.delete_all(&submission.handles).await;
                Ok(Outcome::DeletedWhileMuted)
            }
            (Classification::IgnoreEmptyMedia, _) => {
                self.empty_media_strike(&submission, &settings, now).await
            }
            (Classification::RejectBanned { .. }, _) if muted => {
                self.delete_all(&submission.handles).await;
                Ok(Outcome::DeletedWhileMuted)
            }
            (Classification::RejectBanned { word }, _) => {
                self.banned_word_block(&submission, &word, &settings, now)
                    .await
            }
            (Classification::Count, Some(admission)) => {
                self.settle_admission(&submission, admission, &settings, now, false)
                    .await
            }
            (Classification::Excepted { pattern }, Some(admission)) => {
                debug!(
                    "Submission matched exclusion '{}' (user={}, room={})",
                    pattern, key.user_id, key.room_id
                );
                self.settle_admission(&submission, admission, &settings, now, true)
                    .await
            }
            (Classification::IgnoreShort { .. }, _) | (_, None) => Ok(Outcome::IgnoredShort),
        }
    }

    async fn settle_refresh(&self, refreshed: &Refresh, settings: &EffectiveSettings) {
        let key = refreshed.membership.key();
        if refreshed.temp_limit_expired {
            info!(
                "Temporary limit expired (user={}, room={})",
                key.user_id, key.room_id
            );
            self.log_action(
                settings.security_log_enabled,
                "temporary_limit_expired",
                key,
                "fresh counting period".to_string(),
            )
            .await;
        }
        if refreshed.mute_lifted {
            self.unrestrict(key).await;
            self.log_action(
                settings.security_log_enabled,
                "auto_unblock",
                key,
                "mute ended".to_string(),
            )
            .await;
        }
    }

    async fn settle_admission(
        &self,
        submission: &Submission,
        admission: Admission,
        settings: &EffectiveSettings,
        now: DateTime<Utc>,
        excepted: bool,
    ) -> EngineResult<Outcome> {
        let key = submission.key;
        let (count, limit, warned, muted_now) = match admission {
            Admission::Blocked { state, limit } => {
                debug!(
                    "Muted user posted (user={}, room={}, trace_id={})",
                    key.user_id, key.room_id, submission.trace_id
                );
                self.send_blocked_notice(key, state, limit, settings).await;
                return Ok(Outcome::Blocked);
            }
            Admission::Admitted {
                count,
                limit,
                warned,
                muted_now,
            } => (count, limit, warned, muted_now),
        };

        self.strikes.lock().await.clear(key);

        if warned {
            let remaining = limit.saturating_sub(count).to_string();
            let text = render(
                settings.notices.get(NoticeKind::QuotaWarning),
                &[
                    ("N", remaining.as_str()),
                    ("user_limit", limit.to_string().as_str()),
                    ("contact_link", settings.contact_link.as_str()),
                ],
            );
            self.send_notice(
                key.room_id,
                text,
                self.options.notice_ttl.quota_warning_secs,
            )
            .await;
            self.log_action(
                settings.security_log_enabled,
                "warning_sent",
                key,
                format!("remaining: {}", remaining),
            )
            .await;
        }

        if muted_now {
            self.quota_mute(key, count, limit, settings, now).await;
        }

        if excepted {
            return Ok(Outcome::Excepted);
        }
        Ok(Outcome::Counted {
            count,
            limit,
            warned,
            muted: muted_now,
        })
    }

    async fn quota_mute(
        &self,
        key: MembershipKey,
        count: u32,
        limit: u32,
        settings: &EffectiveSettings,
        now: DateTime<Utc>,
    ) {
        let until = mute::first_day_of_next_month(now);
        let restricted = self.restrict(key, RestrictUntil::Until(until)).await;
        info!(
            "Quota exhausted (user={}, room={}, count={}, limit={})",
            key.user_id, key.room_id, count, limit
        );

        let text = render(
            settings.notices.get(NoticeKind::LimitExceeded),
            &[
                ("user_limit", limit.to_string().as_str()),
                ("contact_link", settings.contact_link.as_str()),
            ],
        );
        self.send_notice(key.room_id, text, self.options.notice_ttl.limit_notice_secs)
            .await;

        let (action, details) = if restricted {
            ("user_blocked", format!("limit: {}, messages: {}", limit, count))
        } else {
            ("block_failed", "platform restriction failed, mute kept".to_string())
        };
        self.log_action(settings.security_log_enabled, action, key, details)
            .await;
    }

    async fn send_blocked_notice(
        &self,
        key: MembershipKey,
        state: MuteState,
        limit: u32,
        settings: &EffectiveSettings,
    ) {
        let text = match state {
            MuteState::Until(until) => render(
                settings.notices.get(NoticeKind::UserBlocked),
                &[
                    ("mute_until", format_mute_until(&until).as_str()),
                    ("contact_link", settings.contact_link.as_str()),
                ],
            ),
            MuteState::Indefinite | MuteState::Unmuted => render(
                settings.notices.get(NoticeKind::LimitExceeded),
                &[
                    ("user_limit", limit.to_string().as_str()),
                    ("contact_link", settings.contact_link.as_str()),
                ],
            ),
        };
        self.send_notice(key.room_id, text, self.options.notice_ttl.blocked_notice_secs)
            .await;
    }

    async fn empty_media_strike(
        &self,
        submission: &Submission,
        settings: &EffectiveSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<Outcome> {
        let key = submission.key;
        self.delete_all(&submission.handles).await;
        if submission.album {
            self.log_action(
                settings.security_log_enabled,
                "album_empty_deleted",
                key,
                format!("items: {}", submission.handles.len()),
            )
            .await;
        }

        let strike = self.strikes.lock().await.record(key, Instant::now());
        let ttl = self.options.notice_ttl.empty_warning_secs;

        if !strike.mute {
            let mut text = render(
                settings.notices.get(NoticeKind::EmptyMessage),
                &[("contact_link", settings.contact_link.as_str())],
            );
            if !text.contains("Предупреждение") {
                text.push_str(&format!(
                    "\n\nПредупреждение {}/{}",
                    strike.count, STRIKE_THRESHOLD
                ));
            }
            self.send_notice(key.room_id, text, ttl).await;
            self.log_action(
                settings.security_log_enabled,
                "empty_message_warning",
                key,
                format!("strike {}/{}", strike.count, STRIKE_THRESHOLD),
            )
            .await;
            return Ok(Outcome::EmptyMedia {
                strikes: strike.count,
                muted: false,
            });
        }

        let until = mute::timed_mute_until(now);
        {
            let store = self.store.lock().await;
            store.set_mute(key, MuteSetting::Until(until, MuteReason::EmptyMedia), now)?;
        }
        self.restrict(key, RestrictUntil::Until(until)).await;
        info!(
            "Muted for empty media until {} (user={}, room={}, trace_id={})",
            until, key.user_id, key.room_id, submission.trace_id
        );

        let date = format_mute_until(&until);
        let template = settings.notices.get(NoticeKind::EmptyMessageBlocked);
        let mut text = render(
            template,
            &[
                ("mute_until", date.as_str()),
                ("contact_link", settings.contact_link.as_str()),
            ],
        );
        if !template.contains("{mute_until}") {
            text.push_str(&format!("\n\nДо: {}", date));
        }
        self.send_notice(key.room_id, text, ttl).await;
        self.log_action(
            settings.security_log_enabled,
            "empty_message_mute",
            key,
            format!("until: {}", date),
        )
        .await;

        Ok(Outcome::EmptyMedia {
            strikes: strike.count,
            muted: true,
        })
    }

    async fn banned_word_block(
        &self,
        submission: &Submission,
        word: &str,
        settings: &EffectiveSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<Outcome> {
        let key = submission.key;
        self.delete_all(&submission.handles).await;

        let until = mute::timed_mute_until(now);
        {
            let store = self.store.lock().await;
            store.set_mute(key, MuteSetting::Until(until, MuteReason::BannedWord), now)?;
        }
        self.restrict(key, RestrictUntil::Until(until)).await;
        info!(
            "Muted for banned word until {} (user={}, room={}, trace_id={})",
            until, key.user_id, key.room_id, submission.trace_id
        );

        let masked = mask_word(word);
        let excerpt: String = mask_banned_words(&submission.text, &settings.banned_words)
            .chars()
            .take(BANNED_EXCERPT_CHARS)
            .collect();
        let text = render(
            settings.notices.get(NoticeKind::SwearWordBlocked),
            &[
                ("word", masked.as_str()),
                ("text", escape_html(&excerpt).as_str()),
                ("mute_until", format_mute_until(&until).as_str()),
                ("contact_link", settings.contact_link.as_str()),
            ],
        );
        self.send_notice(key.room_id, text, self.options.notice_ttl.banned_notice_secs)
            .await;
        self.log_action(
            settings.security_log_enabled,
            "swear_word_block",
            key,
            format!("word: {}", masked),
        )
        .await;

        Ok(Outcome::Banned {
            word: word.to_string(),
        })
    }

    async fn handle_command(&self, message: &InboundMessage) -> EngineResult<Outcome> {
        let room_id = message.room_id;
        let body = message.body_text();
        let command = commands::command_word(body).unwrap_or_default();
        let args: Vec<&str> = body.split_whitespace().skip(1).collect();
        let target = args.first().and_then(|raw| raw.parse::<i64>().ok());

        let reply = match command.as_str() {
            "/resetcounter" => {
                let cleared = self.reset_room_strikes(room_id).await;
                format!("✅ Счетчики пустых сообщений сброшены ({})", cleared)
            }
            "/resetempty" => match target {
                Some(user_id) => {
                    self.reset_strikes(room_id, user_id).await;
                    format!(
                        "✅ Счетчик пустых сообщений пользователя {} сброшен",
                        user_id
                    )
                }
                None => "Использование: /resetempty <user_id>".to_string(),
            },
            "/unblock" => match target {
                Some(user_id) => {
                    self.unblock(room_id, user_id).await?;
                    format!("✅ Пользователь {} разблокирован", user_id)
                }
                None => "Использование: /unblock <user_id>".to_string(),
            },
            "/setlimit" => match (target, args.get(1)) {
                (Some(user_id), Some(raw)) => match self.set_limit_from_str(room_id, user_id, raw).await
                {
                    Ok(change) => format!(
                        "✅ Лимит пользователя {}: {}",
                        user_id,
                        describe_limit(&change.input)
                    ),
                    Err(EngineError::InvalidLimitInput(e)) => {
                        format!("❌ Неверный лимит: {}", e)
                    }
                    Err(e) => return Err(e),
                },
                _ => "Использование: /setlimit <user_id> <N | L/D | 0>".to_string(),
            },
            _ => return Ok(Outcome::Skipped(SkipReason::Admin)),
        };

        info!(
            "Admin command {} in room {} (trace_id={})",
            command, room_id, message.trace_id
        );
        self.send_notice(room_id, reply, self.options.notice_ttl.command_reply_secs)
            .await;
        Ok(Outcome::Command)
    }

    async fn member_command(
        &self,
        message: &InboundMessage,
        sender: &SenderInfo,
        command: MemberCommand,
        is_admin: bool,
    ) -> EngineResult<Outcome> {
        let room_id = message.room_id;
        let settings = self.effective_settings(room_id).await;
        let reply = match command {
            MemberCommand::Status if is_admin => commands::ADMIN_STATUS_TEXT.to_string(),
            MemberCommand::Status => {
                let view = self.status_view(sender, room_id, &settings).await?;
                commands::status_text(&view, &settings.contact_link)
            }
            MemberCommand::Stats => commands::stats_text(&self.room_stats(room_id).await?),
            MemberCommand::Rules => commands::rules_text(&settings),
            MemberCommand::Help => commands::help_text(&settings),
        };

        debug!(
            "Member command /{} (user={}, room={}, trace_id={})",
            command.name(),
            sender.id,
            room_id,
            message.trace_id
        );
        let ttl = self.options.notice_ttl.command_reply_secs;
        self.send_notice(room_id, reply, ttl).await;
        self.reaper.schedule(message.handle(), Duration::from_secs(ttl));
        Ok(Outcome::Command)
    }

    async fn status_view(
        &self,
        sender: &SenderInfo,
        room_id: i64,
        settings: &EffectiveSettings,
    ) -> EngineResult<StatusView> {
        let now = self.now();
        let key = MembershipKey::new(sender.id, room_id);
        let lock = self.key_lock(key).await;
        let _guard = lock.lock_owned().await;

        let refreshed = {
            let store = self.store.lock().await;
            store.get_or_create_user(&profile_of(sender), now)?;
            ledger::refresh(&*store, key, now)?
        };
        self.settle_refresh(&refreshed, settings).await;

        let membership = &refreshed.membership;
        Ok(StatusView {
            count: membership.message_count,
            limit: ledger::effective_limit(membership, settings.limit, now),
            empty_strikes: self.strikes.lock().await.get(key),
            mute: MuteState::of(membership),
        })
    }

    async fn room_stats(&self, room_id: i64) -> EngineResult<RoomStats> {
        let memberships = self.store.lock().await.list_memberships(room_id)?;
        let strike_holders = self.strikes.lock().await.room_len(room_id);
        Ok(RoomStats {
            messages: memberships
                .iter()
                .map(|m| u64::from(m.message_count))
                .sum(),
            members: memberships.len(),
            muted: memberships.iter().filter(|m| m.is_muted).count(),
            strike_holders,
        })
    }

    /// Deactivates a room when the bot loses admin rights there and reactivates it when they
    /// come back.
    pub async fn handle_bot_membership(
        &self,
        room_id: i64,
        title: Option<&str>,
        status: MemberStatus,
    ) -> EngineResult<Outcome> {
        if !is_group_room(room_id) {
            return Ok(Outcome::Skipped(SkipReason::NotAGroup));
        }
        let now = self.now();
        let active = status.is_admin();

        let changed = {
            let store = self.store.lock().await;
            if active {
                store.get_or_create_room(room_id, title, now)?;
                store.set_room_active(room_id, true)?
            } else {
                store.deactivate_room(room_id)?
            }
        };

        if changed {
            let action = if active {
                "room_reactivated"
            } else {
                "room_deactivated"
            };
            info!("Room {} {} (bot status {:?})", room_id, action, status);
            let security = self.security_log_enabled().await;
            self.log_room_action(security, action, room_id, format!("bot status: {:?}", status))
                .await;
        }
        Ok(Outcome::RoomStatus { active })
    }

    // Admin operations

    pub async fn set_limit_from_str(
        &self,
        room_id: i64,
        user_id: i64,
        raw: &str,
    ) -> EngineResult<LimitChange> {
        let input: LimitInput = raw.parse()?;
        self.set_limit(room_id, user_id, input).await
    }

    /// Applies an admin limit. Every variant clears empty strikes and lifts a quota mute.
    pub async fn set_limit(
        &self,
        room_id: i64,
        user_id: i64,
        input: LimitInput,
    ) -> EngineResult<LimitChange> {
        let key = MembershipKey::new(user_id, room_id);
        let lock = self.key_lock(key).await;
        let _guard = lock.lock_owned().await;
        let now = self.now();

        let (lifted_mute, security) = {
            let store = self.store.lock().await;
            let mut membership = store.get_or_create_membership(key, now)?;
            let lifted = MuteState::of(&membership) == MuteState::Indefinite;

            match input {
                LimitInput::Permanent(limit) => {
                    store.set_permanent_limit(key, Some(limit))?;
                    store.set_temporary_limit(key, None)?;
                }
                LimitInput::Temporary { limit, days } => {
                    membership.temp_limit = Some(limit);
                    membership.temp_limit_expires_at =
                        Some(now + chrono::Duration::days(i64::from(days)));
                    membership.message_count = 0;
                    membership.last_reset_at = now;
                    membership.last_temp_reset_at = Some(now);
                    store.save_membership(&membership)?;
                }
                LimitInput::Clear => {
                    store.set_permanent_limit(key, None)?;
                    store.set_temporary_limit(key, None)?;
                }
            }
            if lifted {
                store.set_mute(key, MuteSetting::None, now)?;
            }
            let security = store
                .global_settings()
                .map(|s| s.security_log_enabled)
                .unwrap_or(true);
            (lifted, security)
        };

        self.strikes.lock().await.clear(key);

        let action = match input {
            LimitInput::Permanent(_) => "set_permanent_limit",
            LimitInput::Temporary { .. } => "set_temporary_limit",
            LimitInput::Clear => "reset_user_limit",
        };
        info!(
            "Limit for user {} in room {} set to {}",
            user_id, room_id, input
        );
        self.log_action(security, action, key, format!("input: {}", input))
            .await;

        if lifted_mute {
            self.unrestrict(key).await;
            self.log_action(
                security,
                "auto_unblock_with_limit",
                key,
                format!("new limit: {}", input),
            )
            .await;
        }

        Ok(LimitChange { input, lifted_mute })
    }

    /// Unmutes and restarts the counter. Returns whether the user was muted.
    pub async fn unblock(&self, room_id: i64, user_id: i64) -> EngineResult<bool> {
        let key = MembershipKey::new(user_id, room_id);
        let lock = self.key_lock(key).await;
        let _guard = lock.lock_owned().await;
        let now = self.now();

        let (was_muted, security) = {
            let store = self.store.lock().await;
            let membership = store.get_or_create_membership(key, now)?;
            store.set_mute(key, MuteSetting::None, now)?;
            store.reset_count(key, now)?;
            let security = store
                .global_settings()
                .map(|s| s.security_log_enabled)
                .unwrap_or(true);
            (membership.is_muted, security)
        };

        self.strikes.lock().await.clear(key);
        self.unrestrict(key).await;
        info!("User {} unblocked in room {}", user_id, room_id);
        self.log_action(
            security,
            "manual_unblock",
            key,
            format!("was muted: {}", was_muted),
        )
        .await;

        Ok(was_muted)
    }

    pub async fn reset_strikes(&self, room_id: i64, user_id: i64) -> bool {
        let key = MembershipKey::new(user_id, room_id);
        let cleared = self.strikes.lock().await.clear(key);
        let security = self.security_log_enabled().await;
        self.log_action(
            security,
            "reset_user_empty_counter",
            key,
            format!("had strikes: {}", cleared),
        )
        .await;
        cleared
    }

    pub async fn reset_room_strikes(&self, room_id: i64) -> usize {
        let cleared = self.strikes.lock().await.clear_room(room_id);
        let security = self.security_log_enabled().await;
        self.log_room_action(
            security,
            "reset_empty_counters",
            room_id,
            format!("cleared: {}", cleared),
        )
        .await;
        cleared
    }

    pub async fn empty_strikes(&self, room_id: i64, user_id: i64) -> u32 {
        self.strikes
            .lock()
            .await
            .get(MembershipKey::new(user_id, room_id))
    }

    // Sweeps

    /// Starts a new counting period for memberships last reset before this month. Idempotent.
    pub async fn monthly_reset(&self) -> EngineResult<SweepReport> {
        let now = self.now();
        let outcome = {
            let store = self.store.lock().await;
            store.monthly_reset(mute::month_start(now), now)?
        };
        Ok(self.finish_sweep("monthly_reset", outcome).await)
    }

    /// Lifts timed mutes that ended, plus quota mutes older than the global auto-unblock
    /// window when one is configured.
    pub async fn auto_unblock_sweep(&self) -> EngineResult<SweepReport> {
        let now = self.now();
        let outcome = {
            let store = self.store.lock().await;
            let days = store.global_settings()?.auto_unblock_days;
            let cutoff = (days > 0).then(|| now - chrono::Duration::days(i64::from(days)));
            store.release_expired_mutes(now, cutoff)?
        };
        Ok(self.finish_sweep("auto_unblock", outcome).await)
    }

    pub async fn expired_temporary_limit_sweep(&self) -> EngineResult<SweepReport> {
        let now = self.now();
        let outcome = {
            let store = self.store.lock().await;
            store.expire_temporary_limits(now)?
        };
        Ok(self.finish_sweep("temporary_limit_expired", outcome).await)
    }

    async fn finish_sweep(&self, action: &str, outcome: SweepOutcome) -> SweepReport {
        let security = self.security_log_enabled().await;
        let mut unrestrict_failures = 0;

        for key in &outcome.unmuted {
            if !self.unrestrict(*key).await {
                unrestrict_failures += 1;
            }
            self.log_action(security, action, *key, "mute lifted".to_string())
                .await;
        }

        if outcome.updated > 0 {
            info!(
                "Sweep {}: {} memberships updated, {} unmuted",
                action,
                outcome.updated,
                outcome.unmuted.len()
            );
            self.log_global_action(
                security,
                action,
                format!(
                    "updated: {}, unmuted: {}",
                    outcome.updated,
                    outcome.unmuted.len()
                ),
            )
            .await;
        }

        SweepReport {
            updated: outcome.updated,
            unmuted: outcome.unmuted.len(),
            unrestrict_failures,
        }
    }

    /// Drops stale album state and idle strikes, then frees per-key locks nobody holds.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let albums = self.albums.lock().await.prune(now);
        let strikes = self
            .strikes
            .lock()
            .await
            .prune(now, self.options.strike_idle);

        let mut locks = self.key_locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = albums + strikes + (before - locks.len());
        if removed > 0 {
            debug!("Pruned {} idle moderation entries", removed);
        }
        removed
    }

    // Helpers

    fn is_room_allowed(&self, room_id: i64) -> bool {
        self.options
            .allowed_chats
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&room_id))
    }

    async fn key_lock(&self, key: MembershipKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn effective_settings(&self, room_id: i64) -> EffectiveSettings {
        let resolved = self.store.lock().await.get_effective_settings(room_id);
        match resolved {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "{}",
                    EngineError::ConfigurationUnavailable {
                        room_id,
                        reason: e.to_string(),
                    }
                );
                EffectiveSettings::seed()
            }
        }
    }

    async fn security_log_enabled(&self) -> bool {
        let settings = self.store.lock().await.global_settings();
        settings.map(|s| s.security_log_enabled).unwrap_or(true)
    }

    async fn is_admin(&self, room_id: i64, user_id: i64) -> bool {
        match self.platform.member_status(room_id, user_id).await {
            Ok(status) => status.is_admin(),
            Err(e) => {
                warn!(
                    "Member status lookup failed (user={}, room={}), treating as member: {}",
                    user_id, room_id, e
                );
                false
            }
        }
    }

    async fn delete_all(&self, handles: &[MessageHandle]) {
        for handle in handles {
            if let Err(e) = self.platform.delete_message(*handle).await {
                warn!(
                    "{}",
                    EngineError::PlatformActionFailed {
                        action: "delete_message",
                        room_id: handle.room_id,
                        user_id: None,
                        reason: e.to_string(),
                    }
                );
            }
        }
    }

    async fn send_notice(&self, room_id: i64, text: String, ttl_secs: u64) {
        match self.platform.send_text(room_id, &text).await {
            Ok(handle) => self.reaper.schedule(handle, Duration::from_secs(ttl_secs)),
            Err(e) => warn!(
                "{}",
                EngineError::PlatformActionFailed {
                    action: "send_text",
                    room_id,
                    user_id: None,
                    reason: e.to_string(),
                }
            ),
        }
    }

    async fn restrict(&self, key: MembershipKey, until: RestrictUntil) -> bool {
        match self
            .platform
            .restrict_member(key.room_id, key.user_id, until)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "{}",
                    EngineError::PlatformActionFailed {
                        action: "restrict_member",
                        room_id: key.room_id,
                        user_id: Some(key.user_id),
                        reason: e.to_string(),
                    }
                );
                false
            }
        }
    }

    async fn unrestrict(&self, key: MembershipKey) -> bool {
        match self
            .platform
            .unrestrict_member(key.room_id, key.user_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "{}",
                    EngineError::PlatformActionFailed {
                        action: "unrestrict_member",
                        room_id: key.room_id,
                        user_id: Some(key.user_id),
                        reason: e.to_string(),
                    }
                );
                false
            }
        }
    }

    async fn log_action(&self, enabled: bool, action: &str, key: MembershipKey, details: String) {
        self.append_log(enabled, action, Some(key.user_id), Some(key.room_id), details)
            .await;
    }

    async fn log_room_action(&self, enabled: bool, action: &str, room_id: i64, details: String) {
        self.append_log(enabled, action, None, Some(room_id), details)
            .await;
    }

    async fn log_global_action(&self, enabled: bool, action: &str, details: String) {
        self.append_log(enabled, action, None, None, details).await;
    }

    async fn append_log(
        &self,
        enabled: bool,
        action: &str,
        user_id: Option<i64>,
        room_id: Option<i64>,
        details: String,
    ) {
        if !enabled {
            return;
        }
        let entry = ActionLogEntry {
            action: action.to_string(),
            user_id,
            room_id,
            details,
            created_at: self.now(),
        };
        let appended = self.store.lock().await.append_action_log(&entry);
        if let Err(e) = appended {
            warn!("Failed to append action log '{}': {}", action, e);
        }
    }
}

/// Malformed regex entries in a room's exclusions. Matching treats them as plain substrings.
pub fn invalid_exclusions(settings: &EffectiveSettings) -> Vec<EngineError> {
    if !settings.exclusions_use_regex {
        return Vec::new();
    }
    settings
        .exclusions
        .iter()
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .err()
                .map(|e| EngineError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

fn profile_of(sender: &SenderInfo) -> UserProfile {
    UserProfile {
        id: sender.id,
        username: sender.username.clone(),
        first_name: sender.first_name.clone(),
        last_name: sender.last_name.clone(),
    }
}

fn describe_limit(input: &LimitInput) -> String {
    match input {
        LimitInput::Permanent(limit) => format!("{} сообщений в месяц", limit),
        LimitInput::Temporary { limit, days } => {
            format!("{} сообщений на {} дн.", limit, days)
        }
        LimitInput::Clear => "лимит комнаты".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::shared;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chatquota_ipc::MediaKind;
    use chatquota_storage::{GlobalSettings, Membership, Storage};
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    const ROOM: i64 = -1001234567890;
    const USER: i64 = 42;
    const ADMIN: i64 = 1;
    const LONG: &str = "Продаю велосипед в хорошем состоянии, недорого";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Delete(MessageHandle),
        Send { room_id: i64, text: String },
        Restrict { user_id: i64, until: RestrictUntil },
        Unrestrict { user_id: i64 },
    }

    #[derive(Default)]
    struct RecordingPlatform {
        calls: std::sync::Mutex<Vec<Call>>,
        admins: std::sync::Mutex<HashSet<(i64, i64)>>,
        fail_restrict: AtomicBool,
        next_message_id: AtomicI64,
    }

    impl RecordingPlatform {
        fn record(&self, call: Call) {
            self.calls.lock().expect("calls lock").push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn sent(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Send { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn deleted(&self) -> Vec<MessageHandle> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Delete(handle) => Some(handle),
                    _ => None,
                })
                .collect()
        }

        fn restrictions(&self) -> Vec<RestrictUntil> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Restrict { until, .. } => Some(until),
                    _ => None,
                })
                .collect()
        }

        fn unrestricted(&self) -> Vec<i64> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Unrestrict { user_id } => Some(user_id),
                    _ => None,
                })
                .collect()
        }

        fn make_admin(&self, room_id: i64, user_id: i64) {
            self.admins
                .lock()
                .expect("admins lock")
                .insert((room_id, user_id));
        }
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        async fn delete_message(&self, handle: MessageHandle) -> Result<()> {
            self.record(Call::Delete(handle));
            Ok(())
        }

        async fn send_text(&self, room_id: i64, text: &str) -> Result<MessageHandle> {
            self.record(Call::Send {
                room_id,
                text: text.to_string(),
            });
            let message_id = 10_000 + self.next_message_id.fetch_add(1, Ordering::Relaxed);
            Ok(MessageHandle {
                room_id,
                message_id,
            })
        }

        async fn restrict_member(
            &self,
            _room_id: i64,
            user_id: i64,
            until: RestrictUntil,
        ) -> Result<()> {
            self.record(Call::Restrict { user_id, until });
            if self.fail_restrict.load(Ordering::Relaxed) {
                return Err(anyhow!("Bad Request: not enough rights"));
            }
            Ok(())
        }

        async fn unrestrict_member(&self, _room_id: i64, user_id: i64) -> Result<()> {
            self.record(Call::Unrestrict { user_id });
            Ok(())
        }

        async fn member_status(&self, room_id: i64, user_id: i64) -> Result<MemberStatus> {
            let admins = self.admins.lock().expect("admins lock");
            if admins.contains(&(room_id, user_id)) {
                Ok(MemberStatus::Administrator)
            } else {
                Ok(MemberStatus::Member)
            }
        }
    }

    struct Harness {
        engine: ModerationEngine,
        platform: Arc<RecordingPlatform>,
        clock: Arc<ManualClock>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("valid date")
    }

    fn options() -> EngineOptions {
        EngineOptions {
            album_debounce: Duration::from_secs(60),
            notice_ttl: NoticeTtlConfig::disabled(),
            ..EngineOptions::default()
        }
    }

    fn harness_with(storage: Storage, options: EngineOptions) -> Harness {
        let platform = Arc::new(RecordingPlatform::default());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = ModerationEngine::new(shared(storage), platform.clone(), options)
            .with_clock(clock.clone());
        Harness {
            engine,
            platform,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Storage::in_memory().expect("storage"), options())
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("chatquota-core-{}-{}.db", name, ts))
    }

    fn sender(id: i64) -> SenderInfo {
        SenderInfo {
            id,
            username: Some(format!("user{}", id)),
            ..SenderInfo::default()
        }
    }

    fn text_from(user_id: i64, message_id: i64, text: &str) -> InboundMessage {
        InboundMessage::new("telegram", ROOM, message_id)
            .with_sender(sender(user_id))
            .with_room_title("Market")
            .with_text(text)
    }

    fn text(message_id: i64, body: &str) -> InboundMessage {
        text_from(USER, message_id, body)
    }

    fn photo(message_id: i64) -> InboundMessage {
        InboundMessage::new("telegram", ROOM, message_id)
            .with_sender(sender(USER))
            .with_media(MediaKind::Photo)
    }

    impl Harness {
        async fn send(&self, message: InboundMessage) -> Outcome {
            self.engine
                .handle_message(message)
                .await
                .expect("handle message")
        }

        async fn send_long(&self, count: usize) -> Vec<Outcome> {
            let mut outcomes = Vec::new();
            for i in 0..count {
                outcomes.push(self.send(text(i as i64 + 1, LONG)).await);
            }
            outcomes
        }

        async fn membership(&self) -> Membership {
            let store = self.engine.store().lock().await;
            store
                .get_or_create_membership(MembershipKey::new(USER, ROOM), self.clock.now())
                .expect("membership")
        }
    }

    #[tokio::test]
    async fn scenario_a_third_message_warns() {
        let h = harness();
        let outcomes = h.send_long(3).await;

        assert_eq!(
            outcomes[2],
            Outcome::Counted {
                count: 3,
                limit: 5,
                warned: true,
                muted: false
            }
        );
        let sent = h.platform.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("осталось 2"), "warning text: {}", sent[0]);
        assert!(h.platform.restrictions().is_empty());
        assert!(!h.membership().await.is_muted);
    }

    #[tokio::test]
    async fn limit_of_three_warns_before_muting() {
        let h = harness();
        h.send(text(1, "hi")).await;
        h.engine
            .set_limit(ROOM, USER, LimitInput::Permanent(3))
            .await
            .expect("set limit");

        let outcomes = h.send_long(3).await;
        assert_eq!(
            outcomes[2],
            Outcome::Counted {
                count: 3,
                limit: 3,
                warned: true,
                muted: true
            }
        );
        let sent = h.platform.sent();
        assert_eq!(sent.len(), 2, "sent: {:?}", sent);
        assert!(sent[0].contains("осталось 0"), "warning text: {}", sent[0]);
        assert!(sent[1].contains("Лимит сообщений исчерпан"));
        assert!(h.membership().await.is_muted);
    }

    #[tokio::test]
    async fn scenario_b_fifth_message_mutes_until_next_month() {
        let h = harness();
        let outcomes = h.send_long(5).await;

        assert_eq!(
            outcomes[4],
            Outcome::Counted {
                count: 5,
                limit: 5,
                warned: false,
                muted: true
            }
        );
        let next_month = Utc
            .with_ymd_and_hms(2026, 4, 1, 0, 1, 0)
            .single()
            .expect("date");
        assert_eq!(
            h.platform.restrictions(),
            vec![RestrictUntil::Until(next_month)]
        );
        let sent = h.platform.sent();
        assert!(sent
            .last()
            .expect("limit notice")
            .contains("Лимит сообщений исчерпан"));

        let m = h.membership().await;
        assert!(m.is_muted);
        assert_eq!(m.mute_until, None);
        assert_eq!(m.mute_reason, Some(MuteReason::Quota));

        assert_eq!(h.send(text(6, LONG)).await, Outcome::Blocked);
        assert_eq!(h.membership().await.message_count, 5);
        assert!(h
            .platform
            .sent()
            .last()
            .expect("blocked notice")
            .contains("все 5 сообщений"));
    }

    #[tokio::test]
    async fn scenario_c_expired_temporary_limit_falls_back_to_room_limit() {
        let h = harness();
        let change = h
            .engine
            .set_limit(ROOM, USER, LimitInput::Temporary { limit: 10, days: 30 })
            .await
            .expect("set limit");
        assert!(!change.lifted_mute);

        let outcomes = h.send_long(6).await;
        assert_eq!(
            outcomes[5],
            Outcome::Counted {
                count: 6,
                limit: 10,
                warned: false,
                muted: false
            }
        );

        h.clock.advance(chrono::Duration::days(31));
        assert_eq!(
            h.send(text(7, LONG)).await,
            Outcome::Counted {
                count: 1,
                limit: 5,
                warned: false,
                muted: false
            }
        );
        let m = h.membership().await;
        assert_eq!(m.temp_limit, None);
        assert_eq!(m.temp_limit_expires_at, None);
        assert_eq!(
            h.send(text(8, LONG)).await,
            Outcome::Counted {
                count: 2,
                limit: 5,
                warned: false,
                muted: false
            }
        );
    }

    #[tokio::test]
    async fn scenario_d_empty_album_is_one_strike() {
        let h = harness();
        for id in 1..=4 {
            let outcome = h.send(photo(id).with_album_id("album-1")).await;
            assert_eq!(outcome, Outcome::Buffered);
        }
        assert!(h.platform.calls().is_empty());

        let key = AlbumKey::new(ROOM, "album-1");
        let outcome = h.engine.fire_album(&key).await.expect("fire");
        assert_eq!(
            outcome,
            Some(Outcome::EmptyMedia {
                strikes: 1,
                muted: false
            })
        );
        let deleted: Vec<i64> = h.platform.deleted().iter().map(|h| h.message_id).collect();
        assert_eq!(deleted, vec![1, 2, 3, 4]);
        let sent = h.platform.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Предупреждение 1/3"));
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 1);

        let calls_after_first = h.platform.calls();
        assert_eq!(h.engine.fire_album(&key).await.expect("refire"), None);
        assert_eq!(h.platform.calls(), calls_after_first);
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 1);
    }

    #[tokio::test]
    async fn scenario_e_third_empty_strike_mutes_for_three_days() {
        let h = harness();
        assert_eq!(
            h.send(photo(1)).await,
            Outcome::EmptyMedia {
                strikes: 1,
                muted: false
            }
        );
        h.send(photo(2).with_album_id("album-2")).await;
        h.engine
            .fire_album(&AlbumKey::new(ROOM, "album-2"))
            .await
            .expect("fire");
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 2);

        assert_eq!(
            h.send(photo(3)).await,
            Outcome::EmptyMedia {
                strikes: 3,
                muted: true
            }
        );
        let until = start() + chrono::Duration::days(3);
        let m = h.membership().await;
        assert!(m.is_muted);
        assert_eq!(m.mute_until, Some(until));
        assert_eq!(m.mute_reason, Some(MuteReason::EmptyMedia));
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 0);
        assert_eq!(
            h.platform.restrictions(),
            vec![RestrictUntil::Until(until)]
        );
        assert!(h
            .platform
            .sent()
            .last()
            .expect("block notice")
            .contains("13.03.2026 12:00"));

        let sent_before = h.platform.sent().len();
        assert_eq!(h.send(photo(4)).await, Outcome::DeletedWhileMuted);
        assert_eq!(h.platform.sent().len(), sent_before);
    }

    #[tokio::test]
    async fn banned_word_wins_over_length() {
        let h = harness();
        let outcome = h.send(text(1, "сука")).await;
        assert_eq!(
            outcome,
            Outcome::Banned {
                word: "сука".to_string()
            }
        );
        assert_eq!(h.platform.deleted().len(), 1);

        let m = h.membership().await;
        assert_eq!(m.message_count, 0);
        assert_eq!(m.mute_until, Some(start() + chrono::Duration::days(3)));
        assert_eq!(m.mute_reason, Some(MuteReason::BannedWord));

        let notice = h.platform.sent().pop().expect("notice");
        assert!(notice.contains("<code>****</code>"), "notice: {}", notice);
        assert!(!notice.contains("сука"));
    }

    #[tokio::test]
    async fn short_text_is_left_alone_and_not_counted() {
        let h = harness();
        assert_eq!(h.send(text(1, "привет всем")).await, Outcome::IgnoredShort);
        assert_eq!(h.membership().await.message_count, 0);
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn excepted_resets_the_counter() {
        let seed = GlobalSettings {
            default_exclude_words: vec!["#вакансия".to_string()],
            ..GlobalSettings::default()
        };
        let storage = Storage::in_memory()
            .expect("storage")
            .with_global_seed(seed);
        let h = harness_with(storage, options());

        h.send_long(2).await;
        assert_eq!(h.membership().await.message_count, 2);

        let outcome = h.send(text(3, &format!("{} #Вакансия", LONG))).await;
        assert_eq!(outcome, Outcome::Excepted);
        assert_eq!(h.membership().await.message_count, 0);
    }

    #[tokio::test]
    async fn counter_never_decreases_without_a_reset() {
        let seed = GlobalSettings {
            default_message_limit: 100,
            ..GlobalSettings::default()
        };
        let storage = Storage::in_memory()
            .expect("storage")
            .with_global_seed(seed);
        let h = harness_with(storage, options());

        let messages = vec![
            text(1, LONG),
            text(2, "коротко"),
            photo(3),
            text(4, LONG),
            photo(5).with_caption(LONG),
            text(6, "ок"),
            text(7, LONG),
        ];
        let mut last = 0;
        for message in messages {
            h.send(message).await;
            let count = h.membership().await.message_count;
            assert!(count >= last, "count went from {} to {}", last, count);
            last = count;
        }
        assert_eq!(last, 4);
    }

    #[tokio::test]
    async fn administrators_and_bots_are_not_moderated() {
        let h = harness();
        h.platform.make_admin(ROOM, ADMIN);

        assert_eq!(
            h.send(text_from(ADMIN, 1, "сука")).await,
            Outcome::Skipped(SkipReason::Admin)
        );

        let bot = InboundMessage::new("telegram", ROOM, 2)
            .with_sender(SenderInfo {
                id: 99,
                is_bot: true,
                ..SenderInfo::default()
            })
            .with_text(LONG);
        assert_eq!(h.send(bot).await, Outcome::Skipped(SkipReason::BotSender));

        let private = InboundMessage::new("telegram", USER, 3)
            .with_sender(sender(USER))
            .with_text(LONG);
        assert_eq!(
            h.send(private).await,
            Outcome::Skipped(SkipReason::NotAGroup)
        );

        let anonymous = InboundMessage::new("telegram", ROOM, 4).with_text(LONG);
        assert_eq!(
            h.send(anonymous).await,
            Outcome::Skipped(SkipReason::NoSender)
        );
        assert!(h.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn rooms_outside_the_allow_list_are_ignored() {
        let h = harness_with(
            Storage::in_memory().expect("storage"),
            EngineOptions {
                allowed_chats: Some(vec![-1009999999999]),
                ..options()
            },
        );
        assert_eq!(
            h.send(text(1, LONG)).await,
            Outcome::Skipped(SkipReason::NotAllowed)
        );
    }

    #[tokio::test]
    async fn timed_mute_blocks_until_it_elapses() {
        let h = harness();
        h.send(text(1, "сука")).await;

        assert_eq!(h.send(text(2, LONG)).await, Outcome::Blocked);
        let notice = h.platform.sent().pop().expect("blocked notice");
        assert!(notice.contains("Вы заблокированы"));
        assert!(notice.contains("13.03.2026 12:00"));

        assert_eq!(
            h.send(text(3, "опять сука")).await,
            Outcome::DeletedWhileMuted
        );
        assert_eq!(h.platform.restrictions().len(), 1, "no re-mute while muted");

        h.clock.advance(chrono::Duration::days(3));
        assert_eq!(
            h.send(text(4, LONG)).await,
            Outcome::Counted {
                count: 1,
                limit: 5,
                warned: false,
                muted: false
            }
        );
        assert_eq!(h.platform.unrestricted(), vec![USER]);
    }

    #[tokio::test]
    async fn new_limit_lifts_quota_mute_and_keeps_counter() {
        let h = harness();
        h.send_long(5).await;
        assert!(h.membership().await.is_muted);

        let change = h
            .engine
            .set_limit(ROOM, USER, LimitInput::Permanent(10))
            .await
            .expect("set limit");
        assert!(change.lifted_mute);
        assert_eq!(h.platform.unrestricted(), vec![USER]);

        let m = h.membership().await;
        assert!(!m.is_muted);
        assert_eq!(m.message_count, 5);
        assert_eq!(m.custom_limit, Some(10));

        assert_eq!(
            h.send(text(6, LONG)).await,
            Outcome::Counted {
                count: 6,
                limit: 10,
                warned: false,
                muted: false
            }
        );
    }

    #[tokio::test]
    async fn invalid_limit_input_is_rejected() {
        let h = harness();
        let err = h
            .engine
            .set_limit_from_str(ROOM, USER, "10/400")
            .await
            .expect_err("days out of range");
        assert!(matches!(err, EngineError::InvalidLimitInput(_)));
        assert_eq!(h.membership().await.temp_limit, None);
    }

    #[tokio::test]
    async fn unblock_resets_counter_and_strikes() {
        let h = harness();
        h.send_long(2).await;
        h.send(photo(3)).await;
        h.send(text(4, "сука")).await;
        assert!(h.membership().await.is_muted);
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 1);

        assert!(h.engine.unblock(ROOM, USER).await.expect("unblock"));
        let m = h.membership().await;
        assert!(!m.is_muted);
        assert_eq!(m.message_count, 0);
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 0);
        assert_eq!(h.platform.unrestricted(), vec![USER]);
    }

    #[tokio::test]
    async fn admin_commands_drive_admin_operations() {
        let h = harness();
        h.platform.make_admin(ROOM, ADMIN);
        h.send_long(5).await;

        let outcome = h.send(text_from(ADMIN, 100, "/unblock 42")).await;
        assert_eq!(outcome, Outcome::Command);
        assert!(!h.membership().await.is_muted);
        assert!(h
            .platform
            .sent()
            .last()
            .expect("reply")
            .contains("разблокирован"));

        h.send(text_from(ADMIN, 101, "/setlimit@chatquota_bot 42 abc"))
            .await;
        assert!(h
            .platform
            .sent()
            .last()
            .expect("reply")
            .contains("Неверный лимит"));

        h.send(text_from(ADMIN, 102, "/setlimit 42 10/30")).await;
        assert_eq!(h.membership().await.temp_limit, Some(10));

        h.send(photo(103)).await;
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 1);
        h.send(text_from(ADMIN, 104, "/resetcounter")).await;
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 0);

        assert_eq!(
            h.send(text_from(ADMIN, 105, "/frobnicate")).await,
            Outcome::Skipped(SkipReason::Admin)
        );
    }

    #[tokio::test]
    async fn members_query_their_status_and_room_stats() {
        let h = harness();
        h.send_long(2).await;
        h.send(photo(3)).await;

        assert_eq!(h.send(text(4, "/mystatus")).await, Outcome::Command);
        let status = h.platform.sent().last().expect("status reply").clone();
        assert!(status.contains("Сообщений: 2"), "status: {}", status);
        assert!(status.contains("Осталось: 3"));
        assert!(status.contains("Пустых сообщений: 1/3"));
        assert!(status.contains("🟢 Активен"));
        assert_eq!(h.membership().await.message_count, 2, "commands are not counted");

        h.send(text_from(7, 5, LONG)).await;
        assert_eq!(
            h.send(text(6, "/статистика@chatquota_bot")).await,
            Outcome::Command
        );
        let stats = h.platform.sent().last().expect("stats reply").clone();
        assert!(stats.contains("Сообщений всего: 3"), "stats: {}", stats);
        assert!(stats.contains("Пользователей: 2"));
        assert!(stats.contains("Заблокировано: 0"));
        assert!(stats.contains("пустых сообщений: 1"));
    }

    #[tokio::test]
    async fn muted_members_and_admins_get_command_replies() {
        let h = harness();
        h.platform.make_admin(ROOM, ADMIN);
        h.send_long(5).await;

        assert_eq!(h.send(text(6, "/мойстатус")).await, Outcome::Command);
        let status = h.platform.sent().last().expect("status reply").clone();
        assert!(status.contains("Осталось: 0"), "status: {}", status);
        assert!(status.contains("Заблокирован до сброса лимита"));

        assert_eq!(h.send(text_from(ADMIN, 7, "/mystatus")).await, Outcome::Command);
        assert!(h
            .platform
            .sent()
            .last()
            .expect("admin status")
            .contains("администратор"));

        assert_eq!(h.send(text_from(ADMIN, 8, "/rules")).await, Outcome::Command);
        let rules = h.platform.sent().last().expect("rules reply").clone();
        assert!(rules.contains("Правила чата"));
        assert!(rules.contains("5 бесплатных сообщений"));

        assert_eq!(h.send(text(9, "/help")).await, Outcome::Command);
        assert!(h.platform.sent().last().expect("help").contains("/mystatus"));

        // Admin commands from members are ordinary messages.
        assert_eq!(h.send(text(10, "/unblock 42")).await, Outcome::IgnoredShort);
        assert!(h.membership().await.is_muted);
    }

    #[tokio::test]
    async fn bot_membership_toggles_room_moderation() {
        let h = harness();
        h.send(text(1, LONG)).await;

        let outcome = h
            .engine
            .handle_event(BusEvent::BotMembership {
                room_id: ROOM,
                room_title: None,
                status: MemberStatus::Left,
            })
            .await
            .expect("membership");
        assert_eq!(outcome, Outcome::RoomStatus { active: false });
        assert_eq!(
            h.send(text(2, LONG)).await,
            Outcome::Skipped(SkipReason::RoomInactive)
        );

        h.engine
            .handle_bot_membership(ROOM, Some("Market"), MemberStatus::Administrator)
            .await
            .expect("membership");
        assert!(matches!(
            h.send(text(3, LONG)).await,
            Outcome::Counted { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn monthly_reset_lifts_quota_mutes_once() {
        let h = harness();
        h.send_long(5).await;

        h.clock.set(
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 1, 0)
                .single()
                .expect("date"),
        );
        let report = h.engine.monthly_reset().await.expect("reset");
        assert_eq!(report.updated, 1);
        assert_eq!(report.unmuted, 1);
        assert_eq!(h.platform.unrestricted(), vec![USER]);

        let m = h.membership().await;
        assert_eq!(m.message_count, 0);
        assert!(!m.is_muted);

        let again = h.engine.monthly_reset().await.expect("reset again");
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn auto_unblock_sweep_releases_elapsed_mutes() {
        let h = harness();
        h.send(text(1, "сука")).await;

        h.clock.advance(chrono::Duration::days(1));
        assert_eq!(
            h.engine.auto_unblock_sweep().await.expect("sweep").unmuted,
            0
        );

        h.clock.advance(chrono::Duration::days(2));
        let report = h.engine.auto_unblock_sweep().await.expect("sweep");
        assert_eq!(report.unmuted, 1);
        assert!(!h.membership().await.is_muted);
        assert_eq!(h.platform.unrestricted(), vec![USER]);
    }

    #[tokio::test]
    async fn temporary_limit_sweep_starts_fresh_period() {
        let h = harness();
        h.engine
            .set_limit(ROOM, USER, LimitInput::Temporary { limit: 10, days: 1 })
            .await
            .expect("set limit");
        h.send_long(10).await;
        assert!(h.membership().await.is_muted);

        h.clock.advance(chrono::Duration::days(2));
        let report = h
            .engine
            .expired_temporary_limit_sweep()
            .await
            .expect("sweep");
        assert_eq!(report.updated, 1);
        assert_eq!(report.unmuted, 1);

        let m = h.membership().await;
        assert_eq!(m.message_count, 0);
        assert_eq!(m.temp_limit, None);
        assert!(!m.is_muted);
    }

    #[tokio::test]
    async fn failed_restriction_keeps_logical_mute() {
        let path = temp_db_path("restrict-failure");
        let h = harness_with(Storage::new(&path).expect("storage"), options());
        h.platform.fail_restrict.store(true, Ordering::Relaxed);

        let outcomes = h.send_long(5).await;
        assert!(matches!(outcomes[4], Outcome::Counted { muted: true, .. }));
        assert!(h.membership().await.is_muted);

        let reader = Storage::new(&path).expect("reader");
        let actions: Vec<String> = reader
            .list_actions(Some(ROOM), 10)
            .expect("actions")
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert!(actions.contains(&"block_failed".to_string()));
        assert!(!actions.contains(&"user_blocked".to_string()));
    }

    #[tokio::test]
    async fn security_log_flag_silences_action_log() {
        let path = temp_db_path("security-off");
        let seed = GlobalSettings {
            security_log_enabled: false,
            ..GlobalSettings::default()
        };
        let storage = Storage::new(&path).expect("storage").with_global_seed(seed);
        let h = harness_with(storage, options());

        h.send_long(5).await;
        h.engine.unblock(ROOM, USER).await.expect("unblock");

        let reader = Storage::new(&path).expect("reader");
        assert!(reader.list_actions(None, 10).expect("actions").is_empty());
    }

    #[tokio::test]
    async fn album_timer_fires_once_on_its_own() {
        let h = harness_with(
            Storage::in_memory().expect("storage"),
            EngineOptions {
                album_debounce: Duration::from_millis(50),
                ..options()
            },
        );
        h.send(photo(1).with_album_id("album-3").with_caption(LONG))
            .await;
        h.send(photo(2).with_album_id("album-3")).await;
        h.send(photo(3).with_album_id("album-3").with_caption("second caption"))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.membership().await.message_count, 1);
        assert!(h.platform.deleted().is_empty());
        assert_eq!(
            h.send(photo(4).with_album_id("album-3")).await,
            Outcome::Skipped(SkipReason::AlbumClosed)
        );
    }

    #[tokio::test]
    async fn concurrent_admissions_cannot_overshoot_the_limit() {
        let h = harness();
        let mut tasks = Vec::new();
        for id in 1..=12 {
            let engine = h.engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .handle_message(text(id, LONG))
                    .await
                    .expect("handle message")
            }));
        }

        let mut mutes = 0;
        for task in tasks {
            if let Outcome::Counted { muted: true, .. } = task.await.expect("join") {
                mutes += 1;
            }
        }
        assert_eq!(mutes, 1);
        assert_eq!(h.membership().await.message_count, 5);
        assert_eq!(h.platform.restrictions().len(), 1);
    }

    #[tokio::test]
    async fn prune_forgets_idle_strikes() {
        let h = harness_with(
            Storage::in_memory().expect("storage"),
            EngineOptions {
                strike_idle: Duration::ZERO,
                ..options()
            },
        );
        h.send(photo(1)).await;
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 1);

        assert!(h.engine.prune().await >= 1);
        assert_eq!(h.engine.empty_strikes(ROOM, USER).await, 0);
    }

    #[tokio::test]
    async fn prune_releases_idle_locks() {
        let h = harness();
        h.send_long(1).await;
        assert!(h.engine.prune().await >= 1);
        assert_eq!(h.engine.prune().await, 0);
    }

    #[test]
    fn malformed_exclusions_are_reported() {
        let mut settings = EffectiveSettings::seed();
        settings.exclusions = vec!["(open".to_string(), "price".to_string()];
        assert!(invalid_exclusions(&settings).is_empty());

        settings.exclusions_use_regex = true;
        let errors = invalid_exclusions(&settings);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            EngineError::InvalidPattern { pattern, .. } if pattern == "(open"
        ));
    }
}
