//! chatquota CLI
//!
//! Runs the moderation bot and exposes its admin operations on the command line

mod logging;

use anyhow::{anyhow, Result};
use chatquota_config::{Config, DefaultsConfig, TEMPLATE};
use chatquota_core::{
    invalid_exclusions, shared, EngineOptions, ModerationEngine, ModerationRuntime,
};
use chatquota_cron::{run_job, SweepJob, SweepScheduler};
use chatquota_ipc::{ChatPlatform, EventBus, OfflinePlatform};
use chatquota_policy::{classify, is_group_room, EffectiveSettings, MAX_CUSTOM_LIMIT};
use chatquota_storage::{fmt_ts, GlobalSettings, Storage};
use chatquota_telegram::TelegramAdapter;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const DB_FILE: &str = "chatquota.db";

#[derive(Parser)]
#[command(name = "chatquota")]
#[command(about = "Per-member message quotas and content moderation for group chats", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run batch sweeps once
    Sweep {
        #[command(subcommand)]
        job: SweepCommands,
    },
    /// Set a member's limit: N, L/D (temporary) or 0 (clear)
    Limit {
        #[arg(allow_negative_numbers = true)]
        room: i64,
        user: i64,
        input: String,
    },
    /// Lift a member's mute and reset the counter
    Unblock {
        #[arg(allow_negative_numbers = true)]
        room: i64,
        user: i64,
    },
    /// Inspect and edit rooms
    Room {
        #[command(subcommand)]
        action: RoomCommands,
    },
    /// Inspect and edit global settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },
    /// Classify a text with the effective settings without changing anything
    Check {
        text: String,
        /// Room whose settings apply
        #[arg(short, long, allow_negative_numbers = true)]
        room: Option<i64>,
        /// Treat the text as a media caption
        #[arg(short, long)]
        media: bool,
    },
    /// Show the action log
    Actions {
        #[arg(short, long, allow_negative_numbers = true)]
        room: Option<i64>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Manage log files
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a config template
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
    /// Print the config file path
    Path,
}

#[derive(Subcommand)]
enum SweepCommands {
    /// Monthly counter reset
    Monthly,
    /// Lift expired mutes
    Unblock,
    /// Clear expired temporary limits
    Limits,
    /// All of the above
    All,
}

#[derive(Subcommand)]
enum RoomCommands {
    /// List known rooms
    List,
    /// Show a room, its effective settings and members
    Show {
        #[arg(allow_negative_numbers = true)]
        room: i64,
    },
    /// Set the room limit, or `default` to inherit the global one
    SetLimit {
        #[arg(allow_negative_numbers = true)]
        room: i64,
        value: String,
    },
    /// Set the room banned words (comma separated), or `default`
    BannedWords {
        #[arg(allow_negative_numbers = true)]
        room: i64,
        words: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show global settings
    Show,
    /// Set the contact link used in notices
    SetContact { link: String },
    /// Set the minimum counted message length
    SetMinLength { length: u32 },
    /// Turn the action log on or off
    SecurityLog { state: String },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Delete logs older than N days
    Clean {
        #[arg(short, long, default_value = "7")]
        days: u64,
    },
    /// Show last N lines of today's log
    Tail {
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config)?;
                if path.exists() && !force {
                    anyhow::bail!(
                        "Config already exists at {} (use --force to overwrite)",
                        path.display()
                    );
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, TEMPLATE)?;
                println!("Configuration created at: {}", path.display());
                println!("Edit telegram.bot_token, then run `chatquota start`.");
            }
            ConfigCommands::Show => {
                let config = load_config(cli.config)?;
                println!("{}", serde_json::to_string_pretty(&redacted_config(&config)?)?);
            }
            ConfigCommands::Validate => match load_config(cli.config) {
                Ok(config) => {
                    let now = Utc::now();
                    match SweepScheduler::from_config(&config.schedule, now) {
                        Ok(_) => println!("Configuration is valid."),
                        Err(e) => eprintln!("Configuration error: {}", e),
                    }
                }
                Err(e) => eprintln!("Configuration error: {}", e),
            },
            ConfigCommands::Path => {
                println!("{}", config_path(cli.config)?.display());
            }
        },

        Commands::Start => {
            let config = load_config(cli.config)?;
            let data_dir = data_dir(&config)?;
            fs::create_dir_all(&data_dir)?;
            let log_level = resolve_log_level(cli.log_level, &config);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;
            run_bot(config, data_dir).await?;
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(data_dir(&config)?.join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files in {} ({} total):\n",
                        manager.log_dir().display(),
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|name| name.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let deleted = manager.cleanup_old_logs(days)?;
                    println!("Deleted {} log file(s) older than {} days", deleted, days);
                }
                LogCommands::Tail { lines } => {
                    let current_log = manager.current_log_path();
                    if current_log.exists() {
                        let content = fs::read_to_string(&current_log)?;
                        let all_lines: Vec<&str> = content.lines().collect();
                        let start = all_lines.len().saturating_sub(lines);
                        for line in &all_lines[start..] {
                            println!("{}", line);
                        }
                    } else {
                        println!("No log file found at {}", current_log.display());
                    }
                }
            }
        }

        command => {
            let config = load_config(cli.config)?;
            logging::init_stderr_logging(&resolve_log_level(cli.log_level, &config))?;
            run_admin(command, config).await?;
        }
    }

    Ok(())
}

async fn run_bot(config: Config, data_dir: PathBuf) -> Result<()> {
    let storage = open_storage(&config, &data_dir)?;
    let event_bus = EventBus::new();

    let adapter = match &config.telegram {
        Some(telegram) => Some(Arc::new(
            TelegramAdapter::new(telegram, data_dir.clone())?.with_event_bus(event_bus.clone()),
        )),
        None => {
            warn!("No [telegram] section configured, running sweeps only");
            None
        }
    };
    let platform: Arc<dyn ChatPlatform> = match &adapter {
        Some(adapter) => adapter.clone() as Arc<dyn ChatPlatform>,
        None => Arc::new(OfflinePlatform),
    };

    let engine = ModerationEngine::new(
        shared(storage),
        platform,
        EngineOptions::from_config(&config),
    );
    let runtime = ModerationRuntime::new(engine.clone(), &event_bus, &config.moderation);
    let scheduler = SweepScheduler::from_config(&config.schedule, Utc::now())?;

    let poller = async move {
        match adapter {
            Some(adapter) => adapter.poll().await,
            None => std::future::pending::<Result<()>>().await,
        }
    };

    info!("Starting chatquota (data dir: {})", data_dir.display());

    tokio::select! {
        result = runtime.run() => result?,
        result = scheduler.run(engine) => result?,
        result = poller => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}

async fn run_admin(command: Commands, config: Config) -> Result<()> {
    let data_dir = data_dir(&config)?;
    fs::create_dir_all(&data_dir)?;
    let storage = open_storage(&config, &data_dir)?;

    match command {
        Commands::Sweep { job } => {
            let engine = build_engine(&config, &data_dir, storage)?;
            let jobs: Vec<SweepJob> = match job {
                SweepCommands::Monthly => vec![SweepJob::MonthlyReset],
                SweepCommands::Unblock => vec![SweepJob::AutoUnblock],
                SweepCommands::Limits => vec![SweepJob::TemporaryLimits],
                SweepCommands::All => SweepJob::ALL.to_vec(),
            };
            for job in jobs {
                let report = run_job(&engine, job).await?;
                println!(
                    "{}: {} updated, {} unmuted, {} unrestrict failures",
                    job, report.updated, report.unmuted, report.unrestrict_failures
                );
            }
        }

        Commands::Limit { room, user, input } => {
            ensure_group_room(room)?;
            let engine = build_engine(&config, &data_dir, storage)?;
            let change = engine.set_limit_from_str(room, user, &input).await?;
            println!("Limit for user {} in room {}: {:?}", user, room, change.input);
            if change.lifted_mute {
                println!("Mute lifted.");
            }
        }

        Commands::Unblock { room, user } => {
            ensure_group_room(room)?;
            let engine = build_engine(&config, &data_dir, storage)?;
            if engine.unblock(room, user).await? {
                println!("User {} unblocked in room {}", user, room);
            } else {
                println!("User {} was not muted in room {}; counter reset", user, room);
            }
        }

        Commands::Room { action } => run_room(action, &storage)?,

        Commands::Settings { action } => run_settings(action, &storage)?,

        Commands::Check { text, room, media } => {
            let global = storage.global_settings()?;
            let room_record = match room {
                Some(room_id) => storage.get_room(room_id)?,
                None => None,
            };
            let settings = EffectiveSettings::resolve(room_record.as_ref(), Some(&global));
            for problem in invalid_exclusions(&settings) {
                println!("warning: {}", problem);
            }
            let media_without_caption = media && text.trim().is_empty();
            let classification = classify(&text, media_without_caption, &settings);
            println!("{} ({:?})", classification.label(), classification);
        }

        Commands::Actions { room, limit } => {
            for entry in storage.list_actions(room, limit)? {
                println!(
                    "{}  {:<26} room={} user={}  {}",
                    fmt_ts(&entry.created_at),
                    entry.action,
                    entry.room_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    entry.user_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    entry.details
                );
            }
        }

        Commands::Start | Commands::Config { .. } | Commands::Logs { .. } => {
            anyhow::bail!("not an admin command")
        }
    }

    Ok(())
}

fn run_room(action: RoomCommands, storage: &Storage) -> Result<()> {
    match action {
        RoomCommands::List => {
            let rooms = storage.list_rooms()?;
            if rooms.is_empty() {
                println!("No rooms seen yet.");
            }
            for room in rooms {
                println!(
                    "{}  {}  {}  limit={}",
                    room.id,
                    if room.is_active { "active  " } else { "inactive" },
                    room.title.as_deref().unwrap_or("-"),
                    room.message_limit
                        .map(|limit| limit.to_string())
                        .unwrap_or_else(|| "default".into())
                );
            }
        }
        RoomCommands::Show { room } => {
            let record = storage
                .get_room(room)?
                .ok_or_else(|| anyhow!("Room {} not found", room))?;
            let global = storage.global_settings()?;
            let settings = EffectiveSettings::resolve(Some(&record), Some(&global));
            println!("Room {} ({})", record.id, record.title.as_deref().unwrap_or("-"));
            println!("  active: {}", record.is_active);
            println!("  limit: {}", settings.limit);
            println!("  min length: {}", settings.min_length);
            println!("  banned words: {}", settings.banned_words.join(", "));
            println!(
                "  exclusions{}: {}",
                if settings.exclusions_use_regex { " (regex)" } else { "" },
                settings.exclusions.join(", ")
            );
            let members = storage.list_memberships(room)?;
            println!("  members: {}", members.len());
            for member in members {
                let mute = if !member.is_muted {
                    String::new()
                } else {
                    match member.mute_until {
                        Some(until) => format!(" muted until {}", fmt_ts(&until)),
                        None => " muted until reset".to_string(),
                    }
                };
                let temp = match (member.temp_limit, member.temp_limit_expires_at) {
                    (Some(limit), Some(expires)) => {
                        format!(" temp={} until {}", limit, fmt_ts(&expires))
                    }
                    _ => String::new(),
                };
                println!(
                    "    {}: {} messages{}{}{}",
                    member.user_id,
                    member.message_count,
                    member
                        .custom_limit
                        .map(|limit| format!(" custom={}", limit))
                        .unwrap_or_default(),
                    temp,
                    mute
                );
            }
        }
        RoomCommands::SetLimit { room, value } => {
            ensure_group_room(room)?;
            let mut record = storage.get_or_create_room(room, None, Utc::now())?;
            record.message_limit = parse_room_limit(&value)?;
            storage.save_room(&record)?;
            println!("Room {} limit set to {}", room, value.trim());
        }
        RoomCommands::BannedWords { room, words } => {
            ensure_group_room(room)?;
            let mut record = storage.get_or_create_room(room, None, Utc::now())?;
            record.banned_words = parse_word_list(&words);
            storage.save_room(&record)?;
            match &record.banned_words {
                Some(words) => println!("Room {} banned words: {}", room, words.join(", ")),
                None => println!("Room {} uses the global banned words", room),
            }
        }
    }
    Ok(())
}

fn run_settings(action: SettingsCommands, storage: &Storage) -> Result<()> {
    let mut settings = storage.global_settings()?;
    match action {
        SettingsCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            return Ok(());
        }
        SettingsCommands::SetContact { link } => {
            settings.contact_link = link.trim().to_string();
        }
        SettingsCommands::SetMinLength { length } => {
            settings.default_min_length = length;
        }
        SettingsCommands::SecurityLog { state } => {
            settings.security_log_enabled = parse_switch(&state)?;
        }
    }
    storage.save_global_settings(&settings)?;
    println!("Global settings updated.");
    Ok(())
}

fn build_engine(config: &Config, data_dir: &Path, storage: Storage) -> Result<ModerationEngine> {
    let platform: Arc<dyn ChatPlatform> = match &config.telegram {
        Some(telegram) => Arc::new(TelegramAdapter::new(telegram, data_dir.to_path_buf())?),
        None => Arc::new(OfflinePlatform),
    };
    Ok(ModerationEngine::new(
        shared(storage),
        platform,
        EngineOptions::from_config(config),
    ))
}

fn open_storage(config: &Config, data_dir: &Path) -> Result<Storage> {
    Ok(Storage::new(data_dir.join(DB_FILE))?.with_global_seed(global_seed(&config.defaults)))
}

fn global_seed(defaults: &DefaultsConfig) -> GlobalSettings {
    GlobalSettings {
        contact_link: defaults.contact_link.trim().to_string(),
        default_message_limit: defaults.message_limit,
        default_min_length: defaults.min_message_length,
        default_exclude_words: defaults.exclude_words.clone(),
        default_exclude_use_regex: defaults.exclude_use_regex,
        default_banned_words: defaults.banned_words.clone(),
        default_notifications: HashMap::new(),
        auto_unblock_days: defaults.auto_unblock_days,
        security_log_enabled: defaults.security_log_enabled,
    }
}

fn ensure_group_room(room_id: i64) -> Result<()> {
    if !is_group_room(room_id) {
        anyhow::bail!("{} is not a group room id", room_id);
    }
    Ok(())
}

fn parse_room_limit(value: &str) -> Result<Option<u32>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("default") {
        return Ok(None);
    }
    let limit: u32 = value
        .parse()
        .map_err(|_| anyhow!("'{}' is not a whole number or 'default'", value))?;
    if limit == 0 || limit > MAX_CUSTOM_LIMIT {
        anyhow::bail!("limit must be in range 1..={}", MAX_CUSTOM_LIMIT);
    }
    Ok(Some(limit))
}

/// `default` (or an empty list) means inherit the global words.
fn parse_word_list(words: &str) -> Option<Vec<String>> {
    if words.trim().eq_ignore_ascii_case("default") {
        return None;
    }
    let words: Vec<String> = words
        .split(',')
        .map(|word| word.trim().to_lowercase())
        .filter(|word| !word.is_empty())
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

fn parse_switch(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(anyhow!("expected on or off, got '{}'", other)),
    }
}

fn resolve_log_level(flag: Option<String>, config: &Config) -> String {
    flag.or_else(|| config.core.log_level.clone())
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config directory available")),
    }
}

fn load_config(path: Option<String>) -> Result<Config> {
    let path = config_path(path)?;
    if !path.exists() {
        anyhow::bail!(
            "No config file at {} (run `chatquota config init`)",
            path.display()
        );
    }
    Config::load(&path).map_err(|e| anyhow!("{}: {}", path.display(), e))
}

fn data_dir(config: &Config) -> Result<PathBuf> {
    config
        .data_dir()
        .ok_or_else(|| anyhow!("No data directory available; set core.data_dir"))
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(token) = value
        .get_mut("telegram")
        .and_then(|telegram| telegram.get_mut("bot_token"))
    {
        *token = json!("***REDACTED***");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_section_seeds_global_settings() {
        let defaults = DefaultsConfig {
            contact_link: " https://t.me/market_admin ".to_string(),
            message_limit: 7,
            exclude_words: vec!["куплю".to_string()],
            auto_unblock_days: 3,
            security_log_enabled: false,
            ..DefaultsConfig::default()
        };
        let seed = global_seed(&defaults);
        assert_eq!(seed.contact_link, "https://t.me/market_admin");
        assert_eq!(seed.default_message_limit, 7);
        assert_eq!(seed.default_min_length, 20);
        assert_eq!(seed.default_exclude_words, vec!["куплю".to_string()]);
        assert_eq!(seed.default_banned_words.len(), 6);
        assert_eq!(seed.auto_unblock_days, 3);
        assert!(!seed.security_log_enabled);
        assert!(seed.default_notifications.is_empty());
    }

    #[test]
    fn room_limit_accepts_number_or_default() {
        assert_eq!(parse_room_limit("10").expect("number"), Some(10));
        assert_eq!(parse_room_limit(" Default ").expect("default"), None);
        assert!(parse_room_limit("0").is_err());
        assert!(parse_room_limit("1001").is_err());
        assert!(parse_room_limit("ten").is_err());
    }

    #[test]
    fn word_lists_are_trimmed_and_lowercased() {
        assert_eq!(
            parse_word_list("Спам, реклама ,,"),
            Some(vec!["спам".to_string(), "реклама".to_string()])
        );
        assert_eq!(parse_word_list("default"), None);
        assert_eq!(parse_word_list(" , "), None);
    }

    #[test]
    fn switches_parse() {
        assert!(parse_switch("ON").expect("on"));
        assert!(!parse_switch("off").expect("off"));
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn log_level_prefers_flag_then_config() {
        let mut config = Config::default();
        assert_eq!(resolve_log_level(None, &config), "info");
        config.core.log_level = Some("warn".to_string());
        assert_eq!(resolve_log_level(None, &config), "warn");
        assert_eq!(resolve_log_level(Some("debug".to_string()), &config), "debug");
    }

    #[test]
    fn negative_room_ids_parse_as_arguments() {
        let cli = Cli::try_parse_from(["chatquota", "limit", "-1001234567890", "42", "10/7"])
            .expect("parse");
        match cli.command {
            Commands::Limit { room, user, input } => {
                assert_eq!(room, -1001234567890);
                assert_eq!(user, 42);
                assert_eq!(input, "10/7");
            }
            _ => panic!("expected limit command"),
        }
    }

    #[test]
    fn redacted_config_hides_token() {
        let config = Config {
            telegram: Some(chatquota_config::TelegramConfig {
                bot_token: "123456:secret".to_string(),
                ..Default::default()
            }),
            ..Config::default()
        };
        let value = redacted_config(&config).expect("json");
        assert_eq!(value["telegram"]["bot_token"], "***REDACTED***");
        assert_eq!(value["defaults"]["message_limit"], 5);
    }
}
