//! chatquota Core
//!
//! Moderation engine and the event loop that feeds it

mod album;
mod clock;
mod commands;
mod engine;
mod error;
mod ledger;
mod mute;
mod reaper;
mod store;

pub use album::{AlbumAggregator, AlbumBuffer, AlbumKey, AlbumPush};
pub use clock::{Clock, SystemClock};
pub use commands::{MemberCommand, RoomStats, StatusView};
pub use engine::{
    invalid_exclusions, EngineOptions, EngineResult, LimitChange, ModerationEngine, Outcome,
    SkipReason, SweepReport,
};
pub use error::EngineError;
pub use ledger::{effective_limit, Admission, Refresh, Tally, WARNING_THRESHOLD};
pub use mute::{
    first_day_of_next_month, month_start, timed_mute_until, MuteState, StrikeBook,
    STRIKE_THRESHOLD, TIMED_MUTE_DAYS,
};
pub use reaper::NoticeReaper;
pub use store::{shared, QuotaStore, SharedStore};

use anyhow::Result;
use chatquota_config::ModerationConfig;
use chatquota_ipc::{BusEvent, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

/// Drains the event bus into the engine, one task per event.
pub struct ModerationRuntime {
    engine: ModerationEngine,
    inbound_rx: broadcast::Receiver<BusEvent>,
    max_inflight: usize,
    prune_interval: Duration,
}

impl ModerationRuntime {
    /// Subscribes right away so events published before `run` are not lost.
    pub fn new(engine: ModerationEngine, event_bus: &EventBus, config: &ModerationConfig) -> Self {
        Self {
            engine,
            inbound_rx: event_bus.subscribe(),
            max_inflight: config.max_inflight_events.max(1),
            prune_interval: Duration::from_secs(config.prune_interval_secs.max(1)),
        }
    }

    pub fn engine(&self) -> &ModerationEngine {
        &self.engine
    }

    /// Runs until the event bus closes.
    pub async fn run(self) -> Result<()> {
        let mut inbound_rx = self.inbound_rx;
        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut prune_interval = tokio::time::interval(self.prune_interval);

        info!(
            "Moderation runtime started (max in-flight events: {})",
            self.max_inflight
        );

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(event) => {
                            let engine = self.engine.clone();
                            let semaphore = Arc::clone(&semaphore);
                            let trace_id = event.trace_id().to_string();

                            tokio::spawn(async move {
                                let _permit = match semaphore.acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(err) => {
                                        error!(
                                            "Moderation semaphore closed (trace_id={}): {}",
                                            trace_id, err
                                        );
                                        return;
                                    }
                                };

                                match engine.handle_event(event).await {
                                    Ok(outcome) => {
                                        debug!("Event handled (trace_id={}): {:?}", trace_id, outcome);
                                    }
                                    Err(e) => {
                                        error!(
                                            "Error processing event (trace_id={}): {}",
                                            trace_id, e
                                        );
                                    }
                                }
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping moderation runtime");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} events", n);
                        }
                    }
                }
                _ = prune_interval.tick() => {
                    self.engine.prune().await;
                }
            }
        }

        Ok(())
    }
}
