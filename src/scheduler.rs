use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::calendar::{Clock, ResetAnchor, WeekDates};
use crate::engine::{BookingEngine, EngineError};
use crate::model::WeekOpened;
use crate::observability::RESETS_TOTAL;
use crate::store::SlotStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum SchedulerError {
    ResetFailed(EngineError),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::ResetFailed(e) => write!(f, "weekly reset failed: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Opened(WeekOpened),
    /// Another reset was in flight; this trigger did nothing.
    AlreadyRunning,
}

/// Fires the weekly reset. At most one reset runs at a time, whether it came
/// from the timer or from an operator.
pub struct ResetScheduler {
    engine: Arc<BookingEngine>,
    clock: Arc<dyn Clock>,
    anchor: ResetAnchor,
    date_labels: bool,
    /// Dates of the week the last successful reset opened. Until the first
    /// reset, the week the most recent anchor opened.
    open_week: Arc<std::sync::Mutex<Option<WeekDates>>>,
    in_flight: Arc<Mutex<()>>,
}

impl ResetScheduler {
    pub fn new(
        engine: Arc<BookingEngine>,
        clock: Arc<dyn Clock>,
        anchor: ResetAnchor,
        date_labels: bool,
    ) -> Self {
        let open_week = date_labels.then(|| anchor.active_week(clock.now()));
        Self {
            engine,
            clock,
            anchor,
            date_labels,
            open_week: Arc::new(std::sync::Mutex::new(open_week)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn anchor(&self) -> &ResetAnchor {
        &self.anchor
    }

    /// Dates of the week currently open, if date labelling is on. Only a
    /// successful reset moves them on; a missed or failed one does not.
    pub fn current_dates(&self) -> Option<WeekDates> {
        *self.open_week.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear every slot and announce the new week.
    pub async fn fire(&self) -> Result<FireOutcome, SchedulerError> {
        let Ok(guard) = self.in_flight.clone().try_lock_owned() else {
            metrics::counter!(RESETS_TOTAL, "status" => "skipped").increment(1);
            warn!("reset requested while another is in flight, skipping");
            return Ok(FireOutcome::AlreadyRunning);
        };

        let engine = self.engine.clone();
        let open_week = self.open_week.clone();
        let dates = self.date_labels.then(|| self.anchor.active_week(self.clock.now()));

        // Detached so the reset and its announcement outlive a caller that stops waiting.
        let task = tokio::spawn(async move {
            let _guard = guard;
            let epoch = match engine.reset_all().await {
                Ok(epoch) => epoch,
                Err(e) => {
                    metrics::counter!(RESETS_TOTAL, "status" => "failed").increment(1);
                    return Err(SchedulerError::ResetFailed(e));
                }
            };
            *open_week.lock().unwrap_or_else(|e| e.into_inner()) = dates;

            let opened = WeekOpened { epoch, dates };
            let receivers = engine.notify().send_week(&opened);
            metrics::counter!(RESETS_TOTAL, "status" => "ok").increment(1);
            match &opened.dates {
                Some(dates) => info!(
                    "week {epoch} opened ({} to {}), {receivers} subscribers notified",
                    dates.monday(),
                    dates.friday()
                ),
                None => info!("week {epoch} opened, {receivers} subscribers notified"),
            }
            Ok(FireOutcome::Opened(opened))
        });

        task.await.unwrap_or_else(|e| {
            metrics::counter!(RESETS_TOTAL, "status" => "failed").increment(1);
            Err(SchedulerError::ResetFailed(EngineError::StoreUnavailable(
                format!("reset task failed: {e}"),
            )))
        })
    }

    /// Next anchor instant to wait for, never at or before one already fired.
    pub fn next_fire(&self, last_fired: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        let from = last_fired.map_or(now, |last| last.max(now));
        self.anchor.next_after(from)
    }

    /// Timer loop. A failed reset is logged and retried at the next anchor.
    pub async fn run(self: Arc<Self>) {
        let mut last_fired = None;
        loop {
            let at = self.next_fire(last_fired);
            let wait = (at - self.clock.now()).to_std().unwrap_or_default();
            debug!("next reset at {at} ({}s)", wait.as_secs());
            tokio::time::sleep(wait).await;

            last_fired = Some(at);
            if let Err(e) = self.fire().await {
                error!("{e}");
            }
        }
    }
}

/// Rewrites the WAL once enough appends have piled up since the last rewrite.
pub async fn run_compactor(store: Arc<SlotStore>, threshold: u64) {
    if !store.is_durable() || threshold == 0 {
        return;
    }
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let pending = store.appends_since_compact().await;
        if pending < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {pending} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
