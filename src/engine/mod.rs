mod error;
mod snapshot;

pub use error::EngineError;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::limits::MAX_ACTOR_LEN;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{TOGGLES_TOTAL, TOGGLE_DURATION_SECONDS};
use crate::store::{BookingStore, StoreError};

/// The toggle state machine over a [`BookingStore`].
///
/// Holds no slot state of its own: every decision is made inside the store's
/// atomic claim/release primitives, never from a separate read.
pub struct BookingEngine {
    store: Arc<dyn BookingStore>,
    notify: Arc<NotifyHub>,
}

impl BookingEngine {
    pub fn new(store: Arc<dyn BookingStore>, notify: Arc<NotifyHub>) -> Self {
        Self { store, notify }
    }

    pub fn layout(&self) -> &WeekLayout {
        self.store.layout()
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Map external day/resource identifiers onto a configured slot.
    pub fn resolve_slot(&self, day: &str, resource: &str) -> Result<Slot, EngineError> {
        let invalid = || EngineError::InvalidSlot {
            day: day.to_string(),
            resource: resource.to_string(),
        };
        let slot = Slot::new(Day::parse(day).ok_or_else(invalid)?, resource.trim());
        if self.layout().locate(&slot).is_none() {
            return Err(invalid());
        }
        Ok(slot)
    }

    /// Claim the slot if free, release it if `actor` holds it, otherwise report
    /// the conflict without touching it.
    pub async fn toggle(
        &self,
        day: &str,
        resource: &str,
        actor: &str,
    ) -> Result<ToggleOutcome, EngineError> {
        let slot = match self.resolve_slot(day, resource) {
            Ok(slot) => slot,
            Err(e) => {
                metrics::counter!(TOGGLES_TOTAL, "outcome" => "invalid_slot").increment(1);
                return Err(e);
            }
        };
        self.toggle_slot(slot, actor).await
    }

    pub async fn toggle_slot(&self, slot: Slot, actor: &str) -> Result<ToggleOutcome, EngineError> {
        validate_actor(actor)?;
        let started = Instant::now();

        // Detached so a caller that stops waiting cannot cancel a write mid-flight.
        let store = self.store.clone();
        let task_slot = slot.clone();
        let task_actor = actor.to_string();
        let result =
            tokio::spawn(async move { flip(store.as_ref(), &task_slot, &task_actor).await })
                .await
                .map_err(|e| StoreError::Unavailable(format!("toggle task failed: {e}")))
                .and_then(|r| r);

        metrics::histogram!(TOGGLE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let e = EngineError::from(e);
                let label = match e {
                    EngineError::InvalidSlot { .. } => "invalid_slot",
                    _ => "store_unavailable",
                };
                metrics::counter!(TOGGLES_TOTAL, "outcome" => label).increment(1);
                return Err(e);
            }
        };

        metrics::counter!(TOGGLES_TOTAL, "outcome" => outcome.label()).increment(1);
        debug!("toggle {slot} by {actor}: {}", outcome.label());

        match &outcome {
            ToggleOutcome::Booked => self.notify.send_slot(&SlotChanged {
                slot,
                owner: Some(actor.to_string()),
            }),
            ToggleOutcome::Unbooked => self.notify.send_slot(&SlotChanged { slot, owner: None }),
            ToggleOutcome::Conflict { .. } => {}
        }
        Ok(outcome)
    }

    /// Current owner of one slot.
    pub async fn owner(&self, day: &str, resource: &str) -> Result<Option<String>, EngineError> {
        let slot = self.resolve_slot(day, resource)?;
        Ok(self.store.get(&slot).await?)
    }

    /// Clear the whole week. Callers go through the reset scheduler, which
    /// guarantees a single reset in flight.
    pub async fn reset_all(&self) -> Result<Epoch, EngineError> {
        // Detached like toggles: once started, the reset completes even if nobody waits.
        let store = self.store.clone();
        let epoch = tokio::spawn(async move { store.reset_all().await })
            .await
            .map_err(|e| StoreError::Unavailable(format!("reset task failed: {e}")))??;
        Ok(epoch)
    }
}

fn validate_actor(actor: &str) -> Result<(), EngineError> {
    if actor.trim().is_empty() {
        return Err(EngineError::InvalidActor("empty actor"));
    }
    if actor.len() > MAX_ACTOR_LEN {
        return Err(EngineError::InvalidActor("actor too long"));
    }
    Ok(())
}

/// One claim in the common path; a second call only when the actor already holds it.
async fn flip(
    store: &dyn BookingStore,
    slot: &Slot,
    actor: &str,
) -> Result<ToggleOutcome, StoreError> {
    match store.claim(slot, actor).await? {
        ClaimResult::Claimed => Ok(ToggleOutcome::Booked),
        ClaimResult::AlreadyOwnedByOther(owner) => Ok(ToggleOutcome::Conflict { owner }),
        ClaimResult::AlreadyOwnedBySelf => match store.release(slot, actor).await? {
            ReleaseResult::Released => Ok(ToggleOutcome::Unbooked),
            // A reset landed between the two calls; the slot is already free.
            ReleaseResult::AlreadyEmpty => Ok(ToggleOutcome::Unbooked),
            // A reset and someone else's claim landed in between.
            ReleaseResult::NotOwner(owner) => Ok(ToggleOutcome::Conflict { owner }),
        },
    }
}
