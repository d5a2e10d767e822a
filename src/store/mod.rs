mod error;
mod replay;
#[cfg(test)]
mod tests;

pub use error::StoreError;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};

use crate::model::*;
use crate::observability::{
    OCCUPIED_SLOTS, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS, WEEK_EPOCH,
};
use crate::wal::Wal;

/// Persistence capability behind the booking engine.
///
/// Every method is atomic per slot: concurrent callers on the same slot are
/// serialized, and a failed call leaves the slot in its previous state.
/// Implementations never retry.
#[async_trait]
pub trait BookingStore: Send + Sync {
    fn layout(&self) -> &WeekLayout;

    async fn get(&self, slot: &Slot) -> Result<Option<String>, StoreError>;

    /// Set the owner to `actor` only if the slot is free.
    async fn claim(&self, slot: &Slot, actor: &str) -> Result<ClaimResult, StoreError>;

    /// Clear the owner only if it is `actor`.
    async fn release(&self, slot: &Slot, actor: &str) -> Result<ReleaseResult, StoreError>;

    async fn snapshot(&self) -> Result<StoreSnapshot, StoreError>;

    /// Clear every slot and start a new epoch. Returns the new epoch.
    async fn reset_all(&self) -> Result<Epoch, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every append already queued and commits
/// them with a single fsync; control commands run after the batch they follow.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    let result = appended.and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Nobody in this batch is acknowledged, so none of its bytes may stay in the log.
        error!("WAL batch of {} failed: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            error!("WAL rollback failed: {e}");
        }
    }

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Slot store ───────────────────────────────────────────

/// The booking store: one lock per slot over the fixed layout, optionally
/// backed by a write-ahead log.
///
/// Every slot exists for the store's whole life; a free slot is an explicit
/// `None`. A mutation holds its slot's write lock across the WAL append and
/// only touches memory once the event is durable. Whole-week operations lock
/// slots in layout order, so they never deadlock against each other.
pub struct SlotStore {
    layout: WeekLayout,
    slots: Vec<RwLock<Option<String>>>,
    epoch: AtomicU64,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl SlotStore {
    /// Same semantics, nothing persisted.
    pub fn in_memory(layout: WeekLayout) -> Self {
        let slots = (0..layout.slot_count()).map(|_| RwLock::new(None)).collect();
        Self {
            layout,
            slots,
            epoch: AtomicU64::new(0),
            wal_tx: None,
        }
    }

    /// Replay the WAL at `wal_path` and spawn its writer task. Needs a tokio runtime.
    pub fn open(layout: WeekLayout, wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let mut wal = Wal::open(wal_path)?;

        let state = replay::rebuild(&layout, &events);
        // Start from the minimal log so nothing is appended behind a torn tail.
        wal.rewrite(&replay::minimal_log(&layout, &state))?;
        if state.skipped > 0 {
            warn!(
                "skipped {} replayed events for slots no longer in the layout",
                state.skipped
            );
        }
        info!(
            "replayed {} events: epoch {}, {} slots held",
            events.len(),
            state.epoch,
            state.owners.iter().filter(|o| o.is_some()).count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        metrics::gauge!(WEEK_EPOCH).set(state.epoch as f64);
        metrics::gauge!(OCCUPIED_SLOTS)
            .set(state.owners.iter().filter(|o| o.is_some()).count() as f64);

        Ok(Self {
            layout,
            slots: state.owners.into_iter().map(RwLock::new).collect(),
            epoch: AtomicU64::new(state.epoch),
            wal_tx: Some(wal_tx),
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    fn index(&self, slot: &Slot) -> Result<usize, StoreError> {
        self.layout
            .locate(slot)
            .ok_or_else(|| StoreError::NotConfigured(slot.clone()))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))??;
        Ok(())
    }

    async fn wal_rewrite(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Rewrite {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))??;
        Ok(())
    }

    async fn read_all(&self) -> Vec<RwLockReadGuard<'_, Option<String>>> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.read().await);
        }
        guards
    }

    async fn write_all(&self) -> Vec<RwLockWriteGuard<'_, Option<String>>> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.write().await);
        }
        guards
    }

    /// Rewrite the WAL as the minimal event list that recreates the current week.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let guards = self.read_all().await;
        let owners: Vec<Option<String>> = guards.iter().map(|g| (**g).clone()).collect();
        let events = replay::log_for(&self.layout, self.epoch(), &owners);
        self.wal_rewrite(events).await
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for SlotStore {
    fn layout(&self) -> &WeekLayout {
        &self.layout
    }

    async fn get(&self, slot: &Slot) -> Result<Option<String>, StoreError> {
        let idx = self.index(slot)?;
        Ok(self.slots[idx].read().await.clone())
    }

    async fn claim(&self, slot: &Slot, actor: &str) -> Result<ClaimResult, StoreError> {
        let idx = self.index(slot)?;
        let mut owner = self.slots[idx].write().await;
        match owner.as_deref() {
            Some(current) if current == actor => return Ok(ClaimResult::AlreadyOwnedBySelf),
            Some(current) => return Ok(ClaimResult::AlreadyOwnedByOther(current.to_string())),
            None => {}
        }

        self.wal_append(&Event::SlotClaimed {
            day: slot.day,
            resource: slot.resource.clone(),
            actor: actor.to_string(),
        })
        .await?;
        *owner = Some(actor.to_string());
        metrics::gauge!(OCCUPIED_SLOTS).increment(1.0);
        Ok(ClaimResult::Claimed)
    }

    async fn release(&self, slot: &Slot, actor: &str) -> Result<ReleaseResult, StoreError> {
        let idx = self.index(slot)?;
        let mut owner = self.slots[idx].write().await;
        match owner.as_deref() {
            None => return Ok(ReleaseResult::AlreadyEmpty),
            Some(current) if current != actor => {
                return Ok(ReleaseResult::NotOwner(current.to_string()));
            }
            Some(_) => {}
        }

        self.wal_append(&Event::SlotReleased {
            day: slot.day,
            resource: slot.resource.clone(),
        })
        .await?;
        *owner = None;
        metrics::gauge!(OCCUPIED_SLOTS).decrement(1.0);
        Ok(ReleaseResult::Released)
    }

    /// Taken under every slot's read lock, so it is never a mix of pre- and
    /// post-reset state.
    async fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let guards = self.read_all().await;
        let owners = self
            .layout
            .slots()
            .zip(guards.iter())
            .map(|(slot, owner)| (slot, (**owner).clone()))
            .collect();
        Ok(StoreSnapshot {
            epoch: self.epoch(),
            owners,
        })
    }

    /// The log is rewritten to the single reset record: nothing from the
    /// previous epoch survives.
    async fn reset_all(&self) -> Result<Epoch, StoreError> {
        let mut guards = self.write_all().await;
        let epoch = self.epoch() + 1;
        self.wal_rewrite(vec![Event::WeekReset { epoch }]).await?;
        for owner in guards.iter_mut() {
            **owner = None;
        }
        self.epoch.store(epoch, Ordering::Release);
        metrics::gauge!(OCCUPIED_SLOTS).set(0.0);
        metrics::gauge!(WEEK_EPOCH).set(epoch as f64);
        Ok(epoch)
    }
}
