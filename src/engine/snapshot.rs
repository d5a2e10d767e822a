use std::collections::HashMap;

use crate::model::*;

use super::{BookingEngine, EngineError};

impl BookingEngine {
    /// The whole week as an ordered day → resource → owner grid. Dates are
    /// left empty; the presentation layer attaches them if it wants them.
    pub async fn snapshot(&self) -> Result<WeekGrid, EngineError> {
        let snap = self.store.snapshot().await?;
        Ok(build_grid(self.layout(), snap))
    }

    /// A configured day, or `InvalidSlot` naming every resource on it.
    pub fn resolve_day(&self, day: &str) -> Result<Day, EngineError> {
        Day::parse(day)
            .filter(|d| self.layout().days().contains(d))
            .ok_or_else(|| EngineError::InvalidSlot {
                day: day.to_string(),
                resource: "*".into(),
            })
    }

    pub async fn day_view(&self, day: &str) -> Result<DayRow, EngineError> {
        let parsed = self.resolve_day(day)?;
        let grid = self.snapshot().await?;
        grid.days
            .into_iter()
            .find(|row| row.day == parsed)
            .ok_or_else(|| EngineError::InvalidSlot {
                day: day.to_string(),
                resource: "*".into(),
            })
    }

    /// Slots held by `actor`, in layout order.
    pub async fn bookings_for(&self, actor: &str) -> Result<Vec<Slot>, EngineError> {
        let snap = self.store.snapshot().await?;
        Ok(snap
            .owners
            .into_iter()
            .filter(|(_, owner)| owner.as_deref() == Some(actor))
            .map(|(slot, _)| slot)
            .collect())
    }
}

fn build_grid(layout: &WeekLayout, snap: StoreSnapshot) -> WeekGrid {
    let mut owners: HashMap<Slot, Option<String>> = snap.owners.into_iter().collect();
    let days = layout
        .days()
        .iter()
        .map(|day| DayRow {
            day: *day,
            date: None,
            slots: layout
                .resources()
                .iter()
                .map(|r| SlotView {
                    resource: r.name.clone(),
                    label: r.label.clone(),
                    owner: owners
                        .remove(&Slot::new(*day, r.name.as_str()))
                        .flatten(),
                })
                .collect(),
        })
        .collect();
    WeekGrid {
        epoch: snap.epoch,
        days,
    }
}
