use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Day, SlotChanged, WeekOpened};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: per-day slot changes plus the weekly "week opened" event.
pub struct NotifyHub {
    days: DashMap<Day, broadcast::Sender<SlotChanged>>,
    week: broadcast::Sender<WeekOpened>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            week: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to slot changes on one day. Creates the channel if needed.
    pub fn subscribe_day(&self, day: Day) -> broadcast::Receiver<SlotChanged> {
        self.days
            .entry(day)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_week(&self) -> broadcast::Receiver<WeekOpened> {
        self.week.subscribe()
    }

    /// No-op if nobody is listening on that day.
    pub fn send_slot(&self, change: &SlotChanged) {
        if let Some(sender) = self.days.get(&change.slot.day) {
            let _ = sender.send(change.clone());
        }
    }

    /// Returns how many subscribers received it.
    pub fn send_week(&self, opened: &WeekOpened) -> usize {
        self.week.send(opened.clone()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Slot;

    #[tokio::test]
    async fn day_subscribers_only_see_their_day() {
        let hub = NotifyHub::new();
        let mut monday = hub.subscribe_day(Day::Monday);
        let mut friday = hub.subscribe_day(Day::Friday);

        let change = SlotChanged {
            slot: Slot::new(Day::Friday, "large_1"),
            owner: Some("U1".into()),
        };
        hub.send_slot(&change);

        assert_eq!(friday.recv().await.unwrap(), change);
        assert!(monday.try_recv().is_err());
    }

    #[tokio::test]
    async fn week_opened_reaches_every_subscriber() {
        let hub = NotifyHub::new();
        let mut a = hub.subscribe_week();
        let mut b = hub.subscribe_week();
        let opened = WeekOpened {
            epoch: 2,
            dates: None,
        };
        assert_eq!(hub.send_week(&opened), 2);
        assert_eq!(a.recv().await.unwrap(), opened);
        assert_eq!(b.recv().await.unwrap(), opened);
    }

    #[test]
    fn sending_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send_slot(&SlotChanged {
            slot: Slot::new(Day::Monday, "small_1"),
            owner: None,
        });
        assert_eq!(
            hub.send_week(&WeekOpened {
                epoch: 1,
                dates: None
            }),
            0
        );
    }
}
