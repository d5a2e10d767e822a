use std::fmt;

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::calendar::WeekDates;

/// Week generation counter, advanced by every reset.
pub type Epoch = u64;

/// One of the five bookable weekdays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Day {
    pub const ALL: [Day; 5] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
        }
    }

    /// Accepts full names and three-letter abbreviations, any case.
    pub fn parse(s: &str) -> Option<Day> {
        let lower = s.trim().to_ascii_lowercase();
        Day::ALL.into_iter().find(|day| {
            let name = day.name().to_ascii_lowercase();
            lower == name || (lower.len() == 3 && name.starts_with(&lower))
        })
    }

    /// Days after Monday (Monday = 0).
    pub fn offset(self) -> u32 {
        self.weekday().num_days_from_monday()
    }

    pub fn weekday(self) -> Weekday {
        match self {
            Day::Monday => Weekday::Mon,
            Day::Tuesday => Weekday::Tue,
            Day::Wednesday => Weekday::Wed,
            Day::Thursday => Weekday::Thu,
            Day::Friday => Weekday::Fri,
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bookable desk or room. Identity is `name`; `label` is display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub label: String,
}

impl Resource {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }
}

/// The static, ordered slot space: days × resources.
///
/// Slots are addressed by a flat index `day_idx * resources.len() + resource_idx`,
/// which is also the lock order used by whole-week operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekLayout {
    days: Vec<Day>,
    resources: Vec<Resource>,
}

impl WeekLayout {
    /// Caller guarantees non-empty, duplicate-free lists (see `Config::validate`).
    pub fn new(days: Vec<Day>, resources: Vec<Resource>) -> Self {
        Self { days, resources }
    }

    /// Five weekdays, two small rooms and four large rooms.
    pub fn reference() -> Self {
        Self::new(
            Day::ALL.to_vec(),
            vec![
                Resource::new("small_1", "Small Room 1"),
                Resource::new("small_2", "Small Room 2"),
                Resource::new("large_1", "Large Room 1"),
                Resource::new("large_2", "Large Room 2"),
                Resource::new("large_3", "Large Room 3"),
                Resource::new("large_4", "Large Room 4"),
            ],
        )
    }

    pub fn days(&self) -> &[Day] {
        &self.days
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn slot_count(&self) -> usize {
        self.days.len() * self.resources.len()
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Flat index of a slot, or `None` if the day or resource is not configured.
    pub fn locate(&self, slot: &Slot) -> Option<usize> {
        let d = self.days.iter().position(|d| *d == slot.day)?;
        let r = self.resources.iter().position(|r| r.name == slot.resource)?;
        Some(d * self.resources.len() + r)
    }

    /// All slots in lock order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.days.iter().flat_map(move |day| {
            self.resources
                .iter()
                .map(move |r| Slot::new(*day, r.name.clone()))
        })
    }
}

/// The unit of contention: one resource on one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub day: Day,
    pub resource: String,
}

impl Slot {
    pub fn new(day: Day, resource: impl Into<String>) -> Self {
        Self {
            day,
            resource: resource.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.day, self.resource)
    }
}

/// Result of an atomic claim-if-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    AlreadyOwnedBySelf,
    AlreadyOwnedByOther(String),
}

/// Result of an atomic release-if-owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseResult {
    Released,
    NotOwner(String),
    AlreadyEmpty,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotClaimed {
        day: Day,
        resource: String,
        actor: String,
    },
    SlotReleased {
        day: Day,
        resource: String,
    },
    /// Every slot cleared; `epoch` is the generation that starts here.
    WeekReset {
        epoch: Epoch,
    },
}

/// What a toggle did, relative to the acting identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Booked,
    Unbooked,
    /// Someone else holds the slot; nothing was changed.
    Conflict { owner: String },
}

impl ToggleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ToggleOutcome::Booked => "booked",
            ToggleOutcome::Unbooked => "unbooked",
            ToggleOutcome::Conflict { .. } => "conflict",
        }
    }
}

// ── Read models ──────────────────────────────────────────────────

/// Point-in-time copy of every slot, in layout order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub epoch: Epoch,
    pub owners: Vec<(Slot, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub resource: String,
    pub label: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRow {
    pub day: Day,
    pub date: Option<NaiveDate>,
    pub slots: Vec<SlotView>,
}

impl DayRow {
    pub fn attach_date(&mut self, dates: &WeekDates) {
        self.date = Some(dates.date_of(self.day));
    }
}

/// Ordered day → ordered resource → owner grid for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekGrid {
    pub epoch: Epoch,
    pub days: Vec<DayRow>,
}

impl WeekGrid {
    pub fn day(&self, day: Day) -> Option<&DayRow> {
        self.days.iter().find(|row| row.day == day)
    }

    pub fn owner(&self, slot: &Slot) -> Option<&str> {
        self.day(slot.day)?
            .slots
            .iter()
            .find(|s| s.resource == slot.resource)?
            .owner
            .as_deref()
    }

    pub fn occupied(&self) -> usize {
        self.days
            .iter()
            .flat_map(|row| &row.slots)
            .filter(|s| s.owner.is_some())
            .count()
    }

    pub fn attach_dates(&mut self, dates: &WeekDates) {
        for row in &mut self.days {
            row.attach_date(dates);
        }
    }
}

// ── Notifications ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChanged {
    pub slot: Slot,
    pub owner: Option<String>,
}

/// Fired once per reset cycle for the presentation layer to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekOpened {
    pub epoch: Epoch,
    pub dates: Option<WeekDates>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_parse_accepts_names_and_abbreviations() {
        assert_eq!(Day::parse("Monday"), Some(Day::Monday));
        assert_eq!(Day::parse("friday"), Some(Day::Friday));
        assert_eq!(Day::parse(" WED "), Some(Day::Wednesday));
        assert_eq!(Day::parse("thu"), Some(Day::Thursday));
        assert_eq!(Day::parse("Saturday"), None);
        assert_eq!(Day::parse("mo"), None);
        assert_eq!(Day::parse(""), None);
    }

    #[test]
    fn day_offsets_follow_week_order() {
        let offsets: Vec<u32> = Day::ALL.iter().map(|d| d.offset()).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reference_layout_has_thirty_slots() {
        let layout = WeekLayout::reference();
        assert_eq!(layout.slot_count(), 30);
        assert_eq!(layout.slots().count(), 30);
    }

    #[test]
    fn locate_matches_slot_iteration_order() {
        let layout = WeekLayout::reference();
        for (i, slot) in layout.slots().enumerate() {
            assert_eq!(layout.locate(&slot), Some(i));
        }
    }

    #[test]
    fn locate_rejects_unconfigured_keys() {
        let layout = WeekLayout::new(
            vec![Day::Monday, Day::Tuesday],
            vec![Resource::new("desk_a", "Desk A")],
        );
        assert_eq!(layout.locate(&Slot::new(Day::Friday, "desk_a")), None);
        assert_eq!(layout.locate(&Slot::new(Day::Monday, "desk_b")), None);
        assert_eq!(layout.locate(&Slot::new(Day::Tuesday, "desk_a")), Some(1));
    }

    #[test]
    fn grid_lookup_and_occupancy() {
        let grid = WeekGrid {
            epoch: 3,
            days: vec![DayRow {
                day: Day::Monday,
                date: None,
                slots: vec![
                    SlotView {
                        resource: "small_1".into(),
                        label: "Small Room 1".into(),
                        owner: Some("U1".into()),
                    },
                    SlotView {
                        resource: "small_2".into(),
                        label: "Small Room 2".into(),
                        owner: None,
                    },
                ],
            }],
        };
        assert_eq!(grid.owner(&Slot::new(Day::Monday, "small_1")), Some("U1"));
        assert_eq!(grid.owner(&Slot::new(Day::Monday, "small_2")), None);
        assert_eq!(grid.owner(&Slot::new(Day::Friday, "small_1")), None);
        assert_eq!(grid.occupied(), 1);
    }
}
