use crate::model::*;

pub(super) struct Rebuilt {
    /// One entry per layout slot, in lock order.
    pub owners: Vec<Option<String>>,
    pub epoch: Epoch,
    /// Events naming a day or resource the layout no longer has.
    pub skipped: usize,
}

/// Fold replayed WAL events into slot owners for `layout`.
pub(super) fn rebuild(layout: &WeekLayout, events: &[Event]) -> Rebuilt {
    let mut state = Rebuilt {
        owners: vec![None; layout.slot_count()],
        epoch: 0,
        skipped: 0,
    };

    for event in events {
        match event {
            Event::SlotClaimed {
                day,
                resource,
                actor,
            } => match layout.locate(&Slot::new(*day, resource.as_str())) {
                Some(idx) => state.owners[idx] = Some(actor.clone()),
                None => state.skipped += 1,
            },
            Event::SlotReleased { day, resource } => {
                match layout.locate(&Slot::new(*day, resource.as_str())) {
                    Some(idx) => state.owners[idx] = None,
                    None => state.skipped += 1,
                }
            }
            Event::WeekReset { epoch } => {
                state.owners.iter_mut().for_each(|o| *o = None);
                state.epoch = *epoch;
            }
        }
    }
    state
}

/// Shortest event list that recreates `owners` at `epoch`.
pub(super) fn log_for(layout: &WeekLayout, epoch: Epoch, owners: &[Option<String>]) -> Vec<Event> {
    let mut events = vec![Event::WeekReset { epoch }];
    for (slot, owner) in layout.slots().zip(owners) {
        if let Some(actor) = owner {
            events.push(Event::SlotClaimed {
                day: slot.day,
                resource: slot.resource,
                actor: actor.clone(),
            });
        }
    }
    events
}

pub(super) fn minimal_log(layout: &WeekLayout, state: &Rebuilt) -> Vec<Event> {
    log_for(layout, state.epoch, &state.owners)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(day: Day, resource: &str, actor: &str) -> Event {
        Event::SlotClaimed {
            day,
            resource: resource.into(),
            actor: actor.into(),
        }
    }

    #[test]
    fn empty_log_is_free_week_at_epoch_zero() {
        let layout = WeekLayout::reference();
        let state = rebuild(&layout, &[]);
        assert_eq!(state.epoch, 0);
        assert_eq!(state.owners.len(), 30);
        assert!(state.owners.iter().all(Option::is_none));
    }

    #[test]
    fn claims_and_releases_fold_in_order() {
        let layout = WeekLayout::reference();
        let events = vec![
            claimed(Day::Monday, "small_1", "U1"),
            claimed(Day::Friday, "large_4", "U2"),
            Event::SlotReleased {
                day: Day::Monday,
                resource: "small_1".into(),
            },
            claimed(Day::Monday, "small_1", "U3"),
        ];
        let state = rebuild(&layout, &events);
        let mon = layout.locate(&Slot::new(Day::Monday, "small_1")).unwrap();
        let fri = layout.locate(&Slot::new(Day::Friday, "large_4")).unwrap();
        assert_eq!(state.owners[mon].as_deref(), Some("U3"));
        assert_eq!(state.owners[fri].as_deref(), Some("U2"));
        assert_eq!(state.skipped, 0);
    }

    #[test]
    fn reset_clears_earlier_claims_and_sets_epoch() {
        let layout = WeekLayout::reference();
        let events = vec![
            claimed(Day::Monday, "small_1", "U1"),
            Event::WeekReset { epoch: 7 },
            claimed(Day::Tuesday, "small_2", "U2"),
        ];
        let state = rebuild(&layout, &events);
        assert_eq!(state.epoch, 7);
        assert_eq!(state.owners.iter().filter(|o| o.is_some()).count(), 1);
    }

    #[test]
    fn events_for_removed_resources_are_skipped() {
        let layout = WeekLayout::new(
            vec![Day::Monday],
            vec![Resource::new("desk_a", "Desk A")],
        );
        let events = vec![
            claimed(Day::Monday, "desk_a", "U1"),
            claimed(Day::Monday, "desk_gone", "U2"),
            claimed(Day::Thursday, "desk_a", "U3"),
        ];
        let state = rebuild(&layout, &events);
        assert_eq!(state.owners, vec![Some("U1".to_string())]);
        assert_eq!(state.skipped, 2);
    }

    #[test]
    fn minimal_log_rebuilds_the_same_state() {
        let layout = WeekLayout::reference();
        let events = vec![
            Event::WeekReset { epoch: 3 },
            claimed(Day::Monday, "small_1", "U1"),
            claimed(Day::Monday, "small_2", "U2"),
            Event::SlotReleased {
                day: Day::Monday,
                resource: "small_1".into(),
            },
        ];
        let state = rebuild(&layout, &events);
        let log = minimal_log(&layout, &state);
        assert_eq!(
            log,
            vec![
                Event::WeekReset { epoch: 3 },
                claimed(Day::Monday, "small_2", "U2")
            ]
        );
        let again = rebuild(&layout, &log);
        assert_eq!(again.owners, state.owners);
        assert_eq!(again.epoch, 3);
    }
}
