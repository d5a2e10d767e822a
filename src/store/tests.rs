use std::path::PathBuf;
use std::sync::Arc;

use super::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("weekdesk_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn mon_small_1() -> Slot {
    Slot::new(Day::Monday, "small_1")
}

#[tokio::test]
async fn unconfigured_slot_is_rejected() {
    let store = SlotStore::in_memory(WeekLayout::reference());
    let bad = Slot::new(Day::Monday, "broom_cupboard");
    assert_eq!(
        store.get(&bad).await,
        Err(StoreError::NotConfigured(bad.clone()))
    );
    assert!(matches!(
        store.claim(&bad, "U1").await,
        Err(StoreError::NotConfigured(_))
    ));
    assert!(matches!(
        store.release(&bad, "U1").await,
        Err(StoreError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn claim_only_succeeds_on_free_slot() {
    let store = SlotStore::in_memory(WeekLayout::reference());
    let slot = mon_small_1();

    assert_eq!(store.get(&slot).await.unwrap(), None);
    assert_eq!(store.claim(&slot, "U1").await.unwrap(), ClaimResult::Claimed);
    assert_eq!(
        store.claim(&slot, "U1").await.unwrap(),
        ClaimResult::AlreadyOwnedBySelf
    );
    assert_eq!(
        store.claim(&slot, "U2").await.unwrap(),
        ClaimResult::AlreadyOwnedByOther("U1".into())
    );
    assert_eq!(store.get(&slot).await.unwrap().as_deref(), Some("U1"));
}

#[tokio::test]
async fn release_only_by_owner() {
    let store = SlotStore::in_memory(WeekLayout::reference());
    let slot = mon_small_1();

    assert_eq!(
        store.release(&slot, "U1").await.unwrap(),
        ReleaseResult::AlreadyEmpty
    );
    store.claim(&slot, "U1").await.unwrap();
    assert_eq!(
        store.release(&slot, "U2").await.unwrap(),
        ReleaseResult::NotOwner("U1".into())
    );
    assert_eq!(store.get(&slot).await.unwrap().as_deref(), Some("U1"));
    assert_eq!(
        store.release(&slot, "U1").await.unwrap(),
        ReleaseResult::Released
    );
    assert_eq!(store.get(&slot).await.unwrap(), None);
}

#[tokio::test]
async fn reset_clears_every_slot_and_advances_epoch() {
    let store = SlotStore::in_memory(WeekLayout::reference());
    for (i, slot) in store.layout().slots().enumerate().step_by(3) {
        store.claim(&slot, &format!("U{i}")).await.unwrap();
    }
    assert_eq!(store.epoch(), 0);

    assert_eq!(store.reset_all().await.unwrap(), 1);
    let snap = store.snapshot().await.unwrap();
    assert_eq!(snap.epoch, 1);
    assert_eq!(snap.owners.len(), 30);
    assert!(snap.owners.iter().all(|(_, owner)| owner.is_none()));

    // A second reset right after is harmless.
    assert_eq!(store.reset_all().await.unwrap(), 2);
    assert!(store.snapshot().await.unwrap().owners.iter().all(|(_, o)| o.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let store = Arc::new(SlotStore::in_memory(WeekLayout::reference()));
    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&mon_small_1(), &format!("U{i}")).await.unwrap()
        }));
    }
    let mut claimed = 0;
    let mut lost = 0;
    for h in handles {
        match h.await.unwrap() {
            ClaimResult::Claimed => claimed += 1,
            ClaimResult::AlreadyOwnedByOther(_) => lost += 1,
            ClaimResult::AlreadyOwnedBySelf => panic!("distinct actors cannot own-self"),
        }
    }
    assert_eq!(claimed, 1);
    assert_eq!(lost, 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_never_mixes_pre_and_post_reset() {
    let store = Arc::new(SlotStore::in_memory(WeekLayout::reference()));
    for slot in store.layout().slots() {
        store.claim(&slot, "U1").await.unwrap();
    }

    let mut readers = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        readers.push(tokio::spawn(async move {
            let snap = store.snapshot().await.unwrap();
            let held = snap.owners.iter().filter(|(_, o)| o.is_some()).count();
            (snap.epoch, held)
        }));
    }
    let resetter = {
        let store = store.clone();
        tokio::spawn(async move { store.reset_all().await.unwrap() })
    };

    assert_eq!(resetter.await.unwrap(), 1);
    for r in readers {
        let (epoch, held) = r.await.unwrap();
        match epoch {
            0 => assert_eq!(held, 30),
            1 => assert_eq!(held, 0),
            other => panic!("unexpected epoch {other}"),
        }
    }
}

#[tokio::test]
async fn durable_store_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    {
        let store = SlotStore::open(WeekLayout::reference(), &path).unwrap();
        assert!(store.is_durable());
        store.claim(&mon_small_1(), "U1").await.unwrap();
        store
            .claim(&Slot::new(Day::Friday, "large_3"), "U2")
            .await
            .unwrap();
        store
            .claim(&Slot::new(Day::Friday, "large_3"), "U9")
            .await
            .unwrap();
        store
            .release(&Slot::new(Day::Friday, "large_3"), "U2")
            .await
            .unwrap();
    }

    let reopened = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    assert_eq!(
        reopened.get(&mon_small_1()).await.unwrap().as_deref(),
        Some("U1")
    );
    assert_eq!(
        reopened.get(&Slot::new(Day::Friday, "large_3")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn reset_leaves_only_the_reset_record_on_disk() {
    let path = test_wal_path("reset_history.wal");
    let store = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    for slot in store.layout().slots().take(5) {
        store.claim(&slot, "U1").await.unwrap();
    }
    assert_eq!(store.appends_since_compact().await, 5);

    store.reset_all().await.unwrap();
    assert_eq!(
        crate::wal::Wal::replay(&path).unwrap(),
        vec![Event::WeekReset { epoch: 1 }]
    );
    assert_eq!(store.appends_since_compact().await, 0);

    let reopened = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    assert_eq!(reopened.epoch(), 1);
    assert!(reopened
        .snapshot()
        .await
        .unwrap()
        .owners
        .iter()
        .all(|(_, o)| o.is_none()));
}

#[tokio::test]
async fn compact_keeps_current_owners_only() {
    let path = test_wal_path("compact.wal");
    let store = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    for i in 0..10 {
        let actor = format!("U{i}");
        store.claim(&mon_small_1(), &actor).await.unwrap();
        store.release(&mon_small_1(), &actor).await.unwrap();
    }
    store
        .claim(&Slot::new(Day::Wednesday, "large_1"), "U42")
        .await
        .unwrap();
    let before = store.snapshot().await.unwrap();

    store.compact().await.unwrap();
    assert_eq!(
        crate::wal::Wal::replay(&path).unwrap(),
        vec![
            Event::WeekReset { epoch: 0 },
            Event::SlotClaimed {
                day: Day::Wednesday,
                resource: "large_1".into(),
                actor: "U42".into(),
            },
        ]
    );

    let reopened = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    assert_eq!(reopened.snapshot().await.unwrap(), before);
}

#[tokio::test]
async fn in_memory_store_has_nothing_to_compact() {
    let store = SlotStore::in_memory(WeekLayout::reference());
    store.claim(&mon_small_1(), "U1").await.unwrap();
    assert!(!store.is_durable());
    assert_eq!(store.appends_since_compact().await, 0);
    tokio_test::assert_ok!(store.compact().await);
}

#[tokio::test]
async fn appends_after_a_torn_tail_survive_the_next_reopen() {
    let path = test_wal_path("torn_tail.wal");
    {
        let store = SlotStore::open(WeekLayout::reference(), &path).unwrap();
        store.claim(&mon_small_1(), "U1").await.unwrap();
    }
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x2a, 0x00, 0x00, 0x00, 0x01, 0x02]).unwrap();
    }

    let store = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    assert_eq!(store.get(&mon_small_1()).await.unwrap().as_deref(), Some("U1"));
    store
        .claim(&Slot::new(Day::Thursday, "small_2"), "U2")
        .await
        .unwrap();
    drop(store);

    let reopened = SlotStore::open(WeekLayout::reference(), &path).unwrap();
    assert_eq!(
        reopened
            .get(&Slot::new(Day::Thursday, "small_2"))
            .await
            .unwrap()
            .as_deref(),
        Some("U2")
    );
}
