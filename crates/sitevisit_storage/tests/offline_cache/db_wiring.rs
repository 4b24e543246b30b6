#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::offline_sync::{OfflineItem, OfflineItemKind};
use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_storage::local_cache::{FileLocalCache, LocalCache};
use sitevisit_storage::offline_queue::OfflineQueue;

fn item(id: &str, kind: OfflineItemKind) -> OfflineItem {
    OfflineItem::v1(
        id.to_string(),
        kind,
        WallTimeNs(5),
        format!("{{\"id\":\"{id}\"}}"),
    )
    .unwrap()
}

#[test]
fn at_offline_db_01_pending_items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device").join("cache.json");
    {
        let mut cache = FileLocalCache::open(&path).unwrap();
        OfflineQueue::enqueue(&mut cache, &item("act_1", OfflineItemKind::PendingAction)).unwrap();
        OfflineQueue::enqueue(&mut cache, &item("ses_1", OfflineItemKind::UnsyncedSession))
            .unwrap();
        OfflineQueue::enqueue(
            &mut cache,
            &item("pos_1", OfflineItemKind::UnsyncedPositionSample),
        )
        .unwrap();
    }

    let mut cache = FileLocalCache::open(&path).unwrap();
    let counts = OfflineQueue::counts(&cache).unwrap();
    assert_eq!(counts.pending_actions, 1);
    assert_eq!(counts.unsynced_sessions, 1);
    assert_eq!(counts.unsynced_position_samples, 1);

    let sessions = OfflineQueue::pending(&cache, OfflineItemKind::UnsyncedSession).unwrap();
    assert_eq!(sessions.len(), 1);
    OfflineQueue::ack(&mut cache, &sessions[0]).unwrap();
    drop(cache);

    let cache = FileLocalCache::open(&path).unwrap();
    assert_eq!(OfflineQueue::counts(&cache).unwrap().total(), 2);
}

#[test]
fn at_offline_db_02_unreadable_item_is_skipped_but_counted() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = FileLocalCache::open(dir.path().join("cache.json")).unwrap();
    cache
        .put("offline/pending_action/broken", "not json".to_string())
        .unwrap();
    OfflineQueue::enqueue(&mut cache, &item("act_2", OfflineItemKind::PendingAction)).unwrap();

    let pending = OfflineQueue::pending(&cache, OfflineItemKind::PendingAction).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_id, "act_2");
    assert_eq!(OfflineQueue::counts(&cache).unwrap().pending_actions, 2);
}
