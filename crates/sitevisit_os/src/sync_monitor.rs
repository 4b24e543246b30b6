#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitevisit_kernel_contracts::offline_sync::{
    Connectivity, OfflineItem, OfflineItemKind, SyncCounts, SyncStatusSnapshot,
};
use sitevisit_kernel_contracts::site_visit::RecordId;
use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_storage::local_cache::CacheError;
use sitevisit_storage::offline_queue::OfflineQueue;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::visit_session::{lock_cache, SharedLocalCache};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote sync push failed: {message}")]
pub struct SyncPushError {
    pub message: String,
    pub retryable: bool,
}

/// Destination for queued offline items.
pub trait RemoteSyncSink: Send {
    fn push(&mut self, item: &OfflineItem) -> Result<(), SyncPushError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncSkip {
    Offline,
    AlreadySyncing,
}

/// Proof that a sync pass was started. Consumed by `finish_sync`.
#[derive(Debug)]
pub struct SyncTicket {
    started_at: WallTimeNs,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncPassReport {
    pub pushed: u32,
    pub failed: u32,
    pub counts_after: SyncCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncNowOutcome {
    Skipped(SyncSkip),
    Completed(SyncPassReport),
}

/// Tracks connectivity, whether a sync pass is running, and how many items wait in the local
/// queue. Counts are refreshed on a poll and after every sync pass.
pub struct SyncStatusMonitor {
    cache: SharedLocalCache,
    connectivity: Connectivity,
    syncing: bool,
    counts: SyncCounts,
    counted_at: Option<WallTimeNs>,
    last_synced_at: Option<WallTimeNs>,
    action_seq: u64,
}

impl std::fmt::Debug for SyncStatusMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStatusMonitor")
            .field("status", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl SyncStatusMonitor {
    pub fn new(cache: SharedLocalCache, connectivity: Connectivity) -> Self {
        Self {
            cache,
            connectivity,
            syncing: false,
            counts: SyncCounts::default(),
            counted_at: None,
            last_synced_at: None,
            action_seq: 0,
        }
    }

    pub fn snapshot(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            connectivity: self.connectivity,
            syncing: self.syncing,
            counts: self.counts,
            counted_at: self.counted_at,
            last_synced_at: self.last_synced_at,
        }
    }

    /// Returns true when the value changed.
    pub fn set_connectivity(&mut self, connectivity: Connectivity) -> bool {
        if self.connectivity == connectivity {
            return false;
        }
        tracing::info!(from = ?self.connectivity, to = ?connectivity, "connectivity changed");
        self.connectivity = connectivity;
        true
    }

    pub fn recompute(&mut self, now: WallTimeNs) -> Result<SyncCounts, CacheError> {
        let counts = {
            let c = lock_cache(&self.cache)?;
            OfflineQueue::counts(&*c)?
        };
        self.counts = counts;
        self.counted_at = Some(now);
        Ok(counts)
    }

    /// Queues a command taken while offline so the next sync pass replays it. Returns false
    /// when online.
    pub fn record_pending_action(
        &mut self,
        action: &str,
        record_id: Option<&RecordId>,
        now: WallTimeNs,
    ) -> Result<bool, CacheError> {
        if self.connectivity == Connectivity::Online {
            return Ok(false);
        }
        self.action_seq = self.action_seq.wrapping_add(1);
        let payload = serde_json::json!({
            "action": action,
            "record_id": record_id.map(RecordId::as_str),
            "at": now.0,
        })
        .to_string();
        let item = OfflineItem::v1(
            format!("{:020}-{:06}", now.0, self.action_seq),
            OfflineItemKind::PendingAction,
            now,
            payload,
        )
        .map_err(|v| CacheError::Encode(v.to_string()))?;
        {
            let mut c = lock_cache(&self.cache)?;
            OfflineQueue::enqueue(&mut *c, &item)?;
        }
        tracing::info!(action, item_id = item.item_id.as_str(), "offline action queued");
        self.recompute(now)?;
        Ok(true)
    }

    pub fn begin_sync(&mut self, now: WallTimeNs) -> Result<SyncTicket, SyncSkip> {
        if self.connectivity == Connectivity::Offline {
            return Err(SyncSkip::Offline);
        }
        if self.syncing {
            return Err(SyncSkip::AlreadySyncing);
        }
        self.syncing = true;
        Ok(SyncTicket { started_at: now })
    }

    pub fn finish_sync(
        &mut self,
        ticket: SyncTicket,
        now: WallTimeNs,
        all_pushed: bool,
    ) -> Result<SyncCounts, CacheError> {
        self.syncing = false;
        if all_pushed {
            self.last_synced_at = Some(now);
        }
        tracing::debug!(
            took_ns = now.saturating_since(ticket.started_at),
            all_pushed,
            "sync pass finished"
        );
        self.recompute(now)
    }

    /// Pushes every queued item to `remote` and acknowledges the ones it accepts. While offline
    /// or while another pass runs this is a no-op.
    pub fn sync_now(
        &mut self,
        remote: &mut dyn RemoteSyncSink,
        now: WallTimeNs,
    ) -> Result<SyncNowOutcome, CacheError> {
        let ticket = match self.begin_sync(now) {
            Ok(t) => t,
            Err(skip) => {
                tracing::debug!(reason = ?skip, "sync skipped");
                return Ok(SyncNowOutcome::Skipped(skip));
            }
        };
        let pass = self.push_pending(remote);
        let (pushed, failed) = match pass {
            Ok(v) => v,
            Err(err) => {
                self.syncing = false;
                return Err(err);
            }
        };
        let counts_after = self.finish_sync(ticket, now, failed == 0)?;
        tracing::info!(pushed, failed, remaining = counts_after.total(), "sync pass");
        Ok(SyncNowOutcome::Completed(SyncPassReport {
            pushed,
            failed,
            counts_after,
        }))
    }

    fn push_pending(&self, remote: &mut dyn RemoteSyncSink) -> Result<(u32, u32), CacheError> {
        let mut c = lock_cache(&self.cache)?;
        let items = OfflineQueue::pending_all(&*c)?;
        let mut pushed = 0u32;
        let mut failed = 0u32;
        for item in items {
            match remote.push(&item) {
                Ok(()) => {
                    OfflineQueue::ack(&mut *c, &item)?;
                    pushed = pushed.saturating_add(1);
                }
                Err(err) => {
                    tracing::warn!(item_id = item.item_id.as_str(), error = %err, "sync item failed");
                    failed = failed.saturating_add(1);
                }
            }
        }
        Ok((pushed, failed))
    }
}

/// Re-counts the queue on a fixed interval.
pub fn spawn_sync_poller(
    monitor: Arc<Mutex<SyncStatusMonitor>>,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let result = match monitor.lock() {
                Ok(mut m) => m.recompute(clock.now()).map(|_| ()),
                Err(_) => {
                    tracing::error!("sync monitor lock poisoned; poller stopping");
                    return;
                }
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "sync count refresh failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use sitevisit_storage::local_cache::InMemoryLocalCache;

    fn t(ms: u64) -> WallTimeNs {
        WallTimeNs::from_ms(ms)
    }

    fn cache_with(items: &[(&str, OfflineItemKind)]) -> SharedLocalCache {
        let mut c = InMemoryLocalCache::new();
        for (id, kind) in items {
            let item = OfflineItem::v1(id.to_string(), *kind, t(1), "{}".to_string()).unwrap();
            OfflineQueue::enqueue(&mut c, &item).unwrap();
        }
        Arc::new(Mutex::new(c))
    }

    #[derive(Default)]
    struct Remote {
        refuse: Vec<String>,
        received: Vec<String>,
    }

    impl RemoteSyncSink for Remote {
        fn push(&mut self, item: &OfflineItem) -> Result<(), SyncPushError> {
            if self.refuse.contains(&item.item_id) {
                return Err(SyncPushError {
                    message: "503".to_string(),
                    retryable: true,
                });
            }
            self.received.push(item.item_id.clone());
            Ok(())
        }
    }

    #[test]
    fn sync_now_is_noop_while_offline() {
        let cache = cache_with(&[("a1", OfflineItemKind::PendingAction)]);
        let mut m = SyncStatusMonitor::new(cache, Connectivity::Offline);
        let mut remote = Remote::default();
        assert_eq!(
            m.sync_now(&mut remote, t(10)).unwrap(),
            SyncNowOutcome::Skipped(SyncSkip::Offline)
        );
        assert!(remote.received.is_empty());
        assert!(!m.snapshot().syncing);
    }

    #[test]
    fn second_begin_is_refused_while_syncing() {
        let mut m = SyncStatusMonitor::new(cache_with(&[]), Connectivity::Online);
        let ticket = m.begin_sync(t(1)).unwrap();
        assert_eq!(m.begin_sync(t(2)).unwrap_err(), SyncSkip::AlreadySyncing);
        let mut remote = Remote::default();
        assert_eq!(
            m.sync_now(&mut remote, t(3)).unwrap(),
            SyncNowOutcome::Skipped(SyncSkip::AlreadySyncing)
        );
        m.finish_sync(ticket, t(4), true).unwrap();
        assert!(!m.snapshot().syncing);
        assert_eq!(m.snapshot().last_synced_at, Some(t(4)));
    }

    #[test]
    fn sync_pass_acks_accepted_items_and_recounts() {
        let cache = cache_with(&[
            ("a1", OfflineItemKind::PendingAction),
            ("s1", OfflineItemKind::UnsyncedSession),
            ("p1", OfflineItemKind::UnsyncedPositionSample),
            ("p2", OfflineItemKind::UnsyncedPositionSample),
        ]);
        let mut m = SyncStatusMonitor::new(cache, Connectivity::Online);
        assert_eq!(m.recompute(t(5)).unwrap().total(), 4);

        let mut remote = Remote {
            refuse: vec!["p2".to_string()],
            ..Remote::default()
        };
        let out = m.sync_now(&mut remote, t(10)).unwrap();
        let SyncNowOutcome::Completed(report) = out else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.pushed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.counts_after.unsynced_position_samples, 1);
        assert_eq!(report.counts_after.total(), 1);
        let snap = m.snapshot();
        assert_eq!(snap.counts.total(), 1);
        assert_eq!(snap.counted_at, Some(t(10)));
        assert_eq!(snap.last_synced_at, None);
    }

    #[test]
    fn offline_commands_queue_pending_actions_until_synced() {
        let cache = cache_with(&[]);
        let mut m = SyncStatusMonitor::new(cache.clone(), Connectivity::Online);
        let id = RecordId::new("r1").unwrap();
        assert!(!m.record_pending_action("verify", Some(&id), t(1)).unwrap());
        assert_eq!(m.snapshot().counts.pending_actions, 0);

        m.set_connectivity(Connectivity::Offline);
        assert!(m.record_pending_action("verify", Some(&id), t(2)).unwrap());
        assert!(m.record_pending_action("approve", Some(&id), t(2)).unwrap());
        assert_eq!(m.snapshot().counts.pending_actions, 2);

        let queued = OfflineQueue::pending(&*cache.lock().unwrap(), OfflineItemKind::PendingAction)
            .unwrap();
        let first: serde_json::Value = serde_json::from_str(&queued[0].payload_json).unwrap();
        assert_eq!(first["action"], "verify");
        assert_eq!(first["record_id"], "r1");

        m.set_connectivity(Connectivity::Online);
        let mut remote = Remote::default();
        let SyncNowOutcome::Completed(report) = m.sync_now(&mut remote, t(3)).unwrap() else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.pushed, 2);
        assert_eq!(report.counts_after.pending_actions, 0);
    }

    #[test]
    fn connectivity_change_is_reported_once() {
        let mut m = SyncStatusMonitor::new(cache_with(&[]), Connectivity::Online);
        assert!(m.set_connectivity(Connectivity::Offline));
        assert!(!m.set_connectivity(Connectivity::Offline));
        assert_eq!(m.snapshot().connectivity, Connectivity::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_refreshes_counts() {
        let cache = cache_with(&[]);
        let monitor = Arc::new(Mutex::new(SyncStatusMonitor::new(
            cache.clone(),
            Connectivity::Online,
        )));
        let clock = Arc::new(ManualClock::new(t(1)));
        let handle = spawn_sync_poller(monitor.clone(), clock.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.lock().unwrap().snapshot().counts.total(), 0);

        let item = OfflineItem::v1(
            "a9".to_string(),
            OfflineItemKind::PendingAction,
            t(2),
            "{}".to_string(),
        )
        .unwrap();
        OfflineQueue::enqueue(&mut *cache.lock().unwrap(), &item).unwrap();
        clock.set(t(20_000));
        tokio::time::sleep(Duration::from_secs(11)).await;
        let snap = monitor.lock().unwrap().snapshot();
        assert_eq!(snap.counts.pending_actions, 1);
        assert_eq!(snap.counted_at, Some(t(20_000)));
        handle.abort();
    }
}
