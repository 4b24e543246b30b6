#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::visit_session::{SessionUpdate, VisitSessionRepo};

/// Drives the elapsed-time display: one `Tick` per period, applied through the session's
/// update queue like any other update. The lock is never held across an await.
pub fn spawn_session_ticker(
    repo: Arc<Mutex<VisitSessionRepo>>,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut guard = match repo.lock() {
                Ok(g) => g,
                Err(_) => {
                    tracing::error!("visit session lock poisoned; ticker stopping");
                    return;
                }
            };
            if !guard.is_open() {
                continue;
            }
            let now = clock.now();
            let result = guard
                .enqueue(SessionUpdate::Tick)
                .and_then(|_| guard.pump(now));
            if let Err(err) = result {
                tracing::warn!(error = %err, "visit session tick failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::verification::tests::t;
    use crate::verification::VerificationRuntime;
    use crate::visit_session::tests::{approved_store, FakeGeo};
    use sitevisit_kernel_contracts::geo::GeoWatchOptions;
    use sitevisit_kernel_contracts::site_visit::ActorId;
    use sitevisit_storage::local_cache::InMemoryLocalCache;

    #[tokio::test(start_paused = true)]
    async fn ticker_refreshes_displayed_elapsed_time() {
        let wf = VerificationRuntime::default();
        let (store, id) = approved_store(&wf);
        let repo = VisitSessionRepo::init(
            &store,
            Arc::new(Mutex::new(InMemoryLocalCache::new())),
            Arc::new(FakeGeo::default()),
            GeoWatchOptions {
                high_accuracy: true,
                timeout_ms: 15_000,
                max_age_ms: 10_000,
            },
        )
        .unwrap();
        let repo = Arc::new(Mutex::new(repo));
        repo.lock()
            .unwrap()
            .open(&store, &id, &ActorId::new("collector_1").unwrap(), t(1_000))
            .unwrap();

        let clock = Arc::new(ManualClock::new(t(1_000)));
        let handle = spawn_session_ticker(repo.clone(), clock.clone(), Duration::from_millis(1_000));

        clock.set(t(8_000));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(
            repo.lock().unwrap().snapshot().unwrap().displayed_elapsed_ms,
            7_000
        );
        handle.abort();
    }
}
