#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_storage::store::SiteVisitStore;

use crate::query::{BadgeCounts, RecordPage, RecordQuery};

/// Folds bursts of change notifications into one reload. The window opens at the first trigger
/// and the reload is due once it has elapsed, however many triggers arrived meanwhile.
#[derive(Debug, Clone)]
pub struct ReloadCoalescer {
    window_ns: u64,
    pending_since: Option<WallTimeNs>,
    coalesced: u32,
}

impl ReloadCoalescer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ns: window_ms.saturating_mul(1_000_000),
            pending_since: None,
            coalesced: 0,
        }
    }

    pub fn trigger(&mut self, now: WallTimeNs) {
        if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
        self.coalesced = self.coalesced.saturating_add(1);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Returns the number of triggers folded into this reload, or None if nothing is due.
    pub fn take_due(&mut self, now: WallTimeNs) -> Option<u32> {
        let since = self.pending_since?;
        if now.saturating_since(since) < self.window_ns {
            return None;
        }
        self.pending_since = None;
        Some(std::mem::take(&mut self.coalesced))
    }
}

/// The coordinator's current list view, refreshed from the store's change feed.
#[derive(Debug, Clone)]
pub struct CoordinatorWorkingSet {
    query: RecordQuery,
    default_page_size: u32,
    cursor: u64,
    coalescer: ReloadCoalescer,
    page: RecordPage,
    badges: BadgeCounts,
    reloads: u64,
}

impl CoordinatorWorkingSet {
    pub fn load(
        store: &SiteVisitStore,
        query: RecordQuery,
        default_page_size: u32,
        coalesce_ms: u64,
    ) -> Self {
        let page = query.run(store, default_page_size);
        Self {
            query,
            default_page_size,
            cursor: store.last_change_seq(),
            coalescer: ReloadCoalescer::new(coalesce_ms),
            page,
            badges: BadgeCounts::compute(store.records()),
            reloads: 1,
        }
    }

    pub fn page(&self) -> &RecordPage {
        &self.page
    }

    pub fn badges(&self) -> BadgeCounts {
        self.badges
    }

    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    pub fn set_query(&mut self, store: &SiteVisitStore, query: RecordQuery) {
        self.query = query;
        self.reload(store);
    }

    /// Reads new change-feed entries and arms the coalescer. Returns how many were seen.
    pub fn observe(&mut self, store: &SiteVisitStore, now: WallTimeNs) -> usize {
        let fresh = store.changes_since(self.cursor);
        let n = fresh.len();
        if let Some(last) = fresh.last() {
            self.cursor = last.seq;
            self.coalescer.trigger(now);
        }
        n
    }

    /// Reloads if the coalescing window has passed. Returns true when a reload ran.
    pub fn reload_if_due(&mut self, store: &SiteVisitStore, now: WallTimeNs) -> bool {
        match self.coalescer.take_due(now) {
            Some(folded) => {
                tracing::debug!(folded, "coordinator list reload");
                self.reload(store);
                true
            }
            None => false,
        }
    }

    fn reload(&mut self, store: &SiteVisitStore) {
        self.page = self.query.run(store, self.default_page_size);
        self.badges = BadgeCounts::compute(store.records());
        self.cursor = store.last_change_seq();
        self.reloads = self.reloads.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::tests::{ingest, meta};
    use crate::verification::VerificationRuntime;

    fn t(ms: u64) -> WallTimeNs {
        WallTimeNs::from_ms(ms)
    }

    #[test]
    fn burst_of_triggers_yields_one_reload() {
        let mut c = ReloadCoalescer::new(3_000);
        c.trigger(t(1_000));
        c.trigger(t(1_500));
        c.trigger(t(3_900));
        assert_eq!(c.take_due(t(3_999)), None);
        assert_eq!(c.take_due(t(4_000)), Some(3));
        assert!(!c.is_pending());
        assert_eq!(c.take_due(t(9_000)), None);
    }

    #[test]
    fn working_set_follows_the_change_feed() {
        let rt = VerificationRuntime::default();
        let mut store = SiteVisitStore::new_in_memory();
        let mut ws = CoordinatorWorkingSet::load(&store, RecordQuery::default(), 25, 3_000);
        assert_eq!(ws.page().total, 0);

        for i in 0..5 {
            rt.ingest(
                &mut store,
                &meta(10),
                ingest(&format!("r{i}"), "North Darfur", "Kutum", "Market monitoring", 10),
            )
            .unwrap();
            assert_eq!(ws.observe(&store, t(100 + i)), 1);
        }
        assert!(!ws.reload_if_due(&store, t(2_000)));
        assert!(ws.reload_if_due(&store, t(3_100)));
        assert_eq!(ws.page().total, 5);
        assert_eq!(ws.badges().assigned, 5);
        assert_eq!(ws.reloads(), 2);
        assert_eq!(ws.observe(&store, t(4_000)), 0);
    }
}
