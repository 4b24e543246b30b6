#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::offline_sync::{OfflineItem, OfflineItemKind, SyncCounts};
use sitevisit_kernel_contracts::Validate;

use crate::local_cache::{CacheError, LocalCache};

const ALL_KINDS: [OfflineItemKind; 3] = [
    OfflineItemKind::PendingAction,
    OfflineItemKind::UnsyncedSession,
    OfflineItemKind::UnsyncedPositionSample,
];

/// Items awaiting remote acknowledgement, kept in the durable local cache.
pub struct OfflineQueue;

impl OfflineQueue {
    pub fn enqueue(cache: &mut dyn LocalCache, item: &OfflineItem) -> Result<(), CacheError> {
        item.validate()
            .map_err(|v| CacheError::Encode(v.to_string()))?;
        let body = serde_json::to_string(item).map_err(|e| CacheError::Encode(e.to_string()))?;
        cache.put(&item.cache_key(), body)
    }

    /// Enqueues a batch with one cache write.
    pub fn enqueue_all(cache: &mut dyn LocalCache, items: &[OfflineItem]) -> Result<(), CacheError> {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            item.validate()
                .map_err(|v| CacheError::Encode(v.to_string()))?;
            let body =
                serde_json::to_string(item).map_err(|e| CacheError::Encode(e.to_string()))?;
            entries.push((item.cache_key(), body));
        }
        cache.put_many(entries)
    }

    /// Unacknowledged items of one kind in key order. Unreadable entries are skipped and left
    /// in place for inspection.
    pub fn pending(
        cache: &dyn LocalCache,
        kind: OfflineItemKind,
    ) -> Result<Vec<OfflineItem>, CacheError> {
        let mut out = Vec::new();
        for key in cache.keys_with_prefix(kind.key_prefix())? {
            let Some(raw) = cache.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<OfflineItem>(&raw) {
                Ok(item) => out.push(item),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable offline item"),
            }
        }
        Ok(out)
    }

    pub fn pending_all(cache: &dyn LocalCache) -> Result<Vec<OfflineItem>, CacheError> {
        let mut out = Vec::new();
        for kind in ALL_KINDS {
            out.extend(Self::pending(cache, kind)?);
        }
        Ok(out)
    }

    pub fn counts(cache: &dyn LocalCache) -> Result<SyncCounts, CacheError> {
        let mut counts = SyncCounts::default();
        for kind in ALL_KINDS {
            for _ in cache.keys_with_prefix(kind.key_prefix())? {
                counts.bump(kind);
            }
        }
        Ok(counts)
    }

    pub fn ack(cache: &mut dyn LocalCache, item: &OfflineItem) -> Result<bool, CacheError> {
        cache.remove(&item.cache_key())
    }
}
