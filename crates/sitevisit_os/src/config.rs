#![forbid(unsafe_code)]

use std::env;

use sitevisit_kernel_contracts::geo::GeoWatchOptions;

pub const PAGE_SIZE_MAX: u32 = 200;

/// Runtime knobs for the collector session loop, the sync monitor and coordinator reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteVisitConfig {
    pub tick_ms: u64,
    pub geo_timeout_ms: u64,
    pub geo_max_age_ms: u64,
    pub sync_poll_ms: u64,
    pub reload_coalesce_ms: u64,
    pub page_size_default: u32,
}

impl SiteVisitConfig {
    pub fn mvp_v1() -> Self {
        Self {
            tick_ms: 1_000,
            geo_timeout_ms: 15_000,
            geo_max_age_ms: 10_000,
            sync_poll_ms: 10_000,
            reload_coalesce_ms: 3_000,
            page_size_default: 25,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Out-of-range or unparsable values fall back to the `mvp_v1` default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::mvp_v1();
        let bounded = |key: &str, lo: u64, hi: u64, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| (lo..=hi).contains(v))
                .unwrap_or(default)
        };
        Self {
            tick_ms: bounded("SITEVISIT_TICK_MS", 100, 10_000, d.tick_ms),
            geo_timeout_ms: bounded("SITEVISIT_GEO_TIMEOUT_MS", 1_000, 120_000, d.geo_timeout_ms),
            geo_max_age_ms: bounded("SITEVISIT_GEO_MAX_AGE_MS", 0, 120_000, d.geo_max_age_ms),
            sync_poll_ms: bounded("SITEVISIT_SYNC_POLL_MS", 1_000, 300_000, d.sync_poll_ms),
            reload_coalesce_ms: bounded(
                "SITEVISIT_RELOAD_COALESCE_MS",
                250,
                30_000,
                d.reload_coalesce_ms,
            ),
            page_size_default: lookup("SITEVISIT_PAGE_SIZE_DEFAULT")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| (1..=PAGE_SIZE_MAX).contains(v))
                .unwrap_or(d.page_size_default),
        }
    }

    pub fn geo_watch_options(&self) -> GeoWatchOptions {
        GeoWatchOptions {
            high_accuracy: true,
            timeout_ms: self.geo_timeout_ms,
            max_age_ms: self.geo_max_age_ms,
        }
    }
}

impl Default for SiteVisitConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}
