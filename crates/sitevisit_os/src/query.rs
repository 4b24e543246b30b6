#![forbid(unsafe_code)]

use sitevisit_kernel_contracts::common::same_place;
use sitevisit_kernel_contracts::site_visit::{SiteVisitRecord, VisitStatus};
use sitevisit_storage::store::SiteVisitStore;

use crate::config::PAGE_SIZE_MAX;

/// Coordinator list filter. Text filters compare case-insensitively; `search` matches the site
/// code, site name or record id. Pages are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RecordQuery {
    pub status: Option<VisitStatus>,
    pub hub: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub activity: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecordPage {
    pub items: Vec<SiteVisitRecord>,
    pub total: u32,
    pub page: u32,
    pub page_size: u32,
}

/// Per-status totals shown on the coordinator tabs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BadgeCounts {
    pub assigned: u32,
    pub permits_attached: u32,
    pub verified: u32,
    pub approved: u32,
    pub completed: u32,
    pub rejected: u32,
}

impl BadgeCounts {
    pub fn compute<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a SiteVisitRecord>,
    {
        let mut out = Self::default();
        for r in records {
            let slot = match r.status {
                VisitStatus::Assigned => &mut out.assigned,
                VisitStatus::PermitsAttached => &mut out.permits_attached,
                VisitStatus::Verified => &mut out.verified,
                VisitStatus::Approved => &mut out.approved,
                VisitStatus::Completed => &mut out.completed,
                VisitStatus::Rejected => &mut out.rejected,
            };
            *slot = slot.saturating_add(1);
        }
        out
    }

    pub fn for_status(&self, status: VisitStatus) -> u32 {
        match status {
            VisitStatus::Assigned => self.assigned,
            VisitStatus::PermitsAttached => self.permits_attached,
            VisitStatus::Verified => self.verified,
            VisitStatus::Approved => self.approved,
            VisitStatus::Completed => self.completed,
            VisitStatus::Rejected => self.rejected,
        }
    }
}

impl RecordQuery {
    pub fn matches(&self, r: &SiteVisitRecord) -> bool {
        if let Some(s) = self.status {
            if r.status != s {
                return false;
            }
        }
        let eq = |want: &Option<String>, have: &str| {
            want.as_deref()
                .map(|w| same_place(w, have))
                .unwrap_or(true)
        };
        if !eq(&self.hub, &r.hub_office)
            || !eq(&self.state, &r.state)
            || !eq(&self.locality, &r.locality)
            || !eq(&self.activity, &r.activity)
        {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                r.site_code.to_lowercase().contains(&needle)
                    || r.site_name.to_lowercase().contains(&needle)
                    || r.record_id.as_str().to_lowercase().contains(&needle)
            }
        }
    }

    /// Runs the query against the store, ordering by (assigned_at, record_id).
    pub fn run(&self, store: &SiteVisitStore, default_page_size: u32) -> RecordPage {
        let mut hits: Vec<&SiteVisitRecord> = store.records().filter(|r| self.matches(r)).collect();
        hits.sort_by(|a, b| {
            a.assigned_at
                .cmp(&b.assigned_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        let page_size = self
            .page_size
            .unwrap_or(default_page_size)
            .clamp(1, PAGE_SIZE_MAX);
        let page = self.page.unwrap_or(1).max(1);
        let skip = (page as usize - 1).saturating_mul(page_size as usize);
        RecordPage {
            total: u32::try_from(hits.len()).unwrap_or(u32::MAX),
            items: hits
                .into_iter()
                .skip(skip)
                .take(page_size as usize)
                .cloned()
                .collect(),
            page,
            page_size,
        }
    }
}
