#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use sitevisit_engines::completion_gate;
use sitevisit_kernel_contracts::geo::{
    GeoPoint, GeoWatchErrorKind, GeoWatchOptions, LocationPermission, PositionFix,
};
use sitevisit_kernel_contracts::offline_sync::{OfflineItem, OfflineItemKind};
use sitevisit_kernel_contracts::site_visit::{
    ActorId, CompletionStamp, RecordId, SiteVisitRecord, VisitStatus,
};
use sitevisit_kernel_contracts::visit_session::{
    ActiveVisitSessionSnapshot, CompletionReadiness, SessionStatus, VISIT_SESSION_NOTES_MAX_LEN,
};
use sitevisit_kernel_contracts::common::validate_optional_text;
use sitevisit_kernel_contracts::{ContractViolation, Validate, WallTimeNs};
use sitevisit_storage::local_cache::{CacheError, LocalCache};
use sitevisit_storage::offline_queue::OfflineQueue;
use sitevisit_storage::store::{SiteVisitStore, StorageError};
use tokio::sync::mpsc;

use crate::error::WorkflowError;
use crate::notify::Notification;
use crate::verification::{CommandMeta, VerificationRuntime};

pub const ACTIVE_SESSION_CACHE_KEY: &str = "active_visit_session";

/// Device-local cache shared by the session repository and the sync monitor.
pub type SharedLocalCache = Arc<Mutex<dyn LocalCache>>;

pub(crate) fn lock_cache(cache: &SharedLocalCache) -> Result<MutexGuard<'_, dyn LocalCache + 'static>, CacheError> {
    cache
        .lock()
        .map_err(|_| CacheError::Io("local cache lock poisoned".to_string()))
}

/// One change to the open session. Every source (geolocation callbacks, the ticker, user
/// commands) goes through the same queue and is applied in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    PositionFix(PositionFix),
    PositionError(GeoWatchErrorKind),
    Tick,
    AddPhoto,
    SetNotes(String),
    Pause,
    Resume,
}

/// Handed to a geolocation provider so its callbacks land on the session's update queue.
#[derive(Debug, Clone)]
pub struct PositionSink {
    tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl PositionSink {
    /// Returns false once the session has been torn down.
    pub fn on_fix(&self, fix: PositionFix) -> bool {
        self.tx.send(SessionUpdate::PositionFix(fix)).is_ok()
    }

    pub fn on_error(&self, kind: GeoWatchErrorKind) -> bool {
        self.tx.send(SessionUpdate::PositionError(kind)).is_ok()
    }
}

pub trait WatchHandle: Send {
    fn stop(&mut self);
}

pub trait GeolocationProvider: Send + Sync {
    fn permission_status(&self) -> LocationPermission;

    fn watch(
        &self,
        options: GeoWatchOptions,
        sink: PositionSink,
    ) -> Result<Box<dyn WatchHandle>, GeoWatchErrorKind>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionNotice {
    LocationPermissionDenied,
    LocationUnavailable,
}

impl SessionNotice {
    pub fn message(self) -> &'static str {
        match self {
            SessionNotice::LocationPermissionDenied => {
                "Location access is denied. Enable location permission for this app to complete the visit."
            }
            SessionNotice::LocationUnavailable => {
                "Location is currently unavailable. Move to open sky; the visit stays open."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOpened {
    pub snapshot: ActiveVisitSessionSnapshot,
    pub notice: Option<SessionNotice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
enum SessionLogOutcome {
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SessionLogEntry {
    snapshot: ActiveVisitSessionSnapshot,
    outcome: SessionLogOutcome,
    closed_at: WallTimeNs,
}

struct OpenSession {
    snapshot: ActiveVisitSessionSnapshot,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SessionUpdate>,
    watch: Option<Box<dyn WatchHandle>>,
}

impl OpenSession {
    fn new(snapshot: ActiveVisitSessionSnapshot) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            snapshot,
            updates_tx,
            updates_rx,
            watch: None,
        }
    }

    fn stop_watch(&mut self) {
        if let Some(mut w) = self.watch.take() {
            w.stop();
        }
    }
}

/// Collector-side owner of the single active visit session.
///
/// The snapshot is written to the local cache after every persistent change, so a restart
/// resumes the same session. Completion is the only path that moves a record to COMPLETED.
pub struct VisitSessionRepo {
    cache: SharedLocalCache,
    geo: Arc<dyn GeolocationProvider>,
    watch_options: GeoWatchOptions,
    open: Option<OpenSession>,
}

impl std::fmt::Debug for VisitSessionRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitSessionRepo")
            .field("watch_options", &self.watch_options)
            .field("open", &self.open.as_ref().map(|o| &o.snapshot))
            .finish_non_exhaustive()
    }
}

impl VisitSessionRepo {
    /// Restores a cached session if one exists. A snapshot that no longer decodes or validates,
    /// or whose record can no longer be visited, is discarded.
    pub fn init(
        store: &SiteVisitStore,
        cache: SharedLocalCache,
        geo: Arc<dyn GeolocationProvider>,
        watch_options: GeoWatchOptions,
    ) -> Result<Self, WorkflowError> {
        watch_options.validate()?;
        let restored = {
            let mut c = lock_cache(&cache)?;
            match c.get(ACTIVE_SESSION_CACHE_KEY)? {
                None => None,
                Some(raw) => match decode_snapshot(&raw).and_then(|s| restorable(store, s)) {
                    Ok(s) => Some(s),
                    Err(reason) => {
                        tracing::warn!(reason, "discarding cached visit session");
                        if let Err(err) = c.remove(ACTIVE_SESSION_CACHE_KEY) {
                            tracing::warn!(error = %err, "cached visit session not removed");
                        }
                        None
                    }
                },
            }
        };

        let mut repo = Self {
            cache,
            geo,
            watch_options,
            open: None,
        };
        if let Some(snapshot) = restored {
            tracing::info!(
                record_id = snapshot.record_id.as_str(),
                status = ?snapshot.status,
                "visit session restored"
            );
            let mut open = OpenSession::new(snapshot);
            repo.start_location(&mut open);
            repo.open = Some(open);
            repo.persist()?;
        }
        Ok(repo)
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn snapshot(&self) -> Option<&ActiveVisitSessionSnapshot> {
        self.open.as_ref().map(|o| &o.snapshot)
    }

    pub fn cache(&self) -> &SharedLocalCache {
        &self.cache
    }

    /// Sender for producers outside the repository, such as the tick task.
    pub fn update_sender(&self) -> Option<mpsc::UnboundedSender<SessionUpdate>> {
        self.open.as_ref().map(|o| o.updates_tx.clone())
    }

    pub fn open(
        &mut self,
        store: &SiteVisitStore,
        record_id: &RecordId,
        collector: &ActorId,
        now: WallTimeNs,
    ) -> Result<SessionOpened, WorkflowError> {
        if let Some(o) = &self.open {
            return Err(WorkflowError::SessionAlreadyOpen {
                record_id: o.snapshot.record_id.as_str().to_string(),
            });
        }
        let record = store.record(record_id).ok_or_else(|| {
            WorkflowError::Store(StorageError::NotFound {
                table: "site_visits.record_id",
                key: record_id.as_str().to_string(),
            })
        })?;
        check_openable(record, collector)?;

        let snapshot = ActiveVisitSessionSnapshot::v1(
            record_id.clone(),
            collector.clone(),
            now,
            record.site_coordinates,
        )?;
        let mut open = OpenSession::new(snapshot);
        let notice = self.start_location(&mut open);
        self.open = Some(open);
        self.persist()?;
        tracing::info!(
            record_id = record_id.as_str(),
            collector = collector.as_str(),
            "visit session opened"
        );

        let snapshot = self.require_open()?.snapshot.clone();
        Ok(SessionOpened { snapshot, notice })
    }

    pub fn enqueue(&self, update: SessionUpdate) -> Result<(), WorkflowError> {
        let o = self.open.as_ref().ok_or(WorkflowError::NoOpenSession)?;
        if o.updates_tx.send(update).is_err() {
            tracing::warn!(
                record_id = o.snapshot.record_id.as_str(),
                "session update queue closed; update dropped"
            );
        }
        Ok(())
    }

    /// Applies every queued update in order and persists once if anything durable changed.
    /// Returns the number of updates applied.
    pub fn pump(&mut self, now: WallTimeNs) -> Result<usize, WorkflowError> {
        let max_age_ns = self.watch_options.max_age_ms.saturating_mul(1_000_000);
        let Some(o) = self.open.as_mut() else {
            return Ok(0);
        };
        let mut applied = 0usize;
        let mut dirty = false;
        let mut samples = Vec::new();
        while let Ok(update) = o.updates_rx.try_recv() {
            applied += 1;
            match apply_update(&mut o.snapshot, update, now, max_age_ns) {
                Applied::Ignored => {}
                Applied::Transient => {}
                Applied::Durable => dirty = true,
                Applied::Fix(fix) => {
                    dirty = true;
                    samples.push(fix);
                }
            }
        }
        if !samples.is_empty() {
            let record_id = o.snapshot.record_id.clone();
            self.enqueue_samples(&record_id, &samples)?;
        }
        if dirty {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn add_photo(&mut self, now: WallTimeNs) -> Result<u32, WorkflowError> {
        self.enqueue(SessionUpdate::AddPhoto)?;
        self.pump(now)?;
        Ok(self.require_open()?.snapshot.photo_count)
    }

    pub fn set_notes(&mut self, notes: String, now: WallTimeNs) -> Result<(), WorkflowError> {
        validate_optional_text(
            "visit_session.notes",
            Some(notes.as_str()),
            VISIT_SESSION_NOTES_MAX_LEN,
        )?;
        self.enqueue(SessionUpdate::SetNotes(notes))?;
        self.pump(now)?;
        Ok(())
    }

    pub fn pause(&mut self, now: WallTimeNs) -> Result<(), WorkflowError> {
        self.enqueue(SessionUpdate::Pause)?;
        self.pump(now)?;
        Ok(())
    }

    pub fn resume(&mut self, now: WallTimeNs) -> Result<(), WorkflowError> {
        self.enqueue(SessionUpdate::Resume)?;
        self.pump(now)?;
        Ok(())
    }

    pub fn readiness(&mut self, now: WallTimeNs) -> Result<CompletionReadiness, WorkflowError> {
        self.pump(now)?;
        let o = self.require_open()?;
        Ok(readiness_of(&o.snapshot))
    }

    /// Runs the completion gate and, when it passes, moves the record to COMPLETED and tears the
    /// session down. A blocked attempt changes nothing.
    pub fn attempt_complete(
        &mut self,
        store: &mut SiteVisitStore,
        workflow: &VerificationRuntime,
        now: WallTimeNs,
    ) -> Result<SiteVisitRecord, WorkflowError> {
        self.pump(now)?;
        let o = self.require_open()?;
        let readiness = readiness_of(&o.snapshot);
        if let Some(blocked) = readiness.blocked {
            tracing::info!(
                record_id = o.snapshot.record_id.as_str(),
                reason = %blocked,
                "visit completion blocked"
            );
            workflow
                .notifier()
                .notify(Notification::warning(Some(&o.snapshot.record_id), blocked.to_string()));
            return Err(WorkflowError::CompletionBlocked(blocked));
        }
        let (Some(distance_m), Some(fix)) = (readiness.distance_m, o.snapshot.current_fix) else {
            return Err(WorkflowError::Validation(ContractViolation::InvalidValue {
                field: "visit_session.current_fix",
                reason: "ready session must carry a position",
            }));
        };

        let snapshot = o.snapshot.clone();
        let stamp = CompletionStamp {
            collector: snapshot.collector_id.clone(),
            at: now,
            photo_count: snapshot.photo_count,
            distance_m,
            final_position: fix.point,
            notes: if snapshot.notes.trim().is_empty() {
                None
            } else {
                Some(snapshot.notes.clone())
            },
        };
        let meta = CommandMeta::new(snapshot.collector_id.clone(), now);
        let record = workflow.complete(store, &meta, &snapshot.record_id, stamp)?;
        // Record is already COMPLETED here; teardown errors are logged only.
        if let Err(err) = self.close(SessionLogOutcome::Completed, now) {
            tracing::warn!(
                record_id = snapshot.record_id.as_str(),
                error = %err,
                "visit completed but session teardown failed"
            );
        }
        Ok(record)
    }

    /// Discards the open session without touching the record.
    pub fn abandon(&mut self, now: WallTimeNs) -> Result<(), WorkflowError> {
        self.pump(now)?;
        self.require_open()?;
        self.close(SessionLogOutcome::Abandoned, now)
    }

    fn close(&mut self, outcome: SessionLogOutcome, now: WallTimeNs) -> Result<(), WorkflowError> {
        let Some(mut o) = self.open.take() else {
            return Err(WorkflowError::NoOpenSession);
        };
        o.stop_watch();
        let mut snapshot = o.snapshot;
        snapshot.displayed_elapsed_ms = snapshot.elapsed_ms(now);
        let record_id = snapshot.record_id.clone();
        let entry = SessionLogEntry {
            snapshot,
            outcome,
            closed_at: now,
        };
        let payload = serde_json::to_string(&entry)
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        let item = OfflineItem::v1(
            format!("{}-{}", record_id.as_str(), now.0),
            OfflineItemKind::UnsyncedSession,
            now,
            payload,
        )?;
        let mut c = lock_cache(&self.cache)?;
        let queued = OfflineQueue::enqueue(&mut *c, &item);
        if let Err(err) = c.remove(ACTIVE_SESSION_CACHE_KEY) {
            tracing::warn!(
                record_id = record_id.as_str(),
                error = %err,
                "cached visit session not removed; it is dropped on next restore"
            );
        }
        queued?;
        tracing::info!(record_id = record_id.as_str(), outcome = ?outcome, "visit session closed");
        Ok(())
    }

    fn start_location(&self, open: &mut OpenSession) -> Option<SessionNotice> {
        if self.geo.permission_status() == LocationPermission::Denied {
            open.snapshot.gps_active = false;
            open.snapshot.permission_denied = true;
            tracing::warn!(
                record_id = open.snapshot.record_id.as_str(),
                "location permission denied; session open in degraded mode"
            );
            return Some(SessionNotice::LocationPermissionDenied);
        }
        open.snapshot.permission_denied = false;
        let sink = PositionSink {
            tx: open.updates_tx.clone(),
        };
        match self.geo.watch(self.watch_options, sink) {
            Ok(handle) => {
                open.watch = Some(handle);
                open.snapshot.gps_active = true;
                None
            }
            Err(kind) => {
                open.snapshot.gps_active = false;
                tracing::warn!(
                    record_id = open.snapshot.record_id.as_str(),
                    error = ?kind,
                    "location watch failed to start"
                );
                if kind == GeoWatchErrorKind::PermissionDenied {
                    open.snapshot.permission_denied = true;
                    Some(SessionNotice::LocationPermissionDenied)
                } else {
                    Some(SessionNotice::LocationUnavailable)
                }
            }
        }
    }

    fn enqueue_samples(&self, record_id: &RecordId, fixes: &[PositionFix]) -> Result<(), WorkflowError> {
        let mut items = Vec::with_capacity(fixes.len());
        for fix in fixes {
            let payload = serde_json::json!({
                "record_id": record_id.as_str(),
                "fix": fix,
            })
            .to_string();
            let item = OfflineItem::v1(
                format!("{}-{}", record_id.as_str(), fix.captured_at.0),
                OfflineItemKind::UnsyncedPositionSample,
                fix.captured_at,
                payload,
            )?;
            items.push(item);
        }
        let mut c = lock_cache(&self.cache)?;
        OfflineQueue::enqueue_all(&mut *c, &items)?;
        Ok(())
    }

    fn persist(&self) -> Result<(), WorkflowError> {
        let Some(o) = &self.open else {
            return Ok(());
        };
        let raw = serde_json::to_string(&o.snapshot)
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        lock_cache(&self.cache)?.put(ACTIVE_SESSION_CACHE_KEY, raw)?;
        Ok(())
    }

    fn require_open(&self) -> Result<&OpenSession, WorkflowError> {
        self.open.as_ref().ok_or(WorkflowError::NoOpenSession)
    }
}

impl Drop for VisitSessionRepo {
    fn drop(&mut self) {
        if let Some(o) = self.open.as_mut() {
            o.stop_watch();
        }
    }
}

fn check_openable(record: &SiteVisitRecord, collector: &ActorId) -> Result<(), WorkflowError> {
    if record.status != VisitStatus::Approved {
        return Err(WorkflowError::InvalidTransition {
            record_id: record.record_id.as_str().to_string(),
            command: "open_session",
            from: record.status,
        });
    }
    if let Some(assignee) = &record.assigned_to {
        if assignee != collector {
            return Err(WorkflowError::Validation(ContractViolation::InvalidValue {
                field: "visit_session.collector_id",
                reason: "record is assigned to another collector",
            }));
        }
    }
    Ok(())
}

fn decode_snapshot(raw: &str) -> Result<ActiveVisitSessionSnapshot, &'static str> {
    let snapshot: ActiveVisitSessionSnapshot =
        serde_json::from_str(raw).map_err(|_| "snapshot does not decode")?;
    snapshot
        .validate()
        .map_err(|_| "snapshot fails validation")?;
    Ok(snapshot)
}

fn restorable(
    store: &SiteVisitStore,
    snapshot: ActiveVisitSessionSnapshot,
) -> Result<ActiveVisitSessionSnapshot, &'static str> {
    let record = store
        .record(&snapshot.record_id)
        .ok_or("record no longer exists")?;
    check_openable(record, &snapshot.collector_id).map_err(|_| "record is not open for a visit")?;
    Ok(snapshot)
}

fn readiness_of(s: &ActiveVisitSessionSnapshot) -> CompletionReadiness {
    let current: Option<GeoPoint> = s.current_fix.map(|f| f.point);
    completion_gate::evaluate(s.photo_count, current, s.target)
}

enum Applied {
    Ignored,
    Transient,
    Durable,
    Fix(PositionFix),
}

/// Pure merge of one update into the snapshot.
fn apply_update(
    s: &mut ActiveVisitSessionSnapshot,
    update: SessionUpdate,
    now: WallTimeNs,
    max_age_ns: u64,
) -> Applied {
    match update {
        SessionUpdate::PositionFix(fix) => {
            if fix.validate().is_err() {
                return Applied::Ignored;
            }
            if now.saturating_since(fix.captured_at) > max_age_ns {
                tracing::debug!(
                    record_id = s.record_id.as_str(),
                    captured_at = fix.captured_at.0,
                    "stale position fix dropped"
                );
                return Applied::Ignored;
            }
            s.current_fix = Some(fix);
            s.gps_active = true;
            Applied::Fix(fix)
        }
        SessionUpdate::PositionError(kind) => {
            s.gps_active = false;
            if kind == GeoWatchErrorKind::PermissionDenied {
                s.permission_denied = true;
            }
            Applied::Durable
        }
        SessionUpdate::Tick => {
            if s.status == SessionStatus::Active {
                s.displayed_elapsed_ms = s.elapsed_ms(now);
            }
            Applied::Transient
        }
        SessionUpdate::AddPhoto => {
            s.photo_count = s.photo_count.saturating_add(1);
            Applied::Durable
        }
        SessionUpdate::SetNotes(notes) => {
            s.notes = notes;
            Applied::Durable
        }
        SessionUpdate::Pause => {
            if s.status != SessionStatus::Active {
                return Applied::Ignored;
            }
            s.displayed_elapsed_ms = s.elapsed_ms(now);
            s.status = SessionStatus::Paused;
            s.paused_at = Some(now);
            Applied::Durable
        }
        SessionUpdate::Resume => {
            let Some(paused_at) = s.paused_at else {
                return Applied::Ignored;
            };
            s.paused_total_ns = s
                .paused_total_ns
                .saturating_add(now.saturating_since(paused_at));
            s.paused_at = None;
            s.status = SessionStatus::Active;
            s.displayed_elapsed_ms = s.elapsed_ms(now);
            Applied::Durable
        }
    }
}
