#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sitevisit_kernel_contracts::geo::{
    GeoPoint, GeoWatchErrorKind, GeoWatchOptions, LocationPermission, PositionFix,
};
use sitevisit_kernel_contracts::offline_sync::{Connectivity, OfflineItem, SyncStatusSnapshot};
use sitevisit_kernel_contracts::permit::PermitDemand;
use sitevisit_kernel_contracts::site_visit::{
    ActorId, RecordId, SiteVisitIngest, SiteVisitRecord, VisitStatus, VisitWindow,
};
use sitevisit_kernel_contracts::visit_session::{ActiveVisitSessionSnapshot, CompletionReadiness};
use sitevisit_kernel_contracts::WallTimeNs;
use sitevisit_os::bulk::{BulkOutcome, BulkRuntime, BulkSelection};
use sitevisit_os::clock::{Clock, SystemClock};
use sitevisit_os::config::SiteVisitConfig;
use sitevisit_os::error::WorkflowError;
use sitevisit_os::notify::{
    Notification, NotificationSink, RecordingNotificationSink, TracingNotificationSink,
};
use sitevisit_os::query::{BadgeCounts, RecordPage, RecordQuery};
use sitevisit_os::sync_monitor::{RemoteSyncSink, SyncNowOutcome, SyncPushError, SyncStatusMonitor};
use sitevisit_os::verification::{CommandMeta, VerificationRuntime, VerifyParams};
use sitevisit_os::visit_session::{
    GeolocationProvider, PositionSink, SessionNotice, SharedLocalCache, VisitSessionRepo,
    WatchHandle,
};
use sitevisit_storage::audit::AuditEventRecord;
use sitevisit_storage::local_cache::{FileLocalCache, InMemoryLocalCache};
use sitevisit_storage::store::SiteVisitStore;

/// Transport-neutral failure. `kind` is the stable label from `WorkflowError::kind` or
/// `BAD_REQUEST` for malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterError {
    pub kind: String,
    pub reason: String,
}

impl AdapterError {
    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            kind: "BAD_REQUEST".to_string(),
            reason: reason.into(),
        }
    }

    fn internal(reason: impl Into<String>) -> Self {
        Self {
            kind: "INTERNAL".to_string(),
            reason: reason.into(),
        }
    }
}

impl From<WorkflowError> for AdapterError {
    fn from(e: WorkflowError) -> Self {
        Self {
            kind: e.kind().to_string(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAdapterRequest {
    pub actor: String,
    pub record_id: String,
    pub site_code: String,
    pub site_name: String,
    pub state: String,
    pub locality: String,
    pub hub_office: String,
    pub activity: String,
    pub main_activity: Option<String>,
    pub site_lat: Option<f64>,
    pub site_lon: Option<f64>,
    pub assigned_to: Option<String>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCommandRequest {
    pub actor: String,
    pub record_id: String,
    pub expected_version: Option<u64>,
    pub notes: Option<String>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAdapterRequest {
    pub actor: String,
    pub record_id: String,
    pub expected_date: Option<String>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub notes: Option<String>,
    pub expected_version: Option<u64>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectAdapterRequest {
    pub actor: String,
    pub record_id: String,
    pub reason: String,
    pub expected_version: Option<u64>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalityOverrideRequest {
    pub actor: String,
    pub state: String,
    pub locality: String,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitAdapterRequest {
    pub actor: String,
    pub state: String,
    pub locality: Option<String>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkCommandKind {
    AttachPermit,
    Verify,
    Approve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAdapterRequest {
    pub actor: String,
    pub command: BulkCommandKind,
    pub state: Option<String>,
    pub locality: Option<String>,
    #[serde(default)]
    pub record_ids: Vec<String>,
    pub expected_date: Option<String>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub notes: Option<String>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub record_id: String,
    pub collector: String,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionActionKind {
    AddPhoto,
    SetNotes,
    Pause,
    Resume,
    Complete,
    Abandon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActionRequest {
    pub action: SessionActionKind,
    pub notes: Option<String>,
    pub now_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReportRequest {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub captured_at_ms: Option<u64>,
    pub error: Option<GeoWatchErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordListParams {
    pub status: Option<String>,
    pub hub: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub activity: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCommandResponse {
    pub record: SiteVisitRecord,
    pub badges: BadgeCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAdapterResponse {
    pub outcome: BulkOutcome,
    pub badges: BadgeCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionViewResponse {
    pub session: Option<ActiveVisitSessionSnapshot>,
    pub readiness: Option<CompletionReadiness>,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub records: u32,
    pub session_open: bool,
    pub sync: SyncStatusSnapshot,
}

/// Geolocation provider fed by the device over the transport: the device posts fixes and
/// permission changes, and the open session's watch receives them.
pub struct DeviceBridgeGeolocation {
    permission: Mutex<LocationPermission>,
    sink: Arc<Mutex<Option<PositionSink>>>,
}

impl Default for DeviceBridgeGeolocation {
    fn default() -> Self {
        Self {
            permission: Mutex::new(LocationPermission::Prompt),
            sink: Arc::new(Mutex::new(None)),
        }
    }
}

impl DeviceBridgeGeolocation {
    pub fn set_permission(&self, permission: LocationPermission) {
        if let Ok(mut p) = self.permission.lock() {
            *p = permission;
        }
    }

    /// Returns false when no watch is active.
    pub fn push_fix(&self, fix: PositionFix) -> bool {
        match self.sink.lock() {
            Ok(s) => s.as_ref().map(|s| s.on_fix(fix)).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn push_error(&self, kind: GeoWatchErrorKind) -> bool {
        match self.sink.lock() {
            Ok(s) => s.as_ref().map(|s| s.on_error(kind)).unwrap_or(false),
            Err(_) => false,
        }
    }
}

struct BridgeWatch {
    sink: Arc<Mutex<Option<PositionSink>>>,
}

impl WatchHandle for BridgeWatch {
    fn stop(&mut self) {
        if let Ok(mut s) = self.sink.lock() {
            *s = None;
        }
    }
}

impl GeolocationProvider for DeviceBridgeGeolocation {
    fn permission_status(&self) -> LocationPermission {
        self.permission
            .lock()
            .map(|p| *p)
            .unwrap_or(LocationPermission::Prompt)
    }

    fn watch(
        &self,
        _options: GeoWatchOptions,
        sink: PositionSink,
    ) -> Result<Box<dyn WatchHandle>, GeoWatchErrorKind> {
        let mut slot = self
            .sink
            .lock()
            .map_err(|_| GeoWatchErrorKind::PositionUnavailable)?;
        *slot = Some(sink);
        Ok(Box::new(BridgeWatch {
            sink: self.sink.clone(),
        }))
    }
}

/// Accepts every item. Stands in for the remote store until one is configured.
#[derive(Debug, Default)]
pub struct LoopbackRemoteSink {
    accepted: u64,
}

impl LoopbackRemoteSink {
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl RemoteSyncSink for LoopbackRemoteSink {
    fn push(&mut self, item: &OfflineItem) -> Result<(), SyncPushError> {
        tracing::debug!(item_id = item.item_id.as_str(), kind = ?item.kind, "loopback sync accepted");
        self.accepted = self.accepted.saturating_add(1);
        Ok(())
    }
}

struct AdapterNotificationSink {
    recorded: RecordingNotificationSink,
}

impl NotificationSink for AdapterNotificationSink {
    fn notify(&self, n: Notification) {
        TracingNotificationSink.notify(n.clone());
        self.recorded.notify(n);
    }
}

pub struct AdapterRuntime {
    config: SiteVisitConfig,
    clock: Arc<dyn Clock>,
    store: SiteVisitStore,
    workflow: VerificationRuntime,
    bulk: BulkRuntime,
    notifications: Arc<AdapterNotificationSink>,
    geo: Arc<DeviceBridgeGeolocation>,
    sessions: Arc<Mutex<VisitSessionRepo>>,
    monitor: Arc<Mutex<SyncStatusMonitor>>,
    remote: LoopbackRemoteSink,
}

impl AdapterRuntime {
    pub fn new(
        config: SiteVisitConfig,
        clock: Arc<dyn Clock>,
        cache: SharedLocalCache,
    ) -> Result<Self, String> {
        let notifications = Arc::new(AdapterNotificationSink {
            recorded: RecordingNotificationSink::new(),
        });
        let workflow = VerificationRuntime::new(notifications.clone());
        let geo = Arc::new(DeviceBridgeGeolocation::default());
        let store = SiteVisitStore::new_in_memory();
        let sessions =
            VisitSessionRepo::init(&store, cache.clone(), geo.clone(), config.geo_watch_options())
                .map_err(|e| format!("failed to restore visit session: {e}"))?;
        let mut monitor = SyncStatusMonitor::new(cache, Connectivity::Online);
        monitor
            .recompute(clock.now())
            .map_err(|e| format!("failed to count offline queue: {e}"))?;
        Ok(Self {
            config,
            clock,
            store,
            bulk: BulkRuntime::new(workflow.clone()),
            workflow,
            notifications,
            geo,
            sessions: Arc::new(Mutex::new(sessions)),
            monitor: Arc::new(Mutex::new(monitor)),
            remote: LoopbackRemoteSink::default(),
        })
    }

    pub fn default_from_env() -> Result<Self, String> {
        let config = SiteVisitConfig::from_env();
        let cache: SharedLocalCache = match cache_path_from_env() {
            Some(path) => Arc::new(Mutex::new(FileLocalCache::open(&path).map_err(|e| {
                format!("failed to open device cache '{}': {e}", path.display())
            })?)),
            None => Arc::new(Mutex::new(InMemoryLocalCache::new())),
        };
        Self::new(config, Arc::new(SystemClock), cache)
    }

    pub fn config(&self) -> &SiteVisitConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn session_handle(&self) -> Arc<Mutex<VisitSessionRepo>> {
        self.sessions.clone()
    }

    pub fn monitor_handle(&self) -> Arc<Mutex<SyncStatusMonitor>> {
        self.monitor.clone()
    }

    pub fn store(&self) -> &SiteVisitStore {
        &self.store
    }

    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.notifications.recorded.drain()
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, AdapterError> {
        let sync = lock(&self.monitor)?.snapshot();
        let session_open = lock(&self.sessions)?.is_open();
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            records: u32::try_from(self.store.records().count()).unwrap_or(u32::MAX),
            session_open,
            sync,
        })
    }

    pub fn ingest(&mut self, req: IngestAdapterRequest) -> Result<RecordCommandResponse, AdapterError> {
        let now = self.now(req.now_ms);
        let meta = CommandMeta::new(actor(&req.actor)?, now);
        let site_coordinates = match (req.site_lat, req.site_lon) {
            (Some(lat), Some(lon)) => Some(
                GeoPoint::new(lat, lon).map_err(|e| AdapterError::bad_request(e.to_string()))?,
            ),
            (None, None) => None,
            _ => {
                return Err(AdapterError::bad_request(
                    "site_lat and site_lon must be given together",
                ))
            }
        };
        let assigned_to = match req.assigned_to.as_deref() {
            Some(a) => Some(actor(a)?),
            None => None,
        };
        let input = SiteVisitIngest {
            record_id: record_id(&req.record_id)?,
            site_code: req.site_code,
            site_name: req.site_name,
            state: req.state,
            locality: req.locality,
            hub_office: req.hub_office,
            activity: req.activity,
            main_activity: req.main_activity,
            site_coordinates,
            assigned_to,
            assigned_at: now,
        };
        let record = self.workflow.ingest(&mut self.store, &meta, input)?;
        self.queue_if_offline("ingest", Some(&record.record_id), meta.now);
        Ok(self.with_badges(record))
    }

    pub fn list_records(&self, params: RecordListParams) -> Result<RecordPage, AdapterError> {
        let status = match params.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(parse_status(s)?),
        };
        let query = RecordQuery {
            status,
            hub: params.hub,
            state: params.state,
            locality: params.locality,
            activity: params.activity,
            search: params.search,
            page: params.page,
            page_size: params.page_size,
        };
        Ok(query.run(&self.store, self.config.page_size_default))
    }

    pub fn badges(&self) -> BadgeCounts {
        BadgeCounts::compute(self.store.records())
    }

    pub fn pending_permit_demand(&self) -> PermitDemand {
        self.workflow.pending_demand(&self.store)
    }

    pub fn record_history(&self, id: &str) -> Result<Vec<AuditEventRecord>, AdapterError> {
        let id = record_id(id)?;
        Ok(self
            .store
            .audit_events_for_record(&id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn attach_permit(
        &mut self,
        req: RecordCommandRequest,
    ) -> Result<RecordCommandResponse, AdapterError> {
        let (meta, id) = self.record_command(&req.actor, &req.record_id, req.expected_version, req.now_ms)?;
        let record = self.workflow.attach_permit(&mut self.store, &meta, &id)?;
        self.queue_if_offline("attach_permit", Some(&id), meta.now);
        Ok(self.with_badges(record))
    }

    pub fn proceed_without_permit(
        &mut self,
        req: LocalityOverrideRequest,
    ) -> Result<BulkAdapterResponse, AdapterError> {
        let meta = CommandMeta::new(actor(&req.actor)?, self.now(req.now_ms));
        let outcome =
            self.bulk
                .proceed_without_permit(&mut self.store, &meta, &req.state, &req.locality)?;
        if !outcome.succeeded_ids.is_empty() {
            self.queue_if_offline("proceed_without_permit", None, meta.now);
        }
        Ok(BulkAdapterResponse {
            outcome,
            badges: self.badges(),
        })
    }

    pub fn verify(&mut self, req: VerifyAdapterRequest) -> Result<RecordCommandResponse, AdapterError> {
        let (meta, id) = self.record_command(&req.actor, &req.record_id, req.expected_version, req.now_ms)?;
        let params = verify_params(
            req.expected_date.as_deref(),
            req.window_start.as_deref(),
            req.window_end.as_deref(),
            req.notes,
        )?;
        let record = self.workflow.verify(&mut self.store, &meta, &id, &params)?;
        self.queue_if_offline("verify", Some(&id), meta.now);
        Ok(self.with_badges(record))
    }

    pub fn reject(&mut self, req: RejectAdapterRequest) -> Result<RecordCommandResponse, AdapterError> {
        let (meta, id) = self.record_command(&req.actor, &req.record_id, req.expected_version, req.now_ms)?;
        let record = self
            .workflow
            .reject(&mut self.store, &meta, &id, &req.reason)?;
        self.queue_if_offline("reject", Some(&id), meta.now);
        Ok(self.with_badges(record))
    }

    pub fn approve(&mut self, req: RecordCommandRequest) -> Result<RecordCommandResponse, AdapterError> {
        let (meta, id) = self.record_command(&req.actor, &req.record_id, req.expected_version, req.now_ms)?;
        let record = self
            .workflow
            .approve(&mut self.store, &meta, &id, req.notes.as_deref())?;
        self.queue_if_offline("approve", Some(&id), meta.now);
        Ok(self.with_badges(record))
    }

    pub fn upload_permit(&mut self, req: PermitAdapterRequest) -> Result<PermitDemand, AdapterError> {
        let meta = CommandMeta::new(actor(&req.actor)?, self.now(req.now_ms));
        match req.locality.as_deref() {
            Some(locality) => {
                self.workflow
                    .upload_locality_permit(&mut self.store, &meta, &req.state, locality)?;
            }
            None => {
                self.workflow
                    .upload_state_permit(&mut self.store, &meta, &req.state)?;
            }
        }
        self.queue_if_offline("upload_permit", None, meta.now);
        Ok(self.pending_permit_demand())
    }

    pub fn verify_state_permit(
        &mut self,
        req: PermitAdapterRequest,
    ) -> Result<PermitDemand, AdapterError> {
        let meta = CommandMeta::new(actor(&req.actor)?, self.now(req.now_ms));
        self.workflow
            .verify_state_permit(&mut self.store, &meta, &req.state)?;
        self.queue_if_offline("verify_state_permit", None, meta.now);
        Ok(self.pending_permit_demand())
    }

    pub fn bulk(&mut self, req: BulkAdapterRequest) -> Result<BulkAdapterResponse, AdapterError> {
        let meta = CommandMeta::new(actor(&req.actor)?, self.now(req.now_ms));
        let selection = if req.record_ids.is_empty() {
            match (req.state, req.locality) {
                (Some(state), Some(locality)) => BulkSelection::Locality { state, locality },
                _ => {
                    return Err(AdapterError::bad_request(
                        "bulk needs record_ids or both state and locality",
                    ))
                }
            }
        } else {
            BulkSelection::Explicit(
                req.record_ids
                    .iter()
                    .map(|r| record_id(r))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        let action = match req.command {
            BulkCommandKind::AttachPermit => "bulk_attach_permit",
            BulkCommandKind::Verify => "bulk_verify",
            BulkCommandKind::Approve => "bulk_approve",
        };
        let outcome = match req.command {
            BulkCommandKind::AttachPermit => {
                self.bulk
                    .bulk_attach_permit(&mut self.store, &meta, &selection)?
            }
            BulkCommandKind::Verify => {
                let params = verify_params(
                    req.expected_date.as_deref(),
                    req.window_start.as_deref(),
                    req.window_end.as_deref(),
                    req.notes,
                )?;
                self.bulk
                    .bulk_verify(&mut self.store, &meta, &selection, &params)?
            }
            BulkCommandKind::Approve => {
                self.bulk
                    .bulk_approve(&mut self.store, &meta, &selection, req.notes.as_deref())?
            }
        };
        if !outcome.succeeded_ids.is_empty() {
            self.queue_if_offline(action, None, meta.now);
        }
        Ok(BulkAdapterResponse {
            outcome,
            badges: self.badges(),
        })
    }

    pub fn open_session(&mut self, req: OpenSessionRequest) -> Result<SessionViewResponse, AdapterError> {
        let now = self.now(req.now_ms);
        let id = record_id(&req.record_id)?;
        let collector = actor(&req.collector)?;
        let mut sessions = lock(&self.sessions)?;
        let opened = sessions.open(&self.store, &id, &collector, now)?;
        if let Some(notice) = opened.notice {
            self.notifications
                .notify(Notification::warning(Some(&id), notice.message()));
        }
        let readiness = sessions.readiness(now)?;
        Ok(SessionViewResponse {
            session: Some(opened.snapshot),
            readiness: Some(readiness),
            notice: opened.notice.map(|n| n.message().to_string()),
        })
    }

    pub fn session_view(&self, now_ms: Option<u64>) -> Result<SessionViewResponse, AdapterError> {
        let now = self.now(now_ms);
        let mut sessions = lock(&self.sessions)?;
        if !sessions.is_open() {
            return Ok(SessionViewResponse {
                session: None,
                readiness: None,
                notice: None,
            });
        }
        let readiness = sessions.readiness(now)?;
        let session = sessions.snapshot().cloned();
        let notice = session
            .as_ref()
            .filter(|s| s.permission_denied)
            .map(|_| SessionNotice::LocationPermissionDenied.message().to_string());
        Ok(SessionViewResponse {
            session,
            readiness: Some(readiness),
            notice,
        })
    }

    pub fn session_action(
        &mut self,
        req: SessionActionRequest,
    ) -> Result<SessionViewResponse, AdapterError> {
        let now = self.now(req.now_ms);
        {
            let mut sessions = lock(&self.sessions)?;
            match req.action {
                SessionActionKind::AddPhoto => {
                    sessions.add_photo(now)?;
                }
                SessionActionKind::SetNotes => {
                    sessions.set_notes(req.notes.unwrap_or_default(), now)?;
                }
                SessionActionKind::Pause => sessions.pause(now)?,
                SessionActionKind::Resume => sessions.resume(now)?,
                SessionActionKind::Complete => {
                    sessions.attempt_complete(&mut self.store, &self.workflow, now)?;
                }
                SessionActionKind::Abandon => sessions.abandon(now)?,
            }
        }
        self.session_view(req.now_ms)
    }

    pub fn report_position(&mut self, req: PositionReportRequest) -> Result<SessionViewResponse, AdapterError> {
        let delivered = match (req.error, req.lat, req.lon) {
            (Some(kind), _, _) => {
                if kind == GeoWatchErrorKind::PermissionDenied {
                    self.geo.set_permission(LocationPermission::Denied);
                }
                self.geo.push_error(kind)
            }
            (None, Some(lat), Some(lon)) => {
                let point =
                    GeoPoint::new(lat, lon).map_err(|e| AdapterError::bad_request(e.to_string()))?;
                let captured_at = self.now(req.captured_at_ms);
                let fix = PositionFix::v1(point, req.accuracy_m.unwrap_or(0.0), captured_at)
                    .map_err(|e| AdapterError::bad_request(e.to_string()))?;
                self.geo.set_permission(LocationPermission::Granted);
                self.geo.push_fix(fix)
            }
            _ => {
                return Err(AdapterError::bad_request(
                    "position report needs lat and lon, or an error",
                ))
            }
        };
        if !delivered {
            tracing::debug!("position report arrived with no active watch");
        }
        self.session_view(None)
    }

    pub fn set_location_permission(&self, permission: LocationPermission) {
        self.geo.set_permission(permission);
    }

    pub fn set_connectivity(&self, online: bool) -> Result<SyncStatusSnapshot, AdapterError> {
        let mut m = lock(&self.monitor)?;
        m.set_connectivity(if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        });
        Ok(m.snapshot())
    }

    pub fn sync_status(&self) -> Result<SyncStatusSnapshot, AdapterError> {
        Ok(lock(&self.monitor)?.snapshot())
    }

    pub fn sync_now(&mut self, now_ms: Option<u64>) -> Result<SyncNowOutcome, AdapterError> {
        let now = self.now(now_ms);
        let mut m = lock(&self.monitor)?;
        m.sync_now(&mut self.remote, now)
            .map_err(|e| AdapterError::from(WorkflowError::Cache(e)))
    }

    fn record_command(
        &self,
        actor_id: &str,
        id: &str,
        expected_version: Option<u64>,
        now_ms: Option<u64>,
    ) -> Result<(CommandMeta, RecordId), AdapterError> {
        let mut meta = CommandMeta::new(actor(actor_id)?, self.now(now_ms));
        meta.expected_version = expected_version;
        Ok((meta, record_id(id)?))
    }

    /// Best effort: a failed enqueue is logged and the committed command still succeeds.
    fn queue_if_offline(&self, action: &str, record_id: Option<&RecordId>, now: WallTimeNs) {
        let result = lock(&self.monitor).and_then(|mut m| {
            m.record_pending_action(action, record_id, now)
                .map_err(|e| AdapterError::from(WorkflowError::Cache(e)))
        });
        if let Err(err) = result {
            tracing::warn!(action, reason = err.reason.as_str(), "offline action not queued");
        }
    }

    fn with_badges(&self, record: SiteVisitRecord) -> RecordCommandResponse {
        RecordCommandResponse {
            record,
            badges: self.badges(),
        }
    }

    fn now(&self, now_ms: Option<u64>) -> WallTimeNs {
        now_ms
            .filter(|ms| *ms > 0)
            .map(WallTimeNs::from_ms)
            .unwrap_or_else(|| self.clock.now())
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, AdapterError> {
    m.lock()
        .map_err(|_| AdapterError::internal("adapter state lock poisoned"))
}

fn actor(s: &str) -> Result<ActorId, AdapterError> {
    ActorId::new(s.trim()).map_err(|e| AdapterError::bad_request(e.to_string()))
}

fn record_id(s: &str) -> Result<RecordId, AdapterError> {
    RecordId::new(s.trim()).map_err(|e| AdapterError::bad_request(e.to_string()))
}

fn parse_date(field: &str, s: &str) -> Result<NaiveDate, AdapterError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| AdapterError::bad_request(format!("{field} must be YYYY-MM-DD")))
}

fn parse_status(s: &str) -> Result<VisitStatus, AdapterError> {
    VisitStatus::ALL
        .into_iter()
        .find(|v| v.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| AdapterError::bad_request(format!("unknown status '{s}'")))
}

fn verify_params(
    expected_date: Option<&str>,
    window_start: Option<&str>,
    window_end: Option<&str>,
    notes: Option<String>,
) -> Result<VerifyParams, AdapterError> {
    let expected_date = expected_date
        .map(|d| parse_date("expected_date", d))
        .transpose()?;
    // Window order is checked by the workflow so an inverted window surfaces as a validation
    // error rather than a transport error.
    let expected_window = match (window_start, window_end) {
        (Some(s), Some(e)) => Some(VisitWindow {
            start: parse_date("window_start", s)?,
            end: parse_date("window_end", e)?,
        }),
        (None, None) => None,
        _ => {
            return Err(AdapterError::bad_request(
                "window_start and window_end must be given together",
            ))
        }
    };
    Ok(VerifyParams {
        expected_date,
        expected_window,
        notes,
    })
}

fn cache_path_from_env() -> Option<PathBuf> {
    env::var("SITEVISIT_CACHE_PATH")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
