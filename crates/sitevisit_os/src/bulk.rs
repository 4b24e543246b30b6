#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use sitevisit_kernel_contracts::site_visit::{RecordId, SiteVisitRecord, VisitStatus};
use sitevisit_storage::store::SiteVisitStore;

use crate::error::WorkflowError;
use crate::notify::Notification;
use crate::verification::{CommandMeta, VerificationRuntime, VerifyParams};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BulkSelection {
    /// Every record in the locality that is eligible for the command.
    Locality { state: String, locality: String },
    Explicit(Vec<RecordId>),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BulkFailure {
    pub record_id: RecordId,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BulkOutcome {
    pub succeeded_ids: Vec<RecordId>,
    pub failed: Vec<BulkFailure>,
}

impl BulkOutcome {
    pub fn attempted(&self) -> usize {
        self.succeeded_ids.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkCommand {
    ProceedWithoutPermit,
    AttachPermit,
    Verify,
    Approve,
}

impl BulkCommand {
    fn name(self) -> &'static str {
        match self {
            BulkCommand::ProceedWithoutPermit => "proceed_without_permit",
            BulkCommand::AttachPermit => "bulk_attach_permit",
            BulkCommand::Verify => "bulk_verify",
            BulkCommand::Approve => "bulk_approve",
        }
    }

    fn eligible(self, status: VisitStatus) -> bool {
        match self {
            BulkCommand::ProceedWithoutPermit | BulkCommand::AttachPermit => {
                status == VisitStatus::Assigned
            }
            BulkCommand::Verify => status == VisitStatus::PermitsAttached,
            BulkCommand::Approve => status == VisitStatus::Verified,
        }
    }
}

/// Applies one lifecycle command to many records. Records are processed one at a time in
/// (assigned_at, record_id) order; a failure is recorded and the loop moves on.
#[derive(Debug, Default, Clone)]
pub struct BulkRuntime {
    workflow: VerificationRuntime,
}

impl BulkRuntime {
    pub fn new(workflow: VerificationRuntime) -> Self {
        Self { workflow }
    }

    pub fn bulk_attach_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        selection: &BulkSelection,
    ) -> Result<BulkOutcome, WorkflowError> {
        self.run(store, meta, selection, BulkCommand::AttachPermit, |wf, store, meta, id| {
            wf.attach_permit(store, meta, id)
        })
    }

    /// Overrides the locality permit requirement for one locality and attaches permits to its
    /// ASSIGNED records. The override does not reach any other locality, and a missing verified
    /// state permit still blocks the attach step.
    pub fn proceed_without_permit(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        state: &str,
        locality: &str,
    ) -> Result<BulkOutcome, WorkflowError> {
        let selection = BulkSelection::Locality {
            state: state.to_string(),
            locality: locality.to_string(),
        };
        self.run(
            store,
            meta,
            &selection,
            BulkCommand::ProceedWithoutPermit,
            |wf, store, meta, id| {
                wf.proceed_without_permit(store, meta, id)?;
                wf.attach_permit(store, meta, id)
            },
        )
    }

    pub fn bulk_verify(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        selection: &BulkSelection,
        params: &VerifyParams,
    ) -> Result<BulkOutcome, WorkflowError> {
        self.run(store, meta, selection, BulkCommand::Verify, |wf, store, meta, id| {
            wf.verify(store, meta, id, params)
        })
    }

    pub fn bulk_approve(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        selection: &BulkSelection,
        notes: Option<&str>,
    ) -> Result<BulkOutcome, WorkflowError> {
        self.run(store, meta, selection, BulkCommand::Approve, |wf, store, meta, id| {
            wf.approve(store, meta, id, notes)
        })
    }

    fn run<F>(
        &self,
        store: &mut SiteVisitStore,
        meta: &CommandMeta,
        selection: &BulkSelection,
        command: BulkCommand,
        mut apply: F,
    ) -> Result<BulkOutcome, WorkflowError>
    where
        F: FnMut(
            &VerificationRuntime,
            &mut SiteVisitStore,
            &CommandMeta,
            &RecordId,
        ) -> Result<SiteVisitRecord, WorkflowError>,
    {
        let ids = resolve(store, selection, command);
        if ids.is_empty() {
            return Err(WorkflowError::EmptySelection);
        }
        // Per-record versions are unknown to a bulk caller.
        let item_meta = CommandMeta {
            expected_version: None,
            ..meta.clone()
        };

        let mut out = BulkOutcome::default();
        for id in ids {
            match apply(&self.workflow, store, &item_meta, &id) {
                Ok(_) => out.succeeded_ids.push(id),
                Err(err) => {
                    tracing::warn!(
                        command = command.name(),
                        record_id = id.as_str(),
                        error = %err,
                        "bulk item failed"
                    );
                    out.failed.push(BulkFailure {
                        record_id: id,
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            command = command.name(),
            succeeded = out.succeeded_ids.len(),
            failed = out.failed.len(),
            "bulk command finished"
        );
        let summary = format!(
            "{}: {} succeeded, {} failed",
            command.name(),
            out.succeeded_ids.len(),
            out.failed.len()
        );
        self.workflow.notifier().notify(if out.failed.is_empty() {
            Notification::info(None, summary)
        } else {
            Notification::warning(None, summary)
        });
        Ok(out)
    }
}

fn resolve(store: &SiteVisitStore, selection: &BulkSelection, command: BulkCommand) -> Vec<RecordId> {
    match selection {
        BulkSelection::Locality { state, locality } => {
            let mut picked: Vec<&SiteVisitRecord> = store
                .records()
                .filter(|r| r.matches_locality(state.trim(), locality.trim()))
                .filter(|r| command.eligible(r.status))
                .collect();
            picked.sort_by(|a, b| {
                a.assigned_at
                    .cmp(&b.assigned_at)
                    .then_with(|| a.record_id.cmp(&b.record_id))
            });
            picked.into_iter().map(|r| r.record_id.clone()).collect()
        }
        BulkSelection::Explicit(ids) => {
            let mut seen = BTreeSet::new();
            ids.iter()
                .filter(|id| seen.insert((*id).clone()))
                .cloned()
                .collect()
        }
    }
}
