#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_text};
use crate::{ContractViolation, SchemaVersion, Validate, WallTimeNs};

pub const OFFLINE_SYNC_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OfflineItemKind {
    PendingAction,
    UnsyncedSession,
    UnsyncedPositionSample,
}

impl OfflineItemKind {
    pub fn key_prefix(self) -> &'static str {
        match self {
            OfflineItemKind::PendingAction => "offline/pending_action/",
            OfflineItemKind::UnsyncedSession => "offline/unsynced_session/",
            OfflineItemKind::UnsyncedPositionSample => "offline/position_sample/",
        }
    }
}

/// One locally durable item not yet acknowledged by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineItem {
    pub schema_version: SchemaVersion,
    pub item_id: String,
    pub kind: OfflineItemKind,
    pub created_at: WallTimeNs,
    pub payload_json: String,
}

impl OfflineItem {
    pub fn v1(
        item_id: String,
        kind: OfflineItemKind,
        created_at: WallTimeNs,
        payload_json: String,
    ) -> Result<Self, ContractViolation> {
        let i = Self {
            schema_version: OFFLINE_SYNC_CONTRACT_VERSION,
            item_id,
            kind,
            created_at,
            payload_json,
        };
        i.validate()?;
        Ok(i)
    }

    pub fn cache_key(&self) -> String {
        format!("{}{}", self.kind.key_prefix(), self.item_id)
    }
}

impl Validate for OfflineItem {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != OFFLINE_SYNC_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "offline_item.schema_version",
                reason: "must match OFFLINE_SYNC_CONTRACT_VERSION",
            });
        }
        validate_id("offline_item.item_id", &self.item_id, 128)?;
        validate_text("offline_item.payload_json", &self.payload_json, 64 * 1024)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub pending_actions: u32,
    pub unsynced_sessions: u32,
    pub unsynced_position_samples: u32,
}

impl SyncCounts {
    pub fn total(&self) -> u32 {
        self.pending_actions
            .saturating_add(self.unsynced_sessions)
            .saturating_add(self.unsynced_position_samples)
    }

    pub fn bump(&mut self, kind: OfflineItemKind) {
        let slot = match kind {
            OfflineItemKind::PendingAction => &mut self.pending_actions,
            OfflineItemKind::UnsyncedSession => &mut self.unsynced_sessions,
            OfflineItemKind::UnsyncedPositionSample => &mut self.unsynced_position_samples,
        };
        *slot = slot.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub connectivity: Connectivity,
    pub syncing: bool,
    pub counts: SyncCounts,
    pub counted_at: Option<WallTimeNs>,
    pub last_synced_at: Option<WallTimeNs>,
}
