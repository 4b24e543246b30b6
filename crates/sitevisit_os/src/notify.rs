#![forbid(unsafe_code)]

use std::sync::Mutex;

use sitevisit_kernel_contracts::site_visit::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub record_id: Option<RecordId>,
    pub message: String,
}

impl Notification {
    pub fn info(record_id: Option<&RecordId>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            record_id: record_id.cloned(),
            message: message.into(),
        }
    }

    pub fn warning(record_id: Option<&RecordId>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            record_id: record_id.cloned(),
            message: message.into(),
        }
    }

    pub fn error(record_id: Option<&RecordId>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            record_id: record_id.cloned(),
            message: message.into(),
        }
    }
}

/// User-facing message channel. Delivery is best effort and never fails the command.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, n: Notification) {
        let record_id = n.record_id.as_ref().map(|r| r.as_str()).unwrap_or("-");
        match n.level {
            NotificationLevel::Info => tracing::info!(record_id, "{}", n.message),
            NotificationLevel::Warning => tracing::warn!(record_id, "{}", n.message),
            NotificationLevel::Error => tracing::error!(record_id, "{}", n.message),
        }
    }
}

/// Keeps every notification in memory; used by transports that poll for messages.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notification> {
        match self.seen.lock() {
            Ok(mut seen) => std::mem::take(&mut *seen),
            Err(_) => Vec::new(),
        }
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn notify(&self, n: Notification) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(n);
        }
    }
}
