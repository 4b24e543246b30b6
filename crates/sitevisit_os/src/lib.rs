#![forbid(unsafe_code)]

pub mod bulk;
pub mod clock;
pub mod config;
pub mod error;
pub mod notify;
pub mod query;
pub mod reload;
pub mod session_tasks;
pub mod sync_monitor;
pub mod verification;
pub mod visit_session;
