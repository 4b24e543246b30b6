#![forbid(unsafe_code)]

pub mod common;
pub mod geo;
pub mod offline_sync;
pub mod permit;
pub mod site_visit;
pub mod visit_session;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, Validate, WallTimeNs};
