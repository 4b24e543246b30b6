#![forbid(unsafe_code)]

pub mod audit;
pub mod local_cache;
pub mod offline_queue;
pub mod store;
