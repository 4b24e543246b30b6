#![forbid(unsafe_code)]

pub mod completion_gate;
pub mod geo_math;
pub mod permit_gate;
