//! Exchange transaction scripts, wire messages and their errors.

pub mod contract;
pub mod error;
pub mod messages;
