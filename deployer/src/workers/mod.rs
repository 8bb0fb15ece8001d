//! Background workers of the daemon

pub mod monitor;
pub mod reaper;
