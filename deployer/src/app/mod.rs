//! Application wiring: state, daemon loop and trigger dispatch

pub mod options;
pub mod run;
pub mod state;
pub mod trigger;
