//! Wire models shared by deployer triggers and their callers.

pub mod models;

pub use models::*;
