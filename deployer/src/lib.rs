//! Deployer library
//!
//! Core modules of the self-hosted deployment orchestrator: the deployment
//! executor and its adapters, persistence, secrets and the daemon workers.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod manage;
pub mod models;
pub mod secrets;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod utils;
pub mod workers;
