//! Deployment pipeline and the adapters it drives

pub mod command;
pub mod config;
pub mod env;
pub mod executor;
pub mod fsm;
pub mod git;
pub mod health;
pub mod hooks;
pub mod ports;
pub mod proxy;
pub mod release;
pub mod runtime;
pub mod supervisor;
