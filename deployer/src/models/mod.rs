//! Data models

pub mod deployment;
pub mod log;
pub mod project;
pub mod service;
