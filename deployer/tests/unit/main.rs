//! Integration tests driving the deployer against fake adapters

mod common;
mod test_executor;
mod test_rollback;
mod test_workers;
