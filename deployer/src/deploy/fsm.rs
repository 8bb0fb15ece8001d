//! Finite State Machine for deployment records

use crate::models::deployment::DeploymentStatus;

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start pulling source
    Clone,

    /// Start loading config and preparing the release
    Build,

    /// Start hooks, config writes, switch and reload
    Deploy,

    /// Start health checks
    Test,

    /// Pipeline finished
    Activate,

    /// Stage failed
    Fail(String),

    /// Another deployment became active
    Supersede,

    /// Replaced by a rollback
    RollBack,

    /// Brought back by a rollback
    Restore,

    /// A rollback record finished its work
    Settle,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::at(DeploymentStatus::Pending)
    }

    /// Resume from a persisted status
    pub fn at(state: DeploymentStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        use DeploymentStatus as S;

        let new_state = match (self.state, &event) {
            (S::Pending, DeploymentEvent::Clone) => S::Cloning,
            (S::Cloning, DeploymentEvent::Build) => S::Building,
            (S::Building, DeploymentEvent::Deploy) => S::Deploying,
            (S::Deploying, DeploymentEvent::Test) => S::Testing,
            (S::Testing, DeploymentEvent::Activate) => S::Active,

            // Any stage may fail
            (state, DeploymentEvent::Fail(err)) if state.is_in_flight() => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::Active, DeploymentEvent::Supersede) => S::Inactive,
            (S::Active, DeploymentEvent::RollBack) => S::RolledBack,
            (S::Inactive, DeploymentEvent::Restore) => S::Active,

            // Rollback records skip straight to deploying and settle there
            (S::Deploying, DeploymentEvent::Settle) => S::Inactive,

            // Invalid transitions
            (state, event) => {
                return Err(format!("{} does not accept {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
