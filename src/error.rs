//! Orchestrator error taxonomy.
//!
//! Every public orchestrator operation returns [`OrchestratorError`]. The
//! variants separate caller-fixable input problems (validation, conflicts,
//! allocation) from runtime failures, and provisioning failures carry both
//! the original cause and everything that went wrong while rolling back.

use crate::config::ValidationError;
use crate::conflict::ConflictSet;
use crate::genesis::GenesisError;
use crate::ip::AllocationError;
use crate::keys::KeyError;
use crate::orchestrator::Phase;
use crate::registry::{NetworkStatus, StoreError};
use crate::runtime::RuntimeError;
use std::fmt;
use std::io;

/// One cleanup step that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    /// What was being removed, e.g. `container dev-boot`
    pub resource: String,
    pub error: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

fn describe_failures(failures: &[RollbackFailure]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        let joined: Vec<String> = failures.iter().map(ToString::to_string).collect();
        format!(" (cleanup failures: {})", joined.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Conflict(ConflictSet),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime rejected the request: {0}")]
    RuntimeRejected(String),

    #[error(
        "Provisioning of network '{network_id}' failed at {stage} after {provisioned} node(s) were created: {cause}{}",
        describe_failures(.rollback_failures)
    )]
    PartialProvisionFailure {
        network_id: String,
        /// The step that failed, e.g. `node rpc-1`
        stage: String,
        provisioned: usize,
        #[source]
        cause: Box<OrchestratorError>,
        rollback_failures: Vec<RollbackFailure>,
    },

    #[error("Cleanup of {resource} did not finish after {attempts} attempts")]
    CleanupTimeout { resource: String, attempts: u32 },

    #[error("Could not {operation} network '{network_id}' cleanly{}", describe_failures(.failures))]
    CleanupIncomplete {
        network_id: String,
        operation: &'static str,
        failures: Vec<RollbackFailure>,
    },

    #[error("Node '{0}' needs the bootstrap node's discovery URL, which is not available")]
    MissingBootstrap(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Node '{node_id}' not found in network '{network_id}'")]
    NodeNotFound { network_id: String, node_id: String },

    #[error("Cannot {operation} network '{network_id}' while it is {status}")]
    InvalidState {
        network_id: String,
        status: NetworkStatus,
        operation: &'static str,
    },

    #[error("Network '{0}' has another operation in progress")]
    Busy(String),

    #[error("Network '{network_id}' cannot move from {from} to {to}")]
    IllegalTransition { network_id: String, from: Phase, to: Phase },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Genesis(#[from] GenesisError),

    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error("Failed to write artifacts: {0}")]
    Artifact(#[from] io::Error),
}

impl OrchestratorError {
    /// Conflicts of a rejected candidate, if that is what this error is
    pub fn conflicts(&self) -> Option<&ConflictSet> {
        match self {
            OrchestratorError::Conflict(set) => Some(set),
            _ => None,
        }
    }
}

impl From<ConflictSet> for OrchestratorError {
    fn from(set: ConflictSet) -> Self {
        OrchestratorError::Conflict(set)
    }
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => OrchestratorError::RuntimeUnavailable(msg),
            RuntimeError::CleanupTimeout { resource, attempts } => {
                OrchestratorError::CleanupTimeout { resource, attempts }
            }
            other @ (RuntimeError::Rejected(_)
            | RuntimeError::RemovalInProgress(_)
            | RuntimeError::NotFound(_)
            | RuntimeError::NotRunning { .. }) => OrchestratorError::RuntimeRejected(other.to_string()),
        }
    }
}
