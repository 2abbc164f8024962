//! Container runtime capability.
//!
//! The orchestrator never talks to a container engine directly; it consumes
//! the [`ContainerRuntime`] trait. Failures at this boundary are classified
//! as connection-level ([`RuntimeError::Unavailable`]) or semantic
//! ([`RuntimeError::Rejected`]), and the runtime's asynchronous cleanup is
//! absorbed by a bounded retry with backoff.
//!
//! ## Implementations
//!
//! - `docker.rs`: drives the `docker` command-line client

pub mod types;
pub mod docker;

pub use types::{
    ContainerHandle, ContainerSpec, Mount, NetworkHandle, PortBinding, Protocol, ResourceFilter,
    ResourceInfo, ResourceState, LABEL_NETWORK, LABEL_NODE, LABEL_ROLE,
};
pub use docker::DockerCli;

use crate::ip::Subnet;
use crate::settings::RetryPolicy;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Errors reported by, or about, the container runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Container runtime rejected the request: {0}")]
    Rejected(String),
    #[error("Removal of {0} is already in progress")]
    RemovalInProgress(String),
    #[error("No such resource: {0}")]
    NotFound(String),
    #[error("Container {resource} did not reach running state (last state: {state:?})")]
    NotRunning {
        resource: String,
        state: Option<ResourceState>,
    },
    #[error("Cleanup of {resource} did not finish after {attempts} attempts")]
    CleanupTimeout { resource: String, attempts: u32 },
}

impl RuntimeError {
    /// Errors worth retrying at the boundary
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_) | RuntimeError::RemovalInProgress(_))
    }
}

/// Operations the orchestrator needs from a single-host container runtime.
///
/// Calls are blocking.
pub trait ContainerRuntime: Send + Sync {
    fn create_virtual_network(
        &self,
        name: &str,
        subnet: &Subnet,
        labels: &BTreeMap<String, String>,
    ) -> Result<NetworkHandle, RuntimeError>;

    fn remove_virtual_network(&self, handle: &NetworkHandle) -> Result<(), RuntimeError>;

    /// Names of every virtual network the runtime knows about
    fn list_virtual_networks(&self) -> Result<Vec<String>, RuntimeError>;

    /// Create and start a container
    fn create_resource(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    fn start_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    fn stop_resource(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    fn remove_resource(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError>;

    fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<ResourceInfo>, RuntimeError>;

    fn inspect_resource(&self, handle: &ContainerHandle) -> Result<ResourceInfo, RuntimeError>;
}

/// Run `op` until it succeeds, fails permanently, or the policy is spent.
///
/// Transient failures are retried with exponential backoff. When the last
/// failure was a removal still in progress the result is `CleanupTimeout`.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    resource: &str,
    mut op: impl FnMut() -> Result<T, RuntimeError>,
) -> Result<T, RuntimeError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.backoff_for(attempt);
                debug!("Attempt {}/{} on {} failed ({}), retrying in {:?}", attempt, attempts, resource, err, delay);
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(RuntimeError::RemovalInProgress(_)) => {
                warn!("Giving up on {} after {} attempts", resource, attempts);
                return Err(RuntimeError::CleanupTimeout { resource: resource.to_string(), attempts });
            }
            Err(err) => return Err(err),
        }
    }
}

/// Remove a container, treating an already-missing container as removed
pub fn remove_container(
    runtime: &dyn ContainerRuntime,
    policy: &RetryPolicy,
    handle: &ContainerHandle,
) -> Result<(), RuntimeError> {
    match with_retry(policy, &handle.0, || runtime.remove_resource(handle, true)) {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// Remove a virtual network, treating an already-missing network as removed
pub fn remove_network(
    runtime: &dyn ContainerRuntime,
    policy: &RetryPolicy,
    handle: &NetworkHandle,
) -> Result<(), RuntimeError> {
    match with_retry(policy, &handle.0, || runtime.remove_virtual_network(handle)) {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// Poll a container until it reports running.
///
/// `Created` and `Restarting` are waited out within the retry policy; any
/// other non-running state fails immediately.
pub fn wait_until_running(
    runtime: &dyn ContainerRuntime,
    policy: &RetryPolicy,
    handle: &ContainerHandle,
) -> Result<ResourceInfo, RuntimeError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_state = None;
    for attempt in 1..=attempts {
        let info = with_retry(policy, &handle.0, || runtime.inspect_resource(handle))?;
        match info.state {
            ResourceState::Running => return Ok(info),
            state if state.is_transient() => {
                last_state = Some(state);
                if attempt < attempts {
                    std::thread::sleep(policy.backoff_for(attempt));
                }
            }
            state => {
                return Err(RuntimeError::NotRunning { resource: handle.0.clone(), state: Some(state) });
            }
        }
    }
    Err(RuntimeError::NotRunning { resource: handle.0.clone(), state: last_state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = with_retry(&RetryPolicy::immediate(5), "net", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(RuntimeError::Unavailable("daemon restarting".to_string()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_retry_surfaces_cleanup_timeout() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(4), "node-1", || {
            calls.set(calls.get() + 1);
            Err(RuntimeError::RemovalInProgress("node-1".to_string()))
        });
        assert_eq!(calls.get(), 4);
        assert_eq!(
            result,
            Err(RuntimeError::CleanupTimeout { resource: "node-1".to_string(), attempts: 4 })
        );
    }

    #[test]
    fn test_retry_does_not_repeat_rejections() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(5), "node-1", || {
            calls.set(calls.get() + 1);
            Err(RuntimeError::Rejected("name in use".to_string()))
        });
        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RuntimeError::Rejected(_))));
    }

    #[test]
    fn test_unavailable_is_returned_when_exhausted() {
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(2), "x", || {
            Err(RuntimeError::Unavailable("down".to_string()))
        });
        assert!(matches!(result, Err(RuntimeError::Unavailable(_))));
    }
}
