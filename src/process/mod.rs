//! Node process configuration module.
//!
//! This module decides how each node's client process is started: which
//! capabilities its role grants, which arguments and init steps its
//! container runs, and which artifacts are mounted into it.

pub mod types;
pub mod artifacts;
pub mod provisioner;

// Re-export commonly used items for convenience
pub use types::{role_profile, RoleProfile};
pub use artifacts::ArtifactLayout;
pub use provisioner::{NodeProvisioner, INIT_MARKER_FILE};
