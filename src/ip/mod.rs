//! IP address and port allocation module.
//!
//! This module parses the subnets networks are provisioned into and hands
//! out deterministic host addresses and host ports to their nodes.

pub mod subnet;
pub mod allocator;

// Re-export commonly used types
pub use subnet::{Subnet, SubnetError};
pub use allocator::{AddressAllocator, AllocationError};
