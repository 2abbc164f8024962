//! Role profiles.
//!
//! Maps each node role to the capabilities its client process is started
//! with. The match is exhaustive so a new role cannot be added without
//! deciding its profile.

use crate::config::Role;

/// APIs every node exposes
pub const BASE_APIS: &[&str] = &["eth", "net", "web3"];

/// Client capabilities granted to a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleProfile {
    /// JSON-RPC namespaces exposed over HTTP
    pub apis: &'static [&'static str],
    /// Seal blocks with the node's account
    pub mines: bool,
    /// Relax CORS and virtual-host checks on the RPC endpoint
    pub public_rpc: bool,
}

impl RoleProfile {
    /// The allow-list in the comma-separated form the client expects
    pub fn api_list(&self) -> String {
        self.apis.join(",")
    }
}

pub fn role_profile(role: Role) -> RoleProfile {
    match role {
        Role::Bootnode => RoleProfile {
            apis: &["admin", "eth", "net", "web3"],
            mines: false,
            public_rpc: false,
        },
        Role::Validator => RoleProfile {
            apis: &["eth", "net", "web3", "txpool", "miner", "clique", "debug"],
            mines: true,
            public_rpc: false,
        },
        Role::Rpc => RoleProfile {
            apis: &["eth", "net", "web3", "txpool"],
            mines: false,
            public_rpc: true,
        },
        Role::Plain => RoleProfile {
            apis: BASE_APIS,
            mines: false,
            public_rpc: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_role_exposes_base_apis() {
        for role in Role::ALL {
            let profile = role_profile(role);
            for api in BASE_APIS {
                assert!(profile.apis.contains(api), "{} lacks {}", role, api);
            }
        }
    }

    #[test]
    fn test_only_validators_mine_and_debug() {
        for role in Role::ALL {
            let profile = role_profile(role);
            assert_eq!(profile.mines, role == Role::Validator);
            assert_eq!(profile.apis.contains(&"clique"), role == Role::Validator);
            assert_eq!(profile.apis.contains(&"debug"), role == Role::Validator);
        }
        assert_eq!(role_profile(Role::Plain).api_list(), "eth,net,web3");
    }
}
