//! Tunnel routing configuration.
//!
//! The embedding node parses its configuration file and hands the routing
//! section to this crate as an immutable value; nothing here touches the
//! filesystem. The lists are ordered: when two entries carry the same
//! prefix, the first one wins.

use serde::{Deserialize, Serialize};

/// One static route: an IP prefix carried across the mesh by a remote key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubnet {
    /// CIDR prefix, e.g. `"10.0.0.0/8"` or `"fd00:1234::/32"`.
    pub prefix: String,
    /// Hex-encoded 32-byte Ed25519 public key of the remote peer that
    /// originates the prefix.
    pub public_key: String,
}

/// Static crypto-key routing configuration.
///
/// Disabled by default; with `enable` unset the route tables stay empty
/// and only native overlay traffic is carried.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enable: bool,
    pub ipv4_remote_subnets: Vec<RemoteSubnet>,
    pub ipv6_remote_subnets: Vec<RemoteSubnet>,
}
