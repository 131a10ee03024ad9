//! # Keyroute - Crypto-Key Routing Datapath
//!
//! Keyroute sits between a local TUN interface and a mesh overlay whose
//! endpoints are Ed25519 public keys. It resolves each outbound packet's
//! destination IP to an overlay key and writes the packet onto the
//! overlay; inbound, it validates each packet's claimed source against
//! the sending peer's key before handing it to the kernel.
//!
//! The overlay itself (transport, routing, signing identity) is supplied
//! by the embedder behind the [`MeshCore`] trait; this crate is the
//! address-to-key resolution and forwarding engine on top of it:
//!
//! - A key cache binding overlay addresses and subnets to peer keys,
//!   refreshed on use and expired after 120 seconds without it
//! - A signed out-of-band lookup protocol for discovering the key behind
//!   a remote address or subnet
//! - A hold buffer parking one pending packet per unresolved destination
//!   while a lookup is outstanding
//! - A static prefix-to-key table carrying non-overlay IP ranges across
//!   the mesh
//! - Ingress source validation and the ICMPv6 Packet Too Big path
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `datapath` | [`KeyRouter`]: the TUN-facing send/recv surface |
//! | `keystore` | Key cache, hold buffer, and MTU state |
//! | `lookup` | Out-of-band lookup frame codec |
//! | `routes` | Static prefix-to-key route tables |
//! | `icmpv6` | Packet Too Big construction |
//! | `mesh` | The [`MeshCore`] dependency boundary |
//! | `addr` | Key, address, and subnet value types |
//! | `config` | Tunnel routing configuration |
//!
//! ## Concurrency Model
//!
//! The TUN writer, the overlay reader, out-of-band callbacks, and expiry
//! timers all run as independent tasks over one shared state behind a
//! single mutex. The lock is never held across overlay I/O or signature
//! work: critical sections mutate the maps and capture what the I/O
//! needs, then release before awaiting.

pub mod addr;
pub mod config;
pub mod datapath;
pub mod icmpv6;
pub mod keystore;
pub mod lookup;
pub mod mesh;
pub mod routes;

pub use addr::{Address, PeerKey, Subnet};
pub use config::{RemoteSubnet, RoutingConfig};
pub use datapath::{KeyRouter, PacketError};
pub use keystore::{KEY_STORE_TIMEOUT, KeyInfo, KeyStore, MIN_MTU};
pub use mesh::{MeshCore, OobHandler};
pub use routes::{Route, RouteTable};
