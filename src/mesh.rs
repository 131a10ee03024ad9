//! Mesh core dependency surface.
//!
//! The datapath never talks to the overlay directly. Everything it needs
//! from the mesh implementation lives behind the [`MeshCore`] trait:
//! identity material, address/subnet derivation, transport reads and
//! writes, and the out-of-band channel used by the key lookup protocol.
//!
//! The trait is defined here, away from the components that consume it,
//! so the cache and datapath depend only on this boundary and tests can
//! supply a recording mock.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use crate::addr::{Address, PeerKey, Subnet};

/// Callback invoked by the mesh core for each inbound out-of-band frame.
///
/// Arguments are the sending peer's key, the key the frame was addressed
/// to, and the raw frame bytes. The core calls this from its own driver
/// task; implementations must not block, so the datapath's handler spawns
/// the actual processing onto the runtime.
pub type OobHandler = Arc<dyn Fn(PeerKey, PeerKey, Vec<u8>) + Send + Sync>;

/// The mesh overlay as seen by the crypto-key routing datapath.
///
/// Derivation methods are pure: for a given key the derived address and
/// subnet never change. The I/O methods may fail with transport errors,
/// which the datapath surfaces to its caller so the enclosing read/write
/// loops can terminate.
#[async_trait]
pub trait MeshCore: Send + Sync + 'static {
    /// This node's public key.
    fn public_key(&self) -> PeerKey;

    /// Signing material for the local identity, used to sign out-of-band
    /// lookup frames.
    fn signing_key(&self) -> SigningKey;

    /// Derive the overlay address owned by `key`.
    fn addr_for_key(&self, key: &PeerKey) -> Address;

    /// Derive the overlay subnet owned by `key`.
    fn subnet_for_key(&self, key: &PeerKey) -> Subnet;

    /// A representative remote key whose derived address matches `addr`,
    /// used as the destination for a key lookup.
    fn get_address_key(&self, addr: &Address) -> Option<PeerKey>;

    /// A representative remote key whose derived subnet matches `subnet`.
    fn get_subnet_key(&self, subnet: &Subnet) -> Option<PeerKey>;

    /// Whether `addr` lies in the overlay's native address space.
    fn is_valid_address(&self, addr: &Address) -> bool;

    /// Whether `subnet` lies in the overlay's native subnet space.
    fn is_valid_subnet(&self, subnet: &Subnet) -> bool;

    /// The largest MTU the overlay transport can carry.
    fn mtu(&self) -> u64;

    /// Write one packet to the overlay destined for `dest`.
    async fn write_to(&self, packet: &[u8], dest: &PeerKey) -> Result<usize>;

    /// Read one datagram from the overlay. Returns the byte count and the
    /// sending peer's key.
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, PeerKey)>;

    /// Send a short out-of-band control frame to `dest`.
    async fn send_out_of_band(&self, dest: &PeerKey, frame: &[u8]) -> Result<()>;

    /// Register the handler invoked for inbound out-of-band frames.
    fn set_out_of_band_handler(&self, handler: OobHandler);

    /// Shut the overlay down. Blocked reads and writes return errors
    /// afterwards.
    async fn close(&self) -> Result<()>;

    /// Stop background work after `close`.
    async fn stop(&self);
}
