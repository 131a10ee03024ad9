//! # TUN ↔ Overlay Datapath
//!
//! [`KeyRouter`] is the byte-stream surface a TUN adapter drives:
//! [`send`](KeyRouter::send) carries one IP packet from the kernel onto
//! the overlay, [`recv`](KeyRouter::recv) delivers one overlay packet
//! back. Between them sit destination classification, source validation,
//! the key cache, the static route fallback, and MTU enforcement.
//!
//! ## Egress
//!
//! A packet read from the TUN is classified by its destination: a native
//! overlay address or subnet goes through the key cache (parking in the
//! hold buffer and issuing a lookup on a miss), anything else falls back
//! to the static route table. Oversize IPv6 packets are answered with an
//! ICMPv6 Packet Too Big fed back to the TUN reader; oversize IPv4 is
//! dropped.
//!
//! ## Ingress
//!
//! An overlay packet is accepted only when its claimed source is
//! consistent with the sending peer's key: either the source matches the
//! key's derived address or subnet, or the static table maps the source
//! prefix to exactly that key. Anything else is dropped so a peer cannot
//! spoof traffic from another peer. Receiving from a peer also learns its
//! key, which flushes any packets parked for it.
//!
//! ## Drop policy
//!
//! Per-packet faults (not IP, undersized, spoofed source, no route) are
//! silent drops logged at debug level; the upper layers retransmit. Only
//! overlay transport errors surface to the caller, so the enclosing
//! read/write loops can terminate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::addr::{Address, Subnet};
use crate::config::RoutingConfig;
use crate::icmpv6;
use crate::keystore::KeyStore;
use crate::mesh::MeshCore;
use crate::routes::{Route, RouteTable};

/// Scratch size for overlay reads, the largest IP packet we can carry.
const OVERLAY_READ_BUFFER: usize = 65535;

const IPV4_HEADER_LEN: usize = 20;

/// Why a packet was refused by the datapath.
///
/// These never surface as call errors; the datapath logs them and drops
/// the packet, reporting zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// The version nibble is neither IPv4 nor IPv6.
    NotIp,
    /// Too short to carry the header its version nibble promises.
    Undersized { len: usize },
    /// Ingress source inconsistent with the sending peer's key.
    InvalidSource,
    /// Destination outside the overlay with no static route configured.
    NoRoute,
    /// Larger than the current datapath MTU.
    Oversize { len: usize, mtu: u64 },
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::NotIp => write!(f, "not an IP packet"),
            PacketError::Undersized { len } => write!(f, "undersized packet, length {len}"),
            PacketError::InvalidSource => write!(f, "source inconsistent with sender key"),
            PacketError::NoRoute => write!(f, "no route to destination"),
            PacketError::Oversize { len, mtu } => {
                write!(f, "packet of {len} bytes exceeds MTU {mtu}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IpClass {
    V4,
    V6,
}

fn classify_ip(packet: &[u8]) -> Result<IpClass, PacketError> {
    let Some(first) = packet.first() else {
        return Err(PacketError::NotIp);
    };
    match first & 0xf0 {
        0x40 if packet.len() < IPV4_HEADER_LEN => Err(PacketError::Undersized { len: packet.len() }),
        0x40 => Ok(IpClass::V4),
        0x60 if packet.len() < icmpv6::IPV6_HEADER_LEN => {
            Err(PacketError::Undersized { len: packet.len() })
        }
        0x60 => Ok(IpClass::V6),
        _ => Err(PacketError::NotIp),
    }
}

/// The crypto-key routing datapath between a TUN interface and the mesh
/// overlay.
pub struct KeyRouter<C: MeshCore> {
    core: Arc<C>,
    store: KeyStore<C>,
    routes: Arc<RouteTable>,
    address: Address,
    subnet: Subnet,
    inject: mpsc::UnboundedSender<Vec<u8>>,
    deliveries: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl<C: MeshCore> KeyRouter<C> {
    /// Build the datapath over `core` with the given static routing
    /// configuration, and register the out-of-band lookup handler.
    pub fn new(core: Arc<C>, config: &RoutingConfig) -> Self {
        let routes = Arc::new(RouteTable::from_config(config));
        let public = core.public_key();
        let address = core.addr_for_key(&public);
        let subnet = core.subnet_for_key(&public);
        let store = KeyStore::new(core.clone());

        let handler_store = store.clone();
        core.set_out_of_band_handler(Arc::new(move |from, to, data| {
            // The mesh core calls this from its own driver task; hand the
            // crypto and any resulting sends off to the runtime.
            let store = handler_store.clone();
            tokio::spawn(store.handle_oob(from, to, data));
        }));

        let (inject, deliveries) = mpsc::unbounded_channel();
        Self {
            core,
            store,
            routes,
            address,
            subnet,
            inject,
            deliveries: tokio::sync::Mutex::new(deliveries),
        }
    }

    /// This node's overlay address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// This node's overlay subnet.
    pub fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Current datapath MTU.
    pub fn mtu(&self) -> u64 {
        self.store.mtu()
    }

    /// Set the datapath MTU, clamped to `[1280, max_mtu()]`.
    pub fn set_mtu(&self, mtu: u64) {
        self.store.set_mtu(mtu);
    }

    /// The largest MTU the overlay transport can carry.
    pub fn max_mtu(&self) -> u64 {
        self.store.max_mtu()
    }

    /// Configured IPv4 routes, for interface route programming.
    pub fn v4_routes(&self) -> &[Route] {
        self.routes.v4_routes()
    }

    /// Configured IPv6 routes, for interface route programming.
    pub fn v6_routes(&self) -> &[Route] {
        self.routes.v6_routes()
    }

    /// The shared key cache and hold buffer.
    pub fn key_store(&self) -> &KeyStore<C> {
        &self.store
    }

    /// Carry one IP packet from the TUN onto the overlay.
    ///
    /// Returns the packet length when it was written, parked for key
    /// resolution, or answered with a Packet Too Big; returns zero for a
    /// silent drop. Only overlay transport failures are errors.
    pub async fn send(&self, packet: &[u8]) -> Result<usize> {
        let class = match classify_ip(packet) {
            Ok(class) => class,
            Err(err) => {
                debug!(error = %err, "dropping egress packet");
                return Ok(0);
            }
        };

        let mtu = self.store.mtu();
        if packet.len() as u64 > mtu {
            let err = PacketError::Oversize { len: packet.len(), mtu };
            if class == IpClass::V6 {
                // Tell the kernel the usable MTU; the reply goes back out
                // the TUN through the delivery queue.
                debug!(error = %err, "answering oversize packet with ICMPv6");
                if let Some(reply) = icmpv6::packet_too_big(packet, mtu as u32) {
                    let _ = self.inject.send(reply);
                }
            } else {
                debug!(error = %err, "dropping oversize IPv4 packet");
            }
            return Ok(0);
        }

        match class {
            IpClass::V6 => {
                let mut dst = [0u8; 16];
                dst.copy_from_slice(&packet[24..40]);
                let dst_addr = Address::from_bytes(dst);
                if self.core.is_valid_address(&dst_addr) {
                    self.store.send_to_address(dst_addr, packet).await;
                    return Ok(packet.len());
                }
                let dst_subnet = Subnet::from_prefix(dst);
                if self.core.is_valid_subnet(&dst_subnet) {
                    self.store.send_to_subnet(dst_subnet, packet).await;
                    return Ok(packet.len());
                }
                self.send_via_route(packet, IpAddr::V6(Ipv6Addr::from(dst))).await
            }
            IpClass::V4 => {
                let mut dst = [0u8; 4];
                dst.copy_from_slice(&packet[16..20]);
                let dst_addr = Address::from_ipv4(dst);
                if self.core.is_valid_address(&dst_addr) {
                    self.store.send_to_address(dst_addr, packet).await;
                    return Ok(packet.len());
                }
                self.send_via_route(packet, IpAddr::V4(Ipv4Addr::from(dst))).await
            }
        }
    }

    async fn send_via_route(&self, packet: &[u8], dst: IpAddr) -> Result<usize> {
        match self.routes.lookup(dst) {
            Some(key) => {
                let key = *key;
                let n = self.core.write_to(packet, &key).await?;
                Ok(n)
            }
            None => {
                debug!(%dst, error = %PacketError::NoRoute, "dropping egress packet");
                Ok(0)
            }
        }
    }

    /// Deliver one overlay packet to the TUN.
    ///
    /// Blocks until a packet passes validation or a Packet Too Big reply
    /// is queued for delivery. Returns zero, with no error, when a packet
    /// was dropped for an inconsistent source. Overlay transport failures
    /// surface so the read loop can terminate.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut deliveries = self.deliveries.lock().await;
        let mut scratch = vec![0u8; OVERLAY_READ_BUFFER];
        loop {
            let (n, src_key) = tokio::select! {
                biased;
                injected = deliveries.recv() => {
                    // The sender half lives in self, so the queue cannot
                    // close while we are here.
                    let Some(reply) = injected else { continue };
                    let n = reply.len().min(buf.len());
                    buf[..n].copy_from_slice(&reply[..n]);
                    return Ok(n);
                }
                read = self.core.read_from(&mut scratch) => read?,
            };
            if n == 0 {
                continue;
            }
            let packet = &scratch[..n];

            let class = match classify_ip(packet) {
                Ok(class) => class,
                Err(err) => {
                    trace!(peer = %src_key, error = %err, "skipping overlay datagram");
                    continue;
                }
            };

            let mtu = self.store.mtu();
            if n as u64 > mtu {
                if class == IpClass::V6 {
                    // Path MTU signal toward the overlay sender; routed
                    // back out through the egress path.
                    if let Some(reply) = icmpv6::packet_too_big(packet, mtu as u32) {
                        let _ = self.send(&reply).await;
                    }
                }
                continue;
            }

            let (src_addr, src_subnet, src_ip) = match class {
                IpClass::V4 => {
                    let mut src = [0u8; 4];
                    src.copy_from_slice(&packet[12..16]);
                    // Padded into 16 bytes, this can never equal a derived
                    // overlay address: IPv4 sources are only admitted via
                    // the static table below.
                    (Address::from_ipv4(src), None, IpAddr::V4(Ipv4Addr::from(src)))
                }
                IpClass::V6 => {
                    let mut src = [0u8; 16];
                    src.copy_from_slice(&packet[8..24]);
                    (
                        Address::from_bytes(src),
                        Some(Subnet::from_prefix(src)),
                        IpAddr::V6(Ipv6Addr::from(src)),
                    )
                }
            };

            let info = self.store.learn(src_key).await;
            let native =
                src_addr == info.address || src_subnet.is_some_and(|s| s == info.subnet);
            if !native {
                match self.routes.lookup(src_ip) {
                    Some(key) if *key == src_key => {}
                    _ => {
                        trace!(
                            peer = %src_key,
                            src = %src_ip,
                            error = %PacketError::InvalidSource,
                            "dropping overlay packet"
                        );
                        return Ok(0);
                    }
                }
            }

            let n = n.min(buf.len());
            buf[..n].copy_from_slice(&packet[..n]);
            return Ok(n);
        }
    }

    /// Shut the overlay down. Blocked reads and writes return errors
    /// afterwards, terminating the packet loops.
    pub async fn close(&self) -> Result<()> {
        let result = self.core.close().await;
        self.core.stop().await;
        result
    }
}
