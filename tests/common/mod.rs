//! Shared test fixture: a recording in-memory mesh core.
//!
//! Address derivation is a deterministic hash of the key with marker
//! prefixes, so the overlay's "native address space" is recognizable:
//! addresses start with `0xfd`, subnets with `0xfe`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc;

use keyroute::{Address, MeshCore, OobHandler, PeerKey, Subnet};

pub const ADDRESS_PREFIX: u8 = 0xfd;
pub const SUBNET_PREFIX: u8 = 0xfe;

pub fn keypair() -> (SigningKey, PeerKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let key = PeerKey::from_bytes(signing.verifying_key().to_bytes());
    (signing, key)
}

pub fn derive_address(key: &PeerKey) -> Address {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes[0] = ADDRESS_PREFIX;
    bytes[1..].copy_from_slice(&hash.as_bytes()[..15]);
    Address::from_bytes(bytes)
}

pub fn derive_subnet(key: &PeerKey) -> Subnet {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes[0] = SUBNET_PREFIX;
    bytes[1..8].copy_from_slice(&hash.as_bytes()[..7]);
    Subnet::from_prefix(bytes)
}

/// An in-memory mesh core that records every overlay write and
/// out-of-band send, and feeds inbound datagrams from a channel.
pub struct MockMesh {
    signing: SigningKey,
    local_key: PeerKey,
    max_mtu: u64,
    peers: Mutex<Vec<PeerKey>>,
    written: Mutex<Vec<(Vec<u8>, PeerKey)>>,
    oob_sent: Mutex<Vec<(PeerKey, Vec<u8>)>>,
    handler: Mutex<Option<OobHandler>>,
    closed: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, PeerKey)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, PeerKey)>>,
}

impl MockMesh {
    pub fn new() -> Arc<Self> {
        Self::with_max_mtu(65535)
    }

    pub fn with_max_mtu(max_mtu: u64) -> Arc<Self> {
        let (signing, local_key) = keypair();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            signing,
            local_key,
            max_mtu,
            peers: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            oob_sent: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    pub fn local_key(&self) -> PeerKey {
        self.local_key
    }

    pub fn local_signing_key(&self) -> SigningKey {
        self.signing.clone()
    }

    /// Make a remote key resolvable through `get_address_key` and
    /// `get_subnet_key`.
    pub fn register_peer(&self, key: PeerKey) {
        self.peers.lock().unwrap().push(key);
    }

    /// Queue an inbound overlay datagram from `from`.
    pub fn inject_packet(&self, packet: &[u8], from: PeerKey) {
        self.inbound_tx
            .send((packet.to_vec(), from))
            .expect("inbound queue closed");
    }

    /// Invoke the registered out-of-band handler, as the real core would
    /// for an arriving frame.
    pub fn deliver_oob(&self, from: PeerKey, to: PeerKey, data: Vec<u8>) {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .expect("no out-of-band handler registered");
        handler(from, to, data);
    }

    pub fn written(&self) -> Vec<(Vec<u8>, PeerKey)> {
        self.written.lock().unwrap().clone()
    }

    pub fn oob_frames(&self) -> Vec<(PeerKey, Vec<u8>)> {
        self.oob_sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeshCore for MockMesh {
    fn public_key(&self) -> PeerKey {
        self.local_key
    }

    fn signing_key(&self) -> SigningKey {
        self.signing.clone()
    }

    fn addr_for_key(&self, key: &PeerKey) -> Address {
        derive_address(key)
    }

    fn subnet_for_key(&self, key: &PeerKey) -> Subnet {
        derive_subnet(key)
    }

    fn get_address_key(&self, addr: &Address) -> Option<PeerKey> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .copied()
            .find(|key| derive_address(key) == *addr)
    }

    fn get_subnet_key(&self, subnet: &Subnet) -> Option<PeerKey> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .copied()
            .find(|key| derive_subnet(key) == *subnet)
    }

    fn is_valid_address(&self, addr: &Address) -> bool {
        addr.as_bytes()[0] == ADDRESS_PREFIX
    }

    fn is_valid_subnet(&self, subnet: &Subnet) -> bool {
        subnet.as_bytes()[0] == SUBNET_PREFIX
    }

    fn mtu(&self) -> u64 {
        self.max_mtu
    }

    async fn write_to(&self, packet: &[u8], dest: &PeerKey) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("mesh core closed");
        }
        self.written.lock().unwrap().push((packet.to_vec(), *dest));
        Ok(packet.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, PeerKey)> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((packet, from)) if !self.closed.load(Ordering::SeqCst) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok((n, from))
            }
            _ => bail!("mesh core closed"),
        }
    }

    async fn send_out_of_band(&self, dest: &PeerKey, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("mesh core closed");
        }
        self.oob_sent.lock().unwrap().push((*dest, frame.to_vec()));
        Ok(())
    }

    fn set_out_of_band_handler(&self, handler: OobHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Wake a blocked reader so it observes the shutdown.
        let _ = self.inbound_tx.send((Vec::new(), self.local_key));
        Ok(())
    }

    async fn stop(&self) {}
}

/// Minimal IPv6 packet: fixed header plus a counting payload.
pub fn ipv6_packet(src: [u8; 16], dst: [u8; 16], payload_len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 40 + payload_len];
    packet[0] = 0x60;
    packet[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    packet[6] = 59; // no next header
    packet[7] = 64;
    packet[8..24].copy_from_slice(&src);
    packet[24..40].copy_from_slice(&dst);
    for (i, b) in packet[40..].iter_mut().enumerate() {
        *b = i as u8;
    }
    packet
}

/// Minimal IPv4 packet: 20-byte header plus a counting payload.
pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload_len: usize) -> Vec<u8> {
    let total = 20 + payload_len;
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // TTL
    packet[9] = 17; // UDP
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    for (i, b) in packet[20..].iter_mut().enumerate() {
        *b = i as u8;
    }
    packet
}

/// Let spawned tasks (out-of-band processing, expiry timers) run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
