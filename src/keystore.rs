//! # Key Cache and Hold Buffer
//!
//! The shared state of the datapath:
//!
//! - **Key cache**: a bidirectional index between peer keys and their
//!   derived overlay addresses and subnets, refreshed on every use and
//!   expired after [`KEY_STORE_TIMEOUT`] without one.
//! - **Hold buffer**: at most one parked packet per unresolved address or
//!   subnet, waiting for a key lookup to complete, with the same timeout.
//! - **MTU**: the datapath MTU word, clamped to `[1280, core MTU]`.
//!
//! ## Locking
//!
//! One `std::sync::Mutex` guards all of it. The guard is not `Send`, so
//! holding it across an `.await` does not compile; every overlay write,
//! out-of-band send, and signature operation therefore happens after the
//! critical section, on data captured inside it.
//!
//! ## Expiry
//!
//! Each cache entry and each buffer slot owns a timer task. Every (re)arm
//! records a fresh generation number in the entry and spawns a sleep task
//! capturing it; when the task fires it removes the entry only if the
//! generation still matches, so a timer armed against state that has since
//! been refreshed or replaced is a no-op. Superseded tasks are also
//! aborted so they do not accumulate. Timer tasks hold only a weak
//! reference to the store and quietly exit once it is dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::addr::{Address, PeerKey, Subnet};
use crate::lookup::{self, OOB_FRAME_LEN, TYPE_KEY_LOOKUP, TYPE_KEY_RESPONSE};
use crate::mesh::MeshCore;

/// How long a cache entry or parked packet survives without a refresh.
pub const KEY_STORE_TIMEOUT: Duration = Duration::from_secs(120);

/// Smallest MTU the datapath will operate at, the IPv6 minimum link MTU.
pub const MIN_MTU: u64 = 1280;

/// A cached binding between a peer key and its derived overlay
/// identifiers. For a given key the address and subnet never change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: PeerKey,
    pub address: Address,
    pub subnet: Subnet,
}

struct KeyEntry {
    info: KeyInfo,
    timer_gen: u64,
    timer: Option<AbortHandle>,
}

struct PendingPacket {
    packet: Vec<u8>,
    timer_gen: u64,
    timer: Option<AbortHandle>,
}

struct State {
    by_key: HashMap<PeerKey, KeyEntry>,
    by_addr: HashMap<Address, PeerKey>,
    by_subnet: HashMap<Subnet, PeerKey>,
    addr_buffer: HashMap<Address, PendingPacket>,
    subnet_buffer: HashMap<Subnet, PendingPacket>,
    mtu: u64,
}

struct StoreInner<C: MeshCore> {
    core: Arc<C>,
    signing: SigningKey,
    local_subnet: Subnet,
    state: Mutex<State>,
    timer_seq: AtomicU64,
}

impl<C: MeshCore> StoreInner<C> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // A poisoning panic elsewhere must not take the datapath down
        // with it; the maps are valid after any partial mutation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the shared key cache, hold buffer, and MTU word.
///
/// Cheap to clone; all clones share the same state.
pub struct KeyStore<C: MeshCore> {
    inner: Arc<StoreInner<C>>,
}

impl<C: MeshCore> Clone for KeyStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: MeshCore> KeyStore<C> {
    pub fn new(core: Arc<C>) -> Self {
        let signing = core.signing_key();
        let public = core.public_key();
        let local_subnet = core.subnet_for_key(&public);
        Self {
            inner: Arc::new(StoreInner {
                core,
                signing,
                local_subnet,
                state: Mutex::new(State {
                    by_key: HashMap::new(),
                    by_addr: HashMap::new(),
                    by_subnet: HashMap::new(),
                    addr_buffer: HashMap::new(),
                    subnet_buffer: HashMap::new(),
                    // Safe floor until the embedder raises it.
                    mtu: MIN_MTU,
                }),
                timer_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Record that `key` is reachable, returning its cached binding.
    ///
    /// Idempotent: a known key only has its expiry refreshed. A new key
    /// has its address and subnet derived, is inserted into all three
    /// indices, and any packets parked for those identifiers are written
    /// to the overlay.
    pub async fn learn(&self, key: PeerKey) -> KeyInfo {
        let (info, drained) = {
            let mut state = self.inner.lock_state();
            let (info, drained) = if let Some(entry) = state.by_key.get(&key) {
                (entry.info.clone(), Vec::new())
            } else {
                let address = self.inner.core.addr_for_key(&key);
                let subnet = self.inner.core.subnet_for_key(&key);
                let info = KeyInfo { key, address, subnet };
                state.by_key.insert(
                    key,
                    KeyEntry {
                        info: info.clone(),
                        timer_gen: 0,
                        timer: None,
                    },
                );
                state.by_addr.insert(address, key);
                state.by_subnet.insert(subnet, key);

                // Drain both slots in the same critical section that
                // removes them, so a drained packet can never race a
                // concurrent park against the emptied slot.
                let mut drained = Vec::with_capacity(2);
                if let Some(mut slot) = state.addr_buffer.remove(&address) {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                    drained.push(slot.packet);
                }
                if let Some(mut slot) = state.subnet_buffer.remove(&subnet) {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                    drained.push(slot.packet);
                }
                (info, drained)
            };
            self.arm_key_timer(&mut state, key);
            (info, drained)
        };
        for packet in drained {
            if let Err(err) = self.inner.core.write_to(&packet, &info.key).await {
                debug!(peer = %info.key, error = %err, "draining parked packet failed");
            }
        }
        info
    }

    /// Cached binding for an overlay address, refreshing its expiry.
    pub fn by_address(&self, addr: &Address) -> Option<KeyInfo> {
        let mut state = self.inner.lock_state();
        let key = *state.by_addr.get(addr)?;
        let info = state.by_key.get(&key)?.info.clone();
        self.arm_key_timer(&mut state, key);
        Some(info)
    }

    /// Cached binding for an overlay subnet, refreshing its expiry.
    pub fn by_subnet(&self, subnet: &Subnet) -> Option<KeyInfo> {
        let mut state = self.inner.lock_state();
        let key = *state.by_subnet.get(subnet)?;
        let info = state.by_key.get(&key)?.info.clone();
        self.arm_key_timer(&mut state, key);
        Some(info)
    }

    /// Cached binding for a peer key, refreshing its expiry.
    pub fn by_key(&self, key: &PeerKey) -> Option<KeyInfo> {
        let mut state = self.inner.lock_state();
        let info = state.by_key.get(key)?.info.clone();
        self.arm_key_timer(&mut state, *key);
        Some(info)
    }

    /// Park a copy of `packet` for an unresolved address, replacing any
    /// packet already held there and restarting the slot's expiry.
    pub fn park_for_address(&self, addr: Address, packet: &[u8]) {
        let mut state = self.inner.lock_state();
        self.park_addr_locked(&mut state, addr, packet);
    }

    /// Park a copy of `packet` for an unresolved subnet.
    pub fn park_for_subnet(&self, subnet: Subnet, packet: &[u8]) {
        let mut state = self.inner.lock_state();
        self.park_subnet_locked(&mut state, subnet, packet);
    }

    /// Remove and return the packet parked for `addr`, if any.
    pub fn take_for_address(&self, addr: &Address) -> Option<Vec<u8>> {
        let mut state = self.inner.lock_state();
        let mut slot = state.addr_buffer.remove(addr)?;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        Some(slot.packet)
    }

    /// Remove and return the packet parked for `subnet`, if any.
    pub fn take_for_subnet(&self, subnet: &Subnet) -> Option<Vec<u8>> {
        let mut state = self.inner.lock_state();
        let mut slot = state.subnet_buffer.remove(subnet)?;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        Some(slot.packet)
    }

    /// Send `packet` to the peer owning `addr`, or park it and issue a
    /// key lookup when the owner is not yet known.
    pub(crate) async fn send_to_address(&self, addr: Address, packet: &[u8]) {
        let dest = {
            let mut state = self.inner.lock_state();
            match state.by_addr.get(&addr).copied() {
                Some(key) => {
                    self.arm_key_timer(&mut state, key);
                    Some(key)
                }
                None => {
                    self.park_addr_locked(&mut state, addr, packet);
                    None
                }
            }
        };
        match dest {
            Some(key) => {
                if let Err(err) = self.inner.core.write_to(packet, &key).await {
                    debug!(peer = %key, error = %err, "overlay write failed");
                }
            }
            None => match self.inner.core.get_address_key(&addr) {
                Some(partial) => self.send_lookup(&partial).await,
                None => trace!(%addr, "no representative key for address lookup"),
            },
        }
    }

    /// Send `packet` to the peer owning `subnet`, or park it and issue a
    /// key lookup when the owner is not yet known.
    pub(crate) async fn send_to_subnet(&self, subnet: Subnet, packet: &[u8]) {
        let dest = {
            let mut state = self.inner.lock_state();
            match state.by_subnet.get(&subnet).copied() {
                Some(key) => {
                    self.arm_key_timer(&mut state, key);
                    Some(key)
                }
                None => {
                    self.park_subnet_locked(&mut state, subnet, packet);
                    None
                }
            }
        };
        match dest {
            Some(key) => {
                if let Err(err) = self.inner.core.write_to(packet, &key).await {
                    debug!(peer = %key, error = %err, "overlay write failed");
                }
            }
            None => match self.inner.core.get_subnet_key(&subnet) {
                Some(partial) => self.send_lookup(&partial).await,
                None => trace!(%subnet, "no representative key for subnet lookup"),
            },
        }
    }

    /// Process one inbound out-of-band frame.
    ///
    /// A lookup addressed to a key in our own subnet gets a signed
    /// response; a verified response learns the sender, which drains any
    /// packets parked for it. Everything else is dropped silently.
    pub async fn handle_oob(self, from: PeerKey, to: PeerKey, data: Vec<u8>) {
        if data.len() != OOB_FRAME_LEN {
            trace!(peer = %from, len = data.len(), "dropping malformed out-of-band frame");
            return;
        }
        let sig = &data[1..];
        match data[0] {
            TYPE_KEY_LOOKUP => {
                if self.inner.core.subnet_for_key(&to) == self.inner.local_subnet
                    && lookup::verify(&from, &to, sig)
                {
                    // The lookup targets at least our subnet, possibly
                    // our address.
                    self.send_response(&from).await;
                }
            }
            TYPE_KEY_RESPONSE => {
                if lookup::verify(&from, &to, sig) {
                    self.learn(from).await;
                }
            }
            other => {
                trace!(peer = %from, frame_type = other, "dropping unknown out-of-band frame");
            }
        }
    }

    async fn send_lookup(&self, partial: &PeerKey) {
        let frame = lookup::lookup_frame(&self.inner.signing, partial);
        if let Err(err) = self.inner.core.send_out_of_band(partial, &frame).await {
            debug!(peer = %partial, error = %err, "key lookup send failed");
        }
    }

    async fn send_response(&self, dest: &PeerKey) {
        let frame = lookup::response_frame(&self.inner.signing, dest);
        if let Err(err) = self.inner.core.send_out_of_band(dest, &frame).await {
            debug!(peer = %dest, error = %err, "key response send failed");
        }
    }

    /// Current datapath MTU.
    pub fn mtu(&self) -> u64 {
        self.inner.lock_state().mtu
    }

    /// Set the datapath MTU, clamped to `[1280, max_mtu()]`.
    pub fn set_mtu(&self, mtu: u64) {
        let clamped = mtu.min(self.max_mtu()).max(MIN_MTU);
        self.inner.lock_state().mtu = clamped;
    }

    /// The largest MTU the overlay transport can carry.
    pub fn max_mtu(&self) -> u64 {
        self.inner.core.mtu()
    }

    /// Restart the expiry of the entry for `key`, superseding whatever
    /// timer was armed before.
    fn arm_key_timer(&self, state: &mut State, key: PeerKey) {
        let Some(entry) = state.by_key.get_mut(&key) else {
            return;
        };
        if let Some(old) = entry.timer.take() {
            old.abort();
        }
        let generation = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        entry.timer_gen = generation;
        let store = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(expire_key(store, key, generation));
        entry.timer = Some(handle.abort_handle());
    }

    fn park_addr_locked(&self, state: &mut State, addr: Address, packet: &[u8]) {
        let generation = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        let slot = state.addr_buffer.entry(addr).or_insert_with(empty_slot);
        slot.packet.clear();
        slot.packet.extend_from_slice(packet);
        if let Some(old) = slot.timer.take() {
            old.abort();
        }
        slot.timer_gen = generation;
        let store = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(expire_addr_slot(store, addr, generation));
        slot.timer = Some(handle.abort_handle());
    }

    fn park_subnet_locked(&self, state: &mut State, subnet: Subnet, packet: &[u8]) {
        let generation = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        let slot = state.subnet_buffer.entry(subnet).or_insert_with(empty_slot);
        slot.packet.clear();
        slot.packet.extend_from_slice(packet);
        if let Some(old) = slot.timer.take() {
            old.abort();
        }
        slot.timer_gen = generation;
        let store = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(expire_subnet_slot(store, subnet, generation));
        slot.timer = Some(handle.abort_handle());
    }
}

fn empty_slot() -> PendingPacket {
    PendingPacket {
        packet: Vec::new(),
        timer_gen: 0,
        timer: None,
    }
}

async fn expire_key<C: MeshCore>(store: Weak<StoreInner<C>>, key: PeerKey, generation: u64) {
    sleep(KEY_STORE_TIMEOUT).await;
    let Some(inner) = store.upgrade() else {
        return;
    };
    let mut state = inner.lock_state();
    let live = matches!(
        state.by_key.get(&key),
        Some(entry) if entry.timer_gen == generation
    );
    if !live {
        // A fresher timer owns this entry now.
        return;
    }
    if let Some(entry) = state.by_key.remove(&key) {
        if state.by_addr.get(&entry.info.address) == Some(&key) {
            state.by_addr.remove(&entry.info.address);
        }
        if state.by_subnet.get(&entry.info.subnet) == Some(&key) {
            state.by_subnet.remove(&entry.info.subnet);
        }
        trace!(peer = %key, "key cache entry expired");
    }
}

async fn expire_addr_slot<C: MeshCore>(store: Weak<StoreInner<C>>, addr: Address, generation: u64) {
    sleep(KEY_STORE_TIMEOUT).await;
    let Some(inner) = store.upgrade() else {
        return;
    };
    let mut state = inner.lock_state();
    if let Entry::Occupied(slot) = state.addr_buffer.entry(addr)
        && slot.get().timer_gen == generation
    {
        slot.remove();
        trace!(%addr, "parked packet expired");
    }
}

async fn expire_subnet_slot<C: MeshCore>(
    store: Weak<StoreInner<C>>,
    subnet: Subnet,
    generation: u64,
) {
    sleep(KEY_STORE_TIMEOUT).await;
    let Some(inner) = store.upgrade() else {
        return;
    };
    let mut state = inner.lock_state();
    if let Entry::Occupied(slot) = state.subnet_buffer.entry(subnet)
        && slot.get().timer_gen == generation
    {
        slot.remove();
        trace!(%subnet, "parked packet expired");
    }
}
