//! # Overlay Identifiers
//!
//! The three fixed-size values the datapath routes by:
//!
//! - [`PeerKey`]: 32-byte Ed25519 public key identifying a mesh peer
//! - [`Address`]: 16-byte overlay host address derived from a key
//! - [`Subnet`]: 16-byte overlay /64-style prefix derived from a key
//!
//! All three compare by raw bytes. Derivation itself lives in the mesh
//! core behind [`MeshCore`](crate::mesh::MeshCore); this module only
//! defines the value types and their byte-level conventions.
//!
//! ## Byte conventions
//!
//! - An IPv4 source or destination is carried as the first 4 bytes of an
//!   [`Address`] with the remainder zeroed. A derived overlay address can
//!   never take that form, so IPv4 traffic is only ever admitted through
//!   the static route table.
//! - A [`Subnet`] is stored normalized: bytes 8..16 are always zero. A
//!   candidate extracted from packet bytes is normalized on construction,
//!   so byte equality against a derived subnet is meaningful.

use std::net::Ipv6Addr;

use ed25519_dalek::VerifyingKey;

/// Length of a peer key in bytes (Ed25519 public key).
pub const PEER_KEY_LEN: usize = 32;

/// Length of an overlay address or subnet value in bytes.
pub const ADDRESS_LEN: usize = 16;

/// Number of leading bytes of a [`Subnet`] that carry the prefix.
pub const SUBNET_PREFIX_LEN: usize = 8;

/// A mesh peer's identity: its 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerKey([u8; PEER_KEY_LEN]);

impl PeerKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; PEER_KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != PEER_KEY_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; PEER_KEY_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Interpret the key bytes as an Ed25519 verifying key.
    ///
    /// Returns `None` when the bytes are not a valid curve point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::try_from(self.0.as_slice()).ok()
    }
}

impl std::fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerKey({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; PEER_KEY_LEN]> for PeerKey {
    fn from(bytes: [u8; PEER_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A host address on the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Carry an IPv4 address in the leading 4 bytes, remainder zero.
    #[inline]
    pub fn from_ipv4(octets: [u8; 4]) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[..4].copy_from_slice(&octets);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", Ipv6Addr::from(self.0))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Ipv6Addr::from(self.0))
    }
}

impl From<[u8; ADDRESS_LEN]> for Address {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

/// A /64-style prefix on the overlay, stored with the host half zeroed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet([u8; ADDRESS_LEN]);

impl Subnet {
    /// Build a subnet value from 16 raw bytes, zeroing the host half.
    ///
    /// Both derived subnets and candidates extracted from packets go
    /// through this, so equality compares prefixes only.
    #[inline]
    pub fn from_prefix(mut bytes: [u8; ADDRESS_LEN]) -> Self {
        for b in &mut bytes[SUBNET_PREFIX_LEN..] {
            *b = 0;
        }
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// The prefix half of the subnet value.
    #[inline]
    pub fn prefix(&self) -> &[u8] {
        &self.0[..SUBNET_PREFIX_LEN]
    }
}

impl std::fmt::Debug for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subnet({}/64)", Ipv6Addr::from(self.0))
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/64", Ipv6Addr::from(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_key_hex_roundtrip() {
        let key = PeerKey::from_bytes([0xab; 32]);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PeerKey::from_hex(&hex).expect("hex decode failed"), key);
    }

    #[test]
    fn peer_key_hex_rejects_bad_input() {
        assert!(PeerKey::from_hex("abcd").is_err());
        assert!(PeerKey::from_hex(&"a".repeat(70)).is_err());
        assert!(PeerKey::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn ipv4_address_is_padded() {
        let addr = Address::from_ipv4([10, 1, 2, 3]);
        let bytes = addr.as_bytes();
        assert_eq!(&bytes[..4], &[10, 1, 2, 3]);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn subnet_construction_zeroes_host_half() {
        let raw = [0xff; 16];
        let subnet = Subnet::from_prefix(raw);
        assert_eq!(&subnet.as_bytes()[..8], &[0xff; 8]);
        assert_eq!(&subnet.as_bytes()[8..], &[0u8; 8]);
    }

    #[test]
    fn subnet_equality_ignores_host_bits() {
        let mut a = [0x20; 16];
        let mut b = [0x20; 16];
        a[12] = 0x01;
        b[12] = 0x99;
        assert_eq!(Subnet::from_prefix(a), Subnet::from_prefix(b));
    }

    #[test]
    fn padded_ipv4_never_equals_full_address() {
        let v4 = Address::from_ipv4([10, 0, 0, 1]);
        let full = Address::from_bytes([0x0a, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_ne!(v4, full);
    }
}
