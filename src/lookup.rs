//! Out-of-band key lookup wire format.
//!
//! Key discovery runs over the mesh core's out-of-band channel as single
//! 65-byte frames:
//!
//! ```text
//! [ type : u8 ][ signature : 64 bytes ]
//! ```
//!
//! | Type | Meaning |
//! |------|---------|
//! | `0x00` | Reserved, ignored |
//! | `0x01` | Key lookup: signature covers the addressed key's bytes |
//! | `0x02` | Key response: signature covers the addressed key's bytes |
//!
//! The signature binds each frame to the key it was sent to, so an
//! observer cannot replay a captured lookup or response toward an
//! unrelated destination and cause spurious learning. Frames of any other
//! length, unknown type, or with a signature that does not verify are
//! dropped without a reply.
//!
//! This module is the pure codec; the receive rules live on
//! [`KeyStore::handle_oob`](crate::keystore::KeyStore::handle_oob).

use ed25519_dalek::{SIGNATURE_LENGTH, Signature, Signer, SigningKey};

use crate::addr::PeerKey;

/// Reserved frame type, never sent.
pub const TYPE_KEY_DUMMY: u8 = 0x00;
/// Request to learn the key behind a target address or subnet.
pub const TYPE_KEY_LOOKUP: u8 = 0x01;
/// Reply to a lookup the receiver considers directed at itself.
pub const TYPE_KEY_RESPONSE: u8 = 0x02;

/// Exact length of every lookup protocol frame.
pub const OOB_FRAME_LEN: usize = 1 + SIGNATURE_LENGTH;

/// Build a key lookup frame addressed to `partial`.
pub fn lookup_frame(signing: &SigningKey, partial: &PeerKey) -> Vec<u8> {
    seal(TYPE_KEY_LOOKUP, signing, partial)
}

/// Build a key response frame addressed to `dest`.
pub fn response_frame(signing: &SigningKey, dest: &PeerKey) -> Vec<u8> {
    seal(TYPE_KEY_RESPONSE, signing, dest)
}

fn seal(frame_type: u8, signing: &SigningKey, target: &PeerKey) -> Vec<u8> {
    let sig = signing.sign(target.as_bytes());
    let mut frame = Vec::with_capacity(OOB_FRAME_LEN);
    frame.push(frame_type);
    frame.extend_from_slice(&sig.to_bytes());
    frame
}

/// Verify that `sig` is `from`'s signature over the addressed key.
///
/// `addressed` is the key the frame was sent to, as reported by the mesh
/// core. Returns `false` for malformed signatures or keys that are not
/// valid curve points.
pub fn verify(from: &PeerKey, addressed: &PeerKey, sig: &[u8]) -> bool {
    let Some(verifying) = from.verifying_key() else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(sig) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying
        .verify_strict(addressed.as_bytes(), &signature)
        .is_ok()
}
