//! Key agreement and derivation for RTMFP sessions.
//!
//! A session's packet keys come out of a two-phase exchange: classic
//! Diffie-Hellman over RFC 2409 group 2 produces a 128-byte shared
//! secret, then two HMAC-SHA256 reductions over the handshake nonces
//! turn it into one 16-byte AES key per direction.

mod dh;
mod keying;

pub use dh::{DiffieHellman, DH_KEY_SIZE};
pub use keying::{derive_session_keys, hmac_sha256, SessionKeys};

use sha2::{Digest, Sha256};

use crate::util::write_vlu;

/// Size of an RTMFP peer id.
pub const PEER_ID_SIZE: usize = 32;

/// Compute a peer id from a DH public key.
///
/// The digest covers the handshake key block exactly as it appears in a
/// 38 message: the inner length prefix, the `1D 02` group marker, then
/// the key itself. Existing peers hash the same bytes.
pub fn peer_id(public_key: &[u8]) -> [u8; PEER_ID_SIZE] {
    let mut block = Vec::with_capacity(public_key.len() + 4);
    write_vlu(&mut block, public_key.len() as u64 + 2);
    block.push(0x1D);
    block.push(0x02);
    block.extend_from_slice(public_key);

    let digest = Sha256::digest(&block);
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(&digest);
    id
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_id_is_stable_and_key_dependent() {
        let key_a = [0x11u8; 128];
        let key_b = [0x22u8; 128];

        assert_eq!(peer_id(&key_a), peer_id(&key_a));
        assert_ne!(peer_id(&key_a), peer_id(&key_b));
    }
}
