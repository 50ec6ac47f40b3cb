//! RTMFP packet protection.
//!
//! Every datagram is AES-128-CBC encrypted with a zero IV after a 4-byte
//! scrambled session id. The decrypted body starts with a 16-bit checksum
//! over the rest of the plaintext. Handshake traffic (session id 0) uses a
//! process-wide default key; established sessions use per-direction keys
//! derived in [`crate::crypto`].

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use zeroize::Zeroize;

use crate::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Largest datagram the engine produces, plaintext size before encryption.
pub const RTMFP_MAX_PACKET_SIZE: usize = 1192;

/// Bytes consumed by id, checksum, marker, time and echo-time.
pub const RTMFP_HEADER_SIZE: usize = 11;

/// The id and checksum slots at the front of an outgoing packet. They are
/// filled in by [`encrypt`]; everything the session writes starts after
/// them.
pub const CRYPTO_HOLE: usize = 6;

/// Key of the default cipher used for all handshake packets.
pub const DEFAULT_KEY: &[u8; 16] = b"Adobe Systems 02";

const BLOCK: usize = 16;

/// One direction of a session's packet protection.
///
/// Contexts are never shared between sessions; the default handshake
/// context is recreated from [`DEFAULT_KEY`] wherever needed.
pub struct CipherContext {
    key: [u8; 16],
}

impl CipherContext {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// The context every packet with session id zero uses.
    pub fn default_handshake() -> Self {
        Self { key: *DEFAULT_KEY }
    }

    fn encrypt_blocks(&self, data: &mut [u8]) {
        debug_assert!(data.len() % BLOCK == 0);
        let iv = [0u8; BLOCK];
        let mut enc = Aes128CbcEnc::new((&self.key).into(), (&iv).into());
        for block in data.chunks_exact_mut(BLOCK) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    fn decrypt_blocks(&self, data: &mut [u8]) {
        debug_assert!(data.len() % BLOCK == 0);
        let iv = [0u8; BLOCK];
        let mut dec = Aes128CbcDec::new((&self.key).into(), (&iv).into());
        for block in data.chunks_exact_mut(BLOCK) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

impl Drop for CipherContext {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext").finish()
    }
}

/// 16-bit one's-complement fold over big-endian words. A trailing odd
/// byte is added as-is.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for pair in data.chunks(2) {
        sum += if pair.len() == 2 {
            u32::from(u16::from_be_bytes([pair[0], pair[1]]))
        } else {
            u32::from(pair[0])
        };
    }
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;
    !(sum as u16)
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Recover the session id a datagram is addressed to, without decrypting.
///
/// The id word is XORed with the first two ciphertext words, so the same
/// fold recovers it.
pub fn session_id_of(packet: &[u8]) -> Result<u32, Error> {
    if packet.len() < 4 + BLOCK {
        return Err(Error::MalformedPacket("short packet"));
    }
    if (packet.len() - 4) % BLOCK != 0 {
        return Err(Error::MalformedPacket("bad length"));
    }
    Ok(be32(&packet[0..4]) ^ be32(&packet[4..8]) ^ be32(&packet[8..12]))
}

/// Decrypt a datagram body and verify its checksum.
///
/// Returns the plaintext content starting at the marker byte. Trailing
/// 0xFF padding is left in place; the chunk parser treats it as the end
/// of the chain.
pub fn decrypt(ctx: &CipherContext, packet: &[u8]) -> Result<Vec<u8>, Error> {
    if packet.len() < 4 + BLOCK || (packet.len() - 4) % BLOCK != 0 {
        return Err(Error::MalformedPacket("bad length"));
    }

    let mut body = packet[4..].to_vec();
    ctx.decrypt_blocks(&mut body);

    let expected = u16::from_be_bytes([body[0], body[1]]);
    if checksum(&body[2..]) != expected {
        return Err(Error::MalformedPacket("checksum"));
    }

    body.drain(..2);
    Ok(body)
}

/// Seal a packet built with a [`CRYPTO_HOLE`] prefix: pad, checksum,
/// encrypt, scramble the id word.
pub fn encrypt(ctx: &CipherContext, far_id: u32, mut packet: Vec<u8>) -> Vec<u8> {
    debug_assert!(packet.len() >= CRYPTO_HOLE);

    while (packet.len() - 4) % BLOCK != 0 {
        packet.push(0xFF);
    }

    let sum = checksum(&packet[CRYPTO_HOLE..]);
    packet[4..6].copy_from_slice(&sum.to_be_bytes());

    ctx.encrypt_blocks(&mut packet[4..]);

    let id = far_id ^ be32(&packet[4..8]) ^ be32(&packet[8..12]);
    packet[0..4].copy_from_slice(&id.to_be_bytes());

    packet
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet_with_content(content: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; CRYPTO_HOLE];
        p.extend_from_slice(content);
        p
    }

    #[test]
    fn checksum_folds_carries() {
        assert_eq!(checksum(&[]), 0xFFFF);
        // 0xFFFF + 0x0001 = 0x10000 -> carry fold -> 1
        assert_eq!(checksum(&[0xFF, 0xFF, 0x00, 0x01]), !1u16);
    }

    #[test]
    fn checksum_odd_byte() {
        // 0x0102 + 0x03
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), !(0x0102u16 + 0x03));
    }

    #[test]
    fn round_trip_default_cipher() {
        let ctx = CipherContext::default_handshake();
        let content = [0x0B, 0x00, 0x01, 0x30, 0x00, 0x02, 0xAB, 0xCD];

        let wire = encrypt(&ctx, 0, packet_with_content(&content));
        assert_eq!((wire.len() - 4) % 16, 0);

        assert_eq!(session_id_of(&wire).unwrap(), 0);

        let plain = decrypt(&ctx, &wire).unwrap();
        assert_eq!(&plain[..content.len()], &content);
        // Padding is all 0xFF
        assert!(plain[content.len()..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn session_id_survives_scramble() {
        let ctx = CipherContext::new([7u8; 16]);
        let wire = encrypt(&ctx, 0xDEAD_BEEF, packet_with_content(&[0x89, 0, 0, 0, 0]));
        assert_eq!(session_id_of(&wire).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn tampering_fails_checksum() {
        let ctx = CipherContext::default_handshake();
        let mut wire = encrypt(&ctx, 0, packet_with_content(&[0x0B, 0, 0, 0x01, 0, 0]));
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(
            decrypt(&ctx, &wire),
            Err(Error::MalformedPacket("checksum"))
        ));
    }

    #[test]
    fn wrong_key_fails_checksum() {
        let ctx = CipherContext::default_handshake();
        let other = CipherContext::new([1u8; 16]);
        let wire = encrypt(&ctx, 0, packet_with_content(&[0x0B, 0, 0, 0x01, 0, 0]));
        assert!(decrypt(&other, &wire).is_err());
    }

    #[test]
    fn short_packet_rejected() {
        assert!(session_id_of(&[0u8; 10]).is_err());
        let ctx = CipherContext::default_handshake();
        assert!(decrypt(&ctx, &[0u8; 21]).is_err());
    }
}
