//! The packet under construction for one session.

use crate::codec::{self, CipherContext, CRYPTO_HOLE, RTMFP_MAX_PACKET_SIZE};
use crate::message::{write_chunk, PacketHeader};

/// Accumulates chunks for the next datagram. Exactly one sender is live
/// per session at a time; sealing it produces the encrypted wire bytes.
#[derive(Debug)]
pub struct Sender {
    far_id: u32,
    buf: Vec<u8>,
}

impl Sender {
    pub fn new(far_id: u32, header: PacketHeader) -> Self {
        let mut buf = Vec::with_capacity(RTMFP_MAX_PACKET_SIZE);
        buf.resize(CRYPTO_HOLE, 0);
        header.serialize(&mut buf);
        Self { far_id, buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Room left for chunks, headers included.
    pub fn available(&self) -> usize {
        RTMFP_MAX_PACKET_SIZE.saturating_sub(self.buf.len())
    }

    /// True if a chunk with `payload_len` bytes still fits.
    pub fn fits(&self, payload_len: usize) -> bool {
        payload_len + 3 <= self.available()
    }

    pub fn write_chunk(&mut self, kind: u8, payload: &[u8]) {
        debug_assert!(self.fits(payload.len()));
        write_chunk(&mut self.buf, kind, payload);
    }

    /// Pad, checksum, encrypt and scramble. Consumes the sender.
    pub fn seal(self, cipher: &CipherContext) -> Vec<u8> {
        codec::encrypt(cipher, self.far_id, self.buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::RTMFP_HEADER_SIZE;
    use crate::message::MARKER_AMF;

    #[test]
    fn accounts_for_header_and_chunks() {
        let header = PacketHeader {
            marker: MARKER_AMF,
            time: 0,
            echo_time: None,
        };
        let mut s = Sender::new(5, header);
        // id + checksum + marker + time; no echo on 0x89
        assert_eq!(s.len(), RTMFP_HEADER_SIZE - 2);

        s.write_chunk(0x01, &[]);
        assert_eq!(s.len(), RTMFP_HEADER_SIZE - 2 + 3);
        assert!(s.available() < RTMFP_MAX_PACKET_SIZE);
    }

    #[test]
    fn seal_produces_decodable_packet() {
        let header = PacketHeader {
            marker: MARKER_AMF,
            time: 7,
            echo_time: None,
        };
        let mut s = Sender::new(42, header);
        s.write_chunk(0x01, &[]);

        let cipher = CipherContext::default_handshake();
        let wire = s.seal(&cipher);

        assert_eq!(codec::session_id_of(&wire).unwrap(), 42);
        let plain = codec::decrypt(&cipher, &wire).unwrap();
        assert_eq!(plain[0], MARKER_AMF);
    }
}
