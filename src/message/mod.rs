//! Wire format of decrypted RTMFP packets.
//!
//! A packet body is `marker:u8, time:u16, [echo:u16]` followed by a chain
//! of chunks, each `kind:u8, size:u16, payload`. A kind byte of 0xFF is
//! not a chunk: it is the encryption padding and terminates the chain.

mod handshake;
pub use handshake::{
    read_address, write_address, AddressExchange, AddressKind, Challenge70, Commit38, Complete78,
    Hello30, Redirect71, EPD_PEER_ID, EPD_URL, INITIATOR_NONCE_PREFIX, INITIATOR_NONCE_SUFFIX,
    RESPONDER_NONCE_PREFIX,
};

mod flowmsg;
pub use flowmsg::{
    frag_flags, parse_fragment, parse_fragment_next, parse_id_chunk, write_ack,
    write_fragment_header, Ack, FragmentChunk,
};

use nom::number::complete::{be_u16, u8 as nom_u8};
use nom::IResult;

use crate::Error;

/// Handshake packets (session id zero).
pub const MARKER_HANDSHAKE: u8 = 0x0B;
/// Established session, AMF traffic.
pub const MARKER_AMF: u8 = 0x89;
/// Established session, raw traffic.
pub const MARKER_RAW: u8 = 0x09;
/// Established session, carrying an echo of the peer's last time.
pub const MARKER_ECHO: u8 = 0x4A;

/// Chunk kinds inside a session packet.
pub mod chunk {
    pub const KEEPALIVE: u8 = 0x01;
    pub const KEEPALIVE_ECHO: u8 = 0x41;
    pub const FRAGMENT: u8 = 0x10;
    pub const FRAGMENT_NEXT: u8 = 0x11;
    pub const ACK: u8 = 0x51;
    pub const NACK: u8 = 0x18;
    pub const FAILURE: u8 = 0x0C;
    pub const ADDRESS_EXCHANGE: u8 = 0x0F;
    pub const SESSION_CLOSE: u8 = 0x4C;
    pub const WRITER_FAILED: u8 = 0x5E;
    pub const DIAGNOSTIC: u8 = 0xCC;

    // Handshake packets carry their own chunk set.
    pub const HELLO: u8 = 0x30;
    pub const CHALLENGE: u8 = 0x70;
    pub const COMMIT: u8 = 0x38;
    pub const COMPLETE: u8 = 0x78;
    pub const REDIRECT: u8 = 0x71;
}

/// Marker, peer send time and optional echo of our time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub marker: u8,
    pub time: u16,
    pub echo_time: Option<u16>,
}

impl PacketHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], PacketHeader> {
        let (input, marker) = nom_u8(input)?;
        let (input, time) = be_u16(input)?;
        let (input, echo_time) = if marker == MARKER_ECHO {
            let (input, echo) = be_u16(input)?;
            (input, Some(echo))
        } else {
            (input, None)
        };
        Ok((
            input,
            PacketHeader {
                marker,
                time,
                echo_time,
            },
        ))
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.marker);
        out.extend_from_slice(&self.time.to_be_bytes());
        if let Some(echo) = self.echo_time {
            debug_assert_eq!(self.marker, MARKER_ECHO);
            out.extend_from_slice(&echo.to_be_bytes());
        }
    }
}

/// One chunk of a packet's chain.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub kind: u8,
    pub payload: &'a [u8],
}

/// Parse the whole chunk chain. Stops at 0xFF (padding) or end of input;
/// a chunk whose declared size overruns the input is a malformed packet.
pub fn parse_chunks(mut input: &[u8]) -> Result<Vec<Chunk<'_>>, Error> {
    let mut chunks = Vec::new();

    while let Some((&kind, rest)) = input.split_first() {
        if kind == 0xFF {
            break;
        }
        if rest.len() < 2 {
            return Err(Error::MalformedPacket("chunk header"));
        }
        let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2..];
        if rest.len() < size {
            return Err(Error::MalformedPacket("chunk size"));
        }
        chunks.push(Chunk {
            kind,
            payload: &rest[..size],
        });
        input = &rest[size..];
    }

    Ok(chunks)
}

/// Append one chunk to an outgoing packet.
pub fn write_chunk(out: &mut Vec<u8>, kind: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip_plain() {
        let h = PacketHeader {
            marker: MARKER_AMF,
            time: 0x1234,
            echo_time: None,
        };
        let mut buf = Vec::new();
        h.serialize(&mut buf);
        let (rest, parsed) = PacketHeader::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, h);
    }

    #[test]
    fn header_round_trip_echo() {
        let h = PacketHeader {
            marker: MARKER_ECHO,
            time: 10,
            echo_time: Some(7),
        };
        let mut buf = Vec::new();
        h.serialize(&mut buf);
        let (_, parsed) = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed.echo_time, Some(7));
    }

    #[test]
    fn chain_stops_at_padding() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, chunk::KEEPALIVE, &[]);
        write_chunk(&mut buf, chunk::ACK, &[1, 2, 3]);
        buf.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

        let chunks = parse_chunks(&buf).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, chunk::KEEPALIVE);
        assert_eq!(chunks[1].payload, &[1, 2, 3]);
    }

    #[test]
    fn chain_sizes_account_for_packet() {
        // Sum of payload sizes + 3-byte headers equals the chain length.
        let mut buf = Vec::new();
        write_chunk(&mut buf, 0x10, &[0u8; 20]);
        write_chunk(&mut buf, 0x51, &[0u8; 4]);

        let chunks = parse_chunks(&buf).unwrap();
        let total: usize = chunks.iter().map(|c| c.payload.len() + 3).sum();
        assert_eq!(total, buf.len());
    }

    #[test]
    fn truncated_chunk_is_malformed() {
        let buf = [0x10, 0x00, 0x05, 0x01];
        assert!(parse_chunks(&buf).is_err());
        let buf = [0x10, 0x00];
        assert!(parse_chunks(&buf).is_err());
    }
}
