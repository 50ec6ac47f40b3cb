//! Reliable-flow chunks: 0x10/0x11 fragments and 0x51 acknowledgments.

use nom::bytes::complete::take;
use nom::number::complete::u8 as nom_u8;

use crate::util::{vlu, write_vlu};
use crate::Error;

/// Per-fragment flag bits.
pub mod frag_flags {
    /// The fragment carries the flow header (signature, writer ref).
    pub const HEADER: u8 = 0x80;
    /// The message continues in the preceding stage.
    pub const WITH_BEFORE: u8 = 0x20;
    /// The message continues in the following stage.
    pub const WITH_AFTER: u8 = 0x10;
    /// The sender gave up on this message; the stage counts but carries
    /// nothing.
    pub const ABANDON: u8 = 0x02;
    /// Final stage of the flow.
    pub const END: u8 = 0x01;
}

/// A parsed 0x10 chunk.
#[derive(Debug, PartialEq, Eq)]
pub struct FragmentChunk<'a> {
    pub flags: u8,
    pub flow_id: u64,
    pub stage: u64,
    pub delta_nack: u64,
    pub signature: Option<&'a [u8]>,
    pub writer_ref: Option<u64>,
    pub payload: &'a [u8],
}

/// Parse a 0x10 fragment chunk payload.
///
/// The wire carries `stage` and `deltaNAck` as written; 0x11
/// continuations increment them, which the session tracks across the
/// chain.
pub fn parse_fragment(input: &[u8]) -> Result<FragmentChunk<'_>, Error> {
    let (input, flags) = nom_u8(input)?;
    let (input, flow_id) = vlu(input)?;
    let (input, stage) = vlu(input)?;
    let (mut input, delta_nack) = vlu(input)?;

    let mut signature = None;
    let mut writer_ref = None;

    if flags & frag_flags::HEADER != 0 {
        let (rest, sig_len) = nom_u8(input)?;
        let (rest, sig) = take(sig_len as usize)(rest)?;
        signature = Some(sig);
        input = rest;

        // Optional header parts, each length-prefixed, terminated by a
        // zero length. 0x0A introduces the full-duplex writer reference.
        loop {
            let (rest, part_len) = nom_u8(input)?;
            input = rest;
            if part_len == 0 {
                break;
            }
            let (rest, part) = take(part_len as usize)(input)?;
            input = rest;
            if part[0] == 0x0A {
                if let Ok((_, r)) = vlu(&part[1..]) {
                    writer_ref = Some(r);
                }
            } else {
                debug!("unknown header part 0x{:02x} on flow {}", part[0], flow_id);
            }
        }
    }

    Ok(FragmentChunk {
        flags,
        flow_id,
        stage,
        delta_nack,
        signature,
        writer_ref,
        payload: input,
    })
}

/// Parse a 0x11 continuation payload: the flags byte and the body. Flow
/// id, stage and delta carry over from the previous fragment, plus one.
pub fn parse_fragment_next(input: &[u8]) -> Result<(u8, &[u8]), Error> {
    let (input, flags) = nom_u8(input)?;
    Ok((flags, input))
}

/// Serialize a 0x10 fragment header into `out`. The payload follows
/// separately.
pub fn write_fragment_header(
    out: &mut Vec<u8>,
    mut flags: u8,
    flow_id: u64,
    stage: u64,
    delta_nack: u64,
    header: Option<(&[u8], Option<u64>)>,
) {
    if header.is_some() {
        flags |= frag_flags::HEADER;
    }
    out.push(flags);
    write_vlu(out, flow_id);
    write_vlu(out, stage);
    write_vlu(out, delta_nack);

    if let Some((signature, writer_ref)) = header {
        out.push(signature.len() as u8);
        out.extend_from_slice(signature);
        if let Some(r) = writer_ref {
            out.push(1 + crate::util::vlu_size(r) as u8);
            out.push(0x0A);
            write_vlu(out, r);
        }
        out.push(0);
    }
}

/// A 0x51 acknowledgment: cumulative stage plus `(lost, received)` runs
/// describing holes past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub flow_id: u64,
    pub buffers_available: u64,
    pub cumulative: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl Ack {
    pub fn parse(input: &[u8]) -> Result<Ack, Error> {
        let (input, flow_id) = vlu(input)?;
        let (input, buffers_available) = vlu(input)?;
        let (mut input, cumulative) = vlu(input)?;

        let mut ranges = Vec::new();
        while !input.is_empty() && input[0] != 0xFF {
            let (rest, lost) = vlu(input)?;
            let (rest, received) = vlu(rest)?;
            ranges.push((lost, received));
            input = rest;
        }

        Ok(Ack {
            flow_id,
            buffers_available,
            cumulative,
            ranges,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        write_vlu(out, self.flow_id);
        write_vlu(out, self.buffers_available);
        write_vlu(out, self.cumulative);
        for (lost, received) in &self.ranges {
            write_vlu(out, *lost);
            write_vlu(out, *received);
        }
    }
}

/// Convenience for the common ack-with-no-ranges case.
pub fn write_ack(out: &mut Vec<u8>, flow_id: u64, cumulative: u64, ranges: &[(u64, u64)]) {
    let ack = Ack {
        flow_id,
        buffers_available: 0x7F,
        cumulative,
        ranges: ranges.to_vec(),
    };
    ack.serialize(out);
}

/// 0x5E / 0x18 both carry just a 7-bit id.
pub fn parse_id_chunk(input: &[u8]) -> Result<u64, Error> {
    let (_, id) = vlu(input)?;
    Ok(id)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragment_without_header_round_trip() {
        let mut buf = Vec::new();
        write_fragment_header(&mut buf, frag_flags::END, 2, 5, 3, None);
        buf.extend_from_slice(b"payload");

        let frag = parse_fragment(&buf).unwrap();
        assert_eq!(frag.flags, frag_flags::END);
        assert_eq!(frag.flow_id, 2);
        assert_eq!(frag.stage, 5);
        assert_eq!(frag.delta_nack, 3);
        assert_eq!(frag.signature, None);
        assert_eq!(frag.payload, b"payload");
    }

    #[test]
    fn fragment_with_header_round_trip() {
        let sig = [0x00, 0x54, 0x43, 0x04, 0x00];
        let mut buf = Vec::new();
        write_fragment_header(&mut buf, 0, 2, 1, 1, Some((&sig, Some(3))));
        buf.extend_from_slice(&[0xAA]);

        let frag = parse_fragment(&buf).unwrap();
        assert!(frag.flags & frag_flags::HEADER != 0);
        assert_eq!(frag.signature, Some(&sig[..]));
        assert_eq!(frag.writer_ref, Some(3));
        assert_eq!(frag.payload, &[0xAA]);
    }

    #[test]
    fn fragment_header_without_ref() {
        let sig = [0x00, 0x47, 0x43, 0x01, 0x00];
        let mut buf = Vec::new();
        write_fragment_header(&mut buf, 0, 4, 1, 1, Some((&sig, None)));

        let frag = parse_fragment(&buf).unwrap();
        assert_eq!(frag.signature, Some(&sig[..]));
        assert_eq!(frag.writer_ref, None);
        assert!(frag.payload.is_empty());
    }

    #[test]
    fn ack_round_trip() {
        let ack = Ack {
            flow_id: 2,
            buffers_available: 0x7F,
            cumulative: 3,
            ranges: vec![(1, 2), (4, 1)],
        };
        let mut buf = Vec::new();
        ack.serialize(&mut buf);
        assert_eq!(Ack::parse(&buf).unwrap(), ack);
    }

    #[test]
    fn truncated_fragment_rejected() {
        assert!(parse_fragment(&[]).is_err());
        assert!(parse_fragment(&[0x80, 0x02, 0x01]).is_err());
    }
}
