//! Bodies of the handshake chunks: 30, 70, 38, 78 and 71, plus the
//! session-level 0x0F address exchange that starts a p2p rendezvous.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32, u8 as nom_u8};
use nom::IResult;

use crate::crypto::PEER_ID_SIZE;
use crate::util::{vlu, write_vlu};
use crate::Error;

/// EPD discriminator: the value is an rtmfp:// URL.
pub const EPD_URL: u8 = 0x0A;
/// EPD discriminator: the value is a 32-byte peer id.
pub const EPD_PEER_ID: u8 = 0x0F;

/// Fixed prefix of the initiator nonce sent in a 38.
pub const INITIATOR_NONCE_PREFIX: [u8; 5] = [0x02, 0x1D, 0x02, 0x41, 0x0E];
/// Fixed suffix of the initiator nonce.
pub const INITIATOR_NONCE_SUFFIX: [u8; 7] = [0x03, 0x1A, 0x02, 0x0A, 0x02, 0x1E, 0x02];
/// Fixed prefix of the responder nonce sent in a 78.
pub const RESPONDER_NONCE_PREFIX: [u8; 9] = [0x03, 0x1A, 0x00, 0x00, 0x02, 0x1E, 0x00, 0x41, 0x0E];

const KEY_GROUP_MARKER: [u8; 2] = [0x1D, 0x02];

/// Whether an advertised address is the peer's own interface or its
/// publicly visible mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Local,
    Public,
}

impl AddressKind {
    fn from_flag(flag: u8) -> AddressKind {
        if flag & 0x0F == 0x01 {
            AddressKind::Local
        } else {
            AddressKind::Public
        }
    }

    fn flag(&self) -> u8 {
        match self {
            AddressKind::Local => 0x01,
            AddressKind::Public => 0x02,
        }
    }
}

/// Read one address entry: `flag:u8` (0x80 set means IPv6), ip, `port:u16`.
pub fn read_address(input: &[u8]) -> IResult<&[u8], (AddressKind, SocketAddr)> {
    let (input, flag) = nom_u8(input)?;
    let (input, ip) = if flag & 0x80 != 0 {
        let (input, bytes) = take(16usize)(input)?;
        let mut v6 = [0u8; 16];
        v6.copy_from_slice(bytes);
        (input, IpAddr::V6(Ipv6Addr::from(v6)))
    } else {
        let (input, bytes) = take(4usize)(input)?;
        let v4 = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        (input, IpAddr::V4(v4))
    };
    let (input, port) = be_u16(input)?;
    Ok((input, (AddressKind::from_flag(flag), SocketAddr::new(ip, port))))
}

/// Append one address entry.
pub fn write_address(out: &mut Vec<u8>, kind: AddressKind, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(kind.flag());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(kind.flag() | 0x80);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Initial probe: endpoint discriminator plus the initiator's tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello30 {
    pub epd_kind: u8,
    pub epd: Vec<u8>,
    pub tag: [u8; 16],
}

impl Hello30 {
    pub fn parse(input: &[u8]) -> Result<Hello30, Error> {
        let (input, len) = vlu(input)?;
        if len == 0 {
            return Err(Error::MalformedPacket("empty epd"));
        }
        let (input, epd_kind) = nom_u8(input)?;
        let (input, epd) = take(len as usize - 1)(input)?;
        let (_, tag) = take(16usize)(input)?;

        let mut tag_arr = [0u8; 16];
        tag_arr.copy_from_slice(tag);
        Ok(Hello30 {
            epd_kind,
            epd: epd.to_vec(),
            tag: tag_arr,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        write_vlu(out, self.epd.len() as u64 + 1);
        out.push(self.epd_kind);
        out.extend_from_slice(&self.epd);
        out.extend_from_slice(&self.tag);
    }
}

/// Challenge: tag echo, cookie and the responder's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge70 {
    pub tag: [u8; 16],
    pub cookie: Vec<u8>,
    pub far_key: Vec<u8>,
}

impl Challenge70 {
    pub fn parse(input: &[u8]) -> Result<Challenge70, Error> {
        let (input, tag_len) = nom_u8(input)?;
        if tag_len != 16 {
            return Err(Error::MalformedPacket("tag size"));
        }
        let (input, tag) = take(16usize)(input)?;
        let (input, cookie_len) = nom_u8(input)?;
        let (input, cookie) = take(cookie_len as usize)(input)?;
        let (input, block_len) = vlu(input)?;
        let (_, block) = take(block_len as usize)(input)?;

        // Servers prefix the key with the 1D 02 group marker.
        let far_key = if block.len() > 2 && block[..2] == KEY_GROUP_MARKER {
            block[2..].to_vec()
        } else {
            block.to_vec()
        };

        let mut tag_arr = [0u8; 16];
        tag_arr.copy_from_slice(tag);
        Ok(Challenge70 {
            tag: tag_arr,
            cookie: cookie.to_vec(),
            far_key,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(16);
        out.extend_from_slice(&self.tag);
        out.push(self.cookie.len() as u8);
        out.extend_from_slice(&self.cookie);
        write_vlu(out, self.far_key.len() as u64 + 2);
        out.extend_from_slice(&KEY_GROUP_MARKER);
        out.extend_from_slice(&self.far_key);
    }
}

/// Key commit: the initiator's session id, the echoed cookie, its public
/// key and nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit38 {
    pub initiator_id: u32,
    pub cookie: Vec<u8>,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl Commit38 {
    pub fn parse(input: &[u8]) -> Result<Commit38, Error> {
        let (input, initiator_id) = be_u32(input)?;
        let (input, cookie_len) = vlu(input)?;
        let (input, cookie) = take(cookie_len as usize)(input)?;
        let (input, _outer) = vlu(input)?;
        let (input, inner) = vlu(input)?;
        if inner < 2 {
            return Err(Error::MalformedPacket("key block"));
        }
        let (input, marker) = take(2usize)(input)?;
        if marker != KEY_GROUP_MARKER {
            return Err(Error::MalformedPacket("key group"));
        }
        let (input, public_key) = take(inner as usize - 2)(input)?;
        let (input, nonce_len) = vlu(input)?;
        let (_, nonce) = take(nonce_len as usize)(input)?;

        Ok(Commit38 {
            initiator_id,
            cookie: cookie.to_vec(),
            public_key: public_key.to_vec(),
            nonce: nonce.to_vec(),
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.initiator_id.to_be_bytes());
        write_vlu(out, self.cookie.len() as u64);
        out.extend_from_slice(&self.cookie);
        write_vlu(out, self.public_key.len() as u64 + 4);
        write_vlu(out, self.public_key.len() as u64 + 2);
        out.extend_from_slice(&KEY_GROUP_MARKER);
        out.extend_from_slice(&self.public_key);
        write_vlu(out, self.nonce.len() as u64);
        out.extend_from_slice(&self.nonce);
        out.push(0x58);
    }
}

/// Completion: the responder's session id and nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complete78 {
    pub responder_id: u32,
    pub nonce: Vec<u8>,
}

impl Complete78 {
    pub fn parse(input: &[u8]) -> Result<Complete78, Error> {
        let (input, responder_id) = be_u32(input)?;
        let (input, nonce_len) = vlu(input)?;
        let (_, nonce) = take(nonce_len as usize)(input)?;
        Ok(Complete78 {
            responder_id,
            nonce: nonce.to_vec(),
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.responder_id.to_be_bytes());
        write_vlu(out, self.nonce.len() as u64);
        out.extend_from_slice(&self.nonce);
        out.push(0x58);
    }
}

/// Server redirection: alternative addresses to probe for the same tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect71 {
    pub tag: [u8; 16],
    pub addresses: Vec<(AddressKind, SocketAddr)>,
}

impl Redirect71 {
    pub fn parse(input: &[u8]) -> Result<Redirect71, Error> {
        let (input, tag_len) = nom_u8(input)?;
        if tag_len != 16 {
            return Err(Error::MalformedPacket("tag size"));
        }
        let (mut input, tag) = take(16usize)(input)?;

        let mut addresses = Vec::new();
        while input.len() >= 7 {
            let (rest, entry) = read_address(input)?;
            addresses.push(entry);
            input = rest;
        }

        let mut tag_arr = [0u8; 16];
        tag_arr.copy_from_slice(tag);
        Ok(Redirect71 {
            tag: tag_arr,
            addresses,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(16);
        out.extend_from_slice(&self.tag);
        for (kind, addr) in &self.addresses {
            write_address(out, *kind, addr);
        }
    }
}

/// Session-level 0x0F: the server tells us a peer is about to contact us
/// (or that we should contact it), with the peer's id, its addresses and
/// the rendezvous tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressExchange {
    pub peer_id: [u8; PEER_ID_SIZE],
    pub addresses: Vec<(AddressKind, SocketAddr)>,
    pub tag: [u8; 16],
}

const EXCHANGE_MARKER: [u8; 3] = [0x22, 0x21, 0x0F];

impl AddressExchange {
    pub fn parse(input: &[u8]) -> Result<AddressExchange, Error> {
        let (input, marker) = take(3usize)(input)?;
        if marker != EXCHANGE_MARKER {
            return Err(Error::MalformedPacket("exchange marker"));
        }
        let (mut input, id) = take(PEER_ID_SIZE)(input)?;

        // Everything between the peer id and the trailing 16-byte tag is
        // address entries.
        let mut addresses = Vec::new();
        while input.len() > 16 {
            let (rest, entry) = read_address(input)?;
            addresses.push(entry);
            input = rest;
        }
        if input.len() != 16 {
            return Err(Error::MalformedPacket("exchange tag"));
        }

        let mut peer_id = [0u8; PEER_ID_SIZE];
        peer_id.copy_from_slice(id);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(input);

        Ok(AddressExchange {
            peer_id,
            addresses,
            tag,
        })
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&EXCHANGE_MARKER);
        out.extend_from_slice(&self.peer_id);
        for (kind, addr) in &self.addresses {
            write_address(out, *kind, addr);
        }
        out.extend_from_slice(&self.tag);
    }
}
