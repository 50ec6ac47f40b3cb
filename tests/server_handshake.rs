//! Server handshake happy path against a scripted server.
//!
//! The "server" here is built from the crate's own wire primitives:
//! default-cipher packets for the handshake, then derived session keys
//! for the established exchange. This pins the byte layout the engine
//! puts on the wire, not just its internal consistency.

mod common;

use std::collections::HashMap;
use std::time::Instant;

use common::*;
use rtmfp::codec::{self, CipherContext};
use rtmfp::crypto::{derive_session_keys, DiffieHellman};
use rtmfp::message::{
    parse_chunks, parse_fragment, write_chunk, write_fragment_header, Ack, Challenge70, Commit38,
    Complete78, Hello30, PacketHeader, EPD_URL, MARKER_HANDSHAKE,
};
use rtmfp::{Output, SessionStatus};

const URL: &str = "rtmfp://srv/app";
const SIGNATURE_NETCONNECTION: [u8; 5] = [0x00, 0x54, 0x43, 0x04, 0x00];

struct ScriptedServer {
    addr: std::net::SocketAddr,
    dh: DiffieHellman,
    nonce: Vec<u8>,
    session_id: u32,
}

impl ScriptedServer {
    fn new() -> Self {
        let mut nonce = vec![0x03, 0x1A, 0x00, 0x00, 0x02, 0x1E, 0x00, 0x41, 0x0E];
        nonce.extend_from_slice(&[0x5A; 64]);
        Self {
            addr: "203.0.113.7:1935".parse().unwrap(),
            dh: DiffieHellman::generate(),
            nonce,
            session_id: 0x0707_0707,
        }
    }

    fn handshake_packet(&self, kind: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; codec::CRYPTO_HOLE];
        PacketHeader {
            marker: MARKER_HANDSHAKE,
            time: 0,
            echo_time: None,
        }
        .serialize(&mut buf);
        write_chunk(&mut buf, kind, body);
        codec::encrypt(&CipherContext::default_handshake(), 0, buf)
    }

    fn session_packet(&self, far_id: u32, key: [u8; 16], chunks: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut buf = vec![0u8; codec::CRYPTO_HOLE];
        PacketHeader {
            marker: 0x89,
            time: 1,
            echo_time: None,
        }
        .serialize(&mut buf);
        for (kind, body) in chunks {
            write_chunk(&mut buf, *kind, body);
        }
        codec::encrypt(&CipherContext::new(key), far_id, buf)
    }
}

fn poll_one(node: &mut Node, now: Instant) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match node.endpoint.poll_output(now) {
            Output::Datagram { payload, .. } => out.push(payload),
            Output::Timeout(_) => break,
        }
    }
    out
}

#[test]
fn server_handshake_happy_path() {
    let mut client = Node::new("192.0.2.1:50000", 42);
    let server = ScriptedServer::new();
    let t0 = Instant::now();

    // --- 30: initial probe ------------------------------------------
    let pending = client.endpoint.connect(URL, vec![server.addr], t0);
    let out = poll_one(&mut client, t0);
    assert_eq!(out.len(), 1, "exactly one 30 to the one address");

    let packet = &out[0];
    assert_eq!(codec::session_id_of(packet).unwrap(), 0);
    let plain = codec::decrypt(&CipherContext::default_handshake(), packet).unwrap();
    let (rest, header) = PacketHeader::parse(&plain).unwrap();
    assert_eq!(header.marker, MARKER_HANDSHAKE);

    let chunks = parse_chunks(rest).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].kind, 0x30);
    let hello = Hello30::parse(chunks[0].payload).unwrap();
    assert_eq!(hello.epd_kind, EPD_URL);
    assert_eq!(hello.epd, URL.as_bytes());
    let tag = hello.tag;

    // --- 70: challenge ----------------------------------------------
    let challenge = Challenge70 {
        tag,
        cookie: vec![0xC0; 64],
        far_key: server.dh.public_key().to_vec(),
    };
    let mut body = Vec::new();
    challenge.serialize(&mut body);
    client
        .endpoint
        .handle_datagram(server.addr, &server.handshake_packet(0x70, &body), t0)
        .unwrap();

    // --- 38: key commit ---------------------------------------------
    let out = poll_one(&mut client, t0);
    assert_eq!(out.len(), 1);
    let plain = codec::decrypt(&CipherContext::default_handshake(), &out[0]).unwrap();
    let (rest, _) = PacketHeader::parse(&plain).unwrap();
    let chunks = parse_chunks(rest).unwrap();
    assert_eq!(chunks[0].kind, 0x38);
    let commit = Commit38::parse(chunks[0].payload).unwrap();
    assert_eq!(commit.cookie, vec![0xC0; 64], "cookie echoed verbatim");
    assert_eq!(commit.public_key.len(), 128);
    assert!(!commit.nonce.is_empty());
    assert_eq!(commit.initiator_id, pending);

    // --- 78: completion ---------------------------------------------
    let secret = server.dh.shared_secret(&commit.public_key).unwrap();
    let keys = derive_session_keys(&secret, &commit.nonce, &server.nonce);

    let complete = Complete78 {
        responder_id: server.session_id,
        nonce: server.nonce.clone(),
    };
    let mut body = Vec::new();
    complete.serialize(&mut body);
    client
        .endpoint
        .handle_datagram(server.addr, &server.handshake_packet(0x78, &body), t0)
        .unwrap();

    // The session is up as soon as the 78 lands.
    assert_eq!(client.sink.with(|r| r.connected.len()), 1);
    assert_eq!(client.endpoint.server_session(), Some(pending));
    assert_eq!(
        client.endpoint.session_status(pending),
        Some(SessionStatus::Connected)
    );

    // --- connect invocation over the derived cipher ------------------
    let out = poll_one(&mut client, t0);
    assert!(!out.is_empty(), "connect command follows the handshake");

    let packet = &out[0];
    assert_eq!(
        codec::session_id_of(packet).unwrap(),
        server.session_id,
        "established traffic targets the far session id"
    );
    let plain = codec::decrypt(&CipherContext::new(keys.to_responder), packet).unwrap();
    let (rest, header) = PacketHeader::parse(&plain).unwrap();
    assert!(header.marker == 0x89 || header.marker == 0x4A);

    let chunks = parse_chunks(rest).unwrap();
    let frag_chunk = chunks
        .iter()
        .find(|c| c.kind == 0x10)
        .expect("a fragment chunk");
    let frag = parse_fragment(frag_chunk.payload).unwrap();
    assert_eq!(frag.stage, 1);
    assert_eq!(frag.signature, Some(&SIGNATURE_NETCONNECTION[..]));
    assert_eq!(frag.payload[0], 0x14, "an AMF invocation");
    let client_flow_id = frag.flow_id;

    // --- server accepts: _result success ----------------------------
    let mut info = HashMap::new();
    info.insert(
        "code".to_string(),
        rml_amf0::Amf0Value::Utf8String("NetConnection.Connect.Success".into()),
    );
    info.insert(
        "level".to_string(),
        rml_amf0::Amf0Value::Utf8String("status".into()),
    );
    let values = vec![
        rml_amf0::Amf0Value::Utf8String("_result".into()),
        rml_amf0::Amf0Value::Number(1.0),
        rml_amf0::Amf0Value::Null,
        rml_amf0::Amf0Value::Object(info),
    ];
    let amf = rml_amf0::serialize(&values).unwrap();
    let mut message = vec![0x14, 0, 0, 0, 0];
    message.extend_from_slice(&amf);

    let mut frag_body = Vec::new();
    write_fragment_header(
        &mut frag_body,
        0,
        2,
        1,
        1,
        Some((&SIGNATURE_NETCONNECTION, None)),
    );
    frag_body.extend_from_slice(&message);

    let packet = server.session_packet(
        commit.initiator_id,
        keys.to_initiator,
        &[(0x10, frag_body)],
    );
    client
        .endpoint
        .handle_datagram(server.addr, &packet, t0)
        .unwrap();

    assert!(client.sink.with(|r| r
        .statuses
        .iter()
        .any(|(_, code)| code == "NetConnection.Connect.Success")));

    // The engine acknowledges the server's flow.
    let out = poll_one(&mut client, t0);
    let mut saw_ack = false;
    for packet in &out {
        let plain = codec::decrypt(&CipherContext::new(keys.to_responder), packet).unwrap();
        let (rest, _) = PacketHeader::parse(&plain).unwrap();
        for c in parse_chunks(rest).unwrap() {
            if c.kind == 0x51 {
                let ack = Ack::parse(c.payload).unwrap();
                assert_eq!(ack.flow_id, 2);
                assert_eq!(ack.cumulative, 1);
                saw_ack = true;
            }
        }
    }
    assert!(saw_ack, "cumulative ack for the server flow");
    assert!(client_flow_id >= 2);
}

#[test]
fn redirect_probes_every_listed_address() {
    let mut client = Node::new("192.0.2.1:50000", 42);
    let server = ScriptedServer::new();
    let t0 = Instant::now();

    client.endpoint.connect(URL, vec![server.addr], t0);
    let out = poll_one(&mut client, t0);
    let plain = codec::decrypt(&CipherContext::default_handshake(), &out[0]).unwrap();
    let (rest, _) = PacketHeader::parse(&plain).unwrap();
    let hello = Hello30::parse(parse_chunks(rest).unwrap()[0].payload).unwrap();

    // Redirect to two fresh addresses.
    let redirect = rtmfp::message::Redirect71 {
        tag: hello.tag,
        addresses: vec![
            (
                rtmfp::message::AddressKind::Public,
                "198.51.100.1:1935".parse().unwrap(),
            ),
            (
                rtmfp::message::AddressKind::Public,
                "198.51.100.2:1935".parse().unwrap(),
            ),
        ],
    };
    let mut body = Vec::new();
    redirect.serialize(&mut body);
    client
        .endpoint
        .handle_datagram(server.addr, &server.handshake_packet(0x71, &body), t0)
        .unwrap();

    // A 30 goes to each redirected address, same tag.
    let mut probed = Vec::new();
    loop {
        match client.endpoint.poll_output(t0) {
            Output::Datagram { remote, payload } => {
                let plain =
                    codec::decrypt(&CipherContext::default_handshake(), &payload).unwrap();
                let (rest, _) = PacketHeader::parse(&plain).unwrap();
                let chunks = parse_chunks(rest).unwrap();
                assert_eq!(chunks[0].kind, 0x30);
                let h = Hello30::parse(chunks[0].payload).unwrap();
                assert_eq!(h.tag, hello.tag);
                probed.push(remote);
            }
            Output::Timeout(_) => break,
        }
    }
    assert_eq!(probed.len(), 2);
}
