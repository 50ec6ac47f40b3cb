#![no_main]

use libfuzzer_sys::fuzz_target;
use rtmfp::codec::{self, CipherContext};
use rtmfp::message::{parse_chunks, parse_fragment, Ack, PacketHeader};

fuzz_target!(|data: &[u8]| {
    // Raw datagram through the demultiplexing path.
    let _ = codec::session_id_of(data);
    let ctx = CipherContext::default_handshake();
    if let Ok(plain) = codec::decrypt(&ctx, data) {
        if let Ok((rest, _)) = PacketHeader::parse(&plain) {
            if let Ok(chunks) = parse_chunks(rest) {
                for c in chunks {
                    match c.kind {
                        0x10 => {
                            let _ = parse_fragment(c.payload);
                        }
                        0x51 => {
                            let _ = Ack::parse(c.payload);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // And the plaintext body parsers directly, skipping the cipher.
    if let Ok((rest, _)) = PacketHeader::parse(data) {
        let _ = parse_chunks(rest);
    }
    let _ = parse_fragment(data);
    let _ = Ack::parse(data);
});
