//! Reliable delivery over lossy and duplicating paths.

mod common;

use std::time::{Duration, Instant};

use common::*;
use rtmfp::{MediaKind, MediaReader, FLV_HEADER};

fn audio_frame(i: u8) -> Vec<u8> {
    // Distinct payloads so ordering is visible at the far end.
    vec![0xAF, 0x01, i]
}

#[test]
fn media_arrives_in_order_on_a_clean_path() {
    let mut a = Node::new("10.0.0.1:1935", 1);
    let mut b = Node::new("10.0.0.2:1935", 2);
    let t0 = Instant::now();

    let media_id = establish_p2p(&mut a, &mut b, "live", t0);

    for i in 0..10u8 {
        b.endpoint
            .write_media(u32::from(i) * 40, MediaKind::Audio, &audio_frame(i), t0);
    }
    advance(&mut a, &mut b, t0, Duration::from_millis(200), Duration::from_millis(50));

    let frames: Vec<u8> = a.sink.with(|r| {
        r.media
            .iter()
            .filter(|(id, _, _, _)| *id == media_id)
            .map(|(_, _, _, payload)| payload[2])
            .collect()
    });
    assert_eq!(frames, (0..10).collect::<Vec<u8>>());
}

#[test]
fn lost_data_packets_are_retransmitted_in_order() {
    let mut a = Node::new("10.0.0.1:1935", 1);
    let mut b = Node::new("10.0.0.2:1935", 2);
    let t0 = Instant::now();

    let media_id = establish_p2p(&mut a, &mut b, "live", t0);

    for i in 0..10u8 {
        b.endpoint
            .write_media(u32::from(i) * 40, MediaKind::Audio, &audio_frame(i), t0);
    }

    // Drop the first two data-bearing datagrams from the publisher; the
    // retransmit deadline has to recover them.
    let b_addr = b.addr;
    let mut dropped = 0;
    let mut elapsed = Duration::ZERO;
    let step = Duration::from_millis(50);
    while elapsed < Duration::from_secs(2) {
        elapsed += step;
        let now = t0 + elapsed;
        a.endpoint.handle_timeout(now).unwrap();
        b.endpoint.handle_timeout(now).unwrap();
        drive_filtered(&mut a, &mut b, now, &mut |from, _, _| {
            if from == b_addr && dropped < 2 {
                dropped += 1;
                return false;
            }
            true
        });
    }
    assert_eq!(dropped, 2, "the filter must have dropped packets");

    let frames: Vec<u8> = a.sink.with(|r| {
        r.media
            .iter()
            .filter(|(id, _, _, _)| *id == media_id)
            .map(|(_, _, _, payload)| payload[2])
            .collect()
    });
    assert_eq!(frames, (0..10).collect::<Vec<u8>>(), "in order, no gaps");
}

#[test]
fn duplicated_data_packets_deliver_once() {
    let mut a = Node::new("10.0.0.1:1935", 1);
    let mut b = Node::new("10.0.0.2:1935", 2);
    let t0 = Instant::now();

    let media_id = establish_p2p(&mut a, &mut b, "live", t0);

    for i in 0..4u8 {
        b.endpoint
            .write_media(u32::from(i) * 40, MediaKind::Audio, &audio_frame(i), t0);
    }

    // Deliver everything twice.
    let mut elapsed = Duration::ZERO;
    let step = Duration::from_millis(50);
    while elapsed < Duration::from_millis(500) {
        elapsed += step;
        let now = t0 + elapsed;
        a.endpoint.handle_timeout(now).unwrap();
        b.endpoint.handle_timeout(now).unwrap();

        let mut in_flight = Vec::new();
        for node in [&mut a, &mut b] {
            loop {
                match node.endpoint.poll_output(now) {
                    rtmfp::Output::Datagram { remote, payload } => {
                        in_flight.push((remote, payload))
                    }
                    rtmfp::Output::Timeout(_) => break,
                }
            }
        }
        for (to, payload) in in_flight {
            for _ in 0..2 {
                let (from, node) = if to == a.addr {
                    (b.addr, &mut a)
                } else {
                    (a.addr, &mut b)
                };
                node.endpoint.handle_datagram(from, &payload, now).unwrap();
            }
        }
    }

    let frames: Vec<u8> = a.sink.with(|r| {
        r.media
            .iter()
            .filter(|(id, _, _, _)| *id == media_id)
            .map(|(_, _, _, payload)| payload[2])
            .collect()
    });
    assert_eq!(frames, (0..4).collect::<Vec<u8>>(), "each frame exactly once");
}

#[test]
fn received_media_frames_as_flv_with_prologue() {
    let mut a = Node::new("10.0.0.1:1935", 1);
    let mut b = Node::new("10.0.0.2:1935", 2);
    let t0 = Instant::now();

    let media_id = establish_p2p(&mut a, &mut b, "live", t0);

    b.endpoint
        .write_media(0, MediaKind::Audio, &audio_frame(0), t0);
    advance(&mut a, &mut b, t0, Duration::from_millis(200), Duration::from_millis(50));

    // Run the received packets through the host-side read adapter.
    let mut reader = MediaReader::new();
    a.sink.with(|r| {
        for (id, time, kind, payload) in &r.media {
            if *id == media_id {
                reader.push(*time, *kind, payload);
            }
        }
    });

    let mut buf = [0u8; 512];
    let n = reader.read(&mut buf);
    assert!(n >= FLV_HEADER.len());
    assert_eq!(&buf[..13], &FLV_HEADER, "first read starts with the FLV prologue");
    // Followed by the first audio tag.
    assert_eq!(buf[13], 0x08);
}
