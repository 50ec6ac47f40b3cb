//! Shared helpers for driving endpoints against each other in memory.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rtmfp::{Config, Endpoint, Error, EventSink, MediaKind, Output};

/// Recorded engine events, inspectable from the test body.
#[derive(Default)]
pub struct Recorded {
    pub connected: Vec<u32>,
    pub closed: Vec<(u32, String)>,
    pub statuses: Vec<(u32, String)>,
    pub media: Vec<(u16, u32, MediaKind, Vec<u8>)>,
    pub play_started: Vec<u16>,
    pub play_requests: Vec<(u32, String)>,
    pub publish_ready: Vec<u16>,
    pub group_peers: Vec<[u8; 32]>,
    pub writer_failures: Vec<(u32, u64)>,
}

#[derive(Clone, Default)]
pub struct TestSink {
    pub recorded: Arc<Mutex<Recorded>>,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.recorded.lock().unwrap())
    }
}

impl EventSink for TestSink {
    fn on_status(&self, session_id: u32, code: &str, _description: &str) {
        self.recorded
            .lock()
            .unwrap()
            .statuses
            .push((session_id, code.to_string()));
    }

    fn on_connected(&self, session_id: u32) {
        self.recorded.lock().unwrap().connected.push(session_id);
    }

    fn on_closed(&self, session_id: u32, reason: &Error) {
        self.recorded
            .lock()
            .unwrap()
            .closed
            .push((session_id, reason.to_string()));
    }

    fn on_media(&self, media_id: u16, time: u32, kind: MediaKind, payload: &[u8]) {
        self.recorded
            .lock()
            .unwrap()
            .media
            .push((media_id, time, kind, payload.to_vec()));
    }

    fn on_play_started(&self, media_id: u16) {
        self.recorded.lock().unwrap().play_started.push(media_id);
    }

    fn on_play_request(&self, session_id: u32, stream_name: &str) {
        self.recorded
            .lock()
            .unwrap()
            .play_requests
            .push((session_id, stream_name.to_string()));
    }

    fn on_publish_ready(&self, media_id: u16) {
        self.recorded.lock().unwrap().publish_ready.push(media_id);
    }

    fn on_group_peer(&self, _session_id: u32, peer_id: &[u8; 32]) {
        self.recorded.lock().unwrap().group_peers.push(*peer_id);
    }

    fn on_writer_failed(&self, session_id: u32, writer_id: u64) {
        self.recorded
            .lock()
            .unwrap()
            .writer_failures
            .push((session_id, writer_id));
    }
}

/// One endpoint plus the address it pretends to live at.
pub struct Node {
    pub endpoint: Endpoint,
    pub sink: TestSink,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(addr: &str, seed: u64) -> Node {
        let config = Config::builder()
            .rng_seed(seed)
            .audio_reliable(true)
            .video_reliable(true)
            .build();
        Node::with_config(addr, config)
    }

    pub fn with_config(addr: &str, config: Config) -> Node {
        let sink = TestSink::new();
        let endpoint = Endpoint::new(Arc::new(config), Arc::new(sink.clone()), Instant::now());
        Node {
            endpoint,
            sink,
            addr: addr.parse().unwrap(),
        }
    }
}

/// Pump datagrams between two nodes until both go quiet.
///
/// `filter` sees `(from, to, datagram_index)` for every in-flight packet
/// and returns false to drop it. The index counts all packets since the
/// drive started.
pub fn drive_filtered(
    a: &mut Node,
    b: &mut Node,
    now: Instant,
    filter: &mut dyn FnMut(SocketAddr, SocketAddr, usize) -> bool,
) {
    let mut index = 0;
    for _ in 0..200 {
        let mut in_flight: Vec<(SocketAddr, SocketAddr, Vec<u8>)> = Vec::new();

        for node in [&mut *a, &mut *b] {
            loop {
                match node.endpoint.poll_output(now) {
                    Output::Datagram { remote, payload } => {
                        in_flight.push((node.addr, remote, payload));
                    }
                    Output::Timeout(_) => break,
                }
            }
        }

        if in_flight.is_empty() {
            return;
        }

        for (from, to, payload) in in_flight {
            let deliver = filter(from, to, index);
            index += 1;
            if !deliver {
                continue;
            }
            let node = if to == a.addr {
                &mut *a
            } else if to == b.addr {
                &mut *b
            } else {
                continue;
            };
            node.endpoint.handle_datagram(from, &payload, now).unwrap();
        }
    }
    panic!("endpoints never went quiet");
}

pub fn drive(a: &mut Node, b: &mut Node, now: Instant) {
    drive_filtered(a, b, now, &mut |_, _, _| true);
}

/// Advance simulated time in manage-tick steps, exchanging whatever the
/// ticks produce.
pub fn advance(a: &mut Node, b: &mut Node, start: Instant, total: Duration, step: Duration) {
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        elapsed += step;
        let now = start + elapsed;
        a.endpoint.handle_timeout(now).unwrap();
        b.endpoint.handle_timeout(now).unwrap();
        drive(a, b, now);
    }
}

/// Establish a p2p pair: `a` plays `stream` from `b`. Returns a's media
/// id for the stream.
pub fn establish_p2p(a: &mut Node, b: &mut Node, stream: &str, now: Instant) -> u16 {
    let peer = *b.endpoint.peer_id();
    let media_id = a
        .endpoint
        .connect_to_peer_at(peer, Some(stream), vec![b.addr], now);
    drive(a, b, now);

    assert!(
        a.sink.with(|r| !r.connected.is_empty()),
        "initiator session must connect"
    );
    assert!(
        b.sink.with(|r| !r.connected.is_empty()),
        "responder session must connect"
    );
    media_id
}
