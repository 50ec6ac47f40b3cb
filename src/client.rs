//! Blocking host API.
//!
//! A dedicated network thread owns the sockets and the [`Endpoint`];
//! host threads talk to it through an MPSC command queue and wait on
//! one-shot [`Signal`]s. Locks exist only on this host-facing boundary,
//! never inside the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::crypto::PEER_ID_SIZE;
use crate::media::{FlvParser, MediaKind, MediaReader};
use crate::net::UdpEndpoint;
use crate::registry::{CallTarget, Endpoint, Output};
use crate::stream::EventSink;
use crate::util::parse_hex;
use crate::Error;

/// A one-shot event host threads can block on.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        // Unwrap is ok: no panicking code runs under this lock.
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    /// Wait until set or the timeout elapses. Returns whether it fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !*state {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(state, left).unwrap();
            state = guard;
        }
        true
    }

    /// Wait, then re-arm. For recurring events like "data available".
    pub fn wait_and_clear(&self, timeout: Duration) -> bool {
        let fired = self.wait(timeout);
        if fired {
            *self.state.lock().unwrap() = false;
        }
        fired
    }
}

enum Command {
    Connect {
        url: String,
        addresses: Vec<SocketAddr>,
    },
    ConnectPeer {
        peer: [u8; PEER_ID_SIZE],
        stream: String,
        reply: Sender<Result<u16, Error>>,
    },
    ConnectGroup {
        group_id: Vec<u8>,
        reply: Sender<Result<u16, Error>>,
    },
    AddStream {
        publish: bool,
        name: String,
        audio_reliable: bool,
        video_reliable: bool,
        reply: Sender<Result<u16, Error>>,
    },
    WriteMedia(Vec<u8>),
    Call {
        target: CallTarget,
        function: String,
        args: Vec<String>,
    },
    ClosePublication(String),
    Close,
}

/// State shared between the host threads and the network thread.
struct Shared {
    connect_signal: Signal,
    publish_signal: Signal,
    p2p_play_signal: Signal,
    read_signal: Signal,
    connect_ready: AtomicBool,
    publish_ready: AtomicBool,
    p2p_play_ready: AtomicBool,
    data_available: AtomicBool,
    closed: AtomicBool,
    server_session: AtomicU32,
    media: Mutex<HashMap<u16, MediaReader>>,
    group_peers: Mutex<Vec<[u8; PEER_ID_SIZE]>>,
    last_status: Mutex<String>,
    peer_id_hex: Mutex<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            connect_signal: Signal::new(),
            publish_signal: Signal::new(),
            p2p_play_signal: Signal::new(),
            read_signal: Signal::new(),
            connect_ready: AtomicBool::new(false),
            publish_ready: AtomicBool::new(false),
            p2p_play_ready: AtomicBool::new(false),
            data_available: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            server_session: AtomicU32::new(0),
            media: Mutex::new(HashMap::new()),
            group_peers: Mutex::new(Vec::new()),
            last_status: Mutex::new(String::new()),
            peer_id_hex: Mutex::new(String::new()),
        }
    }
}

/// The sink the network thread installs: translates engine events into
/// shared state and signals.
struct ClientSink {
    shared: Arc<Shared>,
}

impl EventSink for ClientSink {
    fn on_status(&self, _session_id: u32, code: &str, description: &str) {
        debug!("status: {} {}", code, description);
        *self.shared.last_status.lock().unwrap() = code.to_string();
        if code == "NetConnection.Connect.Success" {
            self.shared.connect_ready.store(true, Ordering::SeqCst);
        }
    }

    fn on_connected(&self, session_id: u32) {
        let first = self
            .shared
            .server_session
            .compare_exchange(0, session_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.shared.connect_signal.set();
        } else {
            // A peer session came up.
            self.shared.p2p_play_ready.store(true, Ordering::SeqCst);
            self.shared.p2p_play_signal.set();
        }
    }

    fn on_closed(&self, session_id: u32, reason: &Error) {
        info!("session {} closed: {}", session_id, reason);
        if session_id == self.shared.server_session.load(Ordering::SeqCst) {
            self.shared.closed.store(true, Ordering::SeqCst);
            self.shared.read_signal.set();
        }
        // A failed pending connect must wake the waiting host.
        self.shared.connect_signal.set();
    }

    fn on_media(&self, media_id: u16, time: u32, kind: MediaKind, payload: &[u8]) {
        let mut media = self.shared.media.lock().unwrap();
        media
            .entry(media_id)
            .or_insert_with(MediaReader::new)
            .push(time, kind, payload);
        drop(media);
        self.shared.data_available.store(true, Ordering::SeqCst);
        self.shared.read_signal.set();
    }

    fn on_publish_ready(&self, _media_id: u16) {
        self.shared.publish_ready.store(true, Ordering::SeqCst);
        self.shared.publish_signal.set();
    }

    fn on_play_started(&self, _media_id: u16) {
        self.shared.p2p_play_ready.store(true, Ordering::SeqCst);
        self.shared.p2p_play_signal.set();
    }

    fn on_group_peer(&self, _session_id: u32, peer_id: &[u8; PEER_ID_SIZE]) {
        // Dialed from the network loop; the sink must not reenter the
        // engine.
        self.shared.group_peers.lock().unwrap().push(*peer_id);
    }
}

/// Blocking RTMFP client handle.
pub struct RtmfpClient {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl RtmfpClient {
    /// Open a server session and block until it is established (or the
    /// configured timeout passes).
    pub fn connect(url: &str, addresses: Vec<SocketAddr>, config: Config) -> Result<Self, Error> {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = mpsc::channel();
        let timeout = config.call_timeout();

        tx.send(Command::Connect {
            url: url.to_string(),
            addresses,
        })
        .expect("own receiver alive");

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("rtmfp-net".into())
            .spawn(move || network_loop(config, rx, thread_shared))?;

        let client = Self {
            shared,
            commands: tx,
            handle: Some(handle),
            timeout,
        };

        if !client.shared.connect_signal.wait(timeout) {
            return Err(Error::Timeout("connect"));
        }
        if client.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::HandshakeTimeout);
        }
        Ok(client)
    }

    /// Our peer id in hex, as shared over signaling channels.
    pub fn peer_id(&self) -> String {
        self.shared.peer_id_hex.lock().unwrap().clone()
    }

    /// True once NetConnection.Connect.Success arrived.
    pub fn is_ready(&self) -> bool {
        self.shared.connect_ready.load(Ordering::SeqCst)
    }

    /// True while inbound media is queued.
    pub fn data_available(&self) -> bool {
        self.shared.data_available.load(Ordering::SeqCst)
    }

    /// True once a publication was accepted.
    pub fn publish_ready(&self) -> bool {
        self.shared.publish_ready.load(Ordering::SeqCst)
    }

    /// True once a p2p play started.
    pub fn play_ready(&self) -> bool {
        self.shared.p2p_play_ready.load(Ordering::SeqCst)
    }

    /// The last NetConnection/NetStream status code seen.
    pub fn last_status(&self) -> String {
        self.shared.last_status.lock().unwrap().clone()
    }

    /// Open a p2p session to `peer_id` (hex) and play `stream`.
    /// Returns the media id to read from.
    pub fn connect_to_peer(&self, peer_id: &str, stream: &str) -> Result<u16, Error> {
        let peer = parse_peer_id(peer_id)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::ConnectPeer {
            peer,
            stream: stream.to_string(),
            reply: reply_tx,
        })?;
        let media_id = wait_reply(&reply_rx, self.timeout)??;

        if !self.shared.p2p_play_signal.wait(self.timeout) {
            return Err(Error::Timeout("p2p play"));
        }
        Ok(media_id)
    }

    /// Join a NetGroup (id in hex, with or without the `G:` prefix).
    /// Returns the media id group media surfaces under.
    pub fn connect_to_group(&self, group_id: &str, stream: Option<&str>) -> Result<u16, Error> {
        let raw = group_id.strip_prefix("G:").unwrap_or(group_id);
        let group = parse_hex(raw).ok_or(Error::Amf("group id is not hex".into()))?;

        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::ConnectGroup {
            group_id: group,
            reply: reply_tx,
        })?;
        let media_id = wait_reply(&reply_rx, self.timeout)??;

        if let Some(name) = stream {
            self.add_stream(false, name, false, false)?;
        }
        Ok(media_id)
    }

    /// Create a play or publish stream. Returns its media id.
    pub fn add_stream(
        &self,
        publish: bool,
        name: &str,
        audio_reliable: bool,
        video_reliable: bool,
    ) -> Result<u16, Error> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::AddStream {
            publish,
            name: name.to_string(),
            audio_reliable,
            video_reliable,
            reply: reply_tx,
        })?;
        let media_id = wait_reply(&reply_rx, self.timeout)??;

        if publish && !self.shared.publish_signal.wait(self.timeout) {
            return Err(Error::Timeout("publish"));
        }
        Ok(media_id)
    }

    /// Read FLV bytes for a media id. Blocks up to the call timeout for
    /// data; returns 0 once the session is closed and drained.
    pub fn read(&self, media_id: u16, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            {
                let mut media = self.shared.media.lock().unwrap();
                let reader = media.entry(media_id).or_insert_with(MediaReader::new);
                let n = reader.read(buf);
                if n > 0 {
                    return Ok(n);
                }
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            if !self.shared.read_signal.wait_and_clear(self.timeout) {
                return Err(Error::Timeout("read"));
            }
        }
    }

    /// Feed FLV bytes to the current publication.
    pub fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        self.send(Command::WriteMedia(bytes.to_vec()))
    }

    /// Call a remote function. `target` is `None` for the server,
    /// `Some("all")` for the group, or a peer id in hex.
    pub fn call_function(
        &self,
        target: Option<&str>,
        function: &str,
        args: &[String],
    ) -> Result<(), Error> {
        let target = match target {
            None => CallTarget::Server,
            Some("all") => CallTarget::Group,
            Some(peer) => CallTarget::Peer(parse_peer_id(peer)?),
        };
        self.send(Command::Call {
            target,
            function: function.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn close_publication(&self, name: &str) -> Result<(), Error> {
        self.send(Command::ClosePublication(name.to_string()))
    }

    /// Orderly close. Idempotent and safe from any thread.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ApplicationClosed)
    }
}

impl Drop for RtmfpClient {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn parse_peer_id(hex: &str) -> Result<[u8; PEER_ID_SIZE], Error> {
    let bytes = parse_hex(hex).ok_or_else(|| Error::Amf("peer id is not hex".into()))?;
    if bytes.len() != PEER_ID_SIZE {
        return Err(Error::Amf("peer id must be 32 bytes".into()));
    }
    let mut id = [0u8; PEER_ID_SIZE];
    id.copy_from_slice(&bytes);
    Ok(id)
}

fn wait_reply<T>(
    rx: &Receiver<Result<T, Error>>,
    timeout: Duration,
) -> Result<Result<T, Error>, Error> {
    rx.recv_timeout(timeout)
        .map_err(|_| Error::Timeout("engine reply"))
}

/// The network task. Owns the sockets and the engine exclusively; one
/// iteration drains inbound datagrams, runs the manage tick, applies
/// host commands, then flushes engine output.
fn network_loop(config: Config, commands: Receiver<Command>, shared: Arc<Shared>) {
    let config = Arc::new(config);
    let sink = Arc::new(ClientSink {
        shared: shared.clone(),
    });

    let sock_v4 = match UdpEndpoint::bind("0.0.0.0:0".parse().unwrap(), &config) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("ipv4 bind failed: {}", e);
            None
        }
    };
    let sock_v6 = UdpEndpoint::bind("[::]:0".parse().unwrap(), &config).ok();
    if sock_v4.is_none() && sock_v6.is_none() {
        shared.closed.store(true, Ordering::SeqCst);
        shared.connect_signal.set();
        return;
    }

    let mut engine = Endpoint::new(config.clone(), sink, Instant::now());
    *shared.peer_id_hex.lock().unwrap() = engine.peer_id_hex();

    let mut publisher = FlvParser::new();
    let mut buf = vec![0u8; 2048];
    let mut closing = false;
    let mut close_deadline: Option<Instant> = None;

    'outer: loop {
        let now = Instant::now();

        // 1. Drain inbound datagrams.
        for sock in [&sock_v4, &sock_v6].into_iter().flatten() {
            loop {
                match sock.recv(&mut buf) {
                    Ok(Some((from, n))) => {
                        if let Err(e) = engine.handle_datagram(from, &buf[..n], now) {
                            engine.fail_all(&e);
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        engine.fail_all(&Error::Io(e));
                        break 'outer;
                    }
                }
            }
        }

        // 2. Manage tick (50 ms cadence enforced inside).
        if let Err(e) = engine.handle_timeout(now) {
            engine.fail_all(&e);
            break;
        }

        // 3. Host commands.
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if apply_command(&mut engine, command, now, &mut publisher) {
                        closing = true;
                        close_deadline = Some(now + Duration::from_millis(200));
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closing = true;
                    close_deadline.get_or_insert(now + Duration::from_millis(200));
                    break;
                }
            }
        }

        // Group peers discovered by the sink get dialed here, outside
        // the engine's own call stack.
        let peers: Vec<[u8; PEER_ID_SIZE]> =
            shared.group_peers.lock().unwrap().drain(..).collect();
        for peer in peers {
            if let Err(e) = engine.connect_to_group_peer(peer, now) {
                debug!("group peer dial failed: {}", e);
            }
        }

        // 4. Flush engine output.
        loop {
            match engine.poll_output(now) {
                Output::Datagram { remote, payload } => {
                    let sock = if remote.is_ipv4() { &sock_v4 } else { &sock_v6 };
                    if let Some(sock) = sock {
                        if let Err(e) = sock.send_to(&payload, remote) {
                            engine.fail_all(&Error::Io(e));
                            break 'outer;
                        }
                    }
                }
                Output::Timeout(_) => break,
            }
        }

        if closing {
            let done = close_deadline.map(|d| now >= d).unwrap_or(true);
            if done {
                break;
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.connect_signal.set();
    shared.read_signal.set();
}

/// Returns true when the command asks the loop to shut down.
fn apply_command(
    engine: &mut Endpoint,
    command: Command,
    now: Instant,
    publisher: &mut FlvParser,
) -> bool {
    match command {
        Command::Connect { url, addresses } => {
            engine.connect(&url, addresses, now);
        }
        Command::ConnectPeer {
            peer,
            stream,
            reply,
        } => {
            let _ = reply.send(engine.connect_to_peer(peer, &stream, now));
        }
        Command::ConnectGroup { group_id, reply } => {
            let _ = reply.send(engine.connect_to_group(&group_id, now));
        }
        Command::AddStream {
            publish,
            name,
            audio_reliable,
            video_reliable,
            reply,
        } => {
            let _ = reply.send(engine.add_stream(
                publish,
                &name,
                audio_reliable,
                video_reliable,
                now,
            ));
        }
        Command::WriteMedia(bytes) => {
            for packet in publisher.write(&bytes) {
                engine.write_media(packet.time, packet.kind, &packet.payload, now);
            }
        }
        Command::Call {
            target,
            function,
            args,
        } => {
            if let Err(e) = engine.call(&target, &function, &args, now) {
                debug!("call failed: {}", e);
            }
        }
        Command::ClosePublication(name) => {
            engine.close_publication(&name, now);
        }
        Command::Close => {
            engine.close(now);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signal_fires_and_times_out() {
        let signal = Arc::new(Signal::new());
        assert!(!signal.wait(Duration::from_millis(10)));

        let s = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s.set();
        });
        assert!(signal.wait(Duration::from_secs(2)));
        // Still set: one-shot semantics.
        assert!(signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn signal_wait_and_clear_rearms() {
        let signal = Signal::new();
        signal.set();
        assert!(signal.wait_and_clear(Duration::from_millis(1)));
        assert!(!signal.wait_and_clear(Duration::from_millis(1)));
    }

    #[test]
    fn connect_to_dead_address_times_out() {
        let config = Config::builder()
            .call_timeout(Duration::from_millis(300))
            .build();
        let result = RtmfpClient::connect(
            "rtmfp://localhost/app",
            vec!["127.0.0.1:9".parse().unwrap()],
            config,
        );
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
