//! The session registry and demultiplexer.
//!
//! [`Endpoint`] is the Sans-IO facade of the whole engine: feed it
//! datagrams and timeouts, drain packets with `poll_output`, and all the
//! sessions, handshakes and flows behind one UDP socket take care of
//! themselves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{self, CipherContext};
use crate::config::Config;
use crate::crypto::PEER_ID_SIZE;
use crate::handshake::{HandshakeDone, Handshaker};
use crate::media::MediaKind;
use crate::session::{Outbox, Session, SessionInit, SessionKind, SessionRole, SessionStatus};
use crate::stream::{EventSink, StreamCommand};
use crate::util::format_hex;
use crate::Error;

// Session ids are process-global: monotonic, never reused within a
// process, reset only at process start.
static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(0x0200_0000);

pub(crate) fn next_session_id() -> u32 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Engine output, polled after feeding input.
#[derive(Debug)]
pub enum Output {
    /// Send this on the UDP socket.
    Datagram { remote: SocketAddr, payload: Vec<u8> },
    /// Nothing to send; call `handle_timeout` at (or after) this
    /// instant.
    Timeout(Instant),
}

/// Who a host call is aimed at.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// The server session.
    Server,
    /// Every connected group peer.
    Group,
    /// One specific peer.
    Peer([u8; PEER_ID_SIZE]),
}

/// The multi-session RTMFP endpoint.
pub struct Endpoint {
    config: Arc<Config>,
    sink: Arc<dyn EventSink>,
    epoch: Instant,
    handshaker: Handshaker,
    sessions: HashMap<u32, Session>,
    outbox: Outbox,
    default_ctx: CipherContext,
    last_manage: Option<Instant>,
    server_session: Option<u32>,
    group: Option<(Vec<u8>, u16)>,
    next_media_id: u16,
    failed: bool,
}

impl Endpoint {
    pub fn new(config: Arc<Config>, sink: Arc<dyn EventSink>, now: Instant) -> Self {
        let handshaker = Handshaker::new(config.clone(), now);
        info!("endpoint up, peer id {}", format_hex(handshaker.own_peer_id()));
        Self {
            config,
            sink,
            epoch: now,
            handshaker,
            sessions: HashMap::new(),
            outbox: Outbox::default(),
            default_ctx: CipherContext::default_handshake(),
            last_manage: None,
            server_session: None,
            group: None,
            next_media_id: 0,
            failed: false,
        }
    }

    /// Our peer id: SHA-256 over the DH public key block.
    pub fn peer_id(&self) -> &[u8; PEER_ID_SIZE] {
        self.handshaker.own_peer_id()
    }

    pub fn peer_id_hex(&self) -> String {
        format_hex(self.peer_id())
    }

    pub fn session_status(&self, session_id: u32) -> Option<SessionStatus> {
        self.sessions.get(&session_id).map(|s| s.status())
    }

    pub fn server_session(&self) -> Option<u32> {
        self.server_session
    }

    /// Sessions currently established with peers (not the server).
    pub fn peer_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .values()
            .filter(|s| s.kind() != SessionKind::Server)
    }

    // ---- host operations --------------------------------------------

    /// Open the server session. Returns the pending session id;
    /// `on_connected` (or `on_closed`) fires when the handshake ends.
    pub fn connect(&mut self, url: &str, addresses: Vec<SocketAddr>, now: Instant) -> u32 {
        self.handshaker.connect(url, addresses, now, &mut self.outbox)
    }

    /// Open a p2p session through the server and play `stream_name`.
    /// Returns the media id the stream will surface under.
    pub fn connect_to_peer(
        &mut self,
        peer: [u8; PEER_ID_SIZE],
        stream_name: &str,
        now: Instant,
    ) -> Result<u16, Error> {
        let server = self.server_address()?;
        Ok(self.connect_to_peer_at(peer, Some(stream_name), vec![server], now))
    }

    /// Open a p2p session by probing known addresses directly, without
    /// a server introduction.
    pub fn connect_to_peer_at(
        &mut self,
        peer: [u8; PEER_ID_SIZE],
        stream_name: Option<&str>,
        addresses: Vec<SocketAddr>,
        now: Instant,
    ) -> u16 {
        let media_id = self.alloc_media_id();
        self.handshaker.connect_to_peer(
            peer,
            SessionKind::Peer,
            stream_name.map(str::to_string),
            media_id,
            addresses,
            now,
            &mut self.outbox,
        );
        media_id
    }

    /// Dial a peer that was announced as a group member.
    pub fn connect_to_group_peer(
        &mut self,
        peer: [u8; PEER_ID_SIZE],
        now: Instant,
    ) -> Result<(), Error> {
        let server = self.server_address()?;
        let media_id = self.group.as_ref().map(|(_, id)| *id).unwrap_or(0);
        self.handshaker.connect_to_peer(
            peer,
            SessionKind::Group,
            None,
            media_id,
            vec![server],
            now,
            &mut self.outbox,
        );
        Ok(())
    }

    /// Join a NetGroup on the server session. Returns the media id
    /// group media will surface under.
    pub fn connect_to_group(&mut self, group_id: &[u8], now: Instant) -> Result<u16, Error> {
        let server = self.server_session.ok_or_else(not_connected)?;
        let media_id = self.alloc_media_id();
        self.group = Some((group_id.to_vec(), media_id));

        let own_peer_id = *self.handshaker.own_peer_id();
        // Unwrap is ok: server_session ids always resolve.
        let session = self.sessions.get_mut(&server).unwrap();
        session.join_group(group_id, &own_peer_id, now, self.sink.as_ref());

        Ok(media_id)
    }

    /// Open a play or publish stream on the server connection.
    pub fn add_stream(
        &mut self,
        publish: bool,
        name: &str,
        audio_reliable: bool,
        video_reliable: bool,
        now: Instant,
    ) -> Result<u16, Error> {
        let server = self.server_session.ok_or_else(not_connected)?;
        let media_id = self.alloc_media_id();

        // Unwrap is ok: server_session ids always resolve.
        let session = self.sessions.get_mut(&server).unwrap();
        session.add_stream_command(
            StreamCommand {
                media_id,
                publish,
                name: name.to_string(),
                audio_reliable,
                video_reliable,
            },
            now,
            self.sink.as_ref(),
        );

        Ok(media_id)
    }

    /// Feed one published media packet to every session with a live
    /// publication.
    pub fn write_media(&mut self, time: u32, kind: MediaKind, payload: &[u8], _now: Instant) {
        for session in self.sessions.values_mut() {
            session.send_media(time, kind, payload);
        }
    }

    /// Call a remote function on the server, the group, or one peer.
    pub fn call(
        &mut self,
        target: &CallTarget,
        function: &str,
        args: &[String],
        now: Instant,
    ) -> Result<(), Error> {
        match target {
            CallTarget::Server => {
                let server = self.server_session.ok_or_else(not_connected)?;
                // Unwrap is ok: server_session ids always resolve.
                let session = self.sessions.get_mut(&server).unwrap();
                session.call(function, args, now, self.sink.as_ref());
            }
            CallTarget::Group => {
                for session in self.sessions.values_mut() {
                    if session.kind() == SessionKind::Group {
                        session.call(function, args, now, self.sink.as_ref());
                    }
                }
            }
            CallTarget::Peer(peer) => {
                let session = self
                    .sessions
                    .values_mut()
                    .find(|s| s.peer_id() == Some(peer))
                    .ok_or_else(not_connected)?;
                session.call(function, args, now, self.sink.as_ref());
            }
        }
        Ok(())
    }

    pub fn close_publication(&mut self, name: &str, now: Instant) {
        for session in self.sessions.values_mut() {
            session.close_publication(name, now, self.sink.as_ref());
        }
    }

    pub fn close_session(&mut self, session_id: u32, abrupt: bool, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.close(abrupt, now, self.sink.as_ref(), &mut self.outbox);
        }
    }

    /// Close everything, orderly.
    pub fn close(&mut self, now: Instant) {
        for session in self.sessions.values_mut() {
            session.close(false, now, self.sink.as_ref(), &mut self.outbox);
        }
    }

    // ---- engine input -----------------------------------------------

    /// Feed one received UDP datagram.
    ///
    /// Malformed packets are dropped and logged, per the protocol; only
    /// registry-fatal conditions surface as errors.
    pub fn handle_datagram(
        &mut self,
        remote: SocketAddr,
        packet: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let session_id = match codec::session_id_of(packet) {
            Ok(id) => id,
            Err(e) => {
                debug!("dropping datagram from {}: {}", remote, e);
                return Ok(());
            }
        };

        if session_id == 0 {
            let plaintext = match codec::decrypt(&self.default_ctx, packet) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping handshake datagram from {}: {}", remote, e);
                    return Ok(());
                }
            };
            let done =
                match self
                    .handshaker
                    .receive(remote, &plaintext, now, &mut self.outbox)
                {
                    Ok(done) => done,
                    Err(e) => {
                        debug!("handshake datagram from {} rejected: {}", remote, e);
                        return Ok(());
                    }
                };
            for d in done {
                self.promote(d, now);
            }
            return Ok(());
        }

        let Some(session) = self.sessions.get_mut(&session_id) else {
            // Normal during teardown races.
            trace!("datagram for unknown session {}", session_id);
            return Ok(());
        };

        let plaintext = match codec::decrypt(session.decrypt_ctx(), packet) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping datagram for session {}: {}", session_id, e);
                return Ok(());
            }
        };

        if session.address() != remote {
            debug!("session {} moved to {}", session_id, remote);
            session.set_address(remote);
        }

        let exchanges = match session.receive(&plaintext, now, self.sink.as_ref(), &mut self.outbox)
        {
            Ok(exchanges) => exchanges,
            Err(e) => {
                debug!("session {} packet rejected: {}", session_id, e);
                return Ok(());
            }
        };

        // P2P rendezvous: eagerly challenge the introduced peer at
        // every address the server listed.
        for exchange in exchanges {
            let addresses: Vec<SocketAddr> =
                exchange.addresses.iter().map(|(_, a)| *a).collect();
            debug!(
                "address exchange for peer {}, {} address(es)",
                format_hex(&exchange.peer_id),
                addresses.len()
            );
            self.handshaker
                .start_responder(exchange.tag, addresses, now, &mut self.outbox);
        }

        self.reap_failed();
        Ok(())
    }

    /// Drive timers. Call whenever `poll_output` returned a `Timeout`
    /// that has elapsed; the 50 ms manage cadence is applied inside.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let due = match self.last_manage {
            Some(last) => now.duration_since(last) >= self.config.manage_interval(),
            None => true,
        };
        if !due {
            return Ok(());
        }
        self.last_manage = Some(now);

        for pending_id in self.handshaker.manage(now, &mut self.outbox) {
            self.sink.on_closed(pending_id, &Error::HandshakeTimeout);
        }

        for session in self.sessions.values_mut() {
            session.manage(now, self.sink.as_ref(), &mut self.outbox);
        }

        self.reap_failed();
        Ok(())
    }

    /// Drain engine output: pending datagrams first, then the next
    /// wanted timeout.
    pub fn poll_output(&mut self, now: Instant) -> Output {
        if let Some((remote, payload)) = self.outbox.datagrams.pop_front() {
            return Output::Datagram { remote, payload };
        }

        let mut deadline = match self.last_manage {
            Some(last) => last + self.config.manage_interval(),
            None => now,
        };
        if let Some(t) = self.handshaker.next_deadline() {
            deadline = deadline.min(t);
        }
        for session in self.sessions.values() {
            if let Some(t) = session.next_deadline(now) {
                deadline = deadline.min(t);
            }
        }

        Output::Timeout(deadline)
    }

    /// A socket error is fatal for the whole registry.
    pub fn fail_all(&mut self, error: &Error) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!("endpoint failed: {}", error);
        for (id, _) in self.sessions.drain() {
            self.sink.on_closed(id, error);
        }
    }

    // ---- internals --------------------------------------------------

    fn promote(&mut self, done: HandshakeDone, now: Instant) {
        // One session per (far id, address): a duplicate completion is
        // dropped, keeping handshake idempotence.
        let dupe = self
            .sessions
            .values()
            .any(|s| s.far_id() == done.far_id && s.address() == done.address);
        if dupe {
            debug!("duplicate handshake completion for {}, dropped", done.address);
            return;
        }

        let (encrypt_ctx, decrypt_ctx) = done.cipher_contexts();
        let local_id = done.local_id;
        let kind = done.kind;
        let role = done.role;
        let stream_name = done.stream_name.clone();
        let media_id = done.media_id;

        let init = SessionInit {
            local_id,
            far_id: done.far_id,
            address: done.address,
            kind,
            role,
            peer_id: done.peer_id,
            encrypt_ctx,
            decrypt_ctx,
            shared_secret: done.shared_secret,
            local_nonce: done.local_nonce,
            far_nonce: done.far_nonce,
            url: done.url,
        };

        let mut session = Session::new(init, self.config.clone(), self.epoch, now);
        session.on_connected(now, self.sink.as_ref(), &mut self.outbox);

        if kind == SessionKind::Server {
            self.server_session = Some(local_id);
        }

        if let Some((group_id, group_media)) = self.group.clone() {
            if kind == SessionKind::Group {
                session.set_group_media_id(group_media);
                if role == SessionRole::Initiator {
                    let own = *self.handshaker.own_peer_id();
                    session.join_group(&group_id, &own, now, self.sink.as_ref());
                }
            }
        }

        if let (Some(name), SessionRole::Initiator) = (stream_name, role) {
            session.p2p_play(media_id, &name, now, self.sink.as_ref());
        }

        session.flush_pending(now, &mut self.outbox);
        self.sessions.insert(local_id, session);
    }

    fn reap_failed(&mut self) {
        self.sessions.retain(|id, s| {
            let keep = s.status() != SessionStatus::Failed;
            if !keep {
                debug!("reaping failed session {}", id);
            }
            keep
        });
        if let Some(server) = self.server_session {
            if !self.sessions.contains_key(&server) {
                self.server_session = None;
            }
        }
    }

    fn server_address(&self) -> Result<SocketAddr, Error> {
        let id = self.server_session.ok_or_else(not_connected)?;
        self.sessions
            .get(&id)
            .map(|s| s.address())
            .ok_or_else(not_connected)
    }

    fn alloc_media_id(&mut self) -> u16 {
        self.next_media_id += 1;
        self.next_media_id
    }
}

fn not_connected() -> Error {
    Error::Io(std::io::ErrorKind::NotConnected.into())
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("sessions", &self.sessions.len())
            .field("handshaker", &self.handshaker)
            .field("server_session", &self.server_session)
            .finish()
    }
}
