//! The per-peer session engine.
//!
//! A session exists only once the handshake promoted it: it owns its
//! flow and writer tables, the pending sender, its cipher contexts and
//! the keepalive/close lifecycle. Packets arrive here already decrypted;
//! everything it emits goes out through the registry's outbox.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroize;

use crate::codec::CipherContext;
use crate::config::Config;
use crate::flow::Flow;
use crate::media::MediaKind;
use crate::message::{
    chunk, parse_chunks, parse_fragment, parse_fragment_next, parse_id_chunk, write_ack,
    write_fragment_header, Ack, AddressExchange, PacketHeader, MARKER_AMF, MARKER_ECHO,
};
use crate::sender::Sender;
use crate::stream::{
    netstream_signature, parse_signature, EventSink, MainStream, StreamAction, StreamCommand,
    StreamInfo, SIGNATURE_GROUP_CONTROL, SIGNATURE_NETCONNECTION,
};
use crate::writer::Writer;
use crate::Error;

/// RTMFP timestamps tick in 4 ms units.
pub(crate) const TIMESTAMP_SCALE_MS: u64 = 4;

/// A u16 timestamp relative to the endpoint epoch.
pub(crate) fn rtmfp_timestamp(epoch: Instant, now: Instant) -> u16 {
    let ms = now.saturating_duration_since(epoch).as_millis() as u64;
    (ms / TIMESTAMP_SCALE_MS) as u16
}

/// Outgoing datagrams queued by sessions and the handshaker.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub datagrams: std::collections::VecDeque<(SocketAddr, Vec<u8>)>,
}

impl Outbox {
    pub fn push(&mut self, remote: SocketAddr, payload: Vec<u8>) {
        self.datagrams.push_back((remote, payload));
    }
}

/// What the session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Server,
    Peer,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Stopped,
    Handshake,
    Connected,
    NearClosed,
    Failed,
}

pub struct Session {
    local_id: u32,
    far_id: u32,
    address: SocketAddr,
    kind: SessionKind,
    role: SessionRole,
    status: SessionStatus,
    peer_id: Option<[u8; 32]>,

    encrypt_ctx: CipherContext,
    decrypt_ctx: CipherContext,
    shared_secret: Vec<u8>,
    local_nonce: Vec<u8>,
    far_nonce: Vec<u8>,

    flows: HashMap<u64, Flow>,
    writers: HashMap<u64, Writer>,
    next_writer_id: u64,
    main_stream: MainStream,

    sender: Option<Sender>,

    epoch: Instant,
    last_receive: Instant,
    /// Peer's last timestamp, echoed on our next packet.
    time_received: u16,
    echo_pending: bool,
    last_keepalive: Instant,
    last_keepalive_sent: Option<Instant>,
    keepalive_attempts: u32,
    ping_ms: u16,
    near_closed_at: Option<Instant>,

    config: Arc<Config>,
}

/// Everything the handshaker hands over when it promotes a handshake.
pub(crate) struct SessionInit {
    pub local_id: u32,
    pub far_id: u32,
    pub address: SocketAddr,
    pub kind: SessionKind,
    pub role: SessionRole,
    pub peer_id: Option<[u8; 32]>,
    pub encrypt_ctx: CipherContext,
    pub decrypt_ctx: CipherContext,
    pub shared_secret: Vec<u8>,
    pub local_nonce: Vec<u8>,
    pub far_nonce: Vec<u8>,
    /// Server sessions carry the url they were opened with.
    pub url: Option<String>,
}

impl Session {
    pub(crate) fn new(init: SessionInit, config: Arc<Config>, epoch: Instant, now: Instant) -> Self {
        let main_stream = match &init.url {
            Some(url) => MainStream::new(url),
            None => MainStream::new_p2p(),
        };

        Self {
            local_id: init.local_id,
            far_id: init.far_id,
            address: init.address,
            kind: init.kind,
            role: init.role,
            status: SessionStatus::Handshake,
            peer_id: init.peer_id,
            encrypt_ctx: init.encrypt_ctx,
            decrypt_ctx: init.decrypt_ctx,
            shared_secret: init.shared_secret,
            local_nonce: init.local_nonce,
            far_nonce: init.far_nonce,
            flows: HashMap::new(),
            writers: HashMap::new(),
            next_writer_id: 1,
            main_stream,
            sender: None,
            epoch,
            last_receive: now,
            time_received: 0,
            echo_pending: false,
            last_keepalive: now,
            last_keepalive_sent: None,
            keepalive_attempts: 0,
            ping_ms: 0,
            near_closed_at: None,
            config,
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn far_id(&self) -> u32 {
        self.far_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn set_address(&mut self, address: SocketAddr) {
        self.address = address;
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn peer_id(&self) -> Option<&[u8; 32]> {
        self.peer_id.as_ref()
    }

    pub fn ping_ms(&self) -> u16 {
        self.ping_ms
    }

    /// When the peer last answered a keepalive.
    pub fn last_keepalive(&self) -> Instant {
        self.last_keepalive
    }

    pub fn decrypt_ctx(&self) -> &CipherContext {
        &self.decrypt_ctx
    }

    /// Room for chunk payload in the current packet.
    pub fn available_to_write(&self) -> usize {
        match &self.sender {
            Some(s) => s.available(),
            None => crate::codec::RTMFP_MAX_PACKET_SIZE - crate::codec::RTMFP_HEADER_SIZE,
        }
    }

    /// Status moves only forward in severity.
    fn set_status(&mut self, status: SessionStatus) {
        if status > self.status {
            self.status = status;
        }
    }

    /// The handshake is done; open the NetConnection.
    pub(crate) fn on_connected(&mut self, now: Instant, sink: &dyn EventSink, outbox: &mut Outbox) {
        self.set_status(SessionStatus::Connected);
        info!(
            "session {} to {} connected ({:?}/{:?})",
            self.local_id, self.address, self.kind, self.role
        );
        sink.on_connected(self.local_id);

        match self.main_stream.on_transport_connected() {
            Ok(actions) => self.apply_actions(actions, now, sink),
            Err(e) => warn!("connect invoke failed: {}", e),
        }
        self.flush_writers(now, outbox);
        self.flush(now, outbox);
    }

    // ---- inbound ----------------------------------------------------

    /// Process one decrypted packet body.
    pub(crate) fn receive(
        &mut self,
        plaintext: &[u8],
        now: Instant,
        sink: &dyn EventSink,
        outbox: &mut Outbox,
    ) -> Result<Vec<AddressExchange>, Error> {
        if self.status == SessionStatus::Failed {
            return Ok(Vec::new());
        }

        let (rest, header) = PacketHeader::parse(plaintext)?;

        self.last_receive = now;
        self.keepalive_attempts = 0;
        self.time_received = header.time;
        self.echo_pending = true;
        if let Some(echo) = header.echo_time {
            self.update_ping(now, echo);
        }

        let chunks = parse_chunks(rest)?;
        let mut exchanges = Vec::new();

        // 0x11 continuations inherit and increment the previous
        // fragment's ids.
        let mut current: Option<(u64, u64, u64)> = None;

        for c in chunks {
            match c.kind {
                chunk::FRAGMENT | chunk::FRAGMENT_NEXT => {
                    let (flow_id, stage, delta, flags, payload) = if c.kind == chunk::FRAGMENT {
                        let frag = parse_fragment(c.payload)?;
                        if frag.signature.is_some() {
                            self.ensure_flow(&frag);
                        }
                        (
                            frag.flow_id,
                            frag.stage,
                            frag.delta_nack,
                            frag.flags,
                            frag.payload,
                        )
                    } else {
                        let Some((flow_id, stage, delta)) = current else {
                            warn!("continuation without a fragment, dropped");
                            continue;
                        };
                        let (flags, payload) = parse_fragment_next(c.payload)?;
                        (flow_id, stage + 1, delta + 1, flags, payload)
                    };
                    current = Some((flow_id, stage, delta));

                    if !self.flows.contains_key(&flow_id) {
                        // Unknown flow and no header to create it from:
                        // drop the sub-message, keep the chain.
                        warn!("flow {} unfound on session {}", flow_id, self.local_id);
                        continue;
                    }

                    self.receive_fragment(flow_id, stage, flags, payload, now, sink);
                }
                chunk::KEEPALIVE => {
                    self.write_raw_chunk(chunk::KEEPALIVE_ECHO, &[], now, outbox);
                }
                chunk::KEEPALIVE_ECHO => {
                    self.last_keepalive = now;
                }
                chunk::ACK => {
                    let ack = Ack::parse(c.payload)?;
                    self.handle_ack(&ack, now);
                }
                chunk::NACK => {
                    let id = parse_id_chunk(c.payload)?;
                    if let Some(w) = self.writers.get_mut(&id) {
                        w.on_nack();
                    }
                }
                chunk::FAILURE => {
                    warn!("0x0C received, closing session {}", self.local_id);
                    self.fail(Error::ApplicationClosed, sink);
                    return Ok(exchanges);
                }
                chunk::ADDRESS_EXCHANGE => {
                    if self.kind == SessionKind::Server {
                        exchanges.push(AddressExchange::parse(c.payload)?);
                    } else {
                        warn!("address exchange on a non-server session");
                    }
                }
                chunk::SESSION_CLOSE => {
                    // Echo once; a session already winding down stays
                    // quiet so the exchange terminates.
                    if self.status < SessionStatus::NearClosed {
                        info!("session {} closed by peer", self.local_id);
                        self.write_raw_chunk(chunk::SESSION_CLOSE, &[], now, outbox);
                        self.set_status(SessionStatus::NearClosed);
                        self.near_closed_at = Some(now);
                    }
                }
                chunk::WRITER_FAILED => {
                    let id = parse_id_chunk(c.payload)?;
                    if let Some(w) = self.writers.get_mut(&id) {
                        w.fail();
                    }
                    sink.on_writer_failed(self.local_id, id);
                }
                chunk::DIAGNOSTIC => {
                    info!("diagnostic message ({} bytes)", c.payload.len());
                }
                other => {
                    let err = Error::ProtocolViolation(format!("chunk type 0x{:02x}", other));
                    error!("{} on session {}", err, self.local_id);
                    self.fail(err, sink);
                    return Ok(exchanges);
                }
            }
        }

        self.commit_flows(now, outbox);
        self.flush_writers(now, outbox);
        self.flush(now, outbox);

        Ok(exchanges)
    }

    fn ensure_flow(&mut self, frag: &crate::message::FragmentChunk<'_>) {
        if self.flows.contains_key(&frag.flow_id) {
            return;
        }
        let Some(signature) = frag.signature else {
            return;
        };
        match parse_signature(signature) {
            Ok(kind) => {
                debug!(
                    "creating flow {} ({:?}) on session {}",
                    frag.flow_id, kind, self.local_id
                );
                self.flows.insert(
                    frag.flow_id,
                    Flow::new(frag.flow_id, signature.to_vec(), kind, frag.writer_ref),
                );
            }
            Err(e) => {
                // Fails only this flow; the session stays up.
                error!("{} on session {}", e, self.local_id);
            }
        }
    }

    fn receive_fragment(
        &mut self,
        flow_id: u64,
        stage: u64,
        flags: u8,
        payload: &[u8],
        now: Instant,
        sink: &dyn EventSink,
    ) {
        let Some(flow) = self.flows.get_mut(&flow_id) else {
            return;
        };
        let messages = flow.receive(stage, flags, payload);
        let kind = flow.kind().clone();

        for message in messages {
            match self.main_stream.handle_message(&kind, &message) {
                Ok(actions) => self.apply_actions(actions, now, sink),
                Err(e) => warn!("stream message failed: {}", e),
            }
        }
    }

    fn handle_ack(&mut self, ack: &Ack, now: Instant) {
        let Some(writer) = self.writers.get_mut(&ack.flow_id) else {
            debug!("ack for unknown writer {}", ack.flow_id);
            return;
        };
        writer.on_ack(ack, now, self.ping_ms);
        if writer.state() == crate::writer::WriterState::Closed {
            self.writers.remove(&ack.flow_id);
        }
    }

    /// After a chain: acknowledge flows with fresh stages and erase
    /// consumed ones.
    fn commit_flows(&mut self, now: Instant, outbox: &mut Outbox) {
        let mut acks = Vec::new();
        let mut consumed = Vec::new();

        for flow in self.flows.values_mut() {
            if flow.ack_due() {
                let mut payload = Vec::new();
                write_ack(&mut payload, flow.id(), flow.cumulative(), &flow.ack_ranges());
                acks.push(payload);
                flow.clear_ack_due();
            }
            if flow.consumed() {
                consumed.push(flow.id());
            }
        }

        for payload in acks {
            self.write_raw_chunk(chunk::ACK, &payload, now, outbox);
        }
        for id in consumed {
            debug!("flow {} consumed on session {}", id, self.local_id);
            self.flows.remove(&id);
        }
    }

    // ---- outbound ---------------------------------------------------

    fn apply_actions(&mut self, actions: Vec<StreamAction>, now: Instant, sink: &dyn EventSink) {
        for action in actions {
            match action {
                StreamAction::Invoke(payload) => {
                    self.write_to_signature(SIGNATURE_NETCONNECTION.to_vec(), &payload, true);
                }
                StreamAction::SendOnStream {
                    stream_id,
                    payload,
                    reliable,
                } => {
                    self.write_to_signature(netstream_signature(stream_id), &payload, reliable);
                }
                StreamAction::SendGroup(payload) => {
                    self.write_to_signature(SIGNATURE_GROUP_CONTROL.to_vec(), &payload, true);
                }
                StreamAction::Status { code, description } => {
                    debug!("status on session {}: {}", self.local_id, code);
                    sink.on_status(self.local_id, &code, &description);
                }
                StreamAction::Media {
                    media_id,
                    time,
                    kind,
                    payload,
                } => {
                    sink.on_media(media_id, time, kind, &payload);
                }
                StreamAction::PublishReady { media_id } => {
                    sink.on_publish_ready(media_id);
                }
                StreamAction::PlayStarted { media_id } => {
                    sink.on_play_started(media_id);
                }
                StreamAction::PlayRequested { stream_id, name } => {
                    self.main_stream.register_stream(
                        stream_id,
                        StreamInfo {
                            media_id: 0,
                            publish: true,
                            name: name.clone(),
                            audio_reliable: self.config.audio_reliable(),
                            video_reliable: self.config.video_reliable(),
                        },
                    );
                    sink.on_play_request(self.local_id, &name);
                }
                StreamAction::GroupPeer { peer_id } => {
                    sink.on_group_peer(self.local_id, &peer_id);
                }
                StreamAction::GroupHandshake { group_id, peer_id } => {
                    sink.on_group_handshake(self.local_id, &group_id, &peer_id);
                }
                StreamAction::CloseSession => {
                    self.set_status(SessionStatus::NearClosed);
                    self.near_closed_at = Some(now);
                }
            }
        }
    }

    /// Buffer a message on the writer owning `signature`, creating the
    /// writer on first use.
    fn write_to_signature(&mut self, signature: Vec<u8>, payload: &[u8], reliable: bool) {
        let id = self
            .writers
            .values()
            .find(|w| w.signature() == signature)
            .map(|w| w.id());

        let id = match id {
            Some(id) => id,
            None => {
                self.next_writer_id += 1;
                let id = self.next_writer_id;
                // Answer linkage: reference the inbound flow with the
                // same signature, if one exists.
                let flow_ref = self
                    .flows
                    .values()
                    .find(|f| f.signature() == signature)
                    .map(|f| f.id());
                debug!("new writer {} on session {}", id, self.local_id);
                self.writers.insert(id, Writer::new(id, signature, flow_ref));
                id
            }
        };

        // Unwrap is ok, inserted above.
        let writer = self.writers.get_mut(&id).unwrap();
        writer.write_message(payload, reliable);
    }

    /// Feed one media packet to every publishing stream.
    pub(crate) fn send_media(&mut self, time: u32, kind: MediaKind, payload: &[u8]) {
        let targets: Vec<(u64, bool)> = self
            .main_stream
            .publishing_streams()
            .map(|(id, info)| {
                let reliable = match kind {
                    MediaKind::Audio => info.audio_reliable,
                    MediaKind::Video => info.video_reliable,
                    MediaKind::Data => true,
                };
                (id, reliable)
            })
            .collect();

        for (stream_id, reliable) in targets {
            let mut message = Vec::with_capacity(5 + payload.len());
            message.push(match kind {
                MediaKind::Audio => crate::stream::MSG_AUDIO,
                MediaKind::Video => crate::stream::MSG_VIDEO,
                MediaKind::Data => crate::stream::MSG_DATA_AMF3,
            });
            message.extend_from_slice(&time.to_be_bytes());
            message.extend_from_slice(payload);
            self.write_to_signature(netstream_signature(stream_id), &message, reliable);
        }
    }

    /// Emit every fragment the writers consider due.
    fn flush_writers(&mut self, now: Instant, outbox: &mut Outbox) {
        if self.status == SessionStatus::Failed {
            return;
        }

        let ids: Vec<u64> = self.writers.keys().copied().collect();
        for id in ids {
            let (fragments, signature, flow_ref, stage_ack) = {
                let w = self.writers.get_mut(&id).unwrap();
                (
                    w.take_sendable(now, self.ping_ms),
                    w.signature().to_vec(),
                    w.flow_ref(),
                    w.stage_ack(),
                )
            };

            for frag in fragments {
                let mut body = Vec::with_capacity(frag.payload.len() + 24);
                let header = if frag.with_header {
                    Some((signature.as_slice(), flow_ref))
                } else {
                    None
                };
                write_fragment_header(
                    &mut body,
                    frag.flags,
                    id,
                    frag.stage,
                    frag.stage - stage_ack,
                    header,
                );
                body.extend_from_slice(&frag.payload);
                self.write_raw_chunk(chunk::FRAGMENT, &body, now, outbox);
            }
        }
    }

    /// Append a chunk to the pending sender, flushing first if it would
    /// not fit.
    fn write_raw_chunk(&mut self, kind: u8, payload: &[u8], now: Instant, outbox: &mut Outbox) {
        if let Some(sender) = &self.sender {
            if !sender.fits(payload.len()) {
                self.flush(now, outbox);
            }
        }

        let sender = self.sender.get_or_insert_with(|| {
            let (marker, echo) = if self.echo_pending {
                (MARKER_ECHO, Some(self.time_received))
            } else {
                (MARKER_AMF, None)
            };
            Sender::new(
                self.far_id,
                PacketHeader {
                    marker,
                    time: rtmfp_timestamp(self.epoch, now),
                    echo_time: echo,
                },
            )
        });
        self.echo_pending = false;

        sender.write_chunk(kind, payload);
    }

    /// Seal and queue the pending packet, if any.
    pub(crate) fn flush(&mut self, _now: Instant, outbox: &mut Outbox) {
        if let Some(sender) = self.sender.take() {
            outbox.push(self.address, sender.seal(&self.encrypt_ctx));
        }
    }

    fn update_ping(&mut self, now: Instant, echo: u16) {
        let now_ts = rtmfp_timestamp(self.epoch, now);
        let delta = now_ts.wrapping_sub(echo);
        // Ignore wrapped or absurd echoes.
        if delta < u16::MAX / 2 {
            self.ping_ms = delta.saturating_mul(TIMESTAMP_SCALE_MS as u16);
        }
    }

    // ---- host requests ----------------------------------------------

    pub(crate) fn add_stream_command(
        &mut self,
        command: StreamCommand,
        now: Instant,
        sink: &dyn EventSink,
    ) {
        match self.main_stream.add_stream(command) {
            Ok(actions) => self.apply_actions(actions, now, sink),
            Err(e) => warn!("add stream failed: {}", e),
        }
    }

    pub(crate) fn p2p_play(&mut self, media_id: u16, name: &str, now: Instant, sink: &dyn EventSink) {
        match self.main_stream.p2p_play(media_id, name) {
            Ok(actions) => self.apply_actions(actions, now, sink),
            Err(e) => warn!("p2p play failed: {}", e),
        }
    }

    pub(crate) fn join_group(
        &mut self,
        group_id: &[u8],
        own_peer_id: &[u8; 32],
        now: Instant,
        sink: &dyn EventSink,
    ) {
        let actions = self.main_stream.join_group(group_id, own_peer_id);
        self.apply_actions(actions, now, sink);
    }

    pub(crate) fn call(&mut self, function: &str, args: &[String], now: Instant, sink: &dyn EventSink) {
        match self.main_stream.call(function, args) {
            Ok(actions) => self.apply_actions(actions, now, sink),
            Err(e) => warn!("call failed: {}", e),
        }
    }

    pub(crate) fn close_publication(&mut self, name: &str, now: Instant, sink: &dyn EventSink) {
        if let Some(stream_id) = self.main_stream.stream_id_by_name(name) {
            match crate::stream::encode_invoke("closeStream", 0.0, rml_amf0::Amf0Value::Null, vec![])
            {
                Ok(payload) => self.apply_actions(
                    vec![StreamAction::SendOnStream {
                        stream_id,
                        payload,
                        reliable: true,
                    }],
                    now,
                    sink,
                ),
                Err(e) => warn!("closeStream failed: {}", e),
            }
        }
    }

    pub(crate) fn set_group_media_id(&mut self, media_id: u16) {
        self.main_stream.set_group_media_id(media_id);
    }

    /// Emit whatever the writers have buffered and seal the packet.
    pub(crate) fn flush_pending(&mut self, now: Instant, outbox: &mut Outbox) {
        self.flush_writers(now, outbox);
        self.flush(now, outbox);
    }

    /// Orderly (or abrupt) close. Idempotent.
    pub(crate) fn close(&mut self, abrupt: bool, now: Instant, sink: &dyn EventSink, outbox: &mut Outbox) {
        match self.status {
            SessionStatus::NearClosed | SessionStatus::Failed => return,
            _ => {}
        }

        if abrupt {
            self.fail(Error::HostRequest, sink);
            return;
        }

        self.write_raw_chunk(chunk::SESSION_CLOSE, &[], now, outbox);
        self.flush(now, outbox);
        self.set_status(SessionStatus::NearClosed);
        self.near_closed_at = Some(now);
    }

    fn fail(&mut self, reason: Error, sink: &dyn EventSink) {
        if self.status == SessionStatus::Failed {
            return;
        }
        info!("session {} failed: {}", self.local_id, reason);
        self.set_status(SessionStatus::Failed);
        self.writers.clear();
        self.flows.clear();
        self.sender = None;
        sink.on_closed(self.local_id, &reason);
    }

    // ---- timers -----------------------------------------------------

    /// 50 ms tick: keepalives, writer retransmits, close countdown.
    pub(crate) fn manage(&mut self, now: Instant, sink: &dyn EventSink, outbox: &mut Outbox) {
        match self.status {
            SessionStatus::Connected => {
                self.manage_keepalive(now, sink, outbox);
            }
            SessionStatus::NearClosed => {
                let since = self.near_closed_at.map(|t| now.duration_since(t));
                if since.map(|d| d >= self.config.close_linger()).unwrap_or(false) {
                    self.fail(Error::ApplicationClosed, sink);
                    return;
                }
            }
            _ => {}
        }

        self.flush_writers(now, outbox);
        self.flush(now, outbox);
    }

    fn manage_keepalive(&mut self, now: Instant, sink: &dyn EventSink, outbox: &mut Outbox) {
        let interval = self.config.keepalive_interval();
        if now.duration_since(self.last_receive) < interval {
            return;
        }
        let due = match self.last_keepalive_sent {
            Some(sent) => now.duration_since(sent) >= interval,
            None => true,
        };
        if !due {
            return;
        }

        if self.keepalive_attempts >= self.config.keepalive_attempts() {
            self.fail(Error::SessionTimeout, sink);
            return;
        }

        trace!("keepalive {} on session {}", self.keepalive_attempts + 1, self.local_id);
        self.write_raw_chunk(chunk::KEEPALIVE, &[], now, outbox);
        self.keepalive_attempts += 1;
        self.last_keepalive_sent = Some(now);
    }

    /// Earliest instant this session wants a timer.
    pub(crate) fn next_deadline(&self, _now: Instant) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                deadline = Some(match deadline {
                    Some(d) => d.min(t),
                    None => t,
                });
            }
        };

        for w in self.writers.values() {
            consider(w.next_deadline());
        }
        if self.status == SessionStatus::Connected {
            let base = match self.last_keepalive_sent {
                Some(sent) => sent.max(self.last_receive),
                None => self.last_receive,
            };
            consider(Some(base + self.config.keepalive_interval()));
        }
        if let Some(t) = self.near_closed_at {
            consider(Some(t + self.config.close_linger()));
        }

        deadline
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
        self.local_nonce.zeroize();
        self.far_nonce.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &self.local_id)
            .field("far_id", &self.far_id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("flows", &self.flows.len())
            .field("writers", &self.writers.len())
            .finish()
    }
}
