//! The handshaker: every not-yet-established session lives here.
//!
//! Initiator handshakes are keyed by their tag, responder handshakes by
//! the cookie we minted. Completion hands a [`HandshakeDone`] to the
//! registry, which promotes it into a session; the handshake itself is
//! dropped, so a handshake and its session never coexist.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::codec::CipherContext;
use crate::config::Config;
use crate::crypto::{derive_session_keys, peer_id, DiffieHellman, PEER_ID_SIZE};
use crate::message::{
    chunk, parse_chunks, Challenge70, Commit38, Complete78, Hello30, PacketHeader, Redirect71,
    EPD_PEER_ID, INITIATOR_NONCE_PREFIX, INITIATOR_NONCE_SUFFIX, MARKER_HANDSHAKE,
    RESPONDER_NONCE_PREFIX,
};
use crate::registry::next_session_id;
use crate::rng::SeededRng;
use crate::sender::Sender;
use crate::session::{rtmfp_timestamp, Outbox, SessionKind, SessionRole};
use crate::timer::AttemptSchedule;
use crate::util::format_hex;
use crate::Error;

const COOKIE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Initiator: 30 sent, waiting for a 70.
    Hello,
    /// Initiator: 38 sent, waiting for the 78.
    Commit,
    /// Responder: 70 sent, waiting for the 38.
    Challenge,
    /// Responder: 78 sent; kept only to answer duplicate 38s.
    Done,
}

struct Handshake {
    tag: [u8; 16],
    role: SessionRole,
    kind: SessionKind,
    step: Step,
    /// Endpoint discriminator sent in the 30 (url bytes or peer id).
    epd_kind: u8,
    epd: Vec<u8>,
    /// Server url for the session, if this is a server handshake.
    url: Option<String>,
    /// Stream to play once a p2p session is up.
    stream_name: Option<String>,
    media_id: u16,
    /// Candidate addresses; pinned to one once a 70 answers.
    addresses: Vec<SocketAddr>,
    target: Option<SocketAddr>,
    cookie: Option<Vec<u8>>,
    schedule: AttemptSchedule,
    cookie_created: Option<Instant>,
    local_id: u32,
    local_nonce: Vec<u8>,
    far_key: Vec<u8>,
    far_nonce: Vec<u8>,
    /// Serialized 78 body, retained so duplicate 38s get the same
    /// answer instead of a second session.
    answer78: Option<Vec<u8>>,
}

/// Crypto material and identity of a completed handshake, ready to
/// become a session.
pub(crate) struct HandshakeDone {
    pub local_id: u32,
    pub far_id: u32,
    pub address: SocketAddr,
    pub kind: SessionKind,
    pub role: SessionRole,
    pub peer_id: Option<[u8; PEER_ID_SIZE]>,
    pub shared_secret: Vec<u8>,
    pub local_nonce: Vec<u8>,
    pub far_nonce: Vec<u8>,
    pub url: Option<String>,
    pub stream_name: Option<String>,
    pub media_id: u16,
}

impl HandshakeDone {
    /// Build the per-direction cipher contexts.
    pub fn cipher_contexts(&self) -> (CipherContext, CipherContext) {
        let (initiator_nonce, responder_nonce) = match self.role {
            SessionRole::Initiator => (&self.local_nonce, &self.far_nonce),
            SessionRole::Responder => (&self.far_nonce, &self.local_nonce),
        };
        let keys = derive_session_keys(&self.shared_secret, initiator_nonce, responder_nonce);
        match self.role {
            SessionRole::Initiator => (
                CipherContext::new(keys.to_responder),
                CipherContext::new(keys.to_initiator),
            ),
            SessionRole::Responder => (
                CipherContext::new(keys.to_initiator),
                CipherContext::new(keys.to_responder),
            ),
        }
    }
}

/// Table of in-progress handshakes for one endpoint.
pub(crate) struct Handshaker {
    config: Arc<Config>,
    epoch: Instant,
    dh: DiffieHellman,
    own_peer_id: [u8; PEER_ID_SIZE],
    default_ctx: CipherContext,
    rng: SeededRng,
    by_tag: HashMap<[u8; 16], Handshake>,
    cookie_to_tag: HashMap<Vec<u8>, [u8; 16]>,
}

impl Handshaker {
    pub fn new(config: Arc<Config>, epoch: Instant) -> Self {
        let dh = DiffieHellman::generate();
        let own_peer_id = peer_id(dh.public_key());
        let rng = SeededRng::new(config.rng_seed());
        Self {
            config,
            epoch,
            dh,
            own_peer_id,
            default_ctx: CipherContext::default_handshake(),
            rng,
            by_tag: HashMap::new(),
            cookie_to_tag: HashMap::new(),
        }
    }

    pub fn own_peer_id(&self) -> &[u8; PEER_ID_SIZE] {
        &self.own_peer_id
    }

    // ---- starting ---------------------------------------------------

    /// Begin a server handshake: 30 with the url EPD to every address.
    pub fn connect(
        &mut self,
        url: &str,
        addresses: Vec<SocketAddr>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> u32 {
        let mut epd = Vec::with_capacity(url.len());
        epd.extend_from_slice(url.as_bytes());
        self.start_initiator(
            SessionKind::Server,
            crate::message::EPD_URL,
            epd,
            Some(url.to_string()),
            None,
            0,
            addresses,
            now,
            outbox,
        )
    }

    /// Begin a p2p handshake: 30 with the peer-id EPD, normally aimed at
    /// the server which then introduces us.
    pub fn connect_to_peer(
        &mut self,
        peer: [u8; PEER_ID_SIZE],
        kind: SessionKind,
        stream_name: Option<String>,
        media_id: u16,
        addresses: Vec<SocketAddr>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> u32 {
        self.start_initiator(
            kind,
            EPD_PEER_ID,
            peer.to_vec(),
            None,
            stream_name,
            media_id,
            addresses,
            now,
            outbox,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start_initiator(
        &mut self,
        kind: SessionKind,
        epd_kind: u8,
        epd: Vec<u8>,
        url: Option<String>,
        stream_name: Option<String>,
        media_id: u16,
        addresses: Vec<SocketAddr>,
        now: Instant,
        outbox: &mut Outbox,
    ) -> u32 {
        let mut tag = [0u8; 16];
        self.rng.fill(&mut tag);
        let local_id = next_session_id();

        let mut handshake = Handshake {
            tag,
            role: SessionRole::Initiator,
            kind,
            step: Step::Hello,
            epd_kind,
            epd,
            url,
            stream_name,
            media_id,
            addresses,
            target: None,
            cookie: None,
            schedule: AttemptSchedule::new(self.config.handshake_attempts()),
            cookie_created: None,
            local_id,
            local_nonce: Vec::new(),
            far_key: Vec::new(),
            far_nonce: Vec::new(),
            answer78: None,
        };

        debug!(
            "handshake {} starting, tag {}",
            local_id,
            format_hex(&tag)
        );
        handshake.schedule.begin(now);
        self.send_hello(&handshake, now, outbox);
        self.by_tag.insert(tag, handshake);

        local_id
    }

    /// Rendezvous responder half: the server sent us a 0x0F naming a
    /// peer that is dialing us. We eagerly send the 70 to every listed
    /// address, pre-registered as responder.
    pub fn start_responder(
        &mut self,
        tag: [u8; 16],
        addresses: Vec<SocketAddr>,
        now: Instant,
        outbox: &mut Outbox,
    ) {
        if self.by_tag.contains_key(&tag) {
            // Second 0x0F for the same rendezvous.
            return;
        }

        let mut cookie = vec![0u8; COOKIE_SIZE];
        self.rng.fill(&mut cookie);

        let handshake = Handshake {
            tag,
            role: SessionRole::Responder,
            kind: SessionKind::Peer,
            step: Step::Challenge,
            epd_kind: EPD_PEER_ID,
            epd: Vec::new(),
            url: None,
            stream_name: None,
            media_id: 0,
            addresses,
            target: None,
            cookie: Some(cookie.clone()),
            schedule: AttemptSchedule::new(self.config.handshake_attempts()),
            cookie_created: Some(now),
            local_id: next_session_id(),
            local_nonce: Vec::new(),
            far_key: Vec::new(),
            far_nonce: Vec::new(),
            answer78: None,
        };

        let challenge = Challenge70 {
            tag,
            cookie: cookie.clone(),
            far_key: self.dh.public_key().to_vec(),
        };
        let mut body = Vec::new();
        challenge.serialize(&mut body);
        for addr in handshake.addresses.clone() {
            self.send_chunk(addr, chunk::CHALLENGE, &body, now, outbox);
        }

        self.cookie_to_tag.insert(cookie, tag);
        self.by_tag.insert(tag, handshake);
    }

    // ---- inbound ----------------------------------------------------

    /// Process one decrypted handshake packet (session id zero).
    pub fn receive(
        &mut self,
        from: SocketAddr,
        plaintext: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<Vec<HandshakeDone>, Error> {
        let (rest, header) = PacketHeader::parse(plaintext)?;
        if header.marker != MARKER_HANDSHAKE {
            return Err(Error::MalformedPacket("handshake marker"));
        }

        let mut done = Vec::new();
        for c in parse_chunks(rest)? {
            match c.kind {
                chunk::HELLO => self.handle_hello(from, c.payload, now, outbox)?,
                chunk::CHALLENGE => self.handle_challenge(from, c.payload, now, outbox)?,
                chunk::REDIRECT => self.handle_redirect(c.payload, now, outbox)?,
                chunk::COMMIT => {
                    if let Some(d) = self.handle_commit(from, c.payload, now, outbox)? {
                        done.push(d);
                    }
                }
                chunk::COMPLETE => {
                    if let Some(d) = self.handle_complete(from, c.payload)? {
                        done.push(d);
                    }
                }
                other => {
                    debug!("handshake chunk 0x{:02x} ignored", other);
                }
            }
        }

        Ok(done)
    }

    /// A peer probes us directly (concurrent p2p dial): answer with a
    /// 70 if the EPD names us.
    fn handle_hello(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), Error> {
        let hello = Hello30::parse(payload)?;
        if hello.epd_kind != EPD_PEER_ID || hello.epd != self.own_peer_id {
            trace!("30 for a different endpoint, dropped");
            return Ok(());
        }

        self.start_responder(hello.tag, vec![from], now, outbox);
        Ok(())
    }

    fn handle_challenge(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), Error> {
        let challenge = Challenge70::parse(payload)?;
        let Some(handshake) = self.by_tag.get_mut(&challenge.tag) else {
            trace!("70 with unknown tag, dropped");
            return Ok(());
        };
        if handshake.role != SessionRole::Initiator {
            return Ok(());
        }
        if handshake.cookie.is_some() {
            // A second 70 (slower address, retransmit): first one won.
            trace!("duplicate 70, dropped");
            return Ok(());
        }

        handshake.cookie = Some(challenge.cookie.clone());
        handshake.far_key = challenge.far_key.clone();
        handshake.target = Some(from);
        handshake.step = Step::Commit;
        handshake.schedule.reset(now);

        // Initiator nonce: fixed prefix, 64 random bytes, fixed suffix.
        let mut nonce = Vec::with_capacity(
            INITIATOR_NONCE_PREFIX.len() + 64 + INITIATOR_NONCE_SUFFIX.len(),
        );
        nonce.extend_from_slice(&INITIATOR_NONCE_PREFIX);
        let mut random = [0u8; 64];
        self.rng.fill(&mut random);
        nonce.extend_from_slice(&random);
        nonce.extend_from_slice(&INITIATOR_NONCE_SUFFIX);
        handshake.local_nonce = nonce;

        let commit = Commit38 {
            initiator_id: handshake.local_id,
            cookie: challenge.cookie,
            public_key: self.dh.public_key().to_vec(),
            nonce: handshake.local_nonce.clone(),
        };
        let mut body = Vec::new();
        commit.serialize(&mut body);
        self.send_chunk(from, chunk::COMMIT, &body, now, outbox);
        Ok(())
    }

    fn handle_redirect(
        &mut self,
        payload: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<(), Error> {
        let redirect = Redirect71::parse(payload)?;
        let Some(handshake) = self.by_tag.get_mut(&redirect.tag) else {
            trace!("71 with unknown tag, dropped");
            return Ok(());
        };
        if handshake.step != Step::Hello {
            return Ok(());
        }

        let mut fresh = Vec::new();
        for (_, addr) in redirect.addresses {
            if !handshake.addresses.contains(&addr) {
                handshake.addresses.push(addr);
                fresh.push(addr);
            }
        }
        info!("redirection to {} address(es)", fresh.len());

        let snapshot = self.by_tag.get(&redirect.tag).unwrap();
        let hello = Hello30 {
            epd_kind: snapshot.epd_kind,
            epd: snapshot.epd.clone(),
            tag: snapshot.tag,
        };
        let mut body = Vec::new();
        hello.serialize(&mut body);
        for addr in fresh {
            self.send_chunk(addr, chunk::HELLO, &body, now, outbox);
        }
        Ok(())
    }

    /// Responder: the initiator committed its key. Derive, answer 78,
    /// and promote.
    fn handle_commit(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<Option<HandshakeDone>, Error> {
        let commit = Commit38::parse(payload)?;

        let tag = match self.cookie_to_tag.get(&commit.cookie) {
            Some(tag) => *tag,
            None => {
                // Unknown cookie: treat the 38 as the first thing we
                // saw and answer as a fresh responder.
                debug!("38 with unknown cookie, accepting as fresh responder");
                let mut tag = [0u8; 16];
                self.rng.fill(&mut tag);
                let handshake = Handshake {
                    tag,
                    role: SessionRole::Responder,
                    kind: SessionKind::Peer,
                    step: Step::Challenge,
                    epd_kind: EPD_PEER_ID,
                    epd: Vec::new(),
                    url: None,
                    stream_name: None,
                    media_id: 0,
                    addresses: vec![from],
                    target: None,
                    cookie: Some(commit.cookie.clone()),
                    schedule: AttemptSchedule::new(self.config.handshake_attempts()),
                    cookie_created: Some(now),
                    local_id: next_session_id(),
                    local_nonce: Vec::new(),
                    far_key: Vec::new(),
                    far_nonce: Vec::new(),
                    answer78: None,
                };
                self.cookie_to_tag.insert(commit.cookie.clone(), tag);
                self.by_tag.insert(tag, handshake);
                tag
            }
        };

        // Unwrap is ok: both arms above guarantee the entry.
        let handshake = self.by_tag.get_mut(&tag).unwrap();

        if handshake.step == Step::Done {
            // Duplicate 38 (our 78 was lost): answer again, same session.
            if let Some(body) = handshake.answer78.clone() {
                debug!("duplicate 38, resending 78");
                self.send_chunk(from, chunk::COMPLETE, &body, now, outbox);
            }
            return Ok(None);
        }

        let shared_secret = self.dh.shared_secret(&commit.public_key)?;
        let far_peer_id = peer_id(&commit.public_key);

        // Responder nonce: fixed prefix plus 64 random bytes.
        let mut nonce = Vec::with_capacity(RESPONDER_NONCE_PREFIX.len() + 64);
        nonce.extend_from_slice(&RESPONDER_NONCE_PREFIX);
        let mut random = [0u8; 64];
        self.rng.fill(&mut random);
        nonce.extend_from_slice(&random);

        let complete = Complete78 {
            responder_id: handshake.local_id,
            nonce: nonce.clone(),
        };
        let mut body = Vec::new();
        complete.serialize(&mut body);

        handshake.step = Step::Done;
        handshake.local_nonce = nonce.clone();
        handshake.far_nonce = commit.nonce.clone();
        handshake.answer78 = Some(body.clone());
        let local_id = handshake.local_id;
        let kind = handshake.kind;

        self.send_chunk(from, chunk::COMPLETE, &body, now, outbox);

        info!(
            "responder handshake complete with peer {}",
            format_hex(&far_peer_id)
        );

        Ok(Some(HandshakeDone {
            local_id,
            far_id: commit.initiator_id,
            address: from,
            kind,
            role: SessionRole::Responder,
            peer_id: Some(far_peer_id),
            shared_secret: shared_secret.to_vec(),
            local_nonce: nonce,
            far_nonce: commit.nonce,
            url: None,
            stream_name: None,
            media_id: 0,
        }))
    }

    /// Initiator: the responder completed. Derive and promote.
    fn handle_complete(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<Option<HandshakeDone>, Error> {
        let complete = Complete78::parse(payload)?;

        // The 78 carries no tag: match by the pinned address.
        let tag = self
            .by_tag
            .iter()
            .find(|(_, h)| {
                h.role == SessionRole::Initiator
                    && h.step == Step::Commit
                    && h.target == Some(from)
            })
            .map(|(tag, _)| *tag);
        let Some(tag) = tag else {
            trace!("78 from unknown address, dropped");
            return Ok(None);
        };

        // Unwrap is ok: found above.
        let handshake = self.by_tag.remove(&tag).unwrap();
        if let Some(cookie) = &handshake.cookie {
            self.cookie_to_tag.remove(cookie);
        }

        let shared_secret = self.dh.shared_secret(&handshake.far_key)?;
        let far_peer_id = match handshake.kind {
            SessionKind::Server => None,
            _ => Some(peer_id(&handshake.far_key)),
        };

        Ok(Some(HandshakeDone {
            local_id: handshake.local_id,
            far_id: complete.responder_id,
            address: from,
            kind: handshake.kind,
            role: SessionRole::Initiator,
            peer_id: far_peer_id,
            shared_secret: shared_secret.to_vec(),
            local_nonce: handshake.local_nonce,
            far_nonce: complete.nonce,
            url: handshake.url,
            stream_name: handshake.stream_name,
            media_id: handshake.media_id,
        }))
    }

    // ---- timers -----------------------------------------------------

    /// Retransmit due probes; expire exhausted handshakes and stale
    /// cookies. Returns the pending session ids that timed out.
    pub fn manage(&mut self, now: Instant, outbox: &mut Outbox) -> Vec<u32> {
        let mut failed = Vec::new();
        let mut resend: Vec<[u8; 16]> = Vec::new();
        let mut expired: Vec<[u8; 16]> = Vec::new();

        for (tag, handshake) in &mut self.by_tag {
            match handshake.role {
                SessionRole::Initiator => {
                    if !handshake.schedule.due(now) {
                        continue;
                    }
                    if handshake.schedule.exhausted() {
                        warn!(
                            "handshake {} timed out after {} attempts",
                            handshake.local_id,
                            handshake.schedule.attempts()
                        );
                        failed.push(handshake.local_id);
                        expired.push(*tag);
                    } else {
                        resend.push(*tag);
                    }
                }
                SessionRole::Responder => {
                    let stale = handshake
                        .cookie_created
                        .map(|t| now.duration_since(t) >= self.config.cookie_lifetime())
                        .unwrap_or(true);
                    if stale {
                        expired.push(*tag);
                    }
                }
            }
        }

        for tag in resend {
            // Unwrap is ok: collected from the map just above.
            let handshake = self.by_tag.get_mut(&tag).unwrap();
            handshake.schedule.record_attempt();
            let step = handshake.step;
            let n = handshake.schedule.attempts();
            debug!("handshake {} attempt {}", handshake.local_id, n);

            match step {
                Step::Hello => {
                    let hello = Hello30 {
                        epd_kind: handshake.epd_kind,
                        epd: handshake.epd.clone(),
                        tag,
                    };
                    let mut body = Vec::new();
                    hello.serialize(&mut body);
                    for addr in self.by_tag.get(&tag).unwrap().addresses.clone() {
                        self.send_chunk(addr, chunk::HELLO, &body, now, outbox);
                    }
                }
                Step::Commit => {
                    let handshake = self.by_tag.get(&tag).unwrap();
                    let commit = Commit38 {
                        initiator_id: handshake.local_id,
                        // Unwrap is ok: Commit step implies a cookie.
                        cookie: handshake.cookie.clone().unwrap(),
                        public_key: self.dh.public_key().to_vec(),
                        nonce: handshake.local_nonce.clone(),
                    };
                    let mut body = Vec::new();
                    commit.serialize(&mut body);
                    if let Some(addr) = handshake.target {
                        self.send_chunk(addr, chunk::COMMIT, &body, now, outbox);
                    }
                }
                _ => {}
            }
        }

        for tag in expired {
            if let Some(handshake) = self.by_tag.remove(&tag) {
                if let Some(cookie) = &handshake.cookie {
                    self.cookie_to_tag.remove(cookie);
                }
            }
        }

        failed
    }

    /// Earliest retransmission deadline over all initiator handshakes.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_tag
            .values()
            .filter(|h| h.role == SessionRole::Initiator)
            .filter_map(|h| h.schedule.next_deadline())
            .min()
    }

    // ---- sending ----------------------------------------------------

    fn send_hello(&self, handshake: &Handshake, now: Instant, outbox: &mut Outbox) {
        let hello = Hello30 {
            epd_kind: handshake.epd_kind,
            epd: handshake.epd.clone(),
            tag: handshake.tag,
        };
        let mut body = Vec::new();
        hello.serialize(&mut body);
        for addr in &handshake.addresses {
            self.send_chunk(*addr, chunk::HELLO, &body, now, outbox);
        }
    }

    /// Wrap one chunk in a handshake packet (marker 0x0B, session id 0,
    /// default cipher).
    fn send_chunk(
        &self,
        to: SocketAddr,
        kind: u8,
        body: &[u8],
        now: Instant,
        outbox: &mut Outbox,
    ) {
        let header = PacketHeader {
            marker: MARKER_HANDSHAKE,
            time: rtmfp_timestamp(self.epoch, now),
            echo_time: None,
        };
        let mut sender = Sender::new(0, header);
        sender.write_chunk(kind, body);
        outbox.push(to, sender.seal(&self.default_ctx));
    }
}

impl std::fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshaker")
            .field("pending", &self.by_tag.len())
            .field("cookies", &self.cookie_to_tag.len())
            .finish()
    }
}
