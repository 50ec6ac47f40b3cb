//! Application stream layer.
//!
//! Reassembled flow payloads land here. Flow signatures select the
//! stream kind; NetConnection and NetStream payloads are framed
//! `type:u8, time:u32, body` with AMF0 command bodies, NetGroup control
//! payloads carry their own type byte. Everything user-visible funnels
//! into the single [`EventSink`] the host provides.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;

use rml_amf0::Amf0Value;
use sha2::{Digest, Sha256};

use crate::crypto::PEER_ID_SIZE;
use crate::media::MediaKind;
use crate::util::{format_hex, vlu, write_vlu};
use crate::Error;

/// NetConnection control flow.
pub const SIGNATURE_NETCONNECTION: [u8; 5] = [0x00, 0x54, 0x43, 0x04, 0x00];
/// NetStream flows append the stream id to this prefix.
pub const SIGNATURE_NETSTREAM_PREFIX: [u8; 4] = [0x00, 0x54, 0x43, 0x04];
/// NetGroup control flow.
pub const SIGNATURE_GROUP_CONTROL: [u8; 5] = [0x00, 0x47, 0x43, 0x01, 0x00];
/// NetGroup media flow.
pub const SIGNATURE_GROUP_MEDIA: [u8; 5] = [0x00, 0x47, 0x43, 0x02, 0x00];

/// Message kinds inside NetConnection/NetStream flow payloads.
pub const MSG_AUDIO: u8 = 0x08;
pub const MSG_VIDEO: u8 = 0x09;
pub const MSG_DATA_AMF3: u8 = 0x0F;
pub const MSG_INVOCATION: u8 = 0x14;

/// NetGroup control message kinds.
pub mod group {
    pub const INIT: u8 = 0x01;
    pub const REPORT: u8 = 0x0A;
    pub const MEMBER: u8 = 0x0B;
    pub const BEGIN: u8 = 0x0E;
    pub const MEDIA_DATA: u8 = 0x20;
    pub const INFOS: u8 = 0x21;
    pub const FRAGMENTS_MAP: u8 = 0x22;
    pub const PLAY_PUSH: u8 = 0x23;
    pub const PLAY_PULL: u8 = 0x2B;
    pub const MEDIA_START: u8 = 0x30;
    pub const MEDIA_NEXT: u8 = 0x31;
    pub const MEDIA_END: u8 = 0x32;
}

/// What a flow signature identifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Connection,
    Stream(u64),
    GroupControl,
    GroupMedia,
}

/// Map a signature to its stream kind. Anything unrecognized fails the
/// flow (and only the flow) with [`Error::UnknownSignature`].
pub fn parse_signature(signature: &[u8]) -> Result<StreamKind, Error> {
    if signature == SIGNATURE_NETCONNECTION {
        return Ok(StreamKind::Connection);
    }
    if signature == SIGNATURE_GROUP_CONTROL {
        return Ok(StreamKind::GroupControl);
    }
    if signature == SIGNATURE_GROUP_MEDIA {
        return Ok(StreamKind::GroupMedia);
    }
    if let Some(rest) = signature.strip_prefix(&SIGNATURE_NETSTREAM_PREFIX[..]) {
        if let Ok((_, id)) = vlu(rest) {
            if id > 0 {
                return Ok(StreamKind::Stream(id));
            }
        }
    }
    Err(Error::UnknownSignature(signature.to_vec()))
}

/// The signature of the NetStream flow for `stream_id`.
pub fn netstream_signature(stream_id: u64) -> Vec<u8> {
    let mut sig = SIGNATURE_NETSTREAM_PREFIX.to_vec();
    write_vlu(&mut sig, stream_id);
    sig
}

/// Events the engine surfaces to the host. One sink serves the whole
/// endpoint; sessions are identified by their local id.
pub trait EventSink: Send + Sync {
    /// NetConnection/NetStream status event.
    fn on_status(&self, _session_id: u32, _code: &str, _description: &str) {}
    /// Transport-level handshake completed.
    fn on_connected(&self, _session_id: u32) {}
    /// The session is gone.
    fn on_closed(&self, _session_id: u32, _reason: &Error) {}
    /// Media arrived for a subscribed stream.
    fn on_media(&self, _media_id: u16, _time: u32, _kind: MediaKind, _payload: &[u8]) {}
    /// Our publication was accepted.
    fn on_publish_ready(&self, _media_id: u16) {}
    /// A subscribed stream started playing.
    fn on_play_started(&self, _media_id: u16) {}
    /// A peer asked to play one of our publications.
    fn on_play_request(&self, _session_id: u32, _stream_name: &str) {}
    /// A group member id was announced.
    fn on_group_peer(&self, _session_id: u32, _peer_id: &[u8; PEER_ID_SIZE]) {}
    /// A connected peer opened the group handshake.
    fn on_group_handshake(&self, _session_id: u32, _group_id: &[u8], _peer_id: &[u8; PEER_ID_SIZE]) {
    }
    /// A single writer died (0x5E); the session stays up.
    fn on_writer_failed(&self, _session_id: u32, _writer_id: u64) {}
}

/// What the session should do after the stream layer processed a
/// message or a host request.
#[derive(Debug)]
pub enum StreamAction {
    /// Send an invocation on the NetConnection writer.
    Invoke(Vec<u8>),
    /// Send a message on the NetStream writer for `stream_id`.
    SendOnStream {
        stream_id: u64,
        payload: Vec<u8>,
        reliable: bool,
    },
    /// Send a message on the NetGroup control writer.
    SendGroup(Vec<u8>),
    /// Surface a status event.
    Status { code: String, description: String },
    /// Media for the host.
    Media {
        media_id: u16,
        time: u32,
        kind: MediaKind,
        payload: Vec<u8>,
    },
    /// Our publish request was accepted.
    PublishReady { media_id: u16 },
    /// Play started on a subscribed stream.
    PlayStarted { media_id: u16 },
    /// A peer asked to play `name` on `stream_id`.
    PlayRequested { stream_id: u64, name: String },
    /// Group membership announcement.
    GroupPeer { peer_id: [u8; PEER_ID_SIZE] },
    /// Group handshake from a connected peer.
    GroupHandshake {
        group_id: Vec<u8>,
        peer_id: [u8; PEER_ID_SIZE],
    },
    /// The peer asked for the session to end.
    CloseSession,
}

/// A host play/publish request bound for the main stream.
#[derive(Debug, Clone)]
pub struct StreamCommand {
    pub media_id: u16,
    pub publish: bool,
    pub name: String,
    pub audio_reliable: bool,
    pub video_reliable: bool,
}

#[derive(Debug)]
enum Pending {
    Connect,
    CreateStream(StreamCommand),
}

#[derive(Debug)]
pub struct StreamInfo {
    pub media_id: u16,
    pub publish: bool,
    pub name: String,
    pub audio_reliable: bool,
    pub video_reliable: bool,
}

/// Per-session NetConnection state: pending transactions, stream
/// commands waiting for connect success, and the stream table.
#[derive(Debug)]
pub struct MainStream {
    url: String,
    app: String,
    next_transaction: u64,
    pending: HashMap<u64, Pending>,
    waiting: VecDeque<StreamCommand>,
    streams: HashMap<u64, StreamInfo>,
    connected: bool,
    /// Media id group media surfaces under on this session.
    group_media_id: Option<u16>,
}

impl MainStream {
    pub fn new(url: &str) -> Self {
        // rtmfp://host[:port]/app[/instance]
        let app = url
            .splitn(4, '/')
            .nth(3)
            .unwrap_or_default()
            .to_string();
        Self {
            url: url.to_string(),
            app,
            next_transaction: 0,
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            streams: HashMap::new(),
            connected: false,
            group_media_id: None,
        }
    }

    /// A session that talks to a peer directly: no connect command, the
    /// play goes straight onto stream 1.
    pub fn new_p2p() -> Self {
        let mut s = Self::new("");
        s.connected = true;
        s
    }

    pub fn stream(&self, stream_id: u64) -> Option<&StreamInfo> {
        self.streams.get(&stream_id)
    }

    pub fn stream_id_by_name(&self, name: &str) -> Option<u64> {
        self.streams
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(id, _)| *id)
    }

    pub fn set_group_media_id(&mut self, media_id: u16) {
        self.group_media_id = Some(media_id);
    }

    /// Streams we publish into, for the media fan-out.
    pub fn publishing_streams(&self) -> impl Iterator<Item = (u64, &StreamInfo)> {
        self.streams
            .iter()
            .filter(|(_, info)| info.publish)
            .map(|(id, info)| (*id, info))
    }

    /// Register a stream without a createStream round trip (p2p play,
    /// responder side of a play request).
    pub fn register_stream(&mut self, stream_id: u64, info: StreamInfo) {
        self.streams.insert(stream_id, info);
    }

    /// The transport handshake finished: send the connect invocation.
    pub fn on_transport_connected(&mut self) -> Result<Vec<StreamAction>, Error> {
        if self.url.is_empty() {
            return Ok(Vec::new());
        }

        let transaction = self.take_transaction();
        self.pending.insert(transaction, Pending::Connect);

        let mut object = HashMap::new();
        object.insert("app".into(), Amf0Value::Utf8String(self.app.clone()));
        object.insert("tcUrl".into(), Amf0Value::Utf8String(self.url.clone()));
        object.insert(
            "flashVer".into(),
            Amf0Value::Utf8String("WIN 20,0,0,286".into()),
        );
        object.insert("fpad".into(), Amf0Value::Boolean(false));
        object.insert("capabilities".into(), Amf0Value::Number(235.0));
        object.insert("audioCodecs".into(), Amf0Value::Number(3575.0));
        object.insert("videoCodecs".into(), Amf0Value::Number(252.0));
        object.insert("videoFunction".into(), Amf0Value::Number(1.0));
        object.insert("objectEncoding".into(), Amf0Value::Number(0.0));

        let payload = encode_invoke(
            "connect",
            transaction as f64,
            Amf0Value::Object(object),
            vec![],
        )?;
        Ok(vec![StreamAction::Invoke(payload)])
    }

    /// Queue a play/publish. Fires createStream at once when the
    /// connection is up, otherwise waits for connect success.
    pub fn add_stream(&mut self, command: StreamCommand) -> Result<Vec<StreamAction>, Error> {
        if self.connected {
            self.create_stream(command)
        } else {
            self.waiting.push_back(command);
            Ok(Vec::new())
        }
    }

    fn create_stream(&mut self, command: StreamCommand) -> Result<Vec<StreamAction>, Error> {
        let transaction = self.take_transaction();
        let payload = encode_invoke(
            "createStream",
            transaction as f64,
            Amf0Value::Null,
            vec![],
        )?;
        self.pending
            .insert(transaction, Pending::CreateStream(command));
        Ok(vec![StreamAction::Invoke(payload)])
    }

    /// Start playing `name` directly on stream 1 of a p2p session.
    pub fn p2p_play(&mut self, media_id: u16, name: &str) -> Result<Vec<StreamAction>, Error> {
        self.register_stream(
            1,
            StreamInfo {
                media_id,
                publish: false,
                name: name.to_string(),
                audio_reliable: false,
                video_reliable: false,
            },
        );
        let payload = encode_invoke(
            "play",
            0.0,
            Amf0Value::Null,
            vec![Amf0Value::Utf8String(name.to_string())],
        )?;
        Ok(vec![StreamAction::SendOnStream {
            stream_id: 1,
            payload,
            reliable: true,
        }])
    }

    /// Join a NetGroup: the handshake triple on the group control flow.
    pub fn join_group(
        &mut self,
        group_id: &[u8],
        peer_id: &[u8; PEER_ID_SIZE],
    ) -> Vec<StreamAction> {
        vec![StreamAction::SendGroup(group_init(group_id, peer_id))]
    }

    /// A host-invoked remote function call.
    pub fn call(&mut self, function: &str, args: &[String]) -> Result<Vec<StreamAction>, Error> {
        let amf_args = args
            .iter()
            .map(|a| Amf0Value::Utf8String(a.clone()))
            .collect();
        let payload = encode_invoke(function, 0.0, Amf0Value::Null, amf_args)?;
        Ok(vec![StreamAction::Invoke(payload)])
    }

    /// Route one reassembled flow payload.
    pub fn handle_message(
        &mut self,
        kind: &StreamKind,
        payload: &[u8],
    ) -> Result<Vec<StreamAction>, Error> {
        match kind {
            StreamKind::Connection => self.handle_flash_message(None, payload),
            StreamKind::Stream(id) => self.handle_flash_message(Some(*id), payload),
            StreamKind::GroupControl => Ok(self.handle_group_control(payload)),
            StreamKind::GroupMedia => Ok(self.handle_group_media(payload)),
        }
    }

    fn handle_flash_message(
        &mut self,
        stream_id: Option<u64>,
        payload: &[u8],
    ) -> Result<Vec<StreamAction>, Error> {
        if payload.len() < 5 {
            warn!("flash message too short");
            return Ok(Vec::new());
        }
        let msg_type = payload[0];
        let time = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let body = &payload[5..];

        match msg_type {
            MSG_AUDIO | MSG_VIDEO => {
                let Some(id) = stream_id else {
                    warn!("media message on the connection flow");
                    return Ok(Vec::new());
                };
                let Some(info) = self.streams.get(&id) else {
                    debug!("media for unknown stream {}", id);
                    return Ok(Vec::new());
                };
                let kind = if msg_type == MSG_AUDIO {
                    MediaKind::Audio
                } else {
                    MediaKind::Video
                };
                Ok(vec![StreamAction::Media {
                    media_id: info.media_id,
                    time,
                    kind,
                    payload: body.to_vec(),
                }])
            }
            MSG_INVOCATION => match decode_invocation(body) {
                Ok((name, transaction, values)) => {
                    self.handle_command(stream_id, &name, transaction, values)
                }
                Err(e) => {
                    warn!("undecodable invocation: {}", e);
                    Ok(Vec::new())
                }
            },
            MSG_DATA_AMF3 => {
                trace!("data message ({} bytes) ignored", body.len());
                Ok(Vec::new())
            }
            other => {
                debug!("flash message type 0x{:02x} ignored", other);
                Ok(Vec::new())
            }
        }
    }

    fn handle_command(
        &mut self,
        stream_id: Option<u64>,
        name: &str,
        transaction: f64,
        values: Vec<Amf0Value>,
    ) -> Result<Vec<StreamAction>, Error> {
        match name {
            "_result" => self.handle_result(transaction, values),
            "_error" => {
                let (code, description) = status_of(&values)
                    .unwrap_or_else(|| ("NetConnection.Call.Failed".into(), String::new()));
                Ok(vec![StreamAction::Status { code, description }])
            }
            "onStatus" => Ok(self.handle_on_status(stream_id, &values)),
            "play" => {
                // A peer wants one of our publications.
                let Some(id) = stream_id else {
                    warn!("play command on the connection flow");
                    return Ok(Vec::new());
                };
                let stream_name = values.iter().find_map(|v| match v {
                    Amf0Value::Utf8String(s) => Some(s.clone()),
                    _ => None,
                });
                let Some(stream_name) = stream_name else {
                    warn!("play without a stream name");
                    return Ok(Vec::new());
                };

                let mut actions = vec![
                    StreamAction::SendOnStream {
                        stream_id: id,
                        payload: status_invoke(
                            "NetStream.Play.Reset",
                            &format!("Playing and resetting {}", stream_name),
                        )?,
                        reliable: true,
                    },
                    StreamAction::SendOnStream {
                        stream_id: id,
                        payload: status_invoke(
                            "NetStream.Play.Start",
                            &format!("Started playing {}", stream_name),
                        )?,
                        reliable: true,
                    },
                ];
                actions.push(StreamAction::PlayRequested {
                    stream_id: id,
                    name: stream_name,
                });
                Ok(actions)
            }
            "closeStream" => {
                debug!("closeStream on stream {:?}", stream_id);
                Ok(Vec::new())
            }
            other => {
                debug!("unhandled command {:?}", other);
                Ok(Vec::new())
            }
        }
    }

    fn handle_result(
        &mut self,
        transaction: f64,
        values: Vec<Amf0Value>,
    ) -> Result<Vec<StreamAction>, Error> {
        let Some(pending) = self.pending.remove(&(transaction as u64)) else {
            debug!("_result for unknown transaction {}", transaction);
            return Ok(Vec::new());
        };

        match pending {
            Pending::Connect => {
                let (code, description) = status_of(&values)
                    .unwrap_or_else(|| ("NetConnection.Connect.Success".into(), String::new()));
                let mut actions = vec![StreamAction::Status {
                    code: code.clone(),
                    description,
                }];

                if code == "NetConnection.Connect.Success" {
                    self.connected = true;
                    // Keep the NAT mapping open for p2p introductions.
                    actions.push(StreamAction::Invoke(encode_invoke(
                        "setPeerInfo",
                        0.0,
                        Amf0Value::Null,
                        vec![],
                    )?));
                    while let Some(command) = self.waiting.pop_front() {
                        actions.extend(self.create_stream(command)?);
                    }
                } else {
                    actions.push(StreamAction::CloseSession);
                }
                Ok(actions)
            }
            Pending::CreateStream(command) => {
                let stream_id = values.iter().rev().find_map(|v| match v {
                    Amf0Value::Number(n) => Some(*n as u64),
                    _ => None,
                });
                let Some(stream_id) = stream_id else {
                    warn!("createStream result without a stream id");
                    return Ok(Vec::new());
                };

                debug!(
                    "stream {} created for {} ({})",
                    stream_id,
                    command.name,
                    if command.publish { "publish" } else { "play" }
                );

                let verb = if command.publish { "publish" } else { "play" };
                let mut args = vec![Amf0Value::Utf8String(command.name.clone())];
                if command.publish {
                    args.push(Amf0Value::Utf8String("live".into()));
                }
                let payload = encode_invoke(verb, 0.0, Amf0Value::Null, args)?;

                self.streams.insert(
                    stream_id,
                    StreamInfo {
                        media_id: command.media_id,
                        publish: command.publish,
                        name: command.name,
                        audio_reliable: command.audio_reliable,
                        video_reliable: command.video_reliable,
                    },
                );

                Ok(vec![StreamAction::SendOnStream {
                    stream_id,
                    payload,
                    reliable: true,
                }])
            }
        }
    }

    fn handle_on_status(
        &mut self,
        stream_id: Option<u64>,
        values: &[Amf0Value],
    ) -> Vec<StreamAction> {
        let Some((code, description)) = status_of(values) else {
            warn!("onStatus without an info object");
            return Vec::new();
        };

        let mut actions = vec![StreamAction::Status {
            code: code.clone(),
            description,
        }];

        let info = stream_id.and_then(|id| self.streams.get(&id));
        match code.as_str() {
            "NetStream.Publish.Start" => {
                if let Some(info) = info {
                    actions.push(StreamAction::PublishReady {
                        media_id: info.media_id,
                    });
                }
            }
            "NetStream.Play.Start" => {
                if let Some(info) = info {
                    actions.push(StreamAction::PlayStarted {
                        media_id: info.media_id,
                    });
                }
            }
            "NetConnection.Connect.Closed"
            | "NetConnection.Connect.Rejected"
            | "NetStream.Publish.BadName" => {
                actions.push(StreamAction::CloseSession);
            }
            _ => {}
        }

        actions
    }

    fn handle_group_control(&mut self, payload: &[u8]) -> Vec<StreamAction> {
        let Some((&msg_type, body)) = payload.split_first() else {
            return Vec::new();
        };

        match msg_type {
            group::INIT => match parse_group_init(body) {
                Some((group_id, peer_id)) => vec![StreamAction::GroupHandshake {
                    group_id,
                    peer_id,
                }],
                None => {
                    warn!("unexpected format for a NetGroup init");
                    Vec::new()
                }
            },
            group::MEMBER => {
                if body.len() < PEER_ID_SIZE {
                    warn!("short NetGroup member announcement");
                    return Vec::new();
                }
                let mut peer_id = [0u8; PEER_ID_SIZE];
                peer_id.copy_from_slice(&body[..PEER_ID_SIZE]);
                info!("NetGroup peer id added: {}", format_hex(&peer_id));
                vec![StreamAction::GroupPeer { peer_id }]
            }
            group::BEGIN => {
                debug!("NetGroup begin");
                Vec::new()
            }
            group::REPORT => {
                trace!("NetGroup report ({} bytes)", body.len());
                Vec::new()
            }
            group::FRAGMENTS_MAP | group::PLAY_PUSH | group::PLAY_PULL | group::INFOS => {
                // Overlay scheduling is the group collaborator's concern.
                trace!("NetGroup overlay message 0x{:02x} ignored", msg_type);
                Vec::new()
            }
            other => {
                debug!("NetGroup message 0x{:02x} unknown", other);
                Vec::new()
            }
        }
    }

    fn handle_group_media(&mut self, payload: &[u8]) -> Vec<StreamAction> {
        let Some((&msg_type, body)) = payload.split_first() else {
            return Vec::new();
        };
        if msg_type != group::MEDIA_DATA && msg_type != group::MEDIA_START {
            trace!("group media message 0x{:02x} ignored", msg_type);
            return Vec::new();
        }

        // counter, then an inline audio/video packet.
        let Ok((rest, _counter)) = vlu(body) else {
            return Vec::new();
        };
        if rest.len() < 5 || (rest[0] != MSG_AUDIO && rest[0] != MSG_VIDEO) {
            return Vec::new();
        }
        let kind = if rest[0] == MSG_AUDIO {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        let time = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);

        let media_id = self
            .group_media_id
            .or_else(|| self.streams.values().next().map(|info| info.media_id))
            .unwrap_or(0);

        vec![StreamAction::Media {
            media_id,
            time,
            kind,
            payload: rest[5..].to_vec(),
        }]
    }

    fn take_transaction(&mut self) -> u64 {
        self.next_transaction += 1;
        self.next_transaction
    }
}

/// Frame an AMF0 invocation as a flow payload.
pub fn encode_invoke(
    name: &str,
    transaction: f64,
    object: Amf0Value,
    args: Vec<Amf0Value>,
) -> Result<Vec<u8>, Error> {
    let mut values = vec![
        Amf0Value::Utf8String(name.to_string()),
        Amf0Value::Number(transaction),
        object,
    ];
    values.extend(args);

    let amf = rml_amf0::serialize(&values).map_err(|e| Error::Amf(format!("{:?}", e)))?;

    let mut payload = Vec::with_capacity(5 + amf.len());
    payload.push(MSG_INVOCATION);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&amf);
    Ok(payload)
}

fn status_invoke(code: &str, description: &str) -> Result<Vec<u8>, Error> {
    let mut info = HashMap::new();
    info.insert("level".into(), Amf0Value::Utf8String("status".into()));
    info.insert("code".into(), Amf0Value::Utf8String(code.into()));
    info.insert(
        "description".into(),
        Amf0Value::Utf8String(description.into()),
    );
    encode_invoke("onStatus", 0.0, Amf0Value::Null, vec![Amf0Value::Object(info)])
}

/// Decode an invocation body: command name, transaction id, then the
/// command object and arguments.
pub fn decode_invocation(body: &[u8]) -> Result<(String, f64, Vec<Amf0Value>), Error> {
    let mut cursor = Cursor::new(body);
    let mut values =
        rml_amf0::deserialize(&mut cursor).map_err(|e| Error::Amf(format!("{:?}", e)))?;

    if values.len() < 2 {
        return Err(Error::Amf("invocation too short".into()));
    }

    let rest = values.split_off(2);
    let mut it = values.into_iter();
    let name = match it.next() {
        Some(Amf0Value::Utf8String(s)) => s,
        _ => return Err(Error::Amf("command name not a string".into())),
    };
    let transaction = match it.next() {
        Some(Amf0Value::Number(n)) => n,
        _ => return Err(Error::Amf("transaction not a number".into())),
    };

    Ok((name, transaction, rest))
}

/// Pull `code`/`description` out of the first info object in `values`.
fn status_of(values: &[Amf0Value]) -> Option<(String, String)> {
    for value in values {
        if let Amf0Value::Object(map) = value {
            if let Some(Amf0Value::Utf8String(code)) = map.get("code") {
                let description = match map.get("description") {
                    Some(Amf0Value::Utf8String(d)) => d.clone(),
                    _ => String::new(),
                };
                return Some((code.clone(), description));
            }
        }
    }
    None
}

/// The NetGroup handshake triple: group id, the SHA-256 the overlay
/// keys itself with, and our peer id.
fn group_init(group_id: &[u8], peer_id: &[u8; PEER_ID_SIZE]) -> Vec<u8> {
    let mut id64 = [0u8; 0x40];
    let n = group_id.len().min(0x40);
    id64[..n].copy_from_slice(&group_id[..n]);

    let key = Sha256::digest(group_id);

    let mut out = Vec::with_capacity(1 + 2 + 0x40 + 2 + 0x20 + 4 + PEER_ID_SIZE);
    out.push(group::INIT);
    out.extend_from_slice(&0x4100u16.to_be_bytes());
    out.extend_from_slice(&id64);
    out.extend_from_slice(&0x2101u16.to_be_bytes());
    out.extend_from_slice(&key);
    out.extend_from_slice(&0x2303210Fu32.to_be_bytes());
    out.extend_from_slice(peer_id);
    out
}

fn parse_group_init(body: &[u8]) -> Option<(Vec<u8>, [u8; PEER_ID_SIZE])> {
    if body.len() < 2 + 0x40 + 2 + 0x20 + 4 + PEER_ID_SIZE {
        return None;
    }
    if body[..2] != 0x4100u16.to_be_bytes() {
        return None;
    }
    let group_id = body[2..2 + 0x40].to_vec();
    let rest = &body[2 + 0x40..];
    if rest[..2] != 0x2101u16.to_be_bytes() {
        return None;
    }
    let rest = &rest[2 + 0x20..];
    if rest[..4] != 0x2303210Fu32.to_be_bytes() {
        return None;
    }
    let mut peer_id = [0u8; PEER_ID_SIZE];
    peer_id.copy_from_slice(&rest[4..4 + PEER_ID_SIZE]);
    Some((group_id, peer_id))
}
