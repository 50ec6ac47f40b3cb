use std::fmt;
use std::io;

/// Errors surfaced by the RTMFP engine.
///
/// The set is closed by design: every failure a packet, a session or a
/// host call can produce maps to exactly one of these.
#[derive(Debug)]
pub enum Error {
    /// Decryption, checksum or sub-message parsing failed. The packet is
    /// dropped and the session is unaffected.
    MalformedPacket(&'static str),
    /// An unknown sub-message type was received. Fails the owning session.
    ProtocolViolation(String),
    /// The initiator exhausted its handshake attempts.
    HandshakeTimeout,
    /// An established session missed too many keepalives.
    SessionTimeout,
    /// Diffie-Hellman or key derivation failed. Fatal for the handshake.
    CryptoFailure(String),
    /// A flow was opened with a signature the engine does not know.
    /// Fails only that flow.
    UnknownSignature(Vec<u8>),
    /// The peer closed the session (0x0C or 0x4C).
    ApplicationClosed,
    /// The host asked for the session to close.
    HostRequest,
    /// A blocking host call ran out of time. The underlying session
    /// continues.
    Timeout(&'static str),
    /// AMF command payload could not be encoded or decoded.
    Amf(String),
    /// Socket-level failure. Fatal for the whole registry.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedPacket(what) => write!(f, "malformed packet: {}", what),
            Error::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Error::HandshakeTimeout => write!(f, "handshake timed out"),
            Error::SessionTimeout => write!(f, "session timed out"),
            Error::CryptoFailure(what) => write!(f, "crypto failure: {}", what),
            Error::UnknownSignature(sig) => {
                write!(f, "unknown flow signature: {}", crate::util::format_hex(sig))
            }
            Error::ApplicationClosed => write!(f, "closed by peer"),
            Error::HostRequest => write!(f, "closed by host"),
            Error::Timeout(what) => write!(f, "timeout: {}", what),
            Error::Amf(what) => write!(f, "amf: {}", what),
            Error::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::MalformedPacket("truncated"),
            nom::Err::Error(_) | nom::Err::Failure(_) => Error::MalformedPacket("parse"),
        }
    }
}
