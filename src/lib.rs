//! rtmfp — client-side RTMFP session protocol engine (Sans-IO, Sync)
//!
//! RTMFP (Real-Time Media Flow Protocol) is Adobe's UDP-based,
//! encrypted, reliable-messaging media transport. This crate implements
//! the client side: the 30/70/38/78 handshake, per-session AES-128-CBC
//! packet protection keyed by a two-phase Diffie-Hellman agreement,
//! reliable windowed flows with acknowledgments over datagrams, writer
//! multiplexing for NetConnection/NetStream messages, and the mesh of
//! concurrent handshakes behind one UDP endpoint (a server session plus
//! any number of p2p and NetGroup peer sessions).
//!
//! # Goals
//! - **Wire compatibility**: byte-exact crypto derivation, packet
//!   checksum and session-id scramble of deployed RTMFP peers.
//! - **Safety**: `forbid(unsafe_code)` throughout the crate.
//! - **Sans-IO core**: the whole engine is a synchronous state machine
//!   you can drive from any event loop — or from the bundled blocking
//!   client.
//!
//! ## Non-goals
//! - **Server-side RTMFP**
//! - **TLS or any other transport**
//! - **NetGroup overlay scheduling** (fragment push/pull and
//!   peer-report gossip are surfaced to the host, not decided here)
//! - **Pre-Diffie-Hellman protocol variants**
//!
//! ## Sans-IO integration model
//! Drive the engine with three calls:
//! - [`Endpoint::handle_datagram`] — feed one received UDP datagram.
//! - [`Endpoint::poll_output`] — drain packets to send and the next
//!   timer.
//! - [`Endpoint::handle_timeout`] — let timers fire (handshake
//!   retransmits, keepalives, writer retransmits, close countdowns).
//!
//! Application-level events (status, media, group membership) arrive on
//! the [`EventSink`] the endpoint is built with.
//!
//! # Example (Sans-IO loop)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use rtmfp::{Config, Endpoint, EventSink, Output};
//!
//! struct Sink;
//! impl EventSink for Sink {}
//!
//! // Stub I/O to keep the example focused on the state machine
//! enum Event { Udp(std::net::SocketAddr, Vec<u8>), Timer(Instant) }
//! fn wait_next_event(_next_wake: Option<Instant>) -> Event { unimplemented!() }
//! fn send_udp(_to: std::net::SocketAddr, _bytes: &[u8]) {}
//!
//! fn example_event_loop() -> Result<(), rtmfp::Error> {
//!     let config = Arc::new(Config::default());
//!     let mut endpoint = Endpoint::new(config, Arc::new(Sink), Instant::now());
//!
//!     endpoint.connect(
//!         "rtmfp://srv/app",
//!         vec!["203.0.113.7:1935".parse().unwrap()],
//!         Instant::now(),
//!     );
//!
//!     let mut next_wake: Option<Instant> = None;
//!     loop {
//!         loop {
//!             match endpoint.poll_output(Instant::now()) {
//!                 Output::Datagram { remote, payload } => send_udp(remote, &payload),
//!                 Output::Timeout(t) => { next_wake = Some(t); break; }
//!             }
//!         }
//!         match wait_next_event(next_wake) {
//!             Event::Udp(from, pkt) => endpoint.handle_datagram(from, &pkt, Instant::now())?,
//!             Event::Timer(now) => endpoint.handle_timeout(now)?,
//!         }
//!     }
//! }
//! ```
//!
//! For hosts that just want a socket and blocking calls, use
//! [`RtmfpClient`]: it spawns the network thread, binds one UDP socket
//! per address family, and exposes `connect` / `connect_to_peer` /
//! `connect_to_group` / `add_stream` / `read` / `write` with one-shot
//! signals behind them. `read` yields an FLV byte stream starting with
//! the standard 13-byte header.
//!
//! ### Status
//! - The session-id generator is process-global: ids are monotonic and
//!   never reused within a process.
//! - NetGroup support covers membership and the group handshake; the
//!   overlay fragment store and push/pull scheduling live in the host.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

// RTMFP session establishment:
//
// Initiator                                           Responder
//
// 1     30 (EPD + tag)               -------->
//
// 2                                  <--------   70 (tag echo, cookie,
//                                                    responder pubkey)
// 3     38 (cookie, pubkey, nonce,
//           initiator session id)    -------->
//
// 4                                  <--------   78 (responder session
//                                                    id + nonce)
//
//       encrypted session chunks     <-------->  encrypted session chunks
//
// Either endpoint of a p2p rendezvous may also open with an eager 70
// after the server's 0x0F introduction.

#[macro_use]
extern crate log;

mod client;
pub use client::{RtmfpClient, Signal};

pub mod codec;
pub use codec::{RTMFP_HEADER_SIZE, RTMFP_MAX_PACKET_SIZE};

mod config;
pub use config::{Config, ConfigBuilder};

pub mod crypto;

mod error;
pub use error::Error;

mod flow;
mod handshake;

mod media;
pub use media::{MediaKind, MediaReader, FLV_HEADER};

pub mod message;
mod net;

mod registry;
pub use registry::{CallTarget, Endpoint, Output};

mod rng;
mod sender;

mod session;
pub use session::{Session, SessionKind, SessionRole, SessionStatus};

mod stream;
pub use stream::EventSink;

mod timer;
mod util;
mod writer;
