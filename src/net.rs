//! Non-blocking UDP endpoints, one per address family.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;

/// A bound, non-blocking UDP socket. The network task owns it
/// exclusively; other threads enqueue instead of sending.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpEndpoint {
    /// Bind to an ephemeral port on the family of `local`.
    pub fn bind(local: SocketAddr, config: &Config) -> io::Result<UdpEndpoint> {
        let domain = Domain::for_address(local);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(bytes) = config.socket_receive_buffer() {
            socket.set_recv_buffer_size(bytes)?;
        }
        if let Some(bytes) = config.socket_send_buffer() {
            socket.set_send_buffer_size(bytes)?;
        }

        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let socket: UdpSocket = socket.into();
        let local = socket.local_addr()?;
        debug!("udp endpoint bound to {}", local);

        Ok(UdpEndpoint { socket, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Drain one datagram if available. `Ok(None)` means the socket is
    /// dry.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(SocketAddr, usize)>> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((from, n))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn send_to(&self, payload: &[u8], to: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(payload, to) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram; RTMFP recovers by
            // retransmission.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    #[test]
    fn bind_and_loopback_round_trip() {
        let config = Config::default();
        let a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();

        a.send_to(b"ping", b.local_addr()).unwrap();

        let mut buf = [0u8; 64];
        // Non-blocking: poll briefly.
        let mut got = None;
        for _ in 0..100 {
            if let Some((from, n)) = b.recv(&mut buf).unwrap() {
                got = Some((from, n));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let (from, n) = got.expect("datagram arrives on loopback");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr());
    }

    #[test]
    fn recv_on_dry_socket_is_none() {
        let config = Config::default();
        let a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let mut buf = [0u8; 64];
        assert!(a.recv(&mut buf).unwrap().is_none());
    }
}
