//! The connectionless datagram transport for `Dgram` contexts (spec.md §3,
//! §5): one socket, one syscall per message in either direction, no framing
//! state machine since a datagram already delivers exactly one message or
//! nothing (spec.md's "no fragmentation above one message" non-goal applies
//! doubly here).
//!
//! The teacher has no datagram path of its own (PulseAudio's native
//! protocol is stream-only); this follows the same bind/connect-address
//! split as [`crate::addr::Address`] and the same "parse the 12-byte header,
//! validate magic and declared size" logic as
//! [`crate::wire::Message::from_frame`], just applied to one `recvfrom`
//! buffer instead of a growable stream read buffer.

use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

use crate::addr::Address;
use crate::error::Error;
use crate::wire::{BufferBuilder, Message};

/// Largest single datagram this crate will attempt to receive. Larger than
/// any realistic UDP MTU-limited datagram, but still well under
/// [`crate::wire::HARD_CAP`] by default; `Config::max_message_size` can
/// raise or lower the effective limit applied on top of this buffer size.
const RECV_BUF_SIZE: usize = 65536;

enum Socket {
    Unix(UnixDatagram),
    Udp(UdpSocket),
}

/// A bound datagram socket, Unix or UDP.
pub struct DgramSocket {
    socket: Socket,
}

impl DgramSocket {
    /// Binds a new datagram socket at `addr`.
    pub fn bind(addr: &Address) -> Result<Self, Error> {
        let socket = match addr {
            Address::UnixPath(path) => {
                let _ = std::fs::remove_file(path);
                Socket::Unix(UnixDatagram::bind(path)?)
            }
            Address::UnixAbstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;
                let sock_addr = SocketAddr::from_abstract_name(name)?;
                Socket::Unix(UnixDatagram::bind_addr(&sock_addr)?)
            }
            Address::Inet(sock_addr) => Socket::Udp(UdpSocket::bind(sock_addr)?),
        };

        match &socket {
            Socket::Unix(s) => s.set_nonblocking(true)?,
            Socket::Udp(s) => s.set_nonblocking(true)?,
        }

        Ok(Self { socket })
    }

    /// The underlying fd, for registration with an
    /// [`EventLoop`](crate::reactor::EventLoop).
    pub fn as_raw_fd(&self) -> RawFd {
        match &self.socket {
            Socket::Unix(s) => s.as_raw_fd(),
            Socket::Udp(s) => s.as_raw_fd(),
        }
    }

    /// Sends one complete frame to `addr` in a single syscall.
    ///
    /// Rejects a frame over `max_size` up front with `Error::TooLarge` rather
    /// than let it reach the kernel, where it would surface as `EMSGSIZE` on
    /// a connected UDP socket or simply be truncated on a Unix datagram
    /// socket (spec.md §8).
    pub fn send_to(&self, addr: &Address, frame: &[u8], max_size: u32) -> Result<(), Error> {
        if frame.len() as u32 > max_size {
            return Err(Error::TooLarge(format!("datagram of {} bytes exceeds the configured limit", frame.len())));
        }

        match (&self.socket, addr) {
            (Socket::Unix(s), Address::UnixPath(path)) => {
                s.send_to(frame, path)?;
            }
            (Socket::Unix(s), Address::UnixAbstract(name)) => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;
                let sock_addr = SocketAddr::from_abstract_name(name)?;
                s.send_to_addr(frame, &sock_addr)?;
            }
            (Socket::Udp(s), Address::Inet(sock_addr)) => {
                s.send_to(frame, sock_addr)?;
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "datagram address family does not match this socket".into(),
                ))
            }
        }
        Ok(())
    }

    /// Receives and parses the next pending datagram, if any.
    ///
    /// `Ok(None)` means nothing is currently pending (`EAGAIN`); a datagram
    /// that fails to parse as a valid frame is reported as `Err` so the
    /// caller can log and keep draining, rather than treated as fatal (this
    /// is connectionless, so a malformed peer doesn't warrant tearing
    /// anything down).
    pub fn recv_from(&mut self, max_size: u32) -> Result<Option<(Address, Message)>, Error> {
        let mut buf = vec![0u8; RECV_BUF_SIZE.min(max_size as usize).max(crate::wire::HEADER_SIZE)];

        let (n, from) = match &self.socket {
            Socket::Unix(s) => match s.recv_from(&mut buf) {
                Ok((n, from)) => (n, unix_peer_address(&from)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            },
            Socket::Udp(s) => match s.recv_from(&mut buf) {
                Ok((n, from)) => (n, Address::Inet(from)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            },
        };

        if n > max_size as usize {
            return Err(Error::TooLarge(format!("datagram of {n} bytes exceeds the configured limit")));
        }

        let mut builder = BufferBuilder::with_capacity(n);
        builder.extend_from_slice(&buf[..n]);
        let frame = builder.freeze();

        Ok(Some((from, Message::from_frame(frame)?)))
    }
}

fn unix_peer_address(addr: &std::os::unix::net::SocketAddr) -> Address {
    if let Some(path) = addr.as_pathname() {
        Address::UnixPath(path.to_path_buf())
    } else {
        // An unnamed or abstract-namespace peer address; datagram sockets
        // bound anonymously (the common client-side case) have no path to
        // report back.
        Address::UnixAbstract(Vec::new())
    }
}
