//! The event-driven orchestrator: listen/connect/bind dispatchers over a
//! single event loop, each driving some number of [`Connection`]s and
//! reporting a single callback surface (spec.md §5, §6).
//!
//! The teacher's `Client` (`client.rs`) owns exactly one connection and
//! hides its reactor thread behind an async handle; a [`Context`] here is
//! single-threaded and synchronous by design (spec.md §5: one event loop,
//! driven by the caller calling [`Context::wait_and_process`]), since a
//! server needs to watch an accept socket plus an arbitrary number of peer
//! connections on the same loop, not one socket on a dedicated thread.

mod dgram;

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::time::{Duration, Instant};

use mio::{Interest, Token};

use crate::addr::Address;
use crate::connection::{Connection, ConnState, Role};
use crate::error::Error;
use crate::reactor::{EventLoop, Waker};
use crate::wire::Message;

pub use dgram::DgramSocket;

/// Runtime configuration for a [`Context`] (spec.md's ambient configuration
/// layer; see `SPEC_FULL.md`).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Delay before a client's first and subsequent reconnect attempts.
    pub reconnect_delay_ms: u32,
    /// `listen(2)` backlog for server contexts.
    pub accept_backlog: i32,
    /// Largest single message this context will accept or enqueue, capped
    /// by [`crate::wire::HARD_CAP`].
    pub max_message_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2000,
            accept_backlog: 128,
            max_message_size: crate::wire::HARD_CAP,
        }
    }
}

/// Identifies one live connection within a [`Context`].
pub type ConnectionId = Token;

/// What kind of dispatcher a [`Context`] is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Not yet bound to anything.
    None,
    /// Accepting connections on a listening socket.
    Server,
    /// Maintaining (and, on drop, re-establishing) one connection to a peer.
    Client,
    /// A connectionless datagram endpoint.
    Dgram,
}

/// One occurrence reported to the context's callback.
#[derive(Debug)]
pub enum Event {
    /// A new connection was accepted (`Server`) or established/re-established
    /// (`Client`).
    Connected(ConnectionId),
    /// A connection was torn down, locally or by the peer.
    Disconnected(ConnectionId),
    /// A complete message arrived on a connection.
    Msg(ConnectionId, Message),
    /// A complete, well-formed datagram arrived (`Dgram` contexts only).
    DgramMsg(Address, Message),
}

type EventCallback = Box<dyn FnMut(&mut Context, Event) + Send>;

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match self {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

/// An event-driven IPC endpoint: a server listener, a reconnecting client,
/// or a datagram socket, all driven by repeated calls to
/// [`wait_and_process`](Context::wait_and_process).
pub struct Context {
    kind: ContextKind,
    config: Config,
    event_loop: EventLoop,
    callback: Option<EventCallback>,

    listener: Option<Listener>,
    listener_token: Option<Token>,
    connections: HashMap<Token, Connection>,

    dgram: Option<DgramSocket>,

    client_target: Option<Address>,
    reconnect_deadline: Option<Instant>,

    stop_requested: bool,
    stopped: bool,
}

impl Context {
    fn empty(config: Config) -> Result<Self, Error> {
        Ok(Self {
            kind: ContextKind::None,
            config,
            event_loop: EventLoop::new()?,
            callback: None,
            listener: None,
            listener_token: None,
            connections: HashMap::new(),
            dgram: None,
            client_target: None,
            reconnect_deadline: None,
            stop_requested: false,
            stopped: false,
        })
    }

    /// Creates a server context listening at `addr`, invoking `on_event`
    /// for every accept/disconnect/message from then on.
    pub fn listen(
        addr: &Address,
        config: Config,
        on_event: impl FnMut(&mut Context, Event) + Send + 'static,
    ) -> Result<Self, Error> {
        let mut ctx = Self::empty(config)?;
        ctx.kind = ContextKind::Server;
        ctx.callback = Some(Box::new(on_event));

        let listener = match addr {
            Address::UnixPath(path) => {
                let _ = std::fs::remove_file(path);
                Listener::Unix(UnixListener::bind(path)?)
            }
            Address::UnixAbstract(name) => Listener::Unix(bind_unix_abstract(name)?),
            Address::Inet(sock_addr) => {
                let listener = TcpListener::bind(sock_addr)?;
                socket2_reuse_addr(&listener)?;
                Listener::Tcp(listener)
            }
        };
        match &listener {
            Listener::Unix(l) => l.set_nonblocking(true)?,
            Listener::Tcp(l) => l.set_nonblocking(true)?,
        }

        let token = ctx.event_loop.add(listener.as_raw_fd(), Interest::READABLE, |_| {})?;
        ctx.listener_token = Some(token);
        ctx.listener = Some(listener);
        Ok(ctx)
    }

    /// Creates a client context that connects to `addr` and automatically
    /// reconnects (after [`Config::reconnect_delay_ms`]) whenever the
    /// connection drops.
    pub fn connect(
        addr: Address,
        config: Config,
        on_event: impl FnMut(&mut Context, Event) + Send + 'static,
    ) -> Result<Self, Error> {
        let mut ctx = Self::empty(config)?;
        ctx.kind = ContextKind::Client;
        ctx.callback = Some(Box::new(on_event));
        ctx.client_target = Some(addr);
        if let Err(e) = ctx.try_connect() {
            log::warn!("initial connect failed, will retry: {e}");
            ctx.schedule_reconnect();
        }
        Ok(ctx)
    }

    /// Creates a connectionless datagram context bound at `addr`.
    pub fn bind_dgram(
        addr: &Address,
        config: Config,
        on_event: impl FnMut(&mut Context, Event) + Send + 'static,
    ) -> Result<Self, Error> {
        let mut ctx = Self::empty(config)?;
        ctx.kind = ContextKind::Dgram;
        ctx.callback = Some(Box::new(on_event));

        let socket = DgramSocket::bind(addr)?;
        ctx.event_loop.add(socket.as_raw_fd(), Interest::READABLE, |_| {})?;
        ctx.dgram = Some(socket);
        Ok(ctx)
    }

    /// The kind of dispatcher this context is.
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// A cloneable handle that can interrupt a blocked
    /// [`wait_and_process`](Self::wait_and_process) call from another
    /// thread (spec.md §9's cross-thread wakeup requirement).
    pub fn waker(&self) -> Waker {
        self.event_loop.waker()
    }

    /// Sends `msg` to a single connection (`Server`/`Client` contexts).
    pub fn send_msg(&mut self, id: ConnectionId, msg: &Message) -> Result<(), Error> {
        let frame = msg.as_frame().ok_or_else(|| Error::InvalidArgument("message is not finished".into()))?;
        let conn = self.connections.get_mut(&id).ok_or(Error::NotConnected)?;
        conn.enqueue(frame.clone())?;
        self.event_loop.update(id, Interest::READABLE | Interest::WRITABLE)?;
        Ok(())
    }

    /// Sends `msg` to every currently connected peer (`Server` contexts).
    /// Non-fd-bearing frames are fanned out by cheap `Arc` clone; fd-bearing
    /// frames get an independently `dup`'d descriptor set per peer
    /// (spec.md §4.5, §9).
    pub fn broadcast(&mut self, msg: &Message) -> Result<(), Error> {
        let frame = msg.as_frame().ok_or_else(|| Error::InvalidArgument("message is not finished".into()))?;
        let ids: Vec<Token> = self.connections.keys().copied().collect();
        for id in ids {
            let dup = frame.duplicate_for_fanout()?;
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.enqueue(dup)?;
                self.event_loop.update(id, Interest::READABLE | Interest::WRITABLE)?;
            }
        }
        Ok(())
    }

    /// Sends `msg` as a single datagram to `addr` (`Dgram` contexts only).
    pub fn send_msg_to(&mut self, addr: &Address, msg: &Message) -> Result<(), Error> {
        let frame = msg.as_frame().ok_or_else(|| Error::InvalidArgument("message is not finished".into()))?;
        let dgram = self.dgram.as_mut().ok_or(Error::NotConnected)?;
        dgram.send_to(addr, frame.as_slice(), self.config.max_message_size)
    }

    /// Requests that this connection be closed. The disconnect is reported
    /// once its write queue has drained.
    pub fn close_connection(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.close();
        }
    }

    /// Idempotently stops the context: deregisters everything and marks it
    /// so that subsequent calls to [`wait_and_process`](Self::wait_and_process)
    /// return [`Error::NotConnected`] immediately, without touching
    /// already-dropped sockets twice.
    pub fn stop(&mut self) {
        if self.stop_requested {
            return;
        }
        self.stop_requested = true;

        if let Some(token) = self.listener_token.take() {
            let _ = self.event_loop.remove(token);
        }
        self.listener = None;

        for (token, _) in self.connections.drain() {
            let _ = self.event_loop.remove(token);
        }

        self.dgram = None;
        self.stopped = true;
    }

    /// True once [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Blocks for up to `timeout` waiting for I/O or a timer, dispatching
    /// every event that results to the context's callback. Returns the
    /// number of events dispatched.
    pub fn wait_and_process(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        if self.stopped {
            return Err(Error::NotConnected);
        }

        let result = self.event_loop.wait_and_process(timeout);

        self.drain_listener()?;
        self.drain_connections()?;
        self.drain_dgram()?;
        self.drain_reconnect();

        result
    }

    /// Issues a nonblocking `connect()` and registers the fd for `WRITABLE`
    /// only; `Connected` isn't dispatched here but once `drain_connections`
    /// observes the handshake resolve (spec.md §4.5, §5 — no call in this
    /// crate blocks the single event loop thread).
    fn try_connect(&mut self) -> Result<(), Error> {
        let addr = self.client_target.clone().ok_or(Error::NotConnected)?;

        let conn = match &addr {
            Address::UnixPath(path) => {
                let stream = connect_nonblocking_unix(path)?;
                Connection::connecting_unix(stream, Some(addr.clone()))?
            }
            Address::UnixAbstract(name) => {
                let stream = connect_nonblocking_unix_abstract(name)?;
                Connection::connecting_unix(stream, Some(addr.clone()))?
            }
            Address::Inet(sock_addr) => {
                let stream = connect_nonblocking_tcp(sock_addr)?;
                Connection::connecting_tcp(stream, Some(addr.clone()))?
            }
        };

        let fd = conn.as_raw_fd();
        let token = self.event_loop.add(fd, Interest::WRITABLE, |_| {})?;
        self.connections.insert(token, conn);
        Ok(())
    }

    fn schedule_reconnect(&mut self) {
        if self.kind != ContextKind::Client || self.stopped {
            return;
        }
        let delay = Duration::from_millis(self.config.reconnect_delay_ms as u64);
        self.reconnect_deadline = Some(Instant::now() + delay);

        // The timer callback only needs to unblock a concurrently-blocked
        // `wait_and_process`; the actual reconnect happens in
        // `drain_reconnect`, since a callback stored inside the event loop
        // can't hold a `&mut Context` back to its owner.
        let waker = self.event_loop.waker();
        self.event_loop.timers().set(delay, move || {
            let _ = waker.wake();
        });
    }

    fn drain_reconnect(&mut self) {
        if let Some(deadline) = self.reconnect_deadline {
            if Instant::now() >= deadline {
                self.reconnect_deadline = None;
                if let Err(e) = self.try_connect() {
                    log::warn!("reconnect attempt failed: {e}");
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn drain_listener(&mut self) -> Result<(), Error> {
        if self.listener.is_none() {
            return Ok(());
        }

        loop {
            let accepted = match self.listener.as_ref().unwrap() {
                Listener::Unix(l) => l.accept().map(|(s, _)| {
                    Connection::from_unix_stream(s, Role::Accepted, None, None)
                }),
                Listener::Tcp(l) => l.accept().map(|(s, peer)| {
                    Connection::from_tcp_stream(s, Role::Accepted, Some(Address::Inet(peer)), None)
                }),
            };

            let conn = match accepted {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(e),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            let fd = conn.as_raw_fd();
            let token = self.event_loop.add(fd, Interest::READABLE, |_| {})?;
            self.connections.insert(token, conn);
            self.dispatch(Event::Connected(token));
        }

        Ok(())
    }

    fn drain_connections(&mut self) -> Result<(), Error> {
        let ids: Vec<Token> = self.connections.keys().copied().collect();

        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else { continue };

            if conn.state() == ConnState::Connecting {
                match conn.poll_connect() {
                    Ok(true) => {
                        let _ = self.event_loop.update(id, Interest::READABLE);
                        self.dispatch(Event::Connected(id));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log::warn!("connect attempt failed: {e}");
                        self.fail_connecting(id);
                    }
                }
                continue;
            }

            let readable = conn.on_readable();
            let messages = match readable {
                Ok(msgs) => msgs,
                Err(_) => {
                    self.drop_connection(id);
                    continue;
                }
            };
            for msg in messages {
                self.dispatch(Event::Msg(id, msg));
            }

            let Some(conn) = self.connections.get_mut(&id) else { continue };
            if conn.wants_write() {
                if conn.on_writable().is_err() {
                    self.drop_connection(id);
                    continue;
                }
            }

            let Some(conn) = self.connections.get_mut(&id) else { continue };
            let closed = conn.state() == crate::connection::ConnState::Closed;
            let wants_write = conn.wants_write();
            let interest = if wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let _ = self.event_loop.update(id, interest);

            if closed {
                self.drop_connection(id);
            }
        }

        Ok(())
    }

    fn drain_dgram(&mut self) -> Result<(), Error> {
        if self.dgram.is_none() {
            return Ok(());
        }
        let max_size = self.config.max_message_size;

        loop {
            let outcome = self.dgram.as_mut().unwrap().recv_from(max_size);
            match outcome {
                Ok(Some((addr, msg))) => self.dispatch(Event::DgramMsg(addr, msg)),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("dropping malformed datagram: {e}");
                }
            }
        }

        Ok(())
    }

    /// Tears down a connection whose nonblocking connect never reached
    /// `Established`. Unlike [`drop_connection`](Self::drop_connection),
    /// this never dispatches `Disconnected` — the caller never saw
    /// `Connected` for it either.
    fn fail_connecting(&mut self, id: Token) {
        if self.connections.remove(&id).is_some() {
            let _ = self.event_loop.remove(id);
            if self.kind == ContextKind::Client {
                self.schedule_reconnect();
            }
        }
    }

    fn drop_connection(&mut self, id: Token) {
        if self.connections.remove(&id).is_some() {
            let _ = self.event_loop.remove(id);
            self.dispatch(Event::Disconnected(id));

            if self.kind == ContextKind::Client {
                self.schedule_reconnect();
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        if let Some(mut cb) = self.callback.take() {
            cb(self, event);
            self.callback = Some(cb);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.kind)
            .field("connections", &self.connections.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

fn bind_unix_abstract(name: &[u8]) -> Result<UnixListener, Error> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixListener::bind_addr(&addr)?)
}

/// Opens a nonblocking Unix-domain socket and issues `connect()`, expecting
/// `EINPROGRESS` (spec.md §4.5). The returned stream is handed to
/// [`Connection::connecting_unix`](crate::connection::Connection::connecting_unix)
/// in `Connecting` state regardless of whether the kernel happened to
/// complete the handshake synchronously; the first `poll_connect` call
/// (driven by the fd's own writable readiness) sorts that out either way.
fn connect_nonblocking_unix(path: &std::path::Path) -> Result<std::os::unix::net::UnixStream, Error> {
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
        .map_err(|e| Error::Io(e.into()))?;
    let addr = UnixAddr::new(path).map_err(|e| Error::Io(e.into()))?;
    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) | Err(nix::Error::EINPROGRESS) => {}
        Err(e) => return Err(Error::Io(e.into())),
    }

    Ok(std::os::unix::net::UnixStream::from(fd))
}

/// Abstract-namespace counterpart of
/// [`connect_nonblocking_unix`](connect_nonblocking_unix).
fn connect_nonblocking_unix_abstract(name: &[u8]) -> Result<std::os::unix::net::UnixStream, Error> {
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
        .map_err(|e| Error::Io(e.into()))?;
    let addr = UnixAddr::new_abstract(name).map_err(|e| Error::Io(e.into()))?;
    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) | Err(nix::Error::EINPROGRESS) => {}
        Err(e) => return Err(Error::Io(e.into())),
    }

    Ok(std::os::unix::net::UnixStream::from(fd))
}

/// TCP counterpart of [`connect_nonblocking_unix`](connect_nonblocking_unix).
fn connect_nonblocking_tcp(sock_addr: &std::net::SocketAddr) -> Result<std::net::TcpStream, Error> {
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};

    let family = if sock_addr.is_ipv6() { AddressFamily::Inet6 } else { AddressFamily::Inet };
    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None).map_err(|e| Error::Io(e.into()))?;
    let addr: SockaddrStorage = match sock_addr {
        std::net::SocketAddr::V4(v4) => SockaddrStorage::from(*v4),
        std::net::SocketAddr::V6(v6) => SockaddrStorage::from(*v6),
    };
    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) | Err(nix::Error::EINPROGRESS) => {}
        Err(e) => return Err(Error::Io(e.into())),
    }

    Ok(std::net::TcpStream::from(fd))
}

fn socket2_reuse_addr(listener: &TcpListener) -> Result<(), Error> {
    use nix::sys::socket::{setsockopt, sockopt::ReuseAddr};
    setsockopt(listener, ReuseAddr, &true).map_err(|e| Error::Io(e.into()))
}
