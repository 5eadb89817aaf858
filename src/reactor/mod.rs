//! The single-threaded event loop every [`Context`](crate::context::Context)
//! runs on: one `mio::Poll` multiplexing readiness across every registered
//! fd plus a [`TimerWheel`], woken from other threads via `mio::Waker`
//! (spec.md §5, §9's cross-thread wakeup note).
//!
//! Grounded in the teacher's `client/reactor.rs::Reactor::run`: a
//! `mio::Poll` plus a `WAKER` token registered once at construction, with
//! `mio::Events::with_capacity` reused across polls. The teacher dedicates
//! its reactor to one fixed socket; this generalizes `add`/`update`/`remove`
//! to an arbitrary, dynamic set of registered descriptors, since a `Context`
//! here may be watching any number of connections at once.

pub mod timer;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

pub use timer::{TimerId, TimerWheel};

use crate::error::Error;

/// Which directions a registered fd is ready for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The fd has data to read, or (for a listener) a connection to accept.
    pub readable: bool,
    /// The fd has buffer space to write into.
    pub writable: bool,
}

type Callback = Box<dyn FnMut(Readiness) + Send>;

struct Source {
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

const WAKER_TOKEN: Token = Token(usize::MAX);

/// The event loop. Not `Clone`/`Sync`; a [`Waker`] handle is the
/// cross-thread way to prod it from elsewhere (spec.md §9).
pub struct EventLoop {
    poll: Poll,
    waker: Arc<mio::Waker>,
    sources: HashMap<Token, Source>,
    next_token: usize,
    timers: TimerWheel,
    events: Events,
}

/// A cheaply-cloned, thread-safe handle that can interrupt a blocked
/// [`EventLoop::wait_and_process`] call from any thread.
#[derive(Clone)]
pub struct Waker(Arc<mio::Waker>);

impl Waker {
    /// Interrupts the loop's current or next `wait_and_process` call.
    pub fn wake(&self) -> Result<(), Error> {
        self.0.wake().map_err(Error::Io)
    }
}

impl EventLoop {
    /// Creates a new, empty event loop.
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            waker,
            sources: HashMap::new(),
            next_token: 0,
            timers: TimerWheel::new(),
            events: Events::with_capacity(256),
        })
    }

    /// A cloneable handle for waking this loop from another thread.
    pub fn waker(&self) -> Waker {
        Waker(self.waker.clone())
    }

    /// Direct access to the timer wheel, for scheduling reconnect delays
    /// and the like.
    pub fn timers(&mut self) -> &mut TimerWheel {
        &mut self.timers
    }

    /// Registers `fd` for the given interest, invoking `callback` with the
    /// observed [`Readiness`] on every poll where it fires. Returns a token
    /// that identifies this registration for [`update`](Self::update) and
    /// [`remove`](Self::remove).
    pub fn add(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(Readiness) + Send + 'static,
    ) -> Result<Token, Error> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)?;

        self.sources.insert(
            token,
            Source {
                fd,
                interest,
                callback: Box::new(callback),
            },
        );

        Ok(token)
    }

    /// Changes the interest set for an existing registration.
    pub fn update(&mut self, token: Token, interest: Interest) -> Result<(), Error> {
        let source = self
            .sources
            .get_mut(&token)
            .ok_or_else(|| Error::InvalidArgument("no such registration".into()))?;

        self.poll
            .registry()
            .reregister(&mut SourceFd(&source.fd), token, interest)?;
        source.interest = interest;
        Ok(())
    }

    /// Deregisters a source. No-op if the token is unknown (tolerates a
    /// connection that already removed itself on disconnect).
    pub fn remove(&mut self, token: Token) -> Result<(), Error> {
        if let Some(source) = self.sources.remove(&token) {
            self.poll.registry().deregister(&mut SourceFd(&source.fd))?;
        }
        Ok(())
    }

    /// True if `fd` currently has a live registration.
    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.sources.values().any(|s| s.fd == fd)
    }

    /// Blocks (bounded by `timeout`, or indefinitely if `None`) until a
    /// registered fd becomes ready, a timer fires, or [`Waker::wake`] is
    /// called, then runs every callback that has work.
    ///
    /// Returns the number of fd/timer callbacks invoked. If `timeout` was
    /// given and elapsed with nothing to do, returns
    /// [`Error::Timeout`] rather than `Ok(0)`, so callers (the reconnect
    /// timer driving loop in particular) can distinguish "woken with
    /// nothing to do" from "deadline passed".
    pub fn wait_and_process(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll_timeout = match (deadline, self.timers.next_deadline()) {
            (Some(d), Some(t)) => Some(d.min(t).saturating_duration_since(Instant::now())),
            (Some(d), None) => Some(d.saturating_duration_since(Instant::now())),
            (None, Some(t)) => Some(t.saturating_duration_since(Instant::now())),
            (None, None) => None,
        };

        match self.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let mut fired = self.timers.fire_expired(Instant::now());

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(source) = self.sources.get_mut(&event.token()) {
                let readiness = Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                };
                (source.callback)(readiness);
                fired += 1;
            }
        }

        if fired == 0 {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
            }
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_callback_on_readable_socket() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::io::Write;
        b.try_clone().unwrap().write_all(b"x").unwrap();

        let mut lo = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        lo.add(a.as_raw_fd(), Interest::READABLE, move |r| {
            if r.readable {
                f.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        lo.wait_and_process(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wakeup_interrupts_blocking_wait() {
        let mut lo = EventLoop::new().unwrap();
        let waker = lo.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let result = lo.wait_and_process(Some(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[test]
    fn timeout_with_nothing_ready_is_an_error() {
        let mut lo = EventLoop::new().unwrap();
        let err = lo.wait_and_process(Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn timer_fires_within_wait_and_process() {
        let mut lo = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        lo.timers().set(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let n = lo.wait_and_process(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_is_idempotent_for_unknown_token() {
        let mut lo = EventLoop::new().unwrap();
        assert!(lo.remove(Token(999)).is_ok());
    }
}
