//! The growable byte buffer with an attached set of owned file descriptors
//! that backs every [`Message`](super::Message) payload.
//!
//! Mirrors the teacher's `Vec<u8>`-based read/write buffers in
//! `client/reactor.rs`, but adds the refcounted fan-out `spec.md` §3 and §9
//! call for: a finished [`Buffer`] is frozen and cheaply `Arc`-cloned into
//! every connection queue a broadcast targets, while descriptor-bearing
//! buffers get a fresh, independently-owned set of duplicated fds per peer
//! (the kernel consumes ancillary fds at `sendmsg` time, so sharing them
//! would hand the same descriptor to every peer but only deliver it once).

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

/// An exclusively-owned buffer under construction.
///
/// Used by [`Encoder`](super::Encoder) while a [`Message`](super::Message)
/// is in its `Writing` state. Call [`freeze`](BufferBuilder::freeze) to
/// obtain the shared, immutable [`Buffer`] used from then on.
#[derive(Debug, Default)]
pub struct BufferBuilder {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl BufferBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty builder with at least `capacity` bytes reserved.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            fds: Vec::new(),
        }
    }

    /// Current encoded length, in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Appends raw bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Appends a single byte.
    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Overwrites `len` bytes starting at `offset`, used to patch the
    /// header once the payload length is known.
    pub fn patch(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Appends an owned file descriptor, to be sent as ancillary data.
    pub fn push_fd(&mut self, fd: OwnedFd) {
        self.fds.push(fd);
    }

    /// Number of fds attached so far.
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Freezes the builder into a shared, reference-counted [`Buffer`].
    pub fn freeze(self) -> Buffer {
        Buffer {
            bytes: Arc::new(self.bytes),
            fds: Arc::new(Mutex::new(self.fds.into_iter().map(Some).collect())),
        }
    }
}

/// A finished, shareable message payload.
///
/// Cloning a `Buffer` is an `Arc` bump, not a copy: this is what lets a
/// server broadcast fan out to many connections' write queues without
/// duplicating the encoded bytes (spec.md §4.5, §9).
#[derive(Debug, Clone)]
pub struct Buffer {
    bytes: Arc<Vec<u8>>,
    fds: Arc<Mutex<Vec<Option<OwnedFd>>>>,
}

impl Buffer {
    /// An empty, fd-less buffer.
    pub fn empty() -> Self {
        BufferBuilder::new().freeze()
    }

    /// The encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the payload is empty (no bytes, no fds).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of fds still attached (not yet taken by a decoder).
    pub fn fd_count(&self) -> usize {
        self.fds.lock().unwrap().iter().filter(|f| f.is_some()).count()
    }

    /// Total number of fd slots this buffer was built with, including ones
    /// already taken. Used by the connection framer to know how many
    /// ancillary fds a frame is expecting before any are consumed.
    pub fn fd_slots(&self) -> usize {
        self.fds.lock().unwrap().len()
    }

    /// Appends fds received out-of-band (via `SCM_RIGHTS`) to this buffer's
    /// fd list, in the order they arrived. Used by the connection framer to
    /// attach ancillary descriptors to the message that declares them.
    pub(crate) fn attach_received_fds(&self, received: Vec<OwnedFd>) {
        self.fds.lock().unwrap().extend(received.into_iter().map(Some));
    }

    /// Borrows the fd at `index`, without consuming it. Returns `None` if
    /// the index is out of range or the fd was already taken.
    ///
    /// The returned handle borrows from this buffer; per spec.md §9, a
    /// received fd stays owned by the buffer (and thus by its [`Message`]))
    /// until the message is dropped. Callers that need it longer must
    /// [`ReceivedFd::try_clone`] it.
    pub fn fd(&self, index: usize) -> Option<ReceivedFd<'_>> {
        let guard = self.fds.lock().unwrap();
        if guard.get(index).and_then(|f| f.as_ref()).is_some() {
            Some(ReceivedFd {
                fds: &self.fds,
                index,
            })
        } else {
            None
        }
    }

    /// Duplicates this buffer for fan-out to another peer.
    ///
    /// The byte payload is shared (cheap `Arc` clone); any attached fds are
    /// duplicated with `dup(2)` so each peer gets an independent descriptor
    /// that the kernel can consume exactly once at `sendmsg` time.
    pub fn duplicate_for_fanout(&self) -> std::io::Result<Buffer> {
        if self.fd_slots() == 0 {
            return Ok(self.clone());
        }

        let guard = self.fds.lock().unwrap();
        let mut duped = Vec::with_capacity(guard.len());
        for slot in guard.iter() {
            duped.push(match slot {
                Some(fd) => Some(fd.try_clone()?),
                None => None,
            });
        }

        Ok(Buffer {
            bytes: self.bytes.clone(),
            fds: Arc::new(Mutex::new(duped)),
        })
    }

    /// The number of live references to this buffer's bytes, mirroring the
    /// C implementation's refcount (spec.md §3).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}

/// A file descriptor received as ancillary data on a [`Buffer`].
///
/// Borrowed from the buffer it was decoded out of; use [`try_clone`] to
/// extend its lifetime beyond the owning [`Message`].
///
/// [`try_clone`]: ReceivedFd::try_clone
#[derive(Debug)]
pub struct ReceivedFd<'a> {
    fds: &'a Mutex<Vec<Option<OwnedFd>>>,
    index: usize,
}

impl<'a> ReceivedFd<'a> {
    /// Duplicates the descriptor so the caller can own a copy past the
    /// lifetime of the enclosing message.
    pub fn try_clone(&self) -> std::io::Result<OwnedFd> {
        let guard = self.fds.lock().unwrap();
        guard[self.index]
            .as_ref()
            .expect("fd slot consumed between lookup and clone")
            .try_clone()
    }

    /// The raw fd value, valid only as long as the enclosing message lives.
    pub fn as_raw_fd(&self) -> RawFd {
        let guard = self.fds.lock().unwrap();
        guard[self.index].as_ref().expect("fd slot consumed").as_raw_fd()
    }
}

impl AsRawFd for ReceivedFd<'_> {
    fn as_raw_fd(&self) -> RawFd {
        ReceivedFd::as_raw_fd(self)
    }
}

impl<'a> ReceivedFd<'a> {
    /// Borrows the descriptor directly, for passing to APIs that accept
    /// `BorrowedFd`.
    pub fn as_fd(&self) -> BorrowedFdGuard<'a> {
        BorrowedFdGuard {
            fds: self.fds,
            index: self.index,
        }
    }
}

/// A short-lived [`BorrowedFd`] accessor; since the backing storage is
/// behind a mutex, the `BorrowedFd` itself can't outlive the guard that
/// produced it, so this hands out a closure-scoped view instead.
pub struct BorrowedFdGuard<'a> {
    fds: &'a Mutex<Vec<Option<OwnedFd>>>,
    index: usize,
}

impl<'a> BorrowedFdGuard<'a> {
    /// Invokes `f` with a [`BorrowedFd`] for the duration of the call.
    pub fn with<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> R {
        let guard = self.fds.lock().unwrap();
        let fd = guard[self.index].as_ref().expect("fd slot consumed");
        f(fd.as_fd())
    }
}
