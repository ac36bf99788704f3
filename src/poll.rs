//! Readiness multiplexing.
//!
//! [`Multiplexer`] is the capability set the acceptor and worker loops are written against:
//! register a socket, block until something is ready, wake a blocked caller, close.
//! [`PollHandle`] implements it on top of [`mio::Poll`] (epoll, kqueue or IOCP depending on
//! the platform).
//!
//! A multiplexer is owned by exactly one loop thread. Other threads reach it only through a
//! cloned [`Waker`], which can interrupt a blocked [`Multiplexer::select`] and mark the
//! multiplexer closed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Token reserved for the waker; sockets must be registered with other tokens.
pub const WAKE_TOKEN: Token = Token(0);

/// Why [`Multiplexer::select`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// At least one event was collected, or the multiplexer was woken without being closed.
    Ready,
    /// The multiplexer was closed; the owning loop should drain and exit.
    Closed,
}

/// Readiness selection over a set of registered sockets.
pub trait Multiplexer: Send + Sized {
    fn open() -> io::Result<Self>;

    /// Associates `source` with `token` and `interest`.
    ///
    /// Fails if the multiplexer is closed or the OS refuses the registration.
    fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized;

    fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized;

    /// Blocks until at least one registered source is ready, the multiplexer is woken, it is
    /// closed, or `timeout` elapses (`None` waits indefinitely, `Some(Duration::ZERO)` only
    /// collects what is already ready). Ready events are written into `events`; the waker's own
    /// event carries [`WAKE_TOKEN`] and should be skipped by callers.
    fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<Selection>;

    /// Unblocks a thread currently inside [`select`](Self::select).
    fn wake_up(&self) -> io::Result<()>;

    /// Handle other threads use to wake or close this multiplexer.
    fn waker(&self) -> Waker;

    /// Idempotent. A blocked `select` returns [`Selection::Closed`] promptly afterwards.
    fn close(&self) -> io::Result<()>;

    fn is_closed(&self) -> bool;
}

struct WakerInner {
    waker: mio::Waker,
    closed: AtomicBool,
}

/// Cloneable cross-thread handle onto a multiplexer.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<WakerInner>,
}

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.inner.waker.wake()
    }

    /// Marks the multiplexer closed, then wakes it. Calling this twice is harmless.
    pub fn close(&self) -> io::Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.waker.wake()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waker")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// [`Multiplexer`] backed by [`mio::Poll`].
pub struct PollHandle {
    poller: Poll,
    waker: Waker,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        let poller = Poll::new()?;
        let waker = mio::Waker::new(poller.registry(), WAKE_TOKEN)?;
        Ok(PollHandle {
            poller,
            waker: Waker {
                inner: Arc::new(WakerInner {
                    waker,
                    closed: AtomicBool::new(false),
                }),
            },
        })
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "multiplexer is closed")
    }
}

impl Multiplexer for PollHandle {
    fn open() -> io::Result<Self> {
        Self::new()
    }

    fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        if token == WAKE_TOKEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "token is reserved for the waker",
            ));
        }
        source.register(self.poller.registry(), token, interest)
    }

    fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        source.deregister(self.poller.registry())
    }

    fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<Selection> {
        if self.is_closed() {
            events.clear();
            return Ok(Selection::Closed);
        }
        self.poller.poll(events, timeout)?;
        if self.is_closed() {
            return Ok(Selection::Closed);
        }
        Ok(Selection::Ready)
    }

    fn wake_up(&self) -> io::Result<()> {
        self.waker.wake()
    }

    fn waker(&self) -> Waker {
        self.waker.clone()
    }

    fn close(&self) -> io::Result<()> {
        self.waker.close()
    }

    fn is_closed(&self) -> bool {
        self.waker.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;

    #[test]
    fn test_wake_unblocks_select() {
        let mut poller = PollHandle::new().unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let mut events = Events::with_capacity(16);
        let selection = poller.select(&mut events, None).unwrap();
        assert_eq!(selection, Selection::Ready);
        assert!(events.iter().any(|e| e.token() == WAKE_TOKEN));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_reported() {
        let mut poller = PollHandle::new().unwrap();
        let waker = poller.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.close().unwrap();
            waker.close().unwrap();
        });

        let mut events = Events::with_capacity(16);
        assert_eq!(poller.select(&mut events, None).unwrap(), Selection::Closed);
        handle.join().unwrap();

        // closed stays closed, select no longer blocks
        assert_eq!(poller.select(&mut events, None).unwrap(), Selection::Closed);
        assert!(poller.is_closed());
    }

    #[test]
    fn test_register_after_close_fails() {
        let poller = PollHandle::new().unwrap();
        poller.close().unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(poller
            .register(&mut socket, Token(1), Interest::READABLE)
            .is_err());
    }

    #[test]
    fn test_reserved_token_rejected() {
        let poller = PollHandle::new().unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = poller
            .register(&mut socket, WAKE_TOKEN, Interest::READABLE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_readable_socket_is_selected() {
        let mut poller = PollHandle::new().unwrap();
        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        poller
            .register(&mut socket, Token(7), Interest::READABLE)
            .unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let mut events = Events::with_capacity(16);
        assert_eq!(poller.select(&mut events, None).unwrap(), Selection::Ready);
        assert!(events.iter().any(|e| e.token() == Token(7) && e.is_readable()));
    }

    #[test]
    fn test_zero_timeout_returns_without_events() {
        let mut poller = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(16);
        let selection = poller.select(&mut events, Some(Duration::ZERO)).unwrap();
        assert_eq!(selection, Selection::Ready);
        assert!(events.is_empty());
    }
}
