//! Worker event loop.
//!
//! Each worker owns one multiplexer and the set of connections assigned to it. The acceptor
//! hands connections over through the worker's lock-free `pending` queue and wakes it; from
//! then on only the worker thread touches the connection:
//!
//! ```text
//!  acceptor ──push──▶ pending queue ──pop──▶ register ─▶ channel_open
//!                                                          │
//!        select ◀──────────────────────────────────────────┘
//!          │ readable
//!          ▼
//!        read ─ Data ─▶ channel_read ─┐
//!          │  Empty ─▶ next event     │ (repeat until drained, at most MAX_READS_PER_EVENT
//!          │  EndOfStream / error     │  times; an undrained socket is carried over to the
//!          ▼                          │  next round, after the other ready connections)
//!        close ─▶ channel_close ◀─────┘ (when the handler closed the context)
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Interest, Token};
use tracing::{debug, error, trace, warn};

use crate::error::{NetworkError, Result};
use crate::handler::TcpHandler;
use crate::net::tcp::context::{ConnectionId, ReadOutcome, TcpContext};
use crate::poll::{Multiplexer, Selection, Waker, WAKE_TOKEN};

pub(crate) const EVENTS_CAPACITY: usize = 1024;

/// Chunks read from one connection per round before the worker moves on to the others.
pub(crate) const MAX_READS_PER_EVENT: usize = 16;

/// A connection accepted by the acceptor and not yet registered by its worker.
pub(crate) struct PendingConnection {
    pub(crate) id: ConnectionId,
    pub(crate) stream: TcpStream,
    pub(crate) remote_addr: SocketAddr,
}

/// State of a worker visible to the acceptor and to introspection.
pub(crate) struct WorkerShared {
    index: usize,
    pending: SegQueue<PendingConnection>,
    connection_count: AtomicUsize,
    waker: Waker,
}

impl WorkerShared {
    pub(crate) fn new(index: usize, waker: Waker) -> Self {
        Self {
            index,
            pending: SegQueue::new(),
            connection_count: AtomicUsize::new(0),
            waker,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Connections owned by this worker, including ones handed over but not yet registered.
    pub(crate) fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    /// A stopped worker registers nothing new; its multiplexer is closed.
    pub(crate) fn is_stopped(&self) -> bool {
        self.waker.is_closed()
    }

    /// Transfers ownership of `connection` to this worker and wakes it.
    ///
    /// A stopped worker refuses the connection. `Err` carries every connection taken back from
    /// the queue, which may be empty when the worker dropped it while draining.
    pub(crate) fn assign(
        &self,
        connection: PendingConnection,
    ) -> std::result::Result<(), Vec<PendingConnection>> {
        if self.is_stopped() {
            return Err(vec![connection]);
        }
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.pending.push(connection);
        // the worker marks itself stopped before its last drain of the queue
        if self.is_stopped() {
            return Err(self.reclaim());
        }
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.index, error = %e, "failed to wake worker after assignment");
        }
        Ok(())
    }

    /// Takes every queued, never registered connection back out of the queue.
    pub(crate) fn reclaim(&self) -> Vec<PendingConnection> {
        let mut reclaimed = Vec::new();
        while let Some(pending) = self.pending.pop() {
            self.release_one();
            reclaimed.push(pending);
        }
        reclaimed
    }

    fn release_one(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct WorkerLoop<M: Multiplexer> {
    shared: Arc<WorkerShared>,
    poll: M,
    events: Events,
    handler: Arc<dyn TcpHandler>,
    buffer_size: usize,
    connections: HashMap<Token, TcpContext>,
    next_token: usize,
    ready: Vec<Token>,
    carried: Vec<Token>,
}

impl<M: Multiplexer> WorkerLoop<M> {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        poll: M,
        handler: Arc<dyn TcpHandler>,
        buffer_size: usize,
    ) -> Self {
        Self {
            shared,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handler,
            buffer_size,
            connections: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
            ready: Vec::new(),
            carried: Vec::new(),
        }
    }

    /// Runs until the multiplexer is closed, then closes every owned connection.
    pub(crate) fn run(mut self) {
        let index = self.shared.index;
        debug!(worker = index, "worker loop started");

        loop {
            // connections with unread data must not wait for a new readiness edge
            let timeout = if self.carried.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            match self.poll.select(&mut self.events, timeout) {
                Ok(Selection::Ready) => {}
                Ok(Selection::Closed) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = index, error = %e, "select failed, stopping worker");
                    report(
                        self.handler.as_ref(),
                        None,
                        NetworkError::io("waiting for readable connections", e),
                    );
                    break;
                }
            }

            self.register_pending();

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            ready.extend(
                self.events
                    .iter()
                    .map(|event| event.token())
                    .filter(|token| *token != WAKE_TOKEN),
            );
            for token in self.carried.drain(..) {
                if !ready.contains(&token) {
                    ready.push(token);
                }
            }
            for token in ready.iter().copied() {
                if self.service(token) {
                    self.carried.push(token);
                }
            }
            self.ready = ready;
        }

        self.drain();
        debug!(worker = index, "worker loop stopped");
    }

    fn register_pending(&mut self) {
        while let Some(pending) = self.shared.pending.pop() {
            let PendingConnection {
                id,
                stream,
                remote_addr,
            } = pending;
            let token = Token(self.next_token);
            self.next_token += 1;

            let mut ctx = match TcpContext::new(
                id,
                self.shared.index,
                stream,
                remote_addr,
                self.buffer_size,
            ) {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.shared.release_one();
                    report(
                        self.handler.as_ref(),
                        None,
                        NetworkError::io(format!("preparing connection from {remote_addr}"), e),
                    );
                    continue;
                }
            };

            let registered = match ctx.stream_mut() {
                Some(stream) => self.poll.register(stream, token, Interest::READABLE),
                None => Ok(()),
            };
            if let Err(e) = registered {
                warn!(worker = self.shared.index, conn = id.as_u64(), error = %e, "failed to register connection");
                ctx.release();
                self.shared.release_one();
                report(self.handler.as_ref(), None, NetworkError::Register(e));
                continue;
            }

            debug!(
                worker = self.shared.index,
                conn = id.as_u64(),
                peer = %remote_addr,
                "connection opened"
            );
            invoke(self.handler.as_ref(), &mut ctx, |h, c| h.channel_open(c));
            let open = ctx.is_open();
            self.connections.insert(token, ctx);
            if !open {
                self.finish(token);
            }
        }
    }

    /// Reads a readable connection until it is drained or its read budget is spent.
    ///
    /// Returns `true` when the connection is still open and may hold unread data.
    fn service(&mut self, token: Token) -> bool {
        let handler = self.handler.as_ref();
        let Some(ctx) = self.connections.get_mut(&token) else {
            return false;
        };

        let mut reads = 0;
        let mut undrained = false;
        while ctx.is_open() {
            if reads == MAX_READS_PER_EVENT {
                undrained = true;
                break;
            }
            match ctx.read() {
                Ok(ReadOutcome::Data(n)) => {
                    reads += 1;
                    trace!(conn = ctx.id().as_u64(), bytes = n, "read");
                    invoke(handler, ctx, |h, c| h.channel_read(c));
                }
                Ok(ReadOutcome::Empty) => break,
                Ok(ReadOutcome::EndOfStream) => ctx.close(),
                Err(e) => {
                    ctx.close();
                    report(
                        handler,
                        Some(&mut *ctx),
                        NetworkError::io("reading from connection", e),
                    );
                }
            }
        }

        if !ctx.is_open() {
            self.finish(token);
            return false;
        }
        undrained
    }

    /// Removes a closed connection and delivers its `channel_close`.
    fn finish(&mut self, token: Token) {
        let Some(mut ctx) = self.connections.remove(&token) else {
            return;
        };
        ctx.close();
        if let Some(stream) = ctx.stream_mut() {
            if let Err(e) = self.poll.deregister(stream) {
                debug!(conn = ctx.id().as_u64(), error = %e, "deregister failed");
            }
        }
        ctx.release();
        self.shared.release_one();
        debug!(
            worker = self.shared.index,
            conn = ctx.id().as_u64(),
            "connection closed"
        );
        invoke(self.handler.as_ref(), &mut ctx, |h, c| h.channel_close(c));
    }

    fn drain(&mut self) {
        // stopped before the last look at the pending queue
        if let Err(e) = self.poll.close() {
            debug!(worker = self.shared.index, error = %e, "closing multiplexer failed");
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.finish(token);
        }
        self.carried.clear();

        let dropped = self.shared.reclaim().len();
        if dropped > 0 {
            debug!(
                worker = self.shared.index,
                dropped, "dropped connections that were never opened"
            );
        }
    }
}

/// Runs one callback, routing an `Err` or a panic to `exception_caught`.
pub(crate) fn invoke<F>(handler: &dyn TcpHandler, ctx: &mut TcpContext, callback: F)
where
    F: FnOnce(&dyn TcpHandler, &mut TcpContext) -> Result<()>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(handler, &mut *ctx)));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => NetworkError::from_panic(payload),
    };
    warn!(conn = ctx.id().as_u64(), error = %err, "handler callback failed");
    report(handler, Some(ctx), err);
}

/// Delivers `err` to `exception_caught`, which must not panic; if it does the panic is logged
/// and swallowed.
pub(crate) fn report(handler: &dyn TcpHandler, ctx: Option<&mut TcpContext>, err: NetworkError) {
    let delivered =
        panic::catch_unwind(AssertUnwindSafe(move || handler.exception_caught(ctx, err)));
    if delivered.is_err() {
        error!("exception_caught panicked");
    }
}
