//! Thread creation for acceptor and worker loops.
//!
//! Servers never call `std::thread::spawn` directly; every loop thread is created through a
//! [`ThreadFactory`], so applications can name threads, size their stacks, or wrap the loop
//! body (for example to count how many loop threads have exited).

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Which loop a thread is being created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// The single thread owning the bound socket.
    Acceptor,
    /// Worker thread with the given pool index.
    Worker(usize),
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKind::Acceptor => write!(f, "acceptor"),
            ThreadKind::Worker(id) => write!(f, "worker-{id}"),
        }
    }
}

/// Creates and starts the thread that runs `task`.
///
/// The returned handle must belong to the thread that runs `task`: servers report it through
/// `workers()` and join it on shutdown.
pub trait ThreadFactory: Send + Sync + 'static {
    fn new_thread(&self, kind: ThreadKind, task: Task) -> io::Result<JoinHandle<()>>;
}

impl<F> ThreadFactory for F
where
    F: Fn(ThreadKind, Task) -> io::Result<JoinHandle<()>> + Send + Sync + 'static,
{
    fn new_thread(&self, kind: ThreadKind, task: Task) -> io::Result<JoinHandle<()>> {
        self(kind, task)
    }
}

pub const DEFAULT_THREAD_PREFIX: &str = "mill-server";

/// Default factory: plain OS threads named `{prefix}-acceptor` and `{prefix}-worker-{i}`.
#[derive(Debug, Clone)]
pub struct NamedThreadFactory {
    prefix: String,
    stack_size: Option<usize>,
}

impl Default for NamedThreadFactory {
    fn default() -> Self {
        Self::new(DEFAULT_THREAD_PREFIX)
    }
}

impl NamedThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stack_size: None,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn thread_name(&self, kind: ThreadKind) -> String {
        format!("{}-{kind}", self.prefix)
    }
}

impl ThreadFactory for NamedThreadFactory {
    fn new_thread(&self, kind: ThreadKind, task: Task) -> io::Result<JoinHandle<()>> {
        let mut builder = Builder::new().name(self.thread_name(kind));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(task)
    }
}

pub(crate) fn default_factory() -> Arc<dyn ThreadFactory> {
    Arc::new(NamedThreadFactory::default())
}
