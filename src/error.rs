//! Error types shared by every server, client and loop in the crate.
//!
//! Errors fall into four groups:
//!
//! - **setup** errors (`Bind`, `Configuration`, `Io` raised while starting): returned from
//!   `start()`, the server stays `NotStarted` and may be started again;
//! - **per-connection** errors (`Accept`, `Register`, `Io` raised by a read, `Handler`,
//!   `HandlerPanic`): never returned to a caller, they are delivered to the handler's
//!   `exception_caught` and the loop keeps running;
//! - **shutdown** errors: logged while closing, never prevent the `Closed` transition;
//! - **misuse** errors (`AlreadyStarted`, `AlreadyConnected`, `NotStarted`, `NotConnected`,
//!   `Closed`): returned synchronously to the caller that misused the object.

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Boxed error carried by [`NetworkError::Handler`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    /// Binding the server socket failed (address in use, permission denied, ...).
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Accepting one pending connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Registering a socket with a multiplexer failed.
    #[error("failed to register socket with the multiplexer: {0}")]
    Register(#[source] io::Error),

    #[error("server is already started")]
    AlreadyStarted,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("server is not started")]
    NotStarted,

    #[error("client is not connected")]
    NotConnected,

    #[error("already closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Error returned by a handler callback.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),

    /// A handler callback panicked; carries the panic message.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl NetworkError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps an application error so a handler can return it with `?`.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Handler(err.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::HandlerPanic(message)
    }

    /// Returns `true` for errors caused by using an object in the wrong lifecycle state.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted
                | Self::AlreadyConnected
                | Self::NotStarted
                | Self::NotConnected
                | Self::Closed
        )
    }

    /// Returns `true` for errors that can only be produced while starting a server.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Configuration(_))
    }

    /// Underlying I/O error, if there is one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Bind { source, .. } | Self::Io { source, .. } => Some(source),
            Self::Accept(e) | Self::Register(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = NetworkError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:8080"));
        assert!(text.contains("address in use"));
        assert!(err.is_setup());
        assert!(!err.is_misuse());
        assert_eq!(err.io_error().unwrap().kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_misuse_classification() {
        assert!(NetworkError::AlreadyStarted.is_misuse());
        assert!(NetworkError::Closed.is_misuse());
        assert!(NetworkError::NotConnected.is_misuse());
        assert!(!NetworkError::HandlerPanic("boom".into()).is_misuse());
    }

    #[test]
    fn test_panic_payload_conversion() {
        let err = NetworkError::from_panic(Box::new("static message"));
        assert!(matches!(err, NetworkError::HandlerPanic(ref m) if m == "static message"));

        let err = NetworkError::from_panic(Box::new(String::from("owned message")));
        assert!(matches!(err, NetworkError::HandlerPanic(ref m) if m == "owned message"));

        let err = NetworkError::from_panic(Box::new(42_u32));
        assert!(matches!(err, NetworkError::HandlerPanic(_)));
    }

    #[test]
    fn test_handler_wrapping() {
        let err = NetworkError::handler("bad frame");
        assert!(matches!(err, NetworkError::Handler(_)));
        assert_eq!(err.to_string(), "handler error: bad frame");
    }

    #[test]
    fn test_io_conversion() {
        let err: NetworkError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, NetworkError::Io { .. }));
        assert_eq!(err.io_error().unwrap().kind(), io::ErrorKind::BrokenPipe);
    }
}
