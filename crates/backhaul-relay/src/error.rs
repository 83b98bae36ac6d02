use std::fmt;
use std::io;

use thiserror::Error;

/// Direction of a single copy operation inside a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Tunnel side to local service
    RemoteToLocal,
    /// Local service to tunnel side
    LocalToRemote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::RemoteToLocal => f.write_str("remote->local"),
            Direction::LocalToRemote => f.write_str("local->remote"),
        }
    }
}

/// Failure accepting an inbound connection from the remote listener
#[derive(Debug, Error)]
pub enum AcceptError {
    /// A single inbound connection could not be accepted; the listener is still usable
    #[error("Failed to accept inbound connection: {0}")]
    Transient(String),

    /// The underlying transport is gone and no further connections will arrive
    #[error("Remote listener closed: {0}")]
    Closed(String),
}

impl AcceptError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed(reason.into())
    }

    /// Whether the listener can never produce another connection
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcceptError::Closed(_))
    }
}

/// Failure dialing the local target for one accepted connection
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Failed to connect to local service {target}: {source}")]
    ConnectionFailed { target: String, source: io::Error },

    #[error("Timed out connecting to local service {target}")]
    Timeout { target: String },
}

/// I/O failure in one direction of a relay
#[derive(Debug, Error)]
#[error("Copy {direction} failed: {source}")]
pub struct CopyError {
    pub direction: Direction,
    #[source]
    pub source: io::Error,
}

impl CopyError {
    /// Errors produced by a peer that already went away
    ///
    /// These are part of normal connection teardown and only logged at debug level.
    pub fn is_peer_closed(&self) -> bool {
        matches!(
            self.source.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        )
    }
}

/// Failure of the transport session itself
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Relay host refused to listen on {bind_address}:{port}: {reason}")]
    ListenRefused {
        bind_address: String,
        port: u16,
        reason: String,
    },

    #[error("Transport session closed")]
    SessionClosed,

    #[error("Transport error: {0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal outcome of a session lifecycle
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to establish remote listener: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel terminated: {0}")]
    ListenerClosed(AcceptError),
}
