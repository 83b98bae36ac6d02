//! Seams between the relay core and the outside world
//!
//! The relay never knows which transport carries tunnel connections. A transport
//! adapter implements [`TransportSession`] and hands out a [`RemoteListener`];
//! local connections come from a [`Dialer`]. Two in-process listeners are provided:
//! [`ChannelListener`], fed by any producer through an mpsc channel (the SSH adapter
//! uses it for forwarded channels), and [`TcpRemoteListener`], a plain TCP socket.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use crate::error::{AcceptError, DialError, TransportError};

/// Bidirectional byte stream that can be relayed
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An inbound connection handed out by a remote listener
pub struct Accepted<S> {
    pub stream: S,
    /// Originator of the connection as reported by the transport
    pub peer: String,
}

impl<S> Accepted<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

/// Listener registered through a transport session
#[async_trait]
pub trait RemoteListener: Send {
    type Stream: RelayStream;

    /// Wait for the next inbound connection
    ///
    /// A terminal error (see [`AcceptError::is_terminal`]) means no further
    /// connection will ever be produced.
    async fn accept(&mut self) -> Result<Accepted<Self::Stream>, AcceptError>;

    /// Human readable description of the public endpoint, for logs
    fn describe(&self) -> String;
}

/// Authenticated session to a relay host
#[async_trait]
pub trait TransportSession: Send {
    type Listener: RemoteListener;

    /// Ask the relay host to listen on `bind_address:port` and forward connections back
    async fn open_remote_listener(
        &mut self,
        bind_address: &str,
        port: u16,
    ) -> Result<Self::Listener, TransportError>;

    /// Close the session; outstanding listeners fail terminally afterwards
    async fn close(&mut self);
}

/// Opens fresh connections to the local service
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: RelayStream;

    async fn dial(&self) -> Result<Self::Stream, DialError>;

    /// Target address, for logs
    fn target(&self) -> &str;
}

/// Sending side of a [`ChannelListener`]
pub type ListenerSender<S> = mpsc::Sender<Result<Accepted<S>, AcceptError>>;

/// Remote listener fed through an mpsc channel
///
/// Dropping every sender closes the listener: the next accept fails terminally.
pub struct ChannelListener<S> {
    rx: mpsc::Receiver<Result<Accepted<S>, AcceptError>>,
    description: String,
}

impl<S: RelayStream> ChannelListener<S> {
    /// Create a listener and the sender used to push accepted connections into it
    pub fn channel(capacity: usize, description: impl Into<String>) -> (ListenerSender<S>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx,
                description: description.into(),
            },
        )
    }
}

#[async_trait]
impl<S: RelayStream> RemoteListener for ChannelListener<S> {
    type Stream = S;

    async fn accept(&mut self) -> Result<Accepted<S>, AcceptError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(AcceptError::closed("transport dropped the listener")),
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Remote listener backed by a plain TCP socket
///
/// Accept errors from the OS concern a single connection (e.g. file descriptor
/// exhaustion) and are always reported as transient.
pub struct TcpRemoteListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpRemoteListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl RemoteListener for TcpRemoteListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<Accepted<TcpStream>, AcceptError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| AcceptError::transient(e.to_string()))?;
        Ok(Accepted::new(stream, peer.to_string()))
    }

    fn describe(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Default time allowed for a local connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a TCP service, one fresh connection per call
#[derive(Debug, Clone)]
pub struct TcpDialer {
    target: String,
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect(self.target.as_str());
        let result = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| DialError::Timeout {
                    target: self.target.clone(),
                })?,
            None => connect.await,
        };

        let stream = result.map_err(|source| DialError::ConnectionFailed {
            target: self.target.clone(),
            source,
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", self.target, e);
        }

        Ok(stream)
    }

    fn target(&self) -> &str {
        &self.target
    }
}
