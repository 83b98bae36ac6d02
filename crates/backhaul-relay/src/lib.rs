//! Connection-scoped stream relay for reverse tunnels
//!
//! A transport adapter registers a remote listener on a relay host. Every
//! connection accepted there is paired with a freshly dialed local connection
//! and bytes are copied both ways until both directions finish. Each pair is
//! independent: a failed dial or a broken copy only ever affects its own pair,
//! and only the death of the transport ends the session.
//!
//! # Example
//!
//! ```rust,ignore
//! use backhaul_relay::TcpRemoteListener;
//!
//! let listener = TcpRemoteListener::bind("0.0.0.0:11111").await?;
//! backhaul_relay::run(listener, "127.0.0.1", 21112).await?;
//! ```

mod error;
mod listener;
mod metrics;
mod pair;
mod relay;
mod session;
mod transport;

pub use error::{AcceptError, CopyError, DialError, Direction, SessionError, TransportError};
pub use listener::{ListenerLoop, ServeOptions, DEFAULT_ACCEPT_RETRY_DELAY};
pub use metrics::{ActivePairGuard, MetricsSnapshot, RelayMetrics};
pub use pair::{discard_remote, ConnectionIdGenerator, ConnectionPair};
pub use relay::{relay, DirectionEnd, DirectionReport, RelayOptions, RelayReport, DEFAULT_BUFFER_SIZE};
pub use session::{run, SessionLifecycle, SessionState};
pub use transport::{
    Accepted, ChannelListener, Dialer, ListenerSender, RelayStream, RemoteListener,
    TcpDialer, TcpRemoteListener, TransportSession, DEFAULT_CONNECT_TIMEOUT,
};
