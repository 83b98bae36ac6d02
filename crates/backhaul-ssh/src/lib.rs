//! SSH transport for Backhaul
//!
//! Connects to a relay host with public key authentication and registers remote
//! port forwards (`tcpip-forward`). Connections the relay host forwards back are
//! delivered through a [`backhaul_relay::ChannelListener`]; when the SSH session
//! dies the listener fails terminally.

mod error;
mod handler;
mod keys;
mod session;

pub use error::SshError;
pub use handler::{ForwardedStream, HostKeyPolicy};
pub use keys::{expand_key_path, load_private_key};
pub use session::{SshConfig, SshTransport};
