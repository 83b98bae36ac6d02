use std::path::PathBuf;

use thiserror::Error;

/// Errors establishing or running the SSH transport
#[derive(Debug, Error)]
pub enum SshError {
    /// No key file at the configured location
    #[error("Private key not found at {path}")]
    KeyMissing { path: PathBuf },

    /// Key file exists but could not be decoded
    #[error("Failed to load private key {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("Timed out connecting to {addr}")]
    Timeout { addr: String },

    #[error("Host key for {addr} was rejected")]
    HostKeyRejected { addr: String },

    #[error("Server rejected public key authentication for user '{user}'")]
    AuthenticationRejected { user: String },

    #[error("SSH error: {0}")]
    Protocol(#[from] russh::Error),
}

impl SshError {
    /// Errors that reconnecting cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::KeyMissing { .. }
                | SshError::InvalidKey { .. }
                | SshError::HostKeyRejected { .. }
                | SshError::AuthenticationRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SshError::AuthenticationRejected {
            user: "tunnel".to_string()
        }
        .is_fatal());
        assert!(SshError::HostKeyRejected {
            addr: "relay:22".to_string()
        }
        .is_fatal());
        assert!(!SshError::Timeout {
            addr: "relay:22".to_string()
        }
        .is_fatal());
    }
}
