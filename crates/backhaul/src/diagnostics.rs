use backhaul_relay::{SessionError, TransportError};
use backhaul_ssh::SshError;

use crate::TunnelError;

/// Private key missing or unreadable
#[derive(Debug, miette::Diagnostic, thiserror::Error)]
#[error("{message}")]
#[diagnostic(code(backhaul::ssh::key), severity(error))]
struct KeyDiagnostic {
    message: String,
    #[help]
    help: String,
}

/// Relay host refused the key or the user
#[derive(Debug, miette::Diagnostic, thiserror::Error)]
#[error("{message}")]
#[diagnostic(code(backhaul::ssh::auth), severity(error))]
struct AuthDiagnostic {
    message: String,
    #[help]
    help: String,
}

/// Relay host key did not verify
#[derive(Debug, miette::Diagnostic, thiserror::Error)]
#[error("{message}")]
#[diagnostic(code(backhaul::ssh::host_key), severity(error))]
struct HostKeyDiagnostic {
    message: String,
    #[help]
    help: String,
}

/// Relay host would not open the public port
#[derive(Debug, miette::Diagnostic, thiserror::Error)]
#[error("{message}")]
#[diagnostic(code(backhaul::forward::refused), severity(error))]
struct ForwardRefusedDiagnostic {
    message: String,
    #[help]
    help: String,
}

/// Map errors that reconnecting cannot fix to a diagnostic
pub fn analyze(error: &TunnelError) -> Option<Box<dyn miette::Diagnostic + Send + Sync>> {
    match error {
        TunnelError::Ssh(ssh) => analyze_ssh_error(ssh),
        TunnelError::Session(SessionError::Transport(TransportError::ListenRefused {
            bind_address,
            port,
            reason,
        })) => Some(Box::new(ForwardRefusedDiagnostic {
            message: format!(
                "Relay host refused to listen on {}:{} ({})",
                bind_address, port, reason
            ),
            help: "Check that the port is free on the relay host and that sshd allows \
                   remote forwarding (AllowTcpForwarding yes, GatewayPorts for non-loopback binds)."
                .to_string(),
        })),
        TunnelError::Session(_) => None,
    }
}

fn analyze_ssh_error(err: &SshError) -> Option<Box<dyn miette::Diagnostic + Send + Sync>> {
    match err {
        SshError::KeyMissing { path } => Some(Box::new(KeyDiagnostic {
            message: format!("Private key not found at {}", path.display()),
            help: format!(
                "Generate one with `ssh-keygen -t ed25519 -f {}` and add the public key to \
                 authorized_keys on the relay host, or point --key at an existing key.",
                path.display()
            ),
        })),
        SshError::InvalidKey { path, source } => Some(Box::new(KeyDiagnostic {
            message: format!("Cannot load private key {}: {}", path.display(), source),
            help: "The key must be an unencrypted OpenSSH, PEM or PKCS#8 private key.".to_string(),
        })),
        SshError::AuthenticationRejected { user } => Some(Box::new(AuthDiagnostic {
            message: format!("Public key authentication rejected for user '{}'", user),
            help: "Add the public key to ~/.ssh/authorized_keys of that user on the relay host, \
                   and check --proxy-user."
                .to_string(),
        })),
        SshError::HostKeyRejected { addr } => Some(Box::new(HostKeyDiagnostic {
            message: format!("Host key for {} is not trusted", addr),
            help: format!(
                "Add the relay host to ~/.ssh/known_hosts (e.g. `ssh-keyscan {} >> ~/.ssh/known_hosts`) \
                 or use --host-key-policy accept-any.",
                addr.split(':').next().unwrap_or(addr)
            ),
        })),
        SshError::Timeout { .. } | SshError::Protocol(_) => None,
    }
}

/// Print a fatal diagnostic to stderr
pub fn display(diagnostic: &dyn miette::Diagnostic) {
    use std::fmt::Write;

    let mut output = String::new();

    let _ = writeln!(output);
    let _ = writeln!(output, "  × Tunnel Setup Failed");
    let _ = writeln!(output);

    if let Some(code) = diagnostic.code() {
        let _ = writeln!(output, "  Error: {}", code);
    }

    let _ = writeln!(output, "  {}", diagnostic);

    if let Some(help) = diagnostic.help() {
        let _ = writeln!(output);
        let _ = writeln!(output, "  help: {}", help);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "  This error cannot be resolved by reconnecting.");

    eprintln!("{}", output);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_fatal_errors_have_diagnostics() {
        let missing = TunnelError::Ssh(SshError::KeyMissing {
            path: PathBuf::from("/home/me/.ssh/id_ed25519"),
        });
        let diagnostic = analyze(&missing).unwrap();
        assert!(diagnostic.help().unwrap().to_string().contains("ssh-keygen"));

        let refused = TunnelError::Session(SessionError::Transport(TransportError::ListenRefused {
            bind_address: "0.0.0.0".to_string(),
            port: 11111,
            reason: "denied".to_string(),
        }));
        let diagnostic = analyze(&refused).unwrap();
        assert_eq!(
            diagnostic.code().unwrap().to_string(),
            "backhaul::forward::refused"
        );
    }

    #[test]
    fn test_transient_errors_have_no_diagnostic() {
        let timeout = TunnelError::Ssh(SshError::Timeout {
            addr: "relay:22".to_string(),
        });
        assert!(analyze(&timeout).is_none());

        let closed = TunnelError::Session(SessionError::Transport(TransportError::SessionClosed));
        assert!(analyze(&closed).is_none());
    }
}
