use std::path::{Path, PathBuf};

use russh::keys::ssh_key::{HashAlg, PrivateKey};

use crate::error::SshError;

/// Expand `~` and environment variables in a configured key path
pub fn expand_key_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(e) => {
            tracing::debug!("Failed to expand key path {}: {}", raw, e);
            PathBuf::from(shellexpand::tilde(raw).into_owned())
        }
    }
}

/// Load an unencrypted private key (OpenSSH, PEM or PKCS#8)
pub fn load_private_key(path: &Path) -> Result<PrivateKey, SshError> {
    if !path.exists() {
        return Err(SshError::KeyMissing {
            path: path.to_path_buf(),
        });
    }

    let key = russh::keys::load_secret_key(path, None).map_err(|source| SshError::InvalidKey {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::debug!(
        "Loaded {} key {} from {}",
        key.algorithm(),
        key.public_key().fingerprint(HashAlg::Sha256),
        path.display()
    );

    Ok(key)
}
