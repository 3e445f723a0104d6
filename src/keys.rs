//! Key material: per-session ECDSA key pairs, host/authority keys, and the
//! restricted temp file handed to the local ssh client.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, EcdsaCurve, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use tempfile::TempPath;
use tracing::info;

use crate::error::KeyError;

/// A freshly generated key pair in its wire encodings.
pub struct KeyPair {
    /// OpenSSH PEM-armored private key.
    pub private_key: Vec<u8>,
    /// Authorized-keys line (`ecdsa-sha2-nistp256 AAAA...`).
    pub public_key: Vec<u8>,
}

/// Generate an ECDSA P-256 key pair.
pub fn generate_key_pair() -> Result<KeyPair, KeyError> {
    let private = PrivateKey::random(
        &mut OsRng,
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
    )
    .map_err(KeyError::Generate)?;

    let public_key = authorized_key_line(private.public_key())?;
    let private_key = private
        .to_openssh(LineEnding::LF)
        .map_err(KeyError::Serialize)?;

    Ok(KeyPair {
        private_key: private_key.as_bytes().to_vec(),
        public_key: format!("{}\n", public_key).into_bytes(),
    })
}

/// Encode a public key as a single authorized-keys line, without trailing newline.
pub fn authorized_key_line(key: &PublicKey) -> Result<String, KeyError> {
    key.to_openssh().map_err(KeyError::Serialize)
}

/// Write a private key to a fresh temp file that is created owner-only (0600)
/// before any byte is written.
///
/// The file is removed when the returned path guard is dropped.
pub fn persist_private_key(key: &[u8]) -> Result<TempPath, KeyError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("ssh-priv-key");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o600));
    }

    let mut file = builder.tempfile().map_err(KeyError::Persist)?;
    file.write_all(key).map_err(KeyError::Persist)?;
    file.flush().map_err(KeyError::Persist)?;

    Ok(file.into_temp_path())
}

/// Load a private key from file or generate a new Ed25519 one.
pub async fn load_or_generate_key(path: &Path, role: &str) -> Result<PrivateKey> {
    if path.exists() {
        info!("Loading {} key from {}", role, path.display());
        let key = russh::keys::load_secret_key(path, None).map_err(|e| KeyError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(key)
    } else {
        info!("Generating new Ed25519 {} key", role);
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .with_context(|| format!("Failed to generate {} key", role))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .with_context(|| format!("Failed to encode {} key", role))?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved {} key to {}", role, path.display());
        Ok(key)
    }
}
