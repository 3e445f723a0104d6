//! Typed errors for key material and certificate operations.

use std::path::PathBuf;

use russh::keys::ssh_key;
use thiserror::Error;

/// Errors raised while generating, loading, persisting, or signing keys.
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key generation failed (entropy source or unsupported algorithm).
    #[error("failed to generate key pair: {0}")]
    Generate(#[source] ssh_key::Error),

    /// A key could not be encoded.
    #[error("failed to encode key: {0}")]
    Serialize(#[source] ssh_key::Error),

    /// Writing a private key to a restricted temp file failed.
    #[error("failed to persist private key: {0}")]
    Persist(#[source] std::io::Error),

    /// A key file on disk could not be read or parsed.
    #[error("failed to load key from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The caller-supplied public key is not a valid authorized-key line.
    #[error("malformed public key: {0}")]
    MalformedKey(#[source] ssh_key::Error),

    /// The certificate could not be built or signed.
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] ssh_key::Error),

    /// The requested lifetime does not fit in a certificate timestamp.
    #[error("certificate validity of {0}s is out of range")]
    ValidityOutOfRange(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_malformed_key_display() {
        let err = KeyError::MalformedKey(ssh_key::Error::AlgorithmUnknown);
        assert!(err.to_string().contains("malformed public key"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_load_error_mentions_path() {
        let err = KeyError::Load {
            path: PathBuf::from("/etc/gomote/ca_key"),
            reason: "bad header".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("/etc/gomote/ca_key"));
        assert!(display.contains("bad header"));
        assert!(err.source().is_none());
    }
}
