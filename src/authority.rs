//! Short-lived user certificates scoped to one session and one owner.
//!
//! Certificates are never tracked after issuance: expiry is the only way they
//! stop being valid, so validity windows are kept short.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use russh::keys::ssh_key::certificate::{Builder, CertType};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::HashAlg;
use russh::keys::{Certificate, PrivateKey, PublicKey};
use tracing::debug;

use crate::error::KeyError;

/// Trust realm appended to session ids to form certificate principals.
pub const PRINCIPAL_DOMAIN: &str = "farmer.golang.org";

/// Key id stamped into every issued certificate.
const CERT_KEY_ID: &str = "go_build";

/// Extensions the terminal bridge needs over the tunnel.
const CERT_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// The principal a certificate must carry to open `session_id`.
pub fn session_principal(session_id: &str) -> String {
    format!("{}@{}", session_id, PRINCIPAL_DOMAIN)
}

/// Signs caller keys into session-scoped user certificates.
pub struct CertificateAuthority {
    signer: PrivateKey,
}

impl CertificateAuthority {
    pub fn new(signer: PrivateKey) -> Self {
        Self { signer }
    }

    /// The authority's public key, against which certificates are checked.
    pub fn public_key(&self) -> &PublicKey {
        self.signer.public_key()
    }

    /// Sign `raw_public_key` (an authorized-keys line) into a certificate valid
    /// for `validity` from now, returned in authorized-keys encoding.
    pub fn sign(
        &self,
        raw_public_key: &[u8],
        session_id: &str,
        owner_id: &str,
        validity: Duration,
    ) -> Result<Vec<u8>, KeyError> {
        let line = String::from_utf8_lossy(raw_public_key);
        let public_key = PublicKey::from_openssh(line.trim()).map_err(KeyError::MalformedKey)?;

        let now = unix_now();
        let valid_before = now
            .checked_add(validity.as_secs())
            .ok_or(KeyError::ValidityOutOfRange(validity.as_secs()))?;
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            public_key.key_data().clone(),
            now,
            valid_before,
        )
        .map_err(KeyError::Signing)?;

        builder.serial(1).map_err(KeyError::Signing)?;
        builder.key_id(CERT_KEY_ID).map_err(KeyError::Signing)?;
        builder
            .cert_type(CertType::User)
            .map_err(KeyError::Signing)?;
        builder
            .valid_principal(session_principal(session_id))
            .map_err(KeyError::Signing)?;
        builder
            .valid_principal(owner_id)
            .map_err(KeyError::Signing)?;
        for extension in CERT_EXTENSIONS {
            builder
                .extension(extension, "")
                .map_err(KeyError::Signing)?;
        }

        let certificate = builder.sign(&self.signer).map_err(KeyError::Signing)?;
        let encoded = certificate.to_openssh().map_err(KeyError::Serialize)?;
        debug!(
            "Issued certificate for session {} owner {} valid {}s",
            session_id,
            owner_id,
            validity.as_secs()
        );

        Ok(format!("{}\n", encoded).into_bytes())
    }
}

/// Check a certificate against an authority key, a wanted principal, and the
/// current time. Any failure is a plain rejection.
pub fn validate(cert: &Certificate, signer: &PublicKey, want_principal: &str) -> bool {
    validate_at(cert, signer, want_principal, unix_now())
}

/// [`validate`] at an explicit unix timestamp.
pub fn validate_at(cert: &Certificate, signer: &PublicKey, want_principal: &str, now: u64) -> bool {
    if cert.signature_key() != signer.key_data() {
        debug!("certificate not signed by the configured authority");
        return false;
    }
    if cert.cert_type() != CertType::User {
        debug!("certificate type {:?} is not a user certificate", cert.cert_type());
        return false;
    }
    if !cert.valid_principals().iter().any(|p| p == want_principal) {
        debug!(
            "principal {} not in certificate principals {:?}",
            want_principal,
            cert.valid_principals()
        );
        return false;
    }
    if now < cert.valid_after() || now >= cert.valid_before() {
        debug!(
            "certificate outside validity window [{}, {}) at {}",
            cert.valid_after(),
            cert.valid_before(),
            now
        );
        return false;
    }

    // Signature check last; the window has already been enforced above.
    let fingerprint = signer.fingerprint(HashAlg::Sha256);
    if let Err(e) = cert.validate_at(now, [&fingerprint]) {
        debug!("certificate signature rejected: {}", e);
        return false;
    }

    true
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
