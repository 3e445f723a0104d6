//! Public key authentication as an ordered chain of strategies.
//!
//! Each strategy answers a plain yes/no for the offered credential; the first
//! yes wins. Strategies log but have no other side effects, so new ones can be
//! appended without touching the others.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{Certificate, PublicKey};
use russh::keys::ssh_key::certificate::CertType;
use tracing::{debug, info};

use crate::authority::{self, session_principal};
use crate::config::LegacyAuthConfig;
use crate::github::{compute_fingerprint_from_pubkey, GitHubKeyFetcher};
use crate::naming::{owner_from_instance_name, InstanceName};
use crate::registry::SessionRegistry;

/// The credential a client offered.
#[derive(Debug, Clone, Copy)]
pub enum OfferedKey<'a> {
    PublicKey(&'a PublicKey),
    Certificate(&'a Certificate),
}

/// One authentication attempt.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// The SSH user name, i.e. the (possibly `mutable-` prefixed) instance name.
    pub user: &'a str,
    pub peer_addr: SocketAddr,
    pub key: OfferedKey<'a>,
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn accepts(&self, request: &AuthRequest<'_>) -> bool;
}

/// Strategies evaluated in order, stopping at the first acceptance.
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Name of the strategy that accepted, or `None` if all rejected.
    pub async fn authenticate(&self, request: &AuthRequest<'_>) -> Option<&'static str> {
        for strategy in &self.strategies {
            if strategy.accepts(request).await {
                info!(
                    "{} authenticated {} from {}",
                    strategy.name(),
                    request.user,
                    request.peer_addr
                );
                return Some(strategy.name());
            }
        }
        info!(
            "authentication rejected for {} from {}",
            request.user, request.peer_addr
        );
        None
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

/// Accepts user certificates signed by this gateway's authority for an
/// existing session.
pub struct CertificateStrategy {
    registry: Arc<dyn SessionRegistry>,
    authority: PublicKey,
}

impl CertificateStrategy {
    pub fn new(registry: Arc<dyn SessionRegistry>, authority: PublicKey) -> Self {
        Self {
            registry,
            authority,
        }
    }
}

#[async_trait]
impl AuthStrategy for CertificateStrategy {
    fn name(&self) -> &'static str {
        "certificate"
    }

    async fn accepts(&self, request: &AuthRequest<'_>) -> bool {
        let session_id = InstanceName::parse(request.user).session_id;
        let OfferedKey::Certificate(cert) = request.key else {
            debug!("public key is not a certificate session={}", session_id);
            return false;
        };
        if cert.cert_type() != CertType::User {
            info!("certificate not user cert session={}", session_id);
            return false;
        }
        if cert.signature_key() != self.authority.key_data() {
            info!(
                "certificate is not signed by recognized Certificate Authority session={}",
                session_id
            );
            return false;
        }
        if self.registry.resolve(&session_id).await.is_none() {
            info!("certificate auth: unable to retrieve session={}", session_id);
            return false;
        }
        let want_principal = session_principal(&session_id);
        if !authority::validate(cert, &self.authority, &want_principal) {
            info!("certificate rejected for principal {}", want_principal);
            return false;
        }
        true
    }
}

/// Accepts a plain public key listed for the instance owner's GitHub account.
pub struct LegacyKeyStrategy {
    fetcher: Arc<GitHubKeyFetcher>,
    config: LegacyAuthConfig,
}

impl LegacyKeyStrategy {
    pub fn new(fetcher: Arc<GitHubKeyFetcher>, config: LegacyAuthConfig) -> Self {
        Self { fetcher, config }
    }
}

#[async_trait]
impl AuthStrategy for LegacyKeyStrategy {
    fn name(&self) -> &'static str {
        "legacy-github-key"
    }

    async fn accepts(&self, request: &AuthRequest<'_>) -> bool {
        let OfferedKey::PublicKey(key) = request.key else {
            return false;
        };
        let owner = owner_from_instance_name(request.user);
        if owner.is_empty() {
            return false;
        }

        let github_user = self.config.github_user(owner);
        let keys = self.fetcher.public_keys(github_user).await;
        match keys.iter().find(|k| k.public_key.key_data() == key.key_data()) {
            Some(matched) => {
                info!(
                    "for instance {:?}, github user {:?} key matched: {}",
                    request.user, github_user, matched.authorized_line
                );
                true
            }
            None => {
                debug!(
                    "key {} not among {} key(s) of github user {:?}",
                    compute_fingerprint_from_pubkey(key),
                    keys.len(),
                    github_user
                );
                false
            }
        }
    }
}
