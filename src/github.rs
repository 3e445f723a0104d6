//! Legacy identity source: an owner's public keys from `github.com/<user>.keys`.
//!
//! This module handles:
//! - Fetching and parsing a user's authorized keys (malformed lines skipped)
//! - A time-bounded cache per user
//! - A sliding-window cap on outbound fetches
//!
//! Every failure yields zero keys so authentication fails closed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::PublicKey;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LegacyAuthConfig;

/// A public key from the identity source, in both raw and parsed form.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// e.g. "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILj8HGIG9NsT34PHxO8IBq0riSBv7snp30JM8AanBGoV"
    pub authorized_line: String,
    pub public_key: PublicKey,
}

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<Vec<AuthorizedKey>>,
}

/// Sliding-window cap on outbound requests. A zero limit disables the cap.
struct FetchLimiter {
    max_requests: u32,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl FetchLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    async fn try_acquire(&self) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let now = Instant::now();
        let mut recent = self.recent.lock().await;
        while let Some(oldest) = recent.front() {
            if now.duration_since(*oldest) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.len() >= self.max_requests as usize {
            return false;
        }
        recent.push_back(now);
        true
    }
}

/// HTTP client for fetching GitHub keys.
pub struct GitHubKeyFetcher {
    client: reqwest::Client,
    keys_url: String,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedKeys>>,
    limiter: FetchLimiter,
}

impl GitHubKeyFetcher {
    /// Create a new GitHub key fetcher.
    pub fn new(config: &LegacyAuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("gomote-gateway/0.1")
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            keys_url: config.keys_url.clone(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
            limiter: FetchLimiter::new(config.max_fetches_per_minute, Duration::from_secs(60)),
        })
    }

    /// Public keys for a GitHub user; empty on any failure.
    pub async fn public_keys(&self, github_user: &str) -> Arc<Vec<AuthorizedKey>> {
        if let Err(e) = validate_github_username(github_user) {
            warn!("Not fetching keys for invalid GitHub user '{}': {}", github_user, e);
            return Arc::default();
        }

        if let Some(keys) = self.cached(github_user).await {
            debug!("Using cached keys for GitHub user {}", github_user);
            return keys;
        }

        if !self.limiter.try_acquire().await {
            warn!(
                "Key fetch rate limit reached; refusing lookup for GitHub user {}",
                github_user
            );
            return Arc::default();
        }

        match self.fetch_keys(github_user).await {
            Ok(keys) => {
                let keys = Arc::new(keys);
                let mut cache = self.cache.lock().await;
                let ttl = self.cache_ttl;
                cache.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
                cache.insert(
                    github_user.to_string(),
                    CachedKeys {
                        fetched_at: Instant::now(),
                        keys: keys.clone(),
                    },
                );
                keys
            }
            Err(e) => {
                warn!("Getting {} GitHub keys: {:#}", github_user, e);
                Arc::default()
            }
        }
    }

    async fn cached(&self, github_user: &str) -> Option<Arc<Vec<AuthorizedKey>>> {
        let mut cache = self.cache.lock().await;
        match cache.get(github_user) {
            Some(entry) if entry.fetched_at.elapsed() < self.cache_ttl => Some(entry.keys.clone()),
            Some(_) => {
                cache.remove(github_user);
                None
            }
            None => None,
        }
    }

    /// Fetch SSH public keys for a GitHub user.
    async fn fetch_keys(&self, github_user: &str) -> Result<Vec<AuthorizedKey>> {
        let url = self.keys_url.replace("{user}", github_user);
        debug!("Fetching keys from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch keys for {}", github_user))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(anyhow!(
                "GitHub returned {} for user {}",
                response.status(),
                github_user
            ));
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read response for {}", github_user))?;

        let keys = parse_authorized_keys(github_user, &body);
        info!(
            "Fetched {} key(s) for GitHub user {}",
            keys.len(),
            github_user
        );
        Ok(keys)
    }
}

/// Parse an authorized-keys body, skipping (and logging) lines that don't parse.
pub fn parse_authorized_keys(github_user: &str, body: &str) -> Vec<AuthorizedKey> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match PublicKey::from_openssh(line) {
            Ok(public_key) => Some(AuthorizedKey {
                authorized_line: line.to_string(),
                public_key,
            }),
            Err(e) => {
                warn!("Parsing GitHub user {:?} key {:?}: {}", github_user, line, e);
                None
            }
        })
        .collect()
}

/// Compute fingerprint from raw key bytes (wire format).
/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute fingerprint from a russh public key.
pub fn compute_fingerprint_from_pubkey(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    compute_fingerprint_from_bytes(&key.public_key_bytes())
}

/// Validate a GitHub username.
pub fn validate_github_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("GitHub username cannot be empty"));
    }

    if name.len() > 39 {
        return Err(anyhow!("GitHub username too long (max 39 chars)"));
    }

    // GitHub usernames: alphanumeric or single hyphens, cannot start/end with hyphen
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' {
            return Err(anyhow!("Invalid character '{}' in GitHub username", c));
        }
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(anyhow!("GitHub username cannot start or end with '-'"));
    }

    if name.contains("--") {
        return Err(anyhow!("GitHub username cannot contain consecutive hyphens"));
    }

    Ok(())
}
