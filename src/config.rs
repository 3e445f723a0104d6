//! Gateway configuration loaded from TOML, including the host and builder
//! catalog consulted by the session policy.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key. Its private half is also the identity the
    /// local ssh client presents to workers.
    pub host_key_path: PathBuf,

    /// Path to the certificate authority key.
    pub authority_key_path: PathBuf,

    /// Authorized-keys line installed on workers for the remote shell.
    /// Defaults to the host key's public half.
    pub gomote_public_key: Option<String>,

    /// Path to the session registry state file
    pub state_file: PathBuf,

    /// Lifetime of certificates issued by `sign`
    pub certificate_validity_secs: u64,

    /// How often an open bridge renews its session
    pub keepalive_interval_secs: u64,

    /// Legacy GitHub-key authentication
    #[serde(default)]
    pub legacy: LegacyAuthConfig,

    /// Local terminal client programs
    #[serde(default)]
    pub client: ClientConfig,

    /// Host types keyed by name
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,

    /// Builder types keyed by name
    #[serde(default)]
    pub builders: BTreeMap<String, BuilderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("gomote");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            authority_key_path: data_dir.join("ca_key"),
            gomote_public_key: None,
            state_file: data_dir.join("sessions.json"),
            certificate_validity_secs: 300,
            keepalive_interval_secs: 30,
            legacy: LegacyAuthConfig::default(),
            client: ClientConfig::default(),
            hosts: BTreeMap::new(),
            builders: BTreeMap::new(),
        }
    }
}

/// Legacy authentication against a public key directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyAuthConfig {
    /// Accept plain public keys listed for the owner
    pub enabled: bool,

    /// Keys endpoint; `{user}` is replaced by the GitHub user name
    pub keys_url: String,

    /// Gomote owner name -> GitHub user name, when they differ
    #[serde(default)]
    pub owner_aliases: BTreeMap<String, String>,

    /// How long fetched keys are reused
    pub cache_ttl_secs: u64,

    /// Upper bound on outbound key fetches per minute
    pub max_fetches_per_minute: u32,

    /// Per-request timeout
    pub fetch_timeout_secs: u64,
}

impl Default for LegacyAuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keys_url: "https://github.com/{user}.keys".to_string(),
            owner_aliases: BTreeMap::new(),
            cache_ttl_secs: 300,
            max_fetches_per_minute: 30,
            fetch_timeout_secs: 5,
        }
    }
}

impl LegacyAuthConfig {
    /// GitHub account for a gomote owner.
    pub fn github_user<'a>(&'a self, owner: &'a str) -> &'a str {
        self.owner_aliases
            .get(owner)
            .map(String::as_str)
            .unwrap_or(owner)
    }
}

/// Programs launched on the gateway host for each terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// OpenSSH client
    pub ssh_program: String,

    /// drawterm for Plan 9 workers
    pub drawterm_program: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            drawterm_program: "/usr/local/bin/drawterm".to_string(),
        }
    }
}

/// Capabilities of a host type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Remote shell user; empty when the host has no SSH
    pub ssh_username: String,

    /// Whether every boot starts from a clean filesystem
    pub hermetic: bool,
}

impl HostConfig {
    pub fn is_hermetic(&self) -> bool {
        self.hermetic
    }
}

/// A builder type: the platform a session runs and the env builds use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub host_type: String,
    pub goos: String,
    pub goarch: String,

    /// Extra environment shown to the caller, as `KEY=value`
    #[serde(default)]
    pub env: Vec<String>,
}

impl BuilderConfig {
    pub fn goos(&self) -> &str {
        &self.goos
    }

    /// Plan 9 workers are reached with drawterm rather than through the tunnel.
    pub fn uses_local_ssh_proxy(&self) -> bool {
        self.goos() != "plan9"
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for path in [&self.state_file, &self.host_key_path, &self.authority_key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    pub fn certificate_validity(&self) -> Duration {
        Duration::from_secs(self.certificate_validity_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}
