//! gomote SSH gateway
//!
//! An SSH front-end that authenticates callers with short-lived session
//! certificates (or, for legacy clients, GitHub-listed keys) and bridges their
//! terminal to the session's remote build worker.

mod auth;
mod authority;
mod bridge;
mod buildlet;
mod config;
mod error;
mod github;
mod keys;
mod naming;
mod registry;
mod ssh;
mod terminal;
mod tunnel;

#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::authority::CertificateAuthority;
use crate::config::GatewayConfig;
use crate::registry::{FileSessionRegistry, SessionMetadata};

/// gomote SSH gateway - terminal access to remote build sessions
#[derive(Parser, Debug)]
#[command(name = "gomote-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gomote/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Serve,

    /// Generate an ECDSA key pair: <out> (private) and <out>.pub
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },

    /// Sign a public key into a certificate for one session
    Sign {
        #[arg(long)]
        session: String,

        #[arg(long)]
        owner: String,

        /// Authorized-keys file holding the key to sign
        #[arg(long)]
        public_key: PathBuf,

        /// Certificate lifetime; defaults to certificate_validity_secs
        #[arg(long)]
        validity_secs: Option<u64>,
    },

    /// Add a session to the registry state file
    Register {
        /// Session id, e.g. user-alice-linux-amd64-0
        #[arg(long)]
        id: String,

        #[arg(long)]
        host_type: String,

        #[arg(long)]
        builder_type: String,

        /// Worker address as host:port
        #[arg(long)]
        address: String,
    },

    /// Remove a session from the registry state file
    Unregister {
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Keygen { out } => keygen(&out),
        Command::Sign {
            session,
            owner,
            public_key,
            validity_secs,
        } => {
            let validity = validity_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.certificate_validity());
            sign(&config, &session, &owner, &public_key, validity).await
        }
        Command::Register {
            id,
            host_type,
            builder_type,
            address,
        } => {
            let registry = FileSessionRegistry::load(config.state_file.clone()).await?;
            let now = Utc::now();
            let owner = naming::InstanceName::parse(&id).owner().to_string();
            registry
                .register(SessionMetadata {
                    id: id.clone(),
                    owner,
                    host_type,
                    builder_type,
                    address,
                    created_at: now,
                    renewed_at: now,
                })
                .await?;
            info!("Registered session {}", id);
            Ok(())
        }
        Command::Unregister { id } => {
            let registry = FileSessionRegistry::load(config.state_file.clone()).await?;
            match registry.remove(&id).await? {
                Some(_) => info!("Removed session {}", id),
                None => info!("Session {} was not registered", id),
            }
            Ok(())
        }
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    // Ensure required directories exist
    config.ensure_dirs()?;

    info!("Starting gomote-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Hosts: {}, builders: {}", config.hosts.len(), config.builders.len());

    let config = Arc::new(config);

    let registry = Arc::new(
        FileSessionRegistry::load(config.state_file.clone())
            .await
            .context("Failed to load session registry")?,
    );
    info!(
        "Session registry loaded from {} ({} sessions)",
        config.state_file.display(),
        registry.len().await
    );

    ssh::run_server(config, registry).await
}

fn keygen(out: &std::path::Path) -> Result<()> {
    let pair = keys::generate_key_pair()?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    std::io::Write::write_all(&mut file, &pair.private_key)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    let public_path = PathBuf::from(format!("{}.pub", out.display()));
    std::fs::write(&public_path, &pair.public_key)
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    info!("Wrote {} and {}", out.display(), public_path.display());
    Ok(())
}

async fn sign(
    config: &GatewayConfig,
    session: &str,
    owner: &str,
    public_key: &std::path::Path,
    validity: Duration,
) -> Result<()> {
    let raw = std::fs::read(public_key)
        .with_context(|| format!("Failed to read {}", public_key.display()))?;
    let signer = keys::load_or_generate_key(&config.authority_key_path, "authority").await?;

    let certificate = CertificateAuthority::new(signer).sign(&raw, session, owner, validity)?;
    print!("{}", String::from_utf8_lossy(&certificate));
    Ok(())
}
