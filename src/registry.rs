//! Session registry: maps a session id to its worker and keeps it alive.
//!
//! The gateway only reads sessions and renews them. `FileSessionRegistry`
//! persists sessions to a JSON state file and serializes access behind a lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::buildlet::{BuildletClient, RemoteShell};

/// What the gateway knows about a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub owner: String,
    pub host_type: String,
    pub builder_type: String,

    /// `host:port` of the worker
    pub address: String,

    pub created_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

/// Session registry collaborator. Implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn resolve(&self, id: &str) -> Option<SessionMetadata>;

    /// Renew the session's lease.
    async fn keep_alive(&self, id: &str) -> Result<()>;

    /// A connector for the session's worker.
    async fn remote_shell(&self, id: &str) -> Result<Arc<dyn RemoteShell>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    sessions: HashMap<String, SessionMetadata>,
}

/// Registry backed by a JSON file.
pub struct FileSessionRegistry {
    state: RwLock<RegistryState>,
    path: PathBuf,
}

impl FileSessionRegistry {
    /// Load state from disk, or create a new empty state.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?
        } else {
            RegistryState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path,
        })
    }

    async fn save(&self) -> Result<()> {
        let state = self.state.read().await;
        let content =
            serde_json::to_string_pretty(&*state).context("Failed to serialize state")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write state file: {}", self.path.display()))?;

        Ok(())
    }

    /// Add or replace a session.
    pub async fn register(&self, session: SessionMetadata) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.sessions.insert(session.id.clone(), session);
        }
        self.save().await
    }

    /// Remove a session, returning it if it existed.
    pub async fn remove(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let removed = {
            let mut state = self.state.write().await;
            state.sessions.remove(id)
        };
        self.save().await?;
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

#[async_trait]
impl SessionRegistry for FileSessionRegistry {
    async fn resolve(&self, id: &str) -> Option<SessionMetadata> {
        let state = self.state.read().await;
        state.sessions.get(id).cloned()
    }

    async fn keep_alive(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let session = state
                .sessions
                .get_mut(id)
                .ok_or_else(|| anyhow!("session {} not found", id))?;
            session.renewed_at = Utc::now();
        }
        self.save().await
    }

    async fn remote_shell(&self, id: &str) -> Result<Arc<dyn RemoteShell>> {
        let session = self
            .resolve(id)
            .await
            .ok_or_else(|| anyhow!("session {} not found", id))?;
        Ok(Arc::new(BuildletClient::new(session.address)?))
    }
}
