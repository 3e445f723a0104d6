//! Fixtures shared by unit tests: a loopback HTTP server and in-memory
//! registry / worker fakes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::buildlet::{RemoteShell, ShellStream};
use crate::registry::{SessionMetadata, SessionRegistry};

/// A canned response for one request path.
#[derive(Clone)]
pub struct Canned {
    pub status: &'static str,
    pub body: String,
}

impl Canned {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: "200 OK",
            body: body.into(),
        }
    }

    pub fn status(status: &'static str) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// A tiny HTTP/1.1 server answering every request with `respond(path)`.
pub struct TestHttpServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestHttpServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Canned + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();
                tokio::spawn(async move {
                    let head = read_head(&mut stream).await;
                    let path = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let canned = respond(&path);
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        canned.status,
                        canned.body.len(),
                        canned.body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr, hits }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Read an HTTP request head (up to the blank line).
pub async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// A worker whose shell is an in-memory pipe. The far end of every
/// connection is handed to the test through the receiver.
pub struct FakeShell {
    pub connects: AtomicUsize,
    addr: String,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl FakeShell {
    pub fn new(addr: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let shell = Arc::new(Self {
            connects: AtomicUsize::new(0),
            addr: addr.to_string(),
            peers,
        });
        (shell, rx)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect_shell(&self, _user: &str, _authorized_key: &str) -> Result<Box<dyn ShellStream>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.peers
            .send(far)
            .map_err(|_| anyhow!("test dropped the shell receiver"))?;
        Ok(Box::new(near))
    }

    async fn work_dir(&self) -> Result<String> {
        Ok("/workdir".to_string())
    }

    fn address(&self) -> String {
        self.addr.clone()
    }
}

/// In-memory registry whose sessions all share one fake worker.
pub struct FakeRegistry {
    pub sessions: HashMap<String, SessionMetadata>,
    pub shell: Arc<FakeShell>,
    pub keepalives: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(shell: Arc<FakeShell>) -> Self {
        Self {
            sessions: HashMap::new(),
            shell,
            keepalives: AtomicUsize::new(0),
        }
    }

    pub fn with_session(mut self, id: &str, host_type: &str, builder_type: &str) -> Self {
        let now = Utc::now();
        self.sessions.insert(
            id.to_string(),
            SessionMetadata {
                id: id.to_string(),
                owner: crate::naming::owner_from_instance_name(id).to_string(),
                host_type: host_type.to_string(),
                builder_type: builder_type.to_string(),
                address: self.shell.address(),
                created_at: now,
                renewed_at: now,
            },
        );
        self
    }

    /// Overwrite the owner stored in a session's record.
    pub fn with_record_owner(mut self, id: &str, owner: &str) -> Self {
        if let Some(session) = self.sessions.get_mut(id) {
            session.owner = owner.to_string();
        }
        self
    }
}

#[async_trait]
impl SessionRegistry for FakeRegistry {
    async fn resolve(&self, id: &str) -> Option<SessionMetadata> {
        self.sessions.get(id).cloned()
    }

    async fn keep_alive(&self, _id: &str) -> Result<()> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remote_shell(&self, id: &str) -> Result<Arc<dyn RemoteShell>> {
        if !self.sessions.contains_key(id) {
            return Err(anyhow!("session {} not found", id));
        }
        Ok(self.shell.clone())
    }
}
