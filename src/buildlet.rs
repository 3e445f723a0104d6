//! Remote-shell connector for a worker ("buildlet").
//!
//! The gateway only needs three things from a worker: an upgraded stream to
//! its sshd, its working directory, and its address.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream to a worker's shell endpoint.
pub trait ShellStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ShellStream for T {}

/// The narrow capability the gateway consumes from a worker.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a stream to the worker's sshd, authorizing `authorized_key` for `user`.
    async fn connect_shell(&self, user: &str, authorized_key: &str) -> Result<Box<dyn ShellStream>>;

    /// The directory builds run in.
    async fn work_dir(&self) -> Result<String>;

    /// `host:port` of the worker.
    fn address(&self) -> String;
}

/// Max size of the upgrade response head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// HTTP client for a worker reachable at `host:port`.
pub struct BuildletClient {
    addr: String,
    http: reqwest::Client,
}

impl BuildletClient {
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            addr: addr.into(),
            http,
        })
    }
}

#[async_trait]
impl RemoteShell for BuildletClient {
    async fn connect_shell(&self, user: &str, authorized_key: &str) -> Result<Box<dyn ShellStream>> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("Failed to dial buildlet at {}", self.addr))?;

        let request = format!(
            "POST /connect-ssh HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: ssh\r\n\
             X-Go-Ssh-User: {}\r\n\
             X-Go-Authorized-Key: {}\r\n\
             Content-Length: 0\r\n\r\n",
            self.addr,
            user,
            authorized_key.trim()
        );
        stream
            .write_all(request.as_bytes())
            .await
            .context("Failed to send connect-ssh request")?;

        let head = read_response_head(&mut stream).await?;
        let status = head.lines().next().unwrap_or_default();
        debug!("buildlet {} connect-ssh: {}", self.addr, status);
        match status.split_whitespace().nth(1) {
            Some("101") => Ok(Box::new(stream)),
            _ => Err(anyhow!("unexpected connect-ssh response: {:?}", status)),
        }
    }

    async fn work_dir(&self) -> Result<String> {
        let url = format!("http://{}/workdir", self.addr);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to query {}", url))?;
        if !response.status().is_success() {
            bail!("{} returned {}", url, response.status());
        }
        let body = response.text().await.context("Failed to read workdir")?;
        Ok(body.trim().to_string())
    }

    fn address(&self) -> String {
        self.addr.clone()
    }
}

/// Read up to and including the blank line, one byte at a time so nothing
/// past the head is consumed from the upgraded stream.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_HEAD_LEN {
            bail!("connect-ssh response head too large");
        }
        let n = stream
            .read(&mut byte)
            .await
            .context("Failed to read connect-ssh response")?;
        if n == 0 {
            bail!("buildlet closed connection during connect-ssh");
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).to_string())
}

/// Split `host:port` into its host part.
pub fn host_of(addr: &str) -> Option<&str> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}
