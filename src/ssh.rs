//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key and certificate authentication through the [`AuthChain`]
//! - Session policy (PTY required, known host/builder, hermetic filesystem gate)
//! - Bridging an interactive shell channel to a worker

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Certificate, PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tempfile::TempPath;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::CertificateAuthority;
use crate::auth::{AuthChain, AuthRequest, CertificateStrategy, LegacyKeyStrategy, OfferedKey};
use crate::bridge::{CallerEvents, CallerOutput, TerminalBridge, TunnelLeg};
use crate::buildlet::host_of;
use crate::config::{BuilderConfig, GatewayConfig, HostConfig};
use crate::github::{compute_fingerprint_from_pubkey, GitHubKeyFetcher};
use crate::keys::{authorized_key_line, load_or_generate_key, persist_private_key};
use crate::naming::InstanceName;
use crate::registry::{SessionMetadata, SessionRegistry};
use crate::terminal::{ClientCommand, PtyLauncher, TerminalLauncher, WindowSize};
use crate::tunnel::TunnelProxy;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<dyn SessionRegistry>,
    pub auth: AuthChain,
    pub bridge: TerminalBridge,

    /// Host private key on disk for the local ssh client; deleted on drop.
    pub client_key: TempPath,

    /// Authorized-keys line installed on workers for the remote shell.
    pub gomote_public_key: String,
}

impl ServerState {
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<dyn SessionRegistry>,
        authority: PublicKey,
        host_key: &PrivateKey,
        launcher: Arc<dyn TerminalLauncher>,
    ) -> Result<Self> {
        let mut auth = AuthChain::new().with(CertificateStrategy::new(registry.clone(), authority));
        if config.legacy.enabled {
            let fetcher = Arc::new(GitHubKeyFetcher::new(&config.legacy)?);
            auth = auth.with(LegacyKeyStrategy::new(fetcher, config.legacy.clone()));
        }

        let pem = host_key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        let client_key =
            persist_private_key(pem.as_bytes()).context("Failed to write host key temp file")?;

        let gomote_public_key = match &config.gomote_public_key {
            Some(line) => line.trim().to_string(),
            None => authorized_key_line(host_key.public_key())?,
        };

        Ok(Self {
            config,
            registry,
            auth,
            bridge: TerminalBridge::new(launcher),
            client_key,
            gomote_public_key,
        })
    }
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// SSH user name once authenticated.
    user: Option<String>,

    /// Fingerprint accepted during the offered phase.
    accepted_key: Option<String>,

    /// PTY info per SSH channel (set by pty_request).
    ptys: HashMap<ChannelId, PtyInfo>,

    /// Live bridges per SSH channel.
    bridges: HashMap<ChannelId, BridgeIo>,

    /// Cancelled when the connection goes away.
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub(crate) struct PtyInfo {
    term: String,
    size: WindowSize,
}

struct BridgeIo {
    /// Dropped on channel EOF.
    input: Option<mpsc::Sender<Vec<u8>>>,
    resize: mpsc::Sender<WindowSize>,
    cancel: CancellationToken,
}

/// Caller output over the session's SSH channel.
struct ChannelOutput {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl CallerOutput for ChannelOutput {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| anyhow!("channel {:?} closed", self.channel))
    }
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            user: None,
            accepted_key: None,
            ptys: HashMap::new(),
            bridges: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn run_chain(&mut self, user: &str, key: OfferedKey<'_>) -> Auth {
        let request = AuthRequest {
            user,
            peer_addr: self.peer_addr,
            key,
        };
        if self.server.auth.authenticate(&request).await.is_some() {
            self.user = Some(user.to_string());
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
                partial_success: false,
            }
        }
    }

    /// Start the terminal for `channel_id` and close the channel when it ends.
    fn start_terminal(&mut self, channel_id: ChannelId, session: &mut Session) {
        let pty = self.ptys.get(&channel_id).cloned();
        let handle = session.handle();
        let output = Arc::new(ChannelOutput {
            handle: handle.clone(),
            channel: channel_id,
        });
        let (io, run) = self.spawn_terminal(pty, output);
        self.bridges.insert(channel_id, io);

        tokio::spawn(async move {
            let status = run.await.unwrap_or(1);
            let _ = handle.exit_status_request(channel_id, status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }

    /// Run a terminal session for the authenticated user on its own task.
    /// The session is cancelled when this connection goes away.
    fn spawn_terminal(
        &self,
        pty: Option<PtyInfo>,
        output: Arc<dyn CallerOutput>,
    ) -> (BridgeIo, JoinHandle<u32>) {
        let user = self.user.clone().unwrap_or_default();
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(32);
        let (resize_tx, resize_rx) = mpsc::channel::<WindowSize>(8);
        let cancel = self.cancel.child_token();
        let io = BridgeIo {
            input: Some(input_tx),
            resize: resize_tx,
            cancel: cancel.clone(),
        };

        let server = self.server.clone();
        let run = tokio::spawn(async move {
            let caller = CallerEvents {
                input: input_rx,
                resize: resize_rx,
            };
            serve_terminal(server, &user, pty, caller, output, cancel).await
        });
        (io, run)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        Ok(true)
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);
        let auth = self.run_chain(user, OfferedKey::PublicKey(public_key)).await;
        if matches!(auth, Auth::Accept) {
            self.accepted_key = Some(compute_fingerprint_from_pubkey(public_key));
        }
        Ok(auth)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key auth (with signature) for user '{}'", user);
        let fingerprint = compute_fingerprint_from_pubkey(public_key);
        if self.user.as_deref() == Some(user) && self.accepted_key.as_ref() == Some(&fingerprint) {
            return Ok(Auth::Accept);
        }
        Ok(self.run_chain(user, OfferedKey::PublicKey(public_key)).await)
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        debug!("Certificate auth for user '{}' from {}", user, self.peer_addr);
        Ok(self.run_chain(user, OfferedKey::Certificate(certificate)).await)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        self.ptys.insert(
            channel_id,
            PtyInfo {
                term: term.to_string(),
                size: WindowSize::from_ssh(col_width, row_height),
            },
        );
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel_id);
        session.channel_success(channel_id)?;
        self.start_terminal(channel_id, session);
        Ok(())
    }

    /// Commands are not supported; the policy check explains why.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Exec request on channel {:?}: {}",
            channel_id,
            String::from_utf8_lossy(data)
        );
        session.channel_success(channel_id)?;
        // An exec is never an interactive terminal.
        self.ptys.remove(&channel_id);
        self.start_terminal(channel_id, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Window change: channel={:?}, cols={}, rows={}",
            channel_id, col_width, row_height
        );
        let size = WindowSize::from_ssh(col_width, row_height);
        if let Some(pty) = self.ptys.get_mut(&channel_id) {
            pty.size = size;
        }
        if let Some(io) = self.bridges.get(&channel_id) {
            let _ = io.resize.send(size).await;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.bridges.get(&channel_id).and_then(|io| io.input.as_ref()) {
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        if let Some(io) = self.bridges.get_mut(&channel_id) {
            io.input = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(io) = self.bridges.remove(&channel_id) {
            io.cancel.cancel();
        }
        self.ptys.remove(&channel_id);
        Ok(())
    }
}

/// Why a terminal session did not run to completion.
#[derive(Debug)]
enum Refusal {
    /// Session policy said no; shown to the caller verbatim.
    Policy(String),
    /// A resource could not be set up; shown to the caller verbatim.
    Transport(String),
}

/// Everything the policy check resolved for an allowed session.
struct Approved<'a> {
    host: &'a HostConfig,
    builder: &'a BuilderConfig,
}

/// Run one terminal session to completion and return its exit status.
pub(crate) async fn serve_terminal(
    server: Arc<ServerState>,
    user: &str,
    pty: Option<PtyInfo>,
    caller: CallerEvents,
    output: Arc<dyn CallerOutput>,
    cancel: CancellationToken,
) -> u32 {
    match run_terminal(&server, user, pty, caller, output.clone(), cancel).await {
        Ok(()) => 0,
        Err(Refusal::Policy(message)) => {
            info!("ssh: refused {}: {}", user, message.trim_end());
            say(output.as_ref(), &message).await;
            1
        }
        Err(Refusal::Transport(message)) => {
            warn!("ssh: {} failed: {}", user, message.trim_end());
            say(output.as_ref(), &message).await;
            1
        }
    }
}

async fn say(output: &dyn CallerOutput, text: &str) {
    if let Err(e) = output.write(text.as_bytes()).await {
        debug!("dropping caller message: {}", e);
    }
}

fn check_policy<'a>(
    server: &'a ServerState,
    name: &InstanceName,
    session: Option<SessionMetadata>,
) -> Result<Approved<'a>, Refusal> {
    let inst = &name.session_id;
    if server.gomote_public_key.is_empty() {
        return Err(Refusal::Policy("invalid gomote-ssh-public-key\n".to_string()));
    }
    let Some(session) = session else {
        return Err(Refusal::Policy(format!("unknown instance {:?}\n", inst)));
    };
    let Some(host) = server.config.hosts.get(&session.host_type) else {
        return Err(Refusal::Policy(format!(
            "instance {:?} has unknown host type {:?}\n",
            inst, session.host_type
        )));
    };
    let Some(builder) = server.config.builders.get(&session.builder_type) else {
        return Err(Refusal::Policy(format!(
            "instance {:?} has unknown builder type {:?}\n",
            inst, session.builder_type
        )));
    };
    if host.ssh_username.is_empty() && builder.uses_local_ssh_proxy() {
        return Err(Refusal::Policy(format!(
            "instance {:?} host type {:?} does not have SSH configured\n",
            inst, session.host_type
        )));
    }
    if !host.is_hermetic() && !name.mutable {
        return Err(Refusal::Policy(format!(
            "WARNING: instance {:?} host type {:?} is not currently\n\
             configured to have a hermetic filesystem per boot.\n\
             You must be careful not to modify machine state\n\
             that will affect future builds. Do you agree? If so,\n\
             run gomote ssh --i-will-not-break-the-host <INST>\n",
            inst, session.host_type
        )));
    }
    Ok(Approved {
        host,
        builder,
    })
}

async fn run_terminal(
    server: &ServerState,
    user: &str,
    pty: Option<PtyInfo>,
    caller: CallerEvents,
    output: Arc<dyn CallerOutput>,
    cancel: CancellationToken,
) -> Result<(), Refusal> {
    let Some(pty) = pty else {
        return Err(Refusal::Policy(
            "scp etc not yet supported; https://golang.org/issue/21140\n".to_string(),
        ));
    };
    let name = InstanceName::parse(user);
    let session = server.registry.resolve(&name.session_id).await;
    let Approved { host, builder } = check_policy(server, &name, session)?;
    let inst = name.session_id.as_str();

    // Renew the session until this function returns, on any path.
    let keep_alive = cancel.child_token();
    let _keep_alive_guard = keep_alive.clone().drop_guard();
    tokio::spawn(keep_alive_loop(
        server.registry.clone(),
        inst.to_string(),
        server.config.keepalive_interval(),
        keep_alive,
    ));

    info!("connecting to ssh to instance {:?} ...", inst);
    say(
        output.as_ref(),
        &format!(
            "# Welcome to the gomote ssh proxy, {}.\n\
             # Connecting to/starting remote ssh...\n\
             #\n",
            name.owner()
        ),
    )
    .await;

    let shell = server
        .registry
        .remote_shell(inst)
        .await
        .map_err(|e| Refusal::Transport(format!("failed to connect to ssh on {}: {:#}\n", inst, e)))?;

    let tunnel = if builder.uses_local_ssh_proxy() {
        let remote = shell
            .connect_shell(&host.ssh_username, &server.gomote_public_key)
            .await
            .map_err(|e| {
                Refusal::Transport(format!("failed to connect to ssh on {}: {:#}\n", inst, e))
            })?;
        let proxy = TunnelProxy::open()
            .await
            .map_err(|e| Refusal::Transport(format!("local listen error: {}\n", e)))?;
        info!("ssh local proxy port for {}: {}", inst, proxy.port());
        Some(TunnelLeg { proxy, remote })
    } else {
        None
    };

    let work_dir = shell
        .work_dir()
        .await
        .map_err(|e| Refusal::Transport(format!("Error getting WorkDir: {:#}\n", e)))?;
    say(
        output.as_ref(),
        &format!(
            "# `gomote push` and the builders use:\n\
             # - workdir: {wd}\n\
             # - GOROOT: {wd}/go\n\
             # - GOPATH: {wd}/gopath\n\
             # - env: {env}\n\
             # Happy debugging.\n",
            wd = work_dir,
            env = builder.env.join(" ")
        ),
    )
    .await;

    let command = match &tunnel {
        Some(leg) => ClientCommand::open_ssh(
            &server.config.client,
            leg.proxy.port(),
            &server.client_key,
            &host.ssh_username,
            &pty.term,
        ),
        None => {
            let address = shell.address();
            let ip = host_of(&address).ok_or_else(|| {
                Refusal::Transport(format!("# Failed to get IP out of {:?}\n", address))
            })?;
            ClientCommand::drawterm(&server.config.client, ip, &pty.term)
        }
    };
    if let Some(hint) = command.banner_hint() {
        say(output.as_ref(), &hint).await;
    }

    info!("ssh to {}: starting {} {:?}", inst, command.program, command.args);
    server
        .bridge
        .run(&command, pty.size, tunnel, caller, output, cancel)
        .await
        .map_err(|e| Refusal::Transport(format!("running ssh client to {}: {:#}\n", inst, e)))?;
    Ok(())
}

async fn keep_alive_loop(
    registry: Arc<dyn SessionRegistry>,
    session_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = registry.keep_alive(&session_id).await {
                    warn!("ssh: KeepAlive on session={} failed: {:#}", session_id, e);
                }
            }
        }
    }
    debug!("keep-alive for {} stopped", session_id);
}

/// Run the SSH server.
pub async fn run_server(config: Arc<GatewayConfig>, registry: Arc<dyn SessionRegistry>) -> Result<()> {
    let host_key = load_or_generate_key(&config.host_key_path, "host").await?;
    let authority =
        CertificateAuthority::new(load_or_generate_key(&config.authority_key_path, "authority").await?);

    let server_state = Arc::new(ServerState::new(
        config.clone(),
        registry,
        authority.public_key().clone(),
        &host_key,
        Arc::new(PtyLauncher),
    )?);
    info!(
        "Authentication chain has {} strategies; legacy GitHub keys {}",
        server_state.auth.len(),
        if config.legacy.enabled { "enabled" } else { "disabled" }
    );

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        ..Default::default()
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };
        let server_state = server_state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(server_state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}
