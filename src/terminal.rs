//! Local terminal clients: which program to launch for a worker, and a
//! launcher that runs it under a pseudo-terminal.

use std::io::{Read, Write};
use std::path::Path;
use std::thread;

use anyhow::{anyhow, Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ClientConfig;

/// Plan 9 workers run no sshd; drawterm logs in with the stock account.
const PLAN9_USER: &str = "glenda";
const PLAN9_PASSWORD: &str = "glenda123";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    /// Clamp SSH's u32 dimensions into a PTY size; zero becomes one.
    pub fn from_ssh(cols: u32, rows: u32) -> Self {
        let clamp = |v: u32| v.clamp(1, u16::MAX as u32) as u16;
        Self {
            cols: clamp(cols),
            rows: clamp(rows),
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// A program invocation for the local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Set for drawterm sessions to a Plan 9 worker.
    pub plan9: bool,
}

impl ClientCommand {
    /// OpenSSH to the tunnel on `localhost:port`, authenticating with `key_path`.
    /// Host key checking is off: the loopback target changes every session.
    pub fn open_ssh(
        config: &ClientConfig,
        port: u16,
        key_path: &Path,
        ssh_user: &str,
        term: &str,
    ) -> Self {
        Self {
            program: config.ssh_program.clone(),
            args: vec![
                "-p".to_string(),
                port.to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-i".to_string(),
                key_path.display().to_string(),
                format!("{}@localhost", ssh_user),
            ],
            env: vec![("TERM".to_string(), term.to_string())],
            plan9: false,
        }
    }

    /// drawterm straight to a Plan 9 worker at `ip`.
    pub fn drawterm(config: &ClientConfig, ip: &str, term: &str) -> Self {
        Self {
            program: config.drawterm_program.clone(),
            args: vec![
                "-a".to_string(),
                ip.to_string(),
                "-c".to_string(),
                ip.to_string(),
                "-u".to_string(),
                PLAN9_USER.to_string(),
                "-k".to_string(),
                format!("user={}", PLAN9_USER),
            ],
            env: vec![("TERM".to_string(), term.to_string())],
            plan9: true,
        }
    }

    /// Extra line shown to the caller before this client starts, if any.
    pub fn banner_hint(&self) -> Option<String> {
        self.plan9
            .then(|| format!("# Plan9 user/pass: {}/{}\n", PLAN9_USER, PLAN9_PASSWORD))
    }
}

/// Out-of-band control of a launched client.
pub trait TerminalControl: Send {
    fn resize(&mut self, size: WindowSize) -> Result<()>;

    /// Terminate the client and reap it. Safe to call more than once.
    fn kill(&mut self);
}

/// A running client. `output` closes when the client's terminal does.
pub struct LaunchedTerminal {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub control: Box<dyn TerminalControl>,
}

/// Starts local terminal clients.
pub trait TerminalLauncher: Send + Sync {
    fn launch(&self, command: &ClientCommand, size: WindowSize) -> Result<LaunchedTerminal>;
}

/// Launches clients on the host under a native PTY.
#[derive(Debug, Default)]
pub struct PtyLauncher;

impl TerminalLauncher for PtyLauncher {
    fn launch(&self, command: &ClientCommand, size: WindowSize) -> Result<LaunchedTerminal> {
        let mut cmd = CommandBuilder::new(&command.program);
        for arg in &command.args {
            cmd.arg(arg);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let pair = portable_pty::native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| anyhow!("Failed to allocate PTY: {}", e))?;
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("Failed to start {}: {}", command.program, e))?;
        // The slave end belongs to the child now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("Failed to clone PTY reader: {}", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("Failed to take PTY writer: {}", e))?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(32);
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(32);

        thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || read_pty(reader, output_tx))
            .context("Failed to spawn PTY reader thread")?;
        thread::Builder::new()
            .name("pty-writer".to_string())
            .spawn(move || write_pty(writer, input_rx))
            .context("Failed to spawn PTY writer thread")?;

        debug!("launched {} {:?}", command.program, command.args);
        Ok(LaunchedTerminal {
            input: input_tx,
            output: output_rx,
            control: Box::new(PtyControl {
                master: pair.master,
                child,
                reaped: false,
            }),
        })
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn read_pty(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the child side of the PTY is gone.
            Err(_) => break,
        }
    }
}

fn write_pty(mut writer: Box<dyn Write + Send>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = input.blocking_recv() {
        if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

struct PtyControl {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reaped: bool,
}

impl TerminalControl for PtyControl {
    fn resize(&mut self, size: WindowSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| anyhow!("Failed to resize PTY: {}", e))
    }

    fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!("Failed to kill terminal client: {}", e);
            }
        }
        match self.child.wait() {
            Ok(status) => debug!("terminal client exited: {:?}", status),
            Err(e) => warn!("Failed to reap terminal client: {}", e),
        }
        self.reaped = true;
    }
}

impl Drop for PtyControl {
    fn drop(&mut self) {
        self.kill();
    }
}
