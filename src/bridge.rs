//! Wires a caller's channel to a local terminal client, and that client to a
//! worker through a [`TunnelProxy`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buildlet::ShellStream;
use crate::terminal::{ClientCommand, TerminalLauncher, WindowSize};
use crate::tunnel::TunnelProxy;

/// Where client output goes: the caller's SSH channel.
#[async_trait]
pub trait CallerOutput: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// Events arriving from the caller. Dropping `input`'s sender is caller EOF.
pub struct CallerEvents {
    pub input: mpsc::Receiver<Vec<u8>>,
    pub resize: mpsc::Receiver<WindowSize>,
}

/// A tunnel together with the worker stream it will relay to.
pub struct TunnelLeg {
    pub proxy: TunnelProxy,
    pub remote: Box<dyn ShellStream>,
}

/// Why a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client's terminal closed.
    ClientExited,
    /// The caller went away first.
    Cancelled,
}

/// Aborts a spawned task when dropped.
struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    fn new<T>(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle.abort_handle())
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct TerminalBridge {
    launcher: Arc<dyn TerminalLauncher>,
}

impl TerminalBridge {
    pub fn new(launcher: Arc<dyn TerminalLauncher>) -> Self {
        Self { launcher }
    }

    /// Run `command` until its terminal closes or `cancel` fires, then kill
    /// it and tear down the tunnel.
    pub async fn run(
        &self,
        command: &ClientCommand,
        size: WindowSize,
        tunnel: Option<TunnelLeg>,
        caller: CallerEvents,
        output: Arc<dyn CallerOutput>,
        cancel: CancellationToken,
    ) -> Result<BridgeExit> {
        // Pump first so the client finds the listener ready. Dropping the
        // guard on any return path closes the listener and the remote stream.
        let _pump = tunnel.map(|leg| {
            let port = leg.proxy.port();
            AbortOnDrop::new(tokio::spawn(async move {
                if let Err(e) = leg.proxy.pump_once(leg.remote).await {
                    debug!("tunnel {} closed with error: {}", port, e);
                }
            }))
        });

        let terminal = self.launcher.launch(command, size)?;
        let mut control = terminal.control;
        let mut client_output = terminal.output;

        let client_input = terminal.input;
        let mut caller_input = caller.input;
        let _forward_input = AbortOnDrop::new(tokio::spawn(async move {
            while let Some(bytes) = caller_input.recv().await {
                if client_input.send(bytes).await.is_err() {
                    break;
                }
            }
            debug!("caller input closed");
        }));

        let mut resize = caller.resize;
        let exit = loop {
            tokio::select! {
                chunk = client_output.recv() => match chunk {
                    Some(bytes) => {
                        if let Err(e) = output.write(&bytes).await {
                            warn!("Failed to write to caller: {}", e);
                            break BridgeExit::Cancelled;
                        }
                    }
                    None => break BridgeExit::ClientExited,
                },
                Some(size) = resize.recv() => {
                    if let Err(e) = control.resize(size) {
                        warn!("{}", e);
                    }
                }
                _ = cancel.cancelled() => break BridgeExit::Cancelled,
            }
        };

        // Killing and reaping may block on the child.
        let _ = tokio::task::spawn_blocking(move || control.kill()).await;
        info!("terminal bridge for {} ended: {:?}", command.program, exit);
        Ok(exit)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::terminal::{LaunchedTerminal, TerminalControl};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Records everything written to the caller.
    #[derive(Default)]
    pub(crate) struct RecordingOutput {
        pub bytes: Mutex<Vec<u8>>,
    }

    impl RecordingOutput {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.bytes.lock().unwrap()).to_string()
        }
    }

    #[async_trait]
    impl CallerOutput for RecordingOutput {
        async fn write(&self, bytes: &[u8]) -> Result<()> {
            self.bytes.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
    }

    /// Launcher whose "client" dials the `-p` port from the command line and
    /// relays raw bytes, standing in for an ssh client.
    #[derive(Default)]
    pub(crate) struct DialingLauncher {
        pub launches: AtomicUsize,
        pub kills: Arc<AtomicUsize>,
        pub resizes: Arc<Mutex<Vec<WindowSize>>>,
    }

    struct FakeControl {
        kills: Arc<AtomicUsize>,
        resizes: Arc<Mutex<Vec<WindowSize>>>,
        task: AbortOnDrop,
    }

    impl TerminalControl for FakeControl {
        fn resize(&mut self, size: WindowSize) -> Result<()> {
            self.resizes.lock().unwrap().push(size);
            Ok(())
        }

        fn kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.task.0.abort();
        }
    }

    impl TerminalLauncher for DialingLauncher {
        fn launch(&self, command: &ClientCommand, _size: WindowSize) -> Result<LaunchedTerminal> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let port: u16 = command
                .args
                .iter()
                .position(|a| a == "-p")
                .and_then(|i| command.args.get(i + 1))
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("no -p in {:?}", command.args))?;

            let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(8);
            let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(8);
            let task = tokio::spawn(async move {
                let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await else {
                    return;
                };
                let (mut read, mut write) = stream.into_split();
                let writer = tokio::spawn(async move {
                    while let Some(bytes) = input_rx.recv().await {
                        if write.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
                let mut buf = [0u8; 1024];
                while let Ok(n) = read.read(&mut buf).await {
                    if n == 0 || output_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                writer.abort();
            });

            Ok(LaunchedTerminal {
                input: input_tx,
                output: output_rx,
                control: Box::new(FakeControl {
                    kills: self.kills.clone(),
                    resizes: self.resizes.clone(),
                    task: AbortOnDrop::new(task),
                }),
            })
        }
    }

    fn command_for(port: u16) -> ClientCommand {
        ClientCommand {
            program: "fake-ssh".to_string(),
            args: vec!["-p".to_string(), port.to_string()],
            env: vec![],
            plan9: false,
        }
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways_and_teardown() {
        let launcher = Arc::new(DialingLauncher::default());
        let bridge = TerminalBridge::new(launcher.clone());

        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, mut worker) = tokio::io::duplex(1024);
        let (input_tx, input_rx) = mpsc::channel(8);
        let (resize_tx, resize_rx) = mpsc::channel(8);
        let output = Arc::new(RecordingOutput::default());

        let run = {
            let output = output.clone();
            tokio::spawn(async move {
                bridge
                    .run(
                        &command_for(port),
                        WindowSize::default(),
                        Some(TunnelLeg {
                            proxy,
                            remote: Box::new(near),
                        }),
                        CallerEvents {
                            input: input_rx,
                            resize: resize_rx,
                        },
                        output,
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        input_tx.send(b"ls\n".to_vec()).await.unwrap();
        let mut buf = [0u8; 3];
        worker.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        resize_tx.send(WindowSize { cols: 132, rows: 50 }).await.unwrap();
        worker.write_all(b"go.mod\n").await.unwrap();
        for _ in 0..100 {
            if output.text() == "go.mod\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(output.text(), "go.mod\n");
        for _ in 0..100 {
            if !launcher.resizes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(worker);
        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, BridgeExit::ClientExited);
        assert_eq!(launcher.kills.load(Ordering::SeqCst), 1);
        assert_eq!(
            launcher.resizes.lock().unwrap().as_slice(),
            &[WindowSize { cols: 132, rows: 50 }]
        );
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_kills_client_and_closes_tunnel() {
        let launcher = Arc::new(DialingLauncher::default());
        let bridge = TerminalBridge::new(launcher.clone());

        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, mut worker) = tokio::io::duplex(1024);
        let (_input_tx, input_rx) = mpsc::channel(8);
        let (_resize_tx, resize_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bridge
                    .run(
                        &command_for(port),
                        WindowSize::default(),
                        Some(TunnelLeg {
                            proxy,
                            remote: Box::new(near),
                        }),
                        CallerEvents {
                            input: input_rx,
                            resize: resize_rx,
                        },
                        Arc::new(RecordingOutput::default()),
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, BridgeExit::Cancelled);
        assert_eq!(launcher.kills.load(Ordering::SeqCst), 1);

        // The pump task was aborted, so the worker stream is closed.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), worker.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    struct FailingLauncher;

    impl TerminalLauncher for FailingLauncher {
        fn launch(&self, _command: &ClientCommand, _size: WindowSize) -> Result<LaunchedTerminal> {
            Err(anyhow::anyhow!("no pty"))
        }
    }

    #[tokio::test]
    async fn test_launch_failure_releases_tunnel() {
        let bridge = TerminalBridge::new(Arc::new(FailingLauncher));
        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, _worker) = tokio::io::duplex(64);
        let (_input_tx, input_rx) = mpsc::channel(1);
        let (_resize_tx, resize_rx) = mpsc::channel(1);

        let result = bridge
            .run(
                &command_for(port),
                WindowSize::default(),
                Some(TunnelLeg {
                    proxy,
                    remote: Box::new(near),
                }),
                CallerEvents {
                    input: input_rx,
                    resize: resize_rx,
                },
                Arc::new(RecordingOutput::default()),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
    }
}
