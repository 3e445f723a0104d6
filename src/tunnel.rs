//! Single-use loopback relay between the local terminal client and a worker's
//! shell stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

const BUFFER_SIZE: usize = 32 * 1024;

/// A loopback listener that accepts exactly one connection.
///
/// `pump_once` consumes the proxy, so a used proxy cannot be reused.
pub struct TunnelProxy {
    listener: TcpListener,
    port: u16,
}

impl TunnelProxy {
    /// Bind an ephemeral port on 127.0.0.1.
    pub async fn open() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        debug!("tunnel listening on 127.0.0.1:{}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one local connection, close the listener, then relay bytes
    /// between it and `remote` until either side closes or fails.
    pub async fn pump_once<R>(self, remote: R) -> io::Result<()>
    where
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let Self { listener, port } = self;
        let (mut local, peer) = listener.accept().await?;
        drop(listener);
        debug!("tunnel {} accepted {}; listener closed", port, peer);

        let (mut local_read, mut local_write) = local.split();
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        let local_to_remote = copy_then_shutdown(&mut local_read, &mut remote_write);
        let remote_to_local = copy_then_shutdown(&mut remote_read, &mut local_write);

        let result = tokio::select! {
            r = local_to_remote => r,
            r = remote_to_local => r,
        };
        debug!("tunnel {} finished: {:?}", port, result);
        result
    }
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_pump_relays_both_directions() {
        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, mut far) = tokio::io::duplex(1024);
        let pump = tokio::spawn(proxy.pump_once(near));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(far);
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_second_dial_is_refused() {
        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, mut far) = tokio::io::duplex(1024);
        let _pump = tokio::spawn(proxy.pump_once(near));

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Bytes reaching the remote side prove the accept happened.
        first.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        far.read_exact(&mut buf).await.unwrap();

        let err = TcpStream::connect(("127.0.0.1", port)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_local_close_ends_pump() {
        let proxy = TunnelProxy::open().await.unwrap();
        let port = proxy.port();
        let (near, mut far) = tokio::io::duplex(1024);
        let pump = tokio::spawn(proxy.pump_once(near));

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }
}
