use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Relays bytes bidirectionally between `downstream` and `upstream` until one
/// direction observes EOF, a reset, or a write error. That direction signals
/// the other half to stop via a shared cancellation token (per spec §4.4 step
/// 10) rather than relying on `copy_bidirectional`'s own half-close timing,
/// so both loops always tear down together.
pub async fn relay(downstream: TcpStream, upstream: TcpStream) -> Result<()> {
    let stop = CancellationToken::new();

    let (down_r, down_w) = downstream.into_split();
    let (up_r, up_w) = upstream.into_split();

    let stop_for_down = stop.clone();
    let client_to_upstream = async move {
        let result = pump(down_r, up_w, stop_for_down.clone()).await;
        stop_for_down.cancel();
        result
    };

    let stop_for_up = stop.clone();
    let upstream_to_client = async move {
        let result = pump(up_r, down_w, stop_for_up.clone()).await;
        stop_for_up.cancel();
        result
    };

    let (a, b) = tokio::join!(client_to_upstream, upstream_to_client);
    a?;
    b?;
    Ok(())
}

async fn pump<R, W>(mut reader: R, mut writer: W, stop: CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];

    let result: std::io::Result<()> = async {
        loop {
            let n = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                res = reader.read(&mut buf) => res?,
            };
            if n == 0 {
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
        }
    }
    .await;

    let _ = writer.shutdown().await;
    Ok(result?)
}
