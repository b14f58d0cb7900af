use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pumps bytes both ways until either side closes or errors. Each direction
/// half-closes its destination on exit so the peer sees EOF promptly.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = io::split(client);
    let (mut upstream_read, mut upstream_write) = io::split(upstream);

    let (client_to_upstream, upstream_to_client) = tokio::join!(
        copy_until_closed(&mut client_read, &mut upstream_write),
        copy_until_closed(&mut upstream_read, &mut client_write),
    );

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

/// Copies until EOF or error, then shuts down the write side. Resets and
/// broken pipes are normal tunnel teardown, not failures worth surfacing.
async fn copy_until_closed<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if is_disconnect(&err) => break,
            Err(err) => {
                tracing::debug!(error = %err, "relay read failed");
                break;
            }
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
