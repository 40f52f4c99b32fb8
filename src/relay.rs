use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Copy bytes between the two ends of an established tunnel.
///
/// Runs until either side signals end-of-stream or errors, the idle timer
/// fires with no traffic in either direction, or `cancel` is triggered by a
/// routing update. Both streams are shut down before returning; shutdown of
/// an already-closed stream is absorbed. Returns the byte totals
/// (client -> target, target -> client).
pub async fn relay<C, T>(
    mut client: C,
    mut target: T,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut target_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut from_client = 0u64;
    let mut from_target = 0u64;

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut error: Option<io::Error> = None;

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = target.write_all(&client_buf[..n]).await {
                            error = Some(e);
                            break;
                        }
                        from_client += n as u64;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            res = target.read(&mut target_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client.write_all(&target_buf[..n]).await {
                            error = Some(e);
                            break;
                        }
                        from_target += n as u64;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("tunnel force-closed by routing update");
                break;
            }
            _ = &mut idle => {
                debug!("tunnel idle for {:?}, closing", idle_timeout);
                break;
            }
        }
    }

    if let Err(e) = target.shutdown().await {
        debug!("target shutdown: {}", e);
    }
    if let Err(e) = client.shutdown().await {
        debug!("client shutdown: {}", e);
    }

    match error {
        Some(e) => Err(e),
        None => Ok((from_client, from_target)),
    }
}
