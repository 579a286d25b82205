//! Per-connection request loop for the status server.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Longest request line accepted.
const MAX_LINE: u64 = 4096;

/// Idle connections are dropped after this long without a request.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Writes that cannot complete in this time abandon the connection.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers every request line on `stream` with `reply`.
///
/// Returns when the peer hangs up or misbehaves, or when `abort` fires.
/// `idle` only ends the connection between requests: a request whose first
/// bytes have arrived is still read to the end and answered.
pub(crate) async fn serve_connection<S>(
    stream: S,
    reply: &str,
    idle: CancellationToken,
    abort: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut answered = 0u64;

    loop {
        // Wait for the first byte of a request. Only here may `idle` end the
        // connection; fill_buf consumes nothing when it loses the race.
        let waiting = tokio::select! {
            biased;

            _ = abort.cancelled() => break,
            _ = idle.cancelled() => break,
            waiting = timeout(READ_TIMEOUT, reader.fill_buf()) => {
                waiting.map(|filled| filled.map(|buf| buf.is_empty()))
            }
        };
        match waiting {
            Err(_) => {
                debug!("Status connection idle too long");
                break;
            }
            Ok(Ok(true)) => break,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Status read failed");
                break;
            }
        }

        // A request has started, so it is answered even if `idle` fires.
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE);
        let read = tokio::select! {
            biased;

            _ = abort.cancelled() => break,
            read = timeout(READ_TIMEOUT, limited.read_line(&mut line)) => read,
        };

        match read {
            Err(_) => {
                debug!("Status connection idle too long");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(_)) if !line.ends_with('\n') && line.len() as u64 >= MAX_LINE => {
                debug!("Status request line too long");
                break;
            }
            Ok(Ok(_)) => {
                trace!(request = line.trim_end(), "Status request");
                let write = async {
                    writer.write_all(reply.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                let written = tokio::select! {
                    biased;

                    _ = abort.cancelled() => break,
                    written = timeout(WRITE_TIMEOUT, write) => written,
                };
                match written {
                    Ok(Ok(())) => answered += 1,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Status reply failed");
                        break;
                    }
                    Err(_) => {
                        debug!("Status reply timed out");
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Status read failed");
                break;
            }
        }
    }

    trace!(answered, "Status connection closed");
}
