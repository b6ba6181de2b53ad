// SPDX-License-Identifier: GPL-3.0-only

//! Daemon side of the control socket

use super::ControlInterface;
use super::protocol::{self, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Accept connections until the task is dropped
pub async fn serve(listener: UnixListener, control: Arc<ControlInterface>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let control = Arc::clone(&control);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, control).await {
                        debug!(error = %e, "Control connection closed with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept control connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, control: Arc<ControlInterface>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match protocol::decode::<Request>(&line) {
            Ok(request) => request,
            Err(error) => {
                send(&mut write, &Response::Error { error }).await?;
                continue;
            }
        };
        debug!(?request, "Control request");

        let response = match request {
            Request::Start => Response::from_result(
                control.start().await.map(|_| "Pipeline starting".to_string()),
            ),
            Request::Stop => Response::from_result(
                control.stop().await.map(|_| "Pipeline stopped".to_string()),
            ),
            Request::Restart => Response::from_result(
                control.restart().await.map(|_| "Pipeline restarting".to_string()),
            ),
            Request::Status => Response::Status {
                report: control.status(),
            },
            Request::Logs { lines: limit } => {
                return stream_logs(&control, limit, &mut lines, &mut write).await;
            }
        };
        send(&mut write, &response).await?;
    }
    Ok(())
}

/// Replay history then follow live lines until the client goes away
///
/// Nothing is logged per line here; the stream would feed itself.
async fn stream_logs<W: AsyncWrite + Unpin>(
    control: &ControlInterface,
    limit: Option<usize>,
    incoming: &mut Lines<BufReader<OwnedReadHalf>>,
    write: &mut W,
) -> std::io::Result<()> {
    let (history, mut live) = match control.logs() {
        Ok(subscription) => subscription,
        Err(error) => return send(write, &Response::Error { error }).await,
    };

    let skip = limit.map(|n| history.len().saturating_sub(n)).unwrap_or(0);
    for line in history.into_iter().skip(skip) {
        send(write, &Response::Log { line }).await?;
    }

    loop {
        tokio::select! {
            // Any input or EOF from the client ends the stream
            _ = incoming.next_line() => return Ok(()),
            received = live.recv() => match received {
                Ok(line) => send(write, &Response::Log { line }).await?,
                Err(RecvError::Lagged(count)) => send(write, &Response::Skipped { count }).await?,
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(write: &mut W, response: &Response) -> std::io::Result<()> {
    let bytes = protocol::encode(response).map_err(|e| std::io::Error::other(e.to_string()))?;
    write.write_all(&bytes).await?;
    write.flush().await
}
