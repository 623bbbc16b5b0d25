//! Per-connection IPC loop (§4.1, §4.2): decode frames, dispatch, and relay
//! live PTY output while this connection is the attached client.

use std::sync::Arc;

use anyhow::Result;
use midterm_proto::ipc::{IpcFrame, IpcFrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::session::SessionState;
use crate::HostEvent;

/// Serve one accepted connection until it disconnects, is superseded by a
/// newer connection (`token` cancelled from outside), or sends `Close`.
///
/// Returns `true` if `Close` was received (the caller should exit the
/// process after acking).
pub async fn serve(
    mut stream: UnixStream,
    session: Arc<SessionState>,
    events_tx: broadcast::Sender<HostEvent>,
    token: CancellationToken,
) -> Result<bool> {
    let mut events_rx = events_tx.subscribe();
    let mut decoder = IpcFrameDecoder::new();
    let mut read_buf = [0u8; 16384];
    let mut handshaked = false;

    loop {
        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!("connection superseded, exiting serve loop");
                return Ok(false);
            }
            event = events_rx.recv(), if handshaked => {
                match event {
                    Ok(HostEvent::Output(bytes)) => {
                        let (cols, rows) = session.pty.dims();
                        let frame = IpcFrame::Output { cols, rows, data: bytes };
                        if stream.write_all(&frame.encode()).await.is_err() {
                            return Ok(false);
                        }
                    }
                    // State/process/foreground events are picked up by the
                    // client's next GetInfo (§4.2); no push frame needed
                    // beyond the StateChange marker itself.
                    Ok(HostEvent::StateChange) => {
                        if stream.write_all(&IpcFrame::StateChange.encode()).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(HostEvent::ProcessEvent(json)) => {
                        if stream.write_all(&IpcFrame::ProcessEvent(json).encode()).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(HostEvent::ForegroundChange(json)) => {
                        if stream.write_all(&IpcFrame::ForegroundChange(json).encode()).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(false),
                }
            }
            n = stream.read(&mut read_buf) => {
                let n = match n {
                    Ok(0) => return Ok(false),
                    Ok(n) => n,
                    Err(_) => return Ok(false),
                };
                let frames = match decoder.feed(&read_buf[..n]) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!(error = %e, "invalid frame, tearing down transport");
                        return Ok(false);
                    }
                };
                for frame in frames {
                    if let Some(closed) = dispatch(frame, &mut stream, &session, &mut handshaked, &events_tx).await? {
                        return Ok(closed);
                    }
                }
            }
        }
    }
}

/// Handle one inbound frame. Returns `Some(true)` if `Close` was processed
/// (caller should exit the process), `Some(false)` if the transport should
/// be torn down, `None` to keep serving.
async fn dispatch(
    frame: IpcFrame,
    stream: &mut UnixStream,
    session: &Arc<SessionState>,
    handshaked: &mut bool,
    events_tx: &broadcast::Sender<HostEvent>,
) -> Result<Option<bool>> {
    match frame {
        IpcFrame::GetInfo => {
            let flushed = if !*handshaked {
                *handshaked = true;
                session.complete_handshake()
            } else {
                Vec::new()
            };
            let info = session.snapshot();
            let json = serde_json::to_vec(&info)?;
            stream.write_all(&IpcFrame::Info(json).encode()).await?;
            if !flushed.is_empty() {
                let (cols, rows) = session.pty.dims();
                stream
                    .write_all(&IpcFrame::Output { cols, rows, data: flushed }.encode())
                    .await?;
            }
            Ok(None)
        }
        IpcFrame::Input(data) => {
            let _ = session.pty.write_input(&data);
            Ok(None)
        }
        IpcFrame::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                return Ok(None);
            }
            let current = session.pty.dims();
            if current != (cols, rows) {
                session.pty.resize(cols, rows)?;
            }
            session.set_dims(cols, rows);
            stream.write_all(&IpcFrame::ResizeAck.encode()).await?;
            let _ = events_tx.send(HostEvent::StateChange);
            Ok(None)
        }
        IpcFrame::GetBuffer => {
            let data = session.buffer_snapshot();
            stream.write_all(&IpcFrame::Buffer(data).encode()).await?;
            Ok(None)
        }
        IpcFrame::SetName(name) => {
            session.set_name(name);
            stream.write_all(&IpcFrame::SetNameAck.encode()).await?;
            let _ = events_tx.send(HostEvent::StateChange);
            Ok(None)
        }
        IpcFrame::SetLogLevel(level) => {
            if let Some(level) = midterm_proto::session::LogLevel::from_byte(level) {
                crate::logging::set_level(level);
            }
            stream.write_all(&IpcFrame::SetLogLevelAck.encode()).await?;
            Ok(None)
        }
        IpcFrame::Close => {
            let _ = session.pty.kill();
            stream.write_all(&IpcFrame::CloseAck.encode()).await?;
            Ok(Some(true))
        }
        // Host-to-client-only frames received from a client are protocol
        // errors; tear the transport down rather than crash the process.
        IpcFrame::Info(_)
        | IpcFrame::Output { .. }
        | IpcFrame::ResizeAck
        | IpcFrame::Buffer(_)
        | IpcFrame::SetNameAck
        | IpcFrame::SetLogLevelAck
        | IpcFrame::StateChange
        | IpcFrame::ProcessEvent(_)
        | IpcFrame::ForegroundChange(_)
        | IpcFrame::CloseAck => Ok(Some(false)),
    }
}
