use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, warn};

use devmux_protocol::{ClientMessage, ErrorCode, MAX_JSON_LINE_BYTES, Response};
use libdevmux::{Caller, StreamHandle, StreamId, TerminalManager};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// How long teardown waits for queued frames to reach a client that has
/// stopped reading.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

fn next_stream_id() -> StreamId {
    StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
}

pub async fn handle_connection(
    stream: UnixStream,
    peer_uid: u32,
    manager: Arc<TerminalManager>,
    outbound_queue: usize,
) {
    let (read_half, write_half) = stream.into_split();
    serve(read_half, write_half, Some(peer_uid), manager, outbound_queue).await;
}

/// Run one client stream until it closes, then release everything it held.
pub async fn serve<R, W>(
    read_half: R,
    write_half: W,
    peer_uid: Option<u32>,
    manager: Arc<TerminalManager>,
    outbound_queue: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stream_id = next_stream_id();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(outbound_queue.max(1));
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let mut writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    let caller = Caller {
        stream: StreamHandle::new(stream_id, Arc::new(out_tx.clone())),
        peer_uid,
    };
    debug!(stream = %stream_id, ?peer_uid, "client connected");

    // Set when the client is gone or wedged and queued frames can be dropped.
    let mut abandoned = false;
    loop {
        let line = match reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!(stream = %stream_id, "socket read failed: {err}");
                abandoned = true;
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: ClientMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                let resp = Response::error(
                    None,
                    ErrorCode::InvalidRequest,
                    format!("invalid request: {err}"),
                );
                if enqueue_response(&out_tx, resp).is_err() {
                    abandoned = true;
                    break;
                }
                continue;
            }
        };

        let Some(resp) = dispatch(&manager, &caller, message).await else {
            continue;
        };
        if let Err(err) = enqueue_response(&out_tx, resp) {
            warn!(stream = %stream_id, "dropping client: {err}");
            abandoned = true;
            break;
        }
    }

    // The sink delivers through the writer, so a writer stuck on the socket
    // would hold up detach forever. Aborting it fails the pending sends.
    if abandoned {
        writer_task.abort();
    }
    let detach = manager.detach_stream(stream_id);
    tokio::pin!(detach);
    let released = tokio::select! {
        released = &mut detach => released,
        _ = tokio::time::sleep(FLUSH_GRACE) => {
            warn!(stream = %stream_id, "client stopped reading, discarding queued frames");
            writer_task.abort();
            detach.await
        }
    };
    debug!(stream = %stream_id, attachments = released, "client disconnected");

    drop(caller);
    drop(out_tx);
    if tokio::time::timeout(FLUSH_GRACE, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

/// Run one request. Notifies never produce a frame, even on failure.
async fn dispatch(
    manager: &TerminalManager,
    caller: &Caller,
    message: ClientMessage,
) -> Option<Response> {
    let ClientMessage { id, request } = message;
    let notify = request.is_notify();

    match manager.handle(caller, request).await {
        Ok(_) if notify => None,
        Ok(data) => Some(Response::ok(id, data)),
        Err(err) if notify => {
            debug!(stream = %caller.stream.id, "notify failed: {err}");
            None
        }
        Err(err) => {
            let (code, message) = err.to_error_code();
            Some(Response::error(id, code, message))
        }
    }
}

fn enqueue_response(out_tx: &mpsc::Sender<Response>, response: Response) -> Result<()> {
    match out_tx.try_send(response) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("client outbound queue full")),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}
