use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use devmux_protocol::{Event, Response};

use crate::error::TransportError;

/// Transport-assigned identity of one client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Network side of a stream: where notifications finally get written.
#[async_trait]
pub trait NotifyTransport: Send + Sync + 'static {
    async fn send(&self, event: Event) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool {
        false
    }
}

/// A connection's outbound response queue, drained by its writer task.
#[async_trait]
impl NotifyTransport for mpsc::Sender<Response> {
    async fn send(&self, event: Event) -> Result<(), TransportError> {
        mpsc::Sender::send(self, Response::Event(event))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// What a handler knows about the stream a request arrived on.
#[derive(Clone)]
pub struct StreamHandle {
    pub id: StreamId,
    pub transport: Arc<dyn NotifyTransport>,
}

impl StreamHandle {
    pub fn new(id: StreamId, transport: Arc<dyn NotifyTransport>) -> Self {
        Self { id, transport }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full; the frame is gone and the client recovers it via history.
    Dropped,
    Closed,
}

/// Bounded, ordered, best-effort delivery queue for one stream.
///
/// `try_send` never blocks. A single task drains the queue into the
/// transport and stops for good on the first failed send.
pub struct AsyncNotifySink {
    stream: StreamId,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    closed: Arc<AtomicBool>,
    dropped: AtomicU64,
    done: watch::Receiver<bool>,
}

impl AsyncNotifySink {
    /// Create the sink and start its delivery task. Must be called inside a
    /// tokio runtime.
    pub fn spawn(stream: StreamId, transport: Arc<dyn NotifyTransport>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(deliver(stream, rx, transport, Arc::clone(&closed), done_tx));

        Self {
            stream,
            tx: Mutex::new(Some(tx)),
            closed,
            dropped: AtomicU64::new(0),
            done: done_rx,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn try_send(&self, event: Event) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(event) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(stream = %self.stream, dropped = total, "sink queue full, frame dropped");
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                SendOutcome::Closed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting frames and wait for the delivery task to finish
    /// draining. Safe to call more than once, concurrently too.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(tx);

        let mut done = self.done.clone();
        // Err means the task is gone without reporting, which is also done.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn deliver(
    stream: StreamId,
    mut rx: mpsc::Receiver<Event>,
    transport: Arc<dyn NotifyTransport>,
    closed: Arc<AtomicBool>,
    done: watch::Sender<bool>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = transport.send(event).await {
            warn!(stream = %stream, error = %err, "notification delivery failed, disabling sink");
            closed.store(true, Ordering::Release);
            break;
        }
    }
    rx.close();
    debug!(stream = %stream, "sink delivery task finished");
    done.send_replace(true);
}
