use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use devmux_protocol::{ConnId, Event, SessionId};

use crate::error::TransportError;
use crate::sink::{AsyncNotifySink, SendOutcome, StreamHandle, StreamId};

#[derive(Default)]
struct Attachments {
    sinks: HashMap<StreamId, Arc<AsyncNotifySink>>,
    by_stream: HashMap<StreamId, HashMap<SessionId, ConnId>>,
    by_session: HashMap<SessionId, HashMap<StreamId, ConnId>>,
}

/// Which streams watch which sessions, and the sink for each stream.
///
/// The mutex only guards map bookkeeping. Sends and sink shutdown happen
/// after it is released.
pub struct SessionRegistry {
    sink_capacity: usize,
    state: Mutex<Attachments>,
}

impl SessionRegistry {
    pub fn new(sink_capacity: usize) -> Self {
        Self {
            sink_capacity,
            state: Mutex::new(Attachments::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, Attachments> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `stream` as watching `session_id` through `conn_id`, creating
    /// the stream's sink on first use. Returns the connection id the stream
    /// previously held on the session, which may equal `conn_id`.
    pub fn attach(
        &self,
        session_id: &str,
        conn_id: &str,
        stream: &StreamHandle,
    ) -> Result<Option<ConnId>, TransportError> {
        if stream.transport.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut state = self.state();
        if !state.sinks.contains_key(&stream.id) {
            let sink = AsyncNotifySink::spawn(
                stream.id,
                Arc::clone(&stream.transport),
                self.sink_capacity,
            );
            state.sinks.insert(stream.id, Arc::new(sink));
        }

        let previous = state
            .by_stream
            .entry(stream.id)
            .or_default()
            .insert(session_id.to_string(), conn_id.to_string());
        state
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(stream.id, conn_id.to_string());

        debug!(session_id, conn_id, stream = %stream.id, "stream attached");
        Ok(previous)
    }

    /// Undo an [`attach`](Self::attach) the engine refused. Puts back
    /// `previous` if the stream held the session before, otherwise removes
    /// the attachment. A stream left with no attachments loses its sink.
    pub fn rollback(&self, stream: StreamId, session_id: &str, previous: Option<&str>) {
        let idle_sink = {
            let mut state = self.state();
            match previous {
                Some(conn_id) => {
                    state
                        .by_stream
                        .entry(stream)
                        .or_default()
                        .insert(session_id.to_string(), conn_id.to_string());
                    state
                        .by_session
                        .entry(session_id.to_string())
                        .or_default()
                        .insert(stream, conn_id.to_string());
                }
                None => {
                    if let Some(sessions) = state.by_stream.get_mut(&stream) {
                        sessions.remove(session_id);
                    }
                    if let Some(streams) = state.by_session.get_mut(session_id) {
                        streams.remove(&stream);
                        if streams.is_empty() {
                            state.by_session.remove(session_id);
                        }
                    }
                }
            }

            let idle = state.by_stream.get(&stream).is_none_or(HashMap::is_empty);
            if idle {
                state.by_stream.remove(&stream);
                state.sinks.remove(&stream)
            } else {
                None
            }
        };

        // Nothing was ever queued on an idle sink, so dropping its sender
        // lets the delivery task finish on its own.
        if let Some(sink) = idle_sink {
            drop(sink);
            debug!(session_id, stream = %stream, "attach rolled back, sink released");
        } else {
            debug!(session_id, stream = %stream, ?previous, "attach rolled back");
        }
    }

    /// Queue `event` on every sink attached to `session_id`.
    pub fn broadcast(&self, session_id: &str, event: Event) -> usize {
        self.broadcast_with(session_id, |_| event.clone())
    }

    /// Like [`broadcast`](Self::broadcast), but builds the frame per
    /// attachment from its connection id. Returns how many sinks queued it.
    pub fn broadcast_with<F>(&self, session_id: &str, build: F) -> usize
    where
        F: Fn(&str) -> Event,
    {
        let targets: Vec<(Arc<AsyncNotifySink>, ConnId)> = {
            let state = self.state();
            let Some(streams) = state.by_session.get(session_id) else {
                return 0;
            };
            streams
                .iter()
                .filter_map(|(stream, conn_id)| {
                    state
                        .sinks
                        .get(stream)
                        .map(|sink| (Arc::clone(sink), conn_id.clone()))
                })
                .collect()
        };

        targets
            .iter()
            .filter(|(sink, conn_id)| sink.try_send(build(conn_id)) == SendOutcome::Queued)
            .count()
    }

    /// Drop every attachment owned by `stream` and shut its sink down.
    /// Returns the `(session_id, conn_id)` pairs that were removed so the
    /// caller can release them in the engine. Calling it again is a no-op.
    pub async fn detach_sink(&self, stream: StreamId) -> Vec<(SessionId, ConnId)> {
        let (removed, sink) = {
            let mut state = self.state();
            let owned = state.by_stream.remove(&stream).unwrap_or_default();
            for session_id in owned.keys() {
                if let Some(streams) = state.by_session.get_mut(session_id) {
                    streams.remove(&stream);
                    if streams.is_empty() {
                        state.by_session.remove(session_id);
                    }
                }
            }
            let sink = state.sinks.remove(&stream);
            (owned.into_iter().collect::<Vec<_>>(), sink)
        };

        if let Some(sink) = sink {
            sink.close().await;
            debug!(stream = %stream, attachments = removed.len(), "stream detached");
        }
        removed
    }

    pub fn attachment_count(&self, session_id: &str) -> usize {
        self.state().by_session.get(session_id).map_or(0, HashMap::len)
    }

    pub fn stream_count(&self) -> usize {
        self.state().sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::{RecordingTransport, output};
    use std::time::{Duration, Instant};
    use tokio::sync::Semaphore;

    fn handle(id: u64, transport: Arc<RecordingTransport>) -> StreamHandle {
        StreamHandle::new(StreamId(id), transport)
    }

    #[tokio::test]
    async fn attach_broadcast_detach_cycle() {
        let registry = SessionRegistry::new(16);
        let t1 = RecordingTransport::new();
        let t2 = RecordingTransport::new();
        let s1 = handle(1, t1.clone());
        let s2 = handle(2, t2.clone());

        assert_eq!(registry.attach("sess", "c1", &s1).unwrap(), None);
        assert_eq!(registry.attach("sess", "c2", &s2).unwrap(), None);
        assert_eq!(registry.attachment_count("sess"), 2);
        assert_eq!(registry.stream_count(), 2);

        assert_eq!(registry.broadcast("sess", output("sess", 1)), 2);
        assert_eq!(registry.broadcast("other", output("other", 1)), 0);

        let removed = registry.detach_sink(StreamId(1)).await;
        assert_eq!(removed, vec![("sess".to_string(), "c1".to_string())]);
        assert_eq!(registry.attachment_count("sess"), 1);

        assert_eq!(registry.broadcast("sess", output("sess", 2)), 1);
        registry.detach_sink(StreamId(2)).await;

        assert_eq!(t1.sequences(), vec![1]);
        assert_eq!(t2.sequences(), vec![1, 2]);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = SessionRegistry::new(4);
        let s1 = handle(7, RecordingTransport::new());
        registry.attach("a", "c1", &s1).unwrap();
        registry.attach("b", "c1", &s1).unwrap();

        let mut removed = registry.detach_sink(StreamId(7)).await;
        removed.sort();
        assert_eq!(
            removed,
            vec![
                ("a".to_string(), "c1".to_string()),
                ("b".to_string(), "c1".to_string())
            ]
        );
        assert!(registry.detach_sink(StreamId(7)).await.is_empty());
        assert_eq!(registry.stream_count(), 0);
        assert_eq!(registry.broadcast("a", output("a", 1)), 0);
    }

    #[tokio::test]
    async fn reattach_reports_replaced_connection() {
        let registry = SessionRegistry::new(4);
        let s1 = handle(3, RecordingTransport::new());
        assert_eq!(registry.attach("sess", "c1", &s1).unwrap(), None);
        assert_eq!(
            registry.attach("sess", "c1", &s1).unwrap(),
            Some("c1".to_string())
        );
        assert_eq!(
            registry.attach("sess", "c2", &s1).unwrap(),
            Some("c1".to_string())
        );
        assert_eq!(registry.attachment_count("sess"), 1);
        assert_eq!(
            registry.detach_sink(StreamId(3)).await,
            vec![("sess".to_string(), "c2".to_string())]
        );
    }

    #[tokio::test]
    async fn rollback_restores_replaced_connection() {
        let registry = SessionRegistry::new(4);
        let s1 = handle(5, RecordingTransport::new());
        registry.attach("sess", "c1", &s1).unwrap();
        let previous = registry.attach("sess", "c2", &s1).unwrap();
        assert_eq!(previous.as_deref(), Some("c1"));

        registry.rollback(StreamId(5), "sess", previous.as_deref());
        assert_eq!(registry.attachment_count("sess"), 1);
        assert_eq!(registry.stream_count(), 1);
        assert_eq!(
            registry.detach_sink(StreamId(5)).await,
            vec![("sess".to_string(), "c1".to_string())]
        );
    }

    #[tokio::test]
    async fn rollback_of_first_attach_releases_sink() {
        let registry = SessionRegistry::new(4);
        let transport = RecordingTransport::new();
        let s1 = handle(6, transport.clone());
        assert_eq!(registry.attach("sess", "c1", &s1).unwrap(), None);
        assert_eq!(registry.stream_count(), 1);

        registry.rollback(StreamId(6), "sess", None);
        assert_eq!(registry.attachment_count("sess"), 0);
        assert_eq!(registry.stream_count(), 0);
        assert_eq!(registry.broadcast("sess", output("sess", 1)), 0);
        assert!(registry.detach_sink(StreamId(6)).await.is_empty());

        // A stream with other attachments keeps its sink.
        registry.attach("a", "c1", &s1).unwrap();
        registry.attach("b", "c2", &s1).unwrap();
        registry.rollback(StreamId(6), "b", None);
        assert_eq!(registry.stream_count(), 1);
        assert_eq!(registry.attachment_count("a"), 1);
        assert_eq!(registry.attachment_count("b"), 0);
    }

    #[tokio::test]
    async fn stalled_consumer_never_blocks_broadcast() {
        let registry = SessionRegistry::new(1);
        let stalled = RecordingTransport::gated(Arc::new(Semaphore::new(0)));
        let healthy = RecordingTransport::new();
        registry.attach("sess", "slow", &handle(1, stalled)).unwrap();
        registry.attach("sess", "fast", &handle(2, healthy)).unwrap();

        let started = Instant::now();
        for seq in 1..=1_000 {
            registry.broadcast("sess", output("sess", seq));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn per_connection_frames() {
        let registry = SessionRegistry::new(4);
        let t1 = RecordingTransport::new();
        let t2 = RecordingTransport::new();
        registry.attach("sess", "c1", &handle(1, t1.clone())).unwrap();
        registry.attach("sess", "c2", &handle(2, t2.clone())).unwrap();

        registry.broadcast_with("sess", |conn_id| Event::NameUpdate {
            session_id: "sess".to_string(),
            new_name: conn_id.to_string(),
            working_dir: "/".to_string(),
        });
        registry.detach_sink(StreamId(1)).await;
        registry.detach_sink(StreamId(2)).await;

        let name_of = |t: &RecordingTransport| match &t.events.lock().unwrap()[0] {
            Event::NameUpdate { new_name, .. } => new_name.clone(),
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(name_of(&t1), "c1");
        assert_eq!(name_of(&t2), "c2");
    }

    #[tokio::test]
    async fn closed_transport_is_rejected() {
        let registry = SessionRegistry::new(4);
        let (tx, rx) = tokio::sync::mpsc::channel::<devmux_protocol::Response>(1);
        drop(rx);
        let stream = StreamHandle::new(StreamId(9), Arc::new(tx));
        assert_eq!(
            registry.attach("sess", "c1", &stream),
            Err(TransportError::Closed)
        );
        assert_eq!(registry.stream_count(), 0);
    }
}
