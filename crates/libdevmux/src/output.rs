use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// One read from a session's PTY, stamped with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryChunk {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
}

impl HistoryChunk {
    pub fn timestamp_ms(&self) -> u64 {
        epoch_ms(self.timestamp)
    }
}

pub fn epoch_ms(time: SystemTime) -> u64 {
    u64::try_from(
        time.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Bounded per-session scrollback. Sequence numbers start at 1 and keep
/// increasing across evictions and clears.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<HistoryChunk>,
    max_chunks: usize,
    next_seq: u64,
}

impl ScrollbackBuffer {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.clamp(1, 1024)),
            max_chunks: max_chunks.max(1),
            next_seq: 1,
        }
    }

    pub fn push(&mut self, data: Vec<u8>) -> HistoryChunk {
        let chunk = HistoryChunk {
            sequence: self.next_seq,
            timestamp: SystemTime::now(),
            data,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.chunks.push_back(chunk.clone());
        while self.chunks.len() > self.max_chunks {
            let _ = self.chunks.pop_front();
        }
        chunk
    }

    /// Chunks with `sequence >= start_seq`, oldest first.
    pub fn replay_from(&self, start_seq: u64) -> Vec<HistoryChunk> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.sequence >= start_seq)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.chunks.front().map(|c| c.sequence)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
