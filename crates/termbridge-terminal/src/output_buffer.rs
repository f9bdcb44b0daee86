use bytes::Bytes;
use std::collections::VecDeque;

/// A chunk of PTY output tagged with its position in the session's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Monotonic per-session sequence number, starting at 1
    pub seq: u64,
    pub data: Bytes,
}

/// Bounded replay buffer of recent output.
///
/// Holds at most `max_bytes` bytes and `max_chunks` chunks; the oldest chunks
/// are evicted first. Sequence numbers keep counting across evictions so a
/// reader can tell exactly how much it missed.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    total_bytes: usize,
    max_bytes: usize,
    max_chunks: usize,
    next_seq: u64,
    evicted: u64,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            max_chunks: max_chunks.max(1),
            next_seq: 1,
            evicted: 0,
        }
    }

    /// Append a chunk and return it with its assigned sequence number
    pub fn push(&mut self, data: Bytes) -> OutputChunk {
        let chunk = OutputChunk {
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;
        self.total_bytes += chunk.data.len();
        self.chunks.push_back(chunk.clone());

        while self.total_bytes > self.max_bytes || self.chunks.len() > self.max_chunks {
            match self.chunks.pop_front() {
                Some(old) => {
                    self.total_bytes -= old.data.len();
                    self.evicted += 1;
                }
                None => break,
            }
        }

        chunk
    }

    /// Everything still buffered, oldest first
    pub fn replay(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Chunks newer than `after_seq`, plus how many chunks in between were
    /// already evicted and can no longer be recovered
    pub fn since(&self, after_seq: u64) -> (Vec<OutputChunk>, u64) {
        let chunks: Vec<OutputChunk> = self
            .chunks
            .iter()
            .filter(|c| c.seq > after_seq)
            .cloned()
            .collect();

        let first_available = self.chunks.front().map(|c| c.seq).unwrap_or(self.next_seq);
        let missed = first_available.saturating_sub(after_seq + 1);

        (chunks, missed)
    }

    /// Sequence number of the most recently pushed chunk (0 if none yet)
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn evicted_chunks(&self) -> u64 {
        self.evicted
    }
}

/// Holds back an incomplete trailing UTF-8 sequence so chunks never split a
/// character across frame boundaries
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the longest prefix of `pending + data` that does not end inside
    /// a multi-byte sequence. May be empty.
    pub fn push(&mut self, data: &[u8]) -> Bytes {
        self.pending.extend_from_slice(data);
        let split = incomplete_tail_start(&self.pending);
        let rest = self.pending.split_off(split);
        let complete = std::mem::replace(&mut self.pending, rest);
        Bytes::from(complete)
    }

    /// Release whatever is still held back (at process exit)
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.pending)))
        }
    }
}

fn incomplete_tail_start(buf: &[u8]) -> usize {
    let len = buf.len();
    let floor = len.saturating_sub(3);

    for i in (floor..len).rev() {
        let b = buf[i];
        if b & 0xC0 == 0x80 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if len - i < needed { i } else { len };
    }

    len
}
