//! Fixed-capacity chunked ring buffer for captured audio frames.
//!
//! One buffer per transmitted direction. The capture path writes one
//! wire-encoded 20 ms chunk at a time; the transport reads one chunk per
//! writable pass. Writes and reads are atomic at chunk granularity: a
//! write either copies the whole chunk or fails `BufferError::Full`
//! without partial effect.
//!
//! Each buffer carries a logical media clock that advances by exactly
//! 20 000 µs per chunk written (generated time) and per chunk read (send
//! time). The clock deliberately ignores socket stalls; it feeds the
//! `timestamp` field of media messages as microseconds since stream start.

use std::collections::VecDeque;

use parking_lot::{Mutex, MutexGuard};

use crate::errors::BufferError;

/// Media clock advance per 20 ms chunk, in microseconds.
pub const FRAME_STEP_MICROS: u64 = 20_000;

/// Outcome of a successful chunk write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
    /// Fill milestone crossed by this write, if any: 1 for 30 %, 2 for
    /// 60 %, 3 for 90 % of capacity. Each milestone reports once.
    pub degraded_milestone: Option<u32>,
}

/// One chunk handed to the transport, with its media-clock stamp.
#[derive(Debug, Clone)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    /// Send-side media clock after this chunk, µs since stream start
    pub timestamp_micros: u64,
    /// 1-based transmitted chunk count including this chunk
    pub chunk_index: u64,
}

struct RingInner {
    data: VecDeque<u8>,
    generated_time_micros: u64,
    last_send_time_micros: u64,
    generated_chunks: u64,
    transmitted_chunks: u64,
    /// Next degradation milestone to report; thresholds are
    /// `capacity * milestone * 0.3`
    degradation_milestone: u32,
}

/// Thread-safe chunk ring shared by one producer and one consumer.
pub struct RingFrameBuffer {
    chunk_size: usize,
    capacity: usize,
    inner: Mutex<RingInner>,
}

impl RingFrameBuffer {
    /// Create a ring holding up to `capacity` bytes of `chunk_size`-byte
    /// frames.
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            chunk_size,
            capacity,
            inner: Mutex::new(RingInner {
                data: VecDeque::with_capacity(capacity.min(chunk_size * 64)),
                generated_time_micros: 0,
                last_send_time_micros: 0,
                generated_chunks: 0,
                transmitted_chunks: 0,
                degradation_milestone: 1,
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the buffer without blocking; `None` when contended.
    pub fn try_lock(&self) -> Option<RingGuard<'_>> {
        self.inner.try_lock().map(|guard| RingGuard {
            guard,
            chunk_size: self.chunk_size,
            capacity: self.capacity,
        })
    }

    /// Acquire the buffer, blocking briefly if contended.
    pub fn lock(&self) -> RingGuard<'_> {
        RingGuard {
            guard: self.inner.lock(),
            chunk_size: self.chunk_size,
            capacity: self.capacity,
        }
    }

    /// Whether at least one full chunk is buffered.
    pub fn has_data(&self) -> bool {
        self.inner.lock().data.len() >= self.chunk_size
    }
}

/// Exclusive access to the ring state.
pub struct RingGuard<'a> {
    guard: MutexGuard<'a, RingInner>,
    chunk_size: usize,
    capacity: usize,
}

impl RingGuard<'_> {
    /// Bytes currently buffered.
    pub fn in_use(&self) -> usize {
        self.guard.data.len()
    }

    /// Whether at least one full chunk is buffered.
    pub fn has_chunk(&self) -> bool {
        self.guard.data.len() >= self.chunk_size
    }

    pub fn generated_chunks(&self) -> u64 {
        self.guard.generated_chunks
    }

    pub fn transmitted_chunks(&self) -> u64 {
        self.guard.transmitted_chunks
    }

    /// Copy exactly one chunk in. Fails without partial write when the
    /// remaining capacity is smaller than the chunk.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<WriteOutcome, BufferError> {
        debug_assert_eq!(chunk.len(), self.chunk_size);
        let inner = &mut *self.guard;
        if self.capacity - inner.data.len() < chunk.len() {
            return Err(BufferError::Full);
        }
        inner.data.extend(chunk);
        inner.generated_time_micros += FRAME_STEP_MICROS;
        inner.generated_chunks += 1;

        let mut outcome = WriteOutcome::default();
        let threshold =
            (self.capacity as f64 * inner.degradation_milestone as f64 * 0.3) as usize;
        if inner.data.len() > threshold {
            outcome.degraded_milestone = Some(inner.degradation_milestone);
            inner.degradation_milestone += 1;
        }
        Ok(outcome)
    }

    /// Remove exactly one chunk, advancing the send-side media clock by
    /// one step.
    pub fn read_chunk(&mut self) -> Result<ReadChunk, BufferError> {
        let inner = &mut *self.guard;
        if inner.data.len() < self.chunk_size {
            return Err(BufferError::Empty);
        }
        let data: Vec<u8> = inner.data.drain(..self.chunk_size).collect();
        inner.last_send_time_micros += FRAME_STEP_MICROS;
        inner.transmitted_chunks += 1;
        Ok(ReadChunk {
            data,
            timestamp_micros: inner.last_send_time_micros,
            chunk_index: inner.transmitted_chunks,
        })
    }
}
