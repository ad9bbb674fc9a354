//! Lock-free single-producer / single-consumer PCM ring buffer
//!
//! Carries decoded 16-bit samples from the decoder pump to the playback
//! consumer with no locks on the fast path. Two monotonically non-decreasing
//! 64-bit indices are kept: `head` is written only by the producer, `tail`
//! only by the consumer. Index arithmetic is modulo 2^64; only the low
//! `log2(capacity)` bits address the backing store, so wraparound is
//! harmless. One slot stays reserved so `head == tail` always means empty.

use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};

/// SPSC ring of interleaved i16 PCM samples. Capacity must be a power of two.
pub struct SpscRing {
    buf: Box<[AtomicI16]>,
    mask: u64,
    /// Producer-only writer; published with release semantics
    head: AtomicU64,
    /// Consumer-only writer; published with release semantics
    tail: AtomicU64,
}

impl SpscRing {
    /// Create a ring holding `capacity` samples. Panics unless `capacity`
    /// is a power of two of at least 2.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "ring capacity must be a power of two >= 2, got {capacity}"
        );
        let buf: Vec<AtomicI16> = (0..capacity).map(|_| AtomicI16::new(0)).collect();
        Self {
            buf: buf.into_boxed_slice(),
            mask: (capacity - 1) as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    /// Total sample capacity (one slot of which stays reserved)
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Samples currently readable. Callable from either side.
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    /// Samples currently writable. Callable from either side.
    pub fn free(&self) -> usize {
        self.capacity() - 1 - self.count()
    }

    /// Copy `samples` into the ring and publish the new head.
    ///
    /// Producer side only. Precondition: `free() >= samples.len()`; violating
    /// it is a programmer error (checked in debug builds).
    pub fn write(&self, samples: &[i16]) {
        debug_assert!(
            self.free() >= samples.len(),
            "ring overflow: free={} needed={}",
            self.free(),
            samples.len()
        );
        let head = self.head.load(Ordering::Acquire);

        // Two contiguous spans split across the wrap boundary
        let start = (head & self.mask) as usize;
        let first = samples.len().min(self.capacity() - start);
        for (i, &s) in samples[..first].iter().enumerate() {
            self.buf[start + i].store(s, Ordering::Relaxed);
        }
        for (i, &s) in samples[first..].iter().enumerate() {
            self.buf[i].store(s, Ordering::Relaxed);
        }

        self.head
            .store(head.wrapping_add(samples.len() as u64), Ordering::Release);
    }

    /// Copy samples out of the ring into `out` and publish the new tail.
    ///
    /// Consumer side only. Precondition: `count() >= out.len()`; violating it
    /// is a programmer error (checked in debug builds).
    pub fn read(&self, out: &mut [i16]) {
        debug_assert!(
            self.count() >= out.len(),
            "ring underflow: count={} needed={}",
            self.count(),
            out.len()
        );
        let tail = self.tail.load(Ordering::Acquire);

        let start = (tail & self.mask) as usize;
        let first = out.len().min(self.capacity() - start);
        for (i, slot) in out[..first].iter_mut().enumerate() {
            *slot = self.buf[start + i].load(Ordering::Relaxed);
        }
        let rest = out.len() - first;
        for (i, slot) in out[first..first + rest].iter_mut().enumerate() {
            *slot = self.buf[i].load(Ordering::Relaxed);
        }

        self.tail
            .store(tail.wrapping_add(out.len() as u64), Ordering::Release);
    }

    /// Drop every buffered sample by advancing tail to head.
    ///
    /// Consumer side only; used by stop/flush while the producer is
    /// quiescent or paused.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    /// Current head index (diagnostics and tests)
    pub fn head_index(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Current tail index (diagnostics and tests)
    pub fn tail_index(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }
}
