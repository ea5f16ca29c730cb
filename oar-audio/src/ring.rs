//! Lock-free ring buffer for PCM samples.
//!
//! Single-producer single-consumer ring between the feeder/recording
//! threads and the real-time audio callback. The callback side never takes
//! a lock; underruns and overruns are tracked with atomic counters so the
//! non-real-time side can observe buffer health.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Lock-free SPSC ring of 16-bit PCM samples.
pub struct PcmRing {
    buffer: HeapRb<i16>,
    underruns: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
}

impl PcmRing {
    /// Create a ring holding `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        PcmRing {
            buffer: HeapRb::new(capacity),
            underruns: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Split into producer and consumer halves for use on two threads.
    pub fn split(self) -> (PcmProducer, PcmConsumer) {
        let (prod, cons) = self.buffer.split();
        let producer = PcmProducer {
            producer: prod,
            overruns: Arc::clone(&self.overruns),
        };
        let consumer = PcmConsumer {
            consumer: cons,
            underruns: Arc::clone(&self.underruns),
        };
        (producer, consumer)
    }
}

/// Producer half (feeder or capture callback side).
pub struct PcmProducer {
    producer: ringbuf::HeapProd<i16>,
    overruns: Arc<AtomicU64>,
}

impl PcmProducer {
    /// Push as many samples as fit; returns the number written.
    /// The caller decides whether to retry the remainder.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Push samples, dropping whatever does not fit (counted as overrun).
    /// Lock-free, safe for the capture callback.
    pub fn push_lossy(&mut self, samples: &[i16]) -> usize {
        let written = self.producer.push_slice(samples);
        if written < samples.len() {
            let count = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 0 {
                warn!("PCM ring buffer overrun (total: {})", count);
            }
        }
        written
    }

    /// Current number of queued samples
    pub fn occupied_len(&self) -> usize {
        self.producer.occupied_len()
    }

    /// Free space in samples
    pub fn vacant_len(&self) -> usize {
        self.producer.vacant_len()
    }

    /// Total capacity in samples
    pub fn capacity(&self) -> usize {
        self.producer.capacity().into()
    }

    /// Total overruns so far
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Consumer half (real-time playback callback or recording thread).
pub struct PcmConsumer {
    consumer: ringbuf::HeapCons<i16>,
    underruns: Arc<AtomicU64>,
}

impl PcmConsumer {
    /// Pop up to `out.len()` samples; returns the number read.
    pub fn pop_into(&mut self, out: &mut [i16]) -> usize {
        self.consumer.pop_slice(out)
    }

    /// Pop samples, zero-filling any shortfall (counted as underrun).
    /// Lock-free, safe for the real-time callback.
    pub fn pop_or_silence(&mut self, out: &mut [i16]) -> usize {
        let read = self.consumer.pop_slice(out);
        if read < out.len() {
            out[read..].fill(0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        read
    }

    /// Discard all queued samples
    pub fn clear(&mut self) {
        self.consumer.clear();
    }

    /// Current number of queued samples
    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Total underruns so far
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_round_trip() {
        let (mut prod, mut cons) = PcmRing::new(8).split();
        assert_eq!(prod.push(&[1, 2, 3]), 3);
        let mut out = [0i16; 3];
        assert_eq!(cons.pop_into(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(cons.pop_into(&mut out), 0);
    }

    #[test]
    fn test_partial_push_when_full() {
        let (mut prod, _cons) = PcmRing::new(4).split();
        assert_eq!(prod.push(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(prod.vacant_len(), 0);
    }

    #[test]
    fn test_lossy_push_counts_overrun() {
        let (mut prod, _cons) = PcmRing::new(2).split();
        assert_eq!(prod.push_lossy(&[1, 2, 3]), 2);
        assert_eq!(prod.overruns(), 1);
    }

    #[test]
    fn test_pop_or_silence_zero_fills() {
        let (mut prod, mut cons) = PcmRing::new(8).split();
        prod.push(&[5, 6]);
        let mut out = [9i16; 4];
        assert_eq!(cons.pop_or_silence(&mut out), 2);
        assert_eq!(out, [5, 6, 0, 0]);
        assert_eq!(cons.underruns(), 1);
    }
}
