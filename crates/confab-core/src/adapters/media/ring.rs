//! Lock-free SPSC audio ring bridging the decode path and the
//! real-time render callback.
//!
//! One write/read cursor pair is shared by all channels of a stream;
//! each cursor is advanced only by its owner, except that a full ring
//! makes the producer advance the read cursor past the oldest unread
//! samples (bounded-latency policy — the producer never blocks).
//! Samples are stored as atomic bit-cast f32 so both sides stay free of
//! locks and undefined behavior; both operations complete in bounded
//! time regardless of the other side's progress.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct RingShared {
    /// Per-channel sample planes, each `capacity` long.
    planes: Vec<Box<[AtomicU32]>>,
    capacity: usize,
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
}

impl RingShared {
    fn available(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        (w + self.capacity - r) % self.capacity
    }
}

/// Create a ring holding `capacity` samples per channel. One usable slot
/// is reserved to distinguish full from empty.
pub fn audio_ring(channels: usize, capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(channels > 0, "ring needs at least one channel");
    assert!(capacity > 1, "ring capacity must exceed one sample");
    let planes = (0..channels)
        .map(|_| (0..capacity).map(|_| AtomicU32::new(0)).collect())
        .collect();
    let shared = Arc::new(RingShared {
        planes,
        capacity,
        write: CachePadded::new(AtomicUsize::new(0)),
        read: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Write side, owned by the decode path.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Append one block of planar samples. `channels[0]` stands in for
    /// any missing plane (mono fed into a stereo ring). When free space
    /// is short, the oldest unread samples are overwritten.
    pub fn push(&mut self, channels: &[&[f32]]) {
        let Some(first) = channels.first() else {
            return;
        };
        let capacity = self.shared.capacity;
        // More than the ring can hold: only the newest samples matter.
        let len = first.len().min(capacity - 1);
        let skip = first.len() - len;

        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Acquire);
        let used = (write + capacity - read) % capacity;
        let free = capacity - used - 1;
        if len > free {
            // Do not grow latency: move the read cursor past the excess.
            let need = len - free;
            self.shared
                .read
                .store((read + need) % capacity, Ordering::Release);
        }

        for (ch, plane) in self.shared.planes.iter().enumerate() {
            let src = channels.get(ch).copied().unwrap_or(first);
            let src = &src[skip.min(src.len().saturating_sub(len))..];
            for (i, &sample) in src.iter().take(len).enumerate() {
                plane[(write + i) % capacity].store(sample.to_bits(), Ordering::Relaxed);
            }
        }

        self.shared
            .write
            .store((write + len) % capacity, Ordering::Release);
    }

    /// Unread samples currently buffered.
    pub fn occupied(&self) -> usize {
        self.shared.available()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Read side, owned by the real-time render callback.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Fill `outputs` with exactly `samples` samples per channel.
    ///
    /// When fewer than `samples` are buffered the outputs are zeroed and
    /// the read cursor stays put — silence beats a partial, glitchy
    /// read. Returns `true` when real audio was delivered.
    pub fn pull_into(&mut self, outputs: &mut [&mut [f32]], samples: usize) -> bool {
        if self.shared.available() < samples {
            for out in outputs.iter_mut() {
                let n = samples.min(out.len());
                out[..n].fill(0.0);
            }
            return false;
        }

        let capacity = self.shared.capacity;
        let read = self.shared.read.load(Ordering::Relaxed);
        for (ch, out) in outputs.iter_mut().enumerate() {
            let plane = self
                .shared
                .planes
                .get(ch)
                .unwrap_or_else(|| &self.shared.planes[0]);
            for (i, slot) in out.iter_mut().take(samples).enumerate() {
                *slot = f32::from_bits(plane[(read + i) % capacity].load(Ordering::Relaxed));
            }
        }
        self.shared
            .read
            .store((read + samples) % capacity, Ordering::Release);
        true
    }

    /// Unread samples currently buffered.
    pub fn available(&self) -> usize {
        self.shared.available()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(consumer: &mut RingConsumer, channels: usize, n: usize) -> (bool, Vec<Vec<f32>>) {
        let mut bufs = vec![vec![9.9f32; n]; channels];
        let mut refs: Vec<&mut [f32]> = bufs.iter_mut().map(|b| b.as_mut_slice()).collect();
        let ok = consumer.pull_into(&mut refs, n);
        (ok, bufs)
    }

    #[test]
    fn fifo_exactness() {
        let (mut tx, mut rx) = audio_ring(2, 64);
        let left: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let right: Vec<f32> = (0..10).map(|i| -(i as f32)).collect();
        tx.push(&[&left, &right]);

        let (ok, out) = pull(&mut rx, 2, 10);
        assert!(ok);
        assert_eq!(out[0], left);
        assert_eq!(out[1], right);
    }

    #[test]
    fn partial_pull_preserves_order() {
        let (mut tx, mut rx) = audio_ring(1, 64);
        tx.push(&[&[1.0, 2.0, 3.0, 4.0, 5.0]]);

        let (ok, out) = pull(&mut rx, 1, 2);
        assert!(ok);
        assert_eq!(out[0], vec![1.0, 2.0]);

        let (ok, out) = pull(&mut rx, 1, 3);
        assert!(ok);
        assert_eq!(out[0], vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn shortfall_yields_silence_and_keeps_samples() {
        let (mut tx, mut rx) = audio_ring(1, 64);
        tx.push(&[&[1.0, 2.0, 3.0]]);

        // Ask for more than is buffered: silence, cursor untouched.
        let (ok, out) = pull(&mut rx, 1, 8);
        assert!(!ok);
        assert!(out[0].iter().all(|&s| s == 0.0));

        // The buffered samples are still there.
        let (ok, out) = pull(&mut rx, 1, 3);
        assert!(ok);
        assert_eq!(out[0], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        let (mut tx, mut rx) = audio_ring(1, 9); // 8 usable slots
        tx.push(&[&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]);
        tx.push(&[&[7.0, 8.0, 9.0, 10.0]]); // only 2 slots free

        // Oldest samples were overwritten; the newest 8 remain in order.
        assert_eq!(rx.available(), 8);
        let (ok, out) = pull(&mut rx, 1, 8);
        assert!(ok);
        assert_eq!(out[0], vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn wraparound_is_seamless() {
        let (mut tx, mut rx) = audio_ring(1, 8);
        for round in 0..10 {
            let base = round as f32 * 4.0;
            tx.push(&[&[base, base + 1.0, base + 2.0, base + 3.0]]);
            let (ok, out) = pull(&mut rx, 1, 4);
            assert!(ok, "round {round}");
            assert_eq!(out[0], vec![base, base + 1.0, base + 2.0, base + 3.0]);
        }
    }

    #[test]
    fn mono_input_feeds_all_channels() {
        let (mut tx, mut rx) = audio_ring(2, 32);
        tx.push(&[&[0.5, 0.25]]);
        let (ok, out) = pull(&mut rx, 2, 2);
        assert!(ok);
        assert_eq!(out[0], vec![0.5, 0.25]);
        assert_eq!(out[1], vec![0.5, 0.25]);
    }

    #[test]
    fn giant_push_keeps_only_newest() {
        let (mut tx, mut rx) = audio_ring(1, 5); // 4 usable
        let big: Vec<f32> = (0..100).map(|i| i as f32).collect();
        tx.push(&[&big]);
        assert_eq!(rx.available(), 4);
        let (ok, out) = pull(&mut rx, 1, 4);
        assert!(ok);
        assert_eq!(out[0], vec![96.0, 97.0, 98.0, 99.0]);
    }

    #[test]
    fn producer_and_consumer_run_from_different_threads() {
        let (mut tx, mut rx) = audio_ring(1, 4800);
        let writer = std::thread::spawn(move || {
            let block: Vec<f32> = (0..480).map(|i| (i % 7) as f32).collect();
            for _ in 0..100 {
                tx.push(&[&block]);
                std::thread::yield_now();
            }
        });
        let mut delivered = 0usize;
        for _ in 0..2000 {
            let (ok, _) = pull(&mut rx, 1, 480);
            if ok {
                delivered += 1;
            }
            std::thread::yield_now();
        }
        writer.join().unwrap();
        assert!(delivered > 0);
    }
}
