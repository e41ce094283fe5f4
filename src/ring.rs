//! Lock-free single-producer/single-consumer stereo frame ring.
//!
//! The mixing thread owns the [`FrameProducer`]; the device callback owns the
//! [`FrameConsumer`]. Each side is the sole writer of its own cursor, so plain
//! acquire/release loads and stores are enough and no CAS is needed. Frames are
//! stored as the two `f32` bit patterns packed into one `AtomicU64`, which keeps the
//! whole structure free of `unsafe`.
//!
//! The backing store is a power of two in size and one slot is always left empty,
//! so a ring built with `frame_ring(128)` holds at most 127 frames.

use crate::error::{CitySonicError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
struct Shared {
    slots: Box<[AtomicU64]>,
    mask: usize,
    write: AtomicUsize,
    read: AtomicUsize,
    underruns: AtomicU64,
    frames_read: AtomicU64,
    frames_written: AtomicU64,
}

impl Shared {
    fn size(&self) -> usize {
        self.mask + 1
    }

    fn available(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        w.wrapping_sub(r) & self.mask
    }
}

#[inline]
fn pack(left: f32, right: f32) -> u64 {
    ((left.to_bits() as u64) << 32) | right.to_bits() as u64
}

#[inline]
fn unpack(bits: u64) -> (f32, f32) {
    (f32::from_bits((bits >> 32) as u32), f32::from_bits(bits as u32))
}

/// Create a ring with room for at least `requested_frames - 1` frames.
///
/// The size is rounded up to the next power of two.
///
/// # Errors
///
/// `Configuration` when fewer than two frames are requested, `AllocationFailure`
/// when the backing store cannot be reserved.
pub fn frame_ring(requested_frames: usize) -> Result<(FrameProducer, FrameConsumer)> {
    if requested_frames < 2 {
        return Err(CitySonicError::Configuration(format!(
            "ring capacity must be at least 2 frames, got {}",
            requested_frames
        )));
    }
    let size = requested_frames.checked_next_power_of_two().ok_or_else(|| {
        CitySonicError::AllocationFailure(format!("ring of {} frames", requested_frames))
    })?;

    let mut slots = Vec::new();
    slots.try_reserve_exact(size)?;
    slots.extend((0..size).map(|_| AtomicU64::new(pack(0.0, 0.0))));

    let shared = Arc::new(Shared {
        slots: slots.into_boxed_slice(),
        mask: size - 1,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
        underruns: AtomicU64::new(0),
        frames_read: AtomicU64::new(0),
        frames_written: AtomicU64::new(0),
    });

    log::debug!("Frame ring created ({} slots, {} usable)", size, size - 1);

    Ok((
        FrameProducer {
            shared: shared.clone(),
        },
        FrameConsumer { shared },
    ))
}

/// Write side of the ring. Owned by the mixing thread.
#[derive(Debug)]
pub struct FrameProducer {
    shared: Arc<Shared>,
}

impl FrameProducer {
    /// Frames that can be written without truncation.
    pub fn free_frames(&self) -> usize {
        self.shared.mask - self.shared.available()
    }

    /// Maximum number of frames the ring can hold.
    pub fn capacity(&self) -> usize {
        self.shared.mask
    }

    /// Push planar stereo frames. Writes `min(left.len(), right.len(), free)` frames
    /// and returns how many were accepted.
    pub fn write(&mut self, left: &[f32], right: &[f32]) -> usize {
        let shared = &*self.shared;
        let w = shared.write.load(Ordering::Relaxed);
        let r = shared.read.load(Ordering::Acquire);
        let free = shared.mask - (w.wrapping_sub(r) & shared.mask);
        let count = left.len().min(right.len()).min(free);

        for (i, (&l, &rt)) in left.iter().zip(right).take(count).enumerate() {
            shared.slots[(w + i) & shared.mask].store(pack(l, rt), Ordering::Relaxed);
        }

        shared
            .write
            .store((w + count) & shared.mask, Ordering::Release);
        shared
            .frames_written
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Read side of the ring. Owned by the real-time device callback.
///
/// Never blocks and never allocates.
#[derive(Debug)]
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

impl FrameConsumer {
    pub fn available(&self) -> usize {
        self.shared.available()
    }

    /// Pop frames into planar buffers.
    ///
    /// Fills `min(left.len(), right.len())` frames. Frames past the available data are
    /// silence and the underrun counter is bumped once for the short read. Returns the
    /// number of frames that carried real data.
    pub fn read(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        let wanted = left.len().min(right.len());
        let shared = &*self.shared;
        let r = shared.read.load(Ordering::Relaxed);
        let w = shared.write.load(Ordering::Acquire);
        let count = (w.wrapping_sub(r) & shared.mask).min(wanted);

        for i in 0..count {
            let (l, rt) = unpack(shared.slots[(r + i) & shared.mask].load(Ordering::Relaxed));
            left[i] = l;
            right[i] = rt;
        }
        shared.read.store((r + count) & shared.mask, Ordering::Release);

        self.finish_read(count, wanted);
        left[count..wanted].fill(0.0);
        right[count..wanted].fill(0.0);
        count
    }

    /// Pop frames straight into an interleaved device buffer.
    ///
    /// Channel 0 receives left and channel 1 right; extra channels are silent. A mono
    /// device receives the average of both. Returns the number of real frames.
    pub fn read_interleaved(&mut self, out: &mut [f32], channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        let wanted = out.len() / channels;
        let shared = &*self.shared;
        let r = shared.read.load(Ordering::Relaxed);
        let w = shared.write.load(Ordering::Acquire);
        let count = (w.wrapping_sub(r) & shared.mask).min(wanted);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let (l, rt) = if i < count {
                unpack(shared.slots[(r + i) & shared.mask].load(Ordering::Relaxed))
            } else {
                (0.0, 0.0)
            };
            if channels == 1 {
                frame[0] = 0.5 * (l + rt);
            } else {
                frame[0] = l;
                frame[1] = rt;
                frame[2..].fill(0.0);
            }
        }
        out[wanted * channels..].fill(0.0);
        shared.read.store((r + count) & shared.mask, Ordering::Release);

        self.finish_read(count, wanted);
        count
    }

    fn finish_read(&self, count: usize, wanted: usize) {
        self.shared
            .frames_read
            .fetch_add(count as u64, Ordering::Relaxed);
        if count < wanted {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view of ring statistics, shareable with any thread.
#[derive(Debug, Clone)]
pub struct RingMonitor {
    shared: Arc<Shared>,
}

impl RingMonitor {
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Frames handed to the device that carried real data.
    pub fn frames_read(&self) -> u64 {
        self.shared.frames_read.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.size() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, offset: f32) -> Vec<f32> {
        (0..n).map(|i| offset + i as f32).collect()
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let (producer, _consumer) = frame_ring(100).unwrap();
        assert_eq!(producer.capacity(), 127);
        let (producer, _consumer) = frame_ring(128).unwrap();
        assert_eq!(producer.capacity(), 127);
        assert!(frame_ring(1).is_err());
    }

    #[test]
    fn test_fifo_order() {
        let (mut producer, mut consumer) = frame_ring(64).unwrap();
        let left = ramp(40, 0.0);
        let right = ramp(40, 1000.0);
        assert_eq!(producer.write(&left, &right), 40);

        let mut out_l = vec![0.0; 40];
        let mut out_r = vec![0.0; 40];
        assert_eq!(consumer.read(&mut out_l, &mut out_r), 40);
        assert_eq!(out_l, left);
        assert_eq!(out_r, right);
        assert_eq!(consumer.monitor().underruns(), 0);
    }

    #[test]
    fn test_write_truncates_to_free_space() {
        let (mut producer, consumer) = frame_ring(16).unwrap();
        let data = ramp(20, 0.0);
        assert_eq!(producer.write(&data, &data), 15);
        assert_eq!(producer.free_frames(), 0);
        assert_eq!(producer.write(&data, &data), 0);
        assert_eq!(consumer.available(), 15);
    }

    #[test]
    fn test_short_read_fills_silence_and_counts_underrun() {
        let (mut producer, mut consumer) = frame_ring(128).unwrap();
        let data = vec![0.5; 100];
        assert_eq!(producer.write(&data, &data), 100);

        let mut left = vec![1.0; 150];
        let mut right = vec![1.0; 150];
        assert_eq!(consumer.read(&mut left, &mut right), 100);
        assert!(left[..100].iter().all(|&s| s == 0.5));
        assert!(left[100..].iter().all(|&s| s == 0.0));
        assert!(right[100..].iter().all(|&s| s == 0.0));
        assert_eq!(consumer.monitor().underruns(), 1);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = frame_ring(8).unwrap();
        let mut out_l = vec![0.0; 5];
        let mut out_r = vec![0.0; 5];
        for round in 0..10 {
            let l = ramp(5, round as f32 * 10.0);
            assert_eq!(producer.write(&l, &l), 5);
            assert_eq!(consumer.read(&mut out_l, &mut out_r), 5);
            assert_eq!(out_l, l);
        }
        assert_eq!(consumer.monitor().frames_read(), 50);
    }

    #[test]
    fn test_read_interleaved_stereo_and_mono() {
        let (mut producer, mut consumer) = frame_ring(16).unwrap();
        producer.write(&[1.0, 0.2], &[-1.0, 0.4]);

        let mut out = vec![9.0; 6];
        assert_eq!(consumer.read_interleaved(&mut out, 2), 2);
        assert_eq!(out, vec![1.0, -1.0, 0.2, 0.4, 0.0, 0.0]);
        assert_eq!(consumer.monitor().underruns(), 1);

        producer.write(&[0.2], &[0.4]);
        let mut mono = vec![9.0; 1];
        assert_eq!(consumer.read_interleaved(&mut mono, 1), 1);
        assert!((mono[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_cross_thread_transfer() {
        let (mut producer, mut consumer) = frame_ring(256).unwrap();
        let total = 10_000usize;

        let writer = std::thread::spawn(move || {
            let mut next = 0usize;
            while next < total {
                let end = (next + 37).min(total);
                let chunk: Vec<f32> = (next..end).map(|i| i as f32).collect();
                next += producer.write(&chunk, &chunk);
                std::thread::yield_now();
            }
        });

        let mut received = Vec::with_capacity(total);
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        while received.len() < total {
            let n = consumer.read(&mut l, &mut r);
            received.extend_from_slice(&l[..n]);
            std::thread::yield_now();
        }
        writer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, &s)| s == i as f32));
    }
}
