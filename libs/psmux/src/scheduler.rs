//! When to flush, and how much audio goes with each video group.
//!
//! Video is the scheduling master. Frames accumulate until the queue holds
//! a complete group (everything before the next I-frame); that group is then
//! written together with the audio covering the same span of time. At
//! finalize the remaining frames drain regardless of group boundaries.
//!
//! Within a flush, [`DecoderBuffer`] models each stream's decoder input
//! buffer so that no packet is sent before the decoder has room for it.

use std::collections::VecDeque;

use tracing::trace;

use crate::clock::ticks_to_secs;
use crate::queue::FrameQueue;

/// Flush state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    /// Nothing queued.
    #[default]
    Idle,
    /// Frames queued, group incomplete.
    Accumulating,
    /// A complete group is queued.
    ReadyToFlush,
    /// Finalizing, everything goes.
    Draining,
    Finalized,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    state: FlushState,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Re-evaluates the state after the video queue changed.
    pub fn observe(&mut self, video: &FrameQueue) {
        if matches!(self.state, FlushState::Draining | FlushState::Finalized) {
            return;
        }
        let next = if video.is_empty() {
            FlushState::Idle
        } else if video.next_group_boundary().is_some() {
            FlushState::ReadyToFlush
        } else {
            FlushState::Accumulating
        };
        if next != self.state {
            trace!(from = ?self.state, to = ?next, "flush state");
            self.state = next;
        }
    }

    pub fn begin_drain(&mut self) {
        self.state = FlushState::Draining;
    }

    pub fn finish(&mut self) {
        self.state = FlushState::Finalized;
    }

    /// Number of leading video frames that form the next flushable group.
    /// `timing_known` is false while the stream cannot be timestamped yet.
    pub fn flushable(&self, video: &FrameQueue, timing_known: bool) -> Option<usize> {
        match self.state {
            FlushState::ReadyToFlush if timing_known => video.next_group_boundary(),
            FlushState::Draining if !video.is_empty() => {
                Some(video.next_group_boundary().unwrap_or(video.len()))
            }
            _ => None,
        }
    }

    pub fn draining(&self) -> bool {
        self.state == FlushState::Draining
    }
}

/// Audio bytes granted to one flush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allowance {
    pub bytes: usize,
    compensate: f64,
}

/// Per audio stream byte budget. Keeps the long-run audio to video ratio on
/// the real bit rate ratio by carrying the rounding remainder over from one
/// flush to the next.
#[derive(Debug, Clone, Default)]
pub struct AudioBudget {
    compensate: f64,
}

impl AudioBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes carried over from previous flushes. Negative after borrowing.
    pub fn compensate(&self) -> f64 {
        self.compensate
    }

    /// Allowance for a group lasting `duration` ticks, in whole multiples of
    /// `unit`. Nothing changes until [`AudioBudget::commit`].
    pub fn allowance(&self, duration: u64, byterate: u32, unit: usize) -> Allowance {
        let ideal = ticks_to_secs(duration) * byterate as f64 + self.compensate;
        let unit = unit.max(1);
        let units = (ideal / unit as f64).floor().max(0.0) as usize;
        let bytes = units * unit;
        Allowance {
            bytes,
            compensate: ideal - bytes as f64,
        }
    }

    pub fn commit(&mut self, allowance: &Allowance) {
        self.compensate = allowance.compensate;
    }

    /// Records bytes written beyond the allowance to fill a packet.
    pub fn borrow(&mut self, bytes: usize) {
        self.compensate -= bytes as f64;
    }
}

/// Occupancy of one stream's decoder buffer.
///
/// A frame enters the buffer when its first byte is written and leaves it,
/// whole, when the SCR reaches its decode time. Bytes are counted as they
/// are written, so a frame decoded before all of its bytes arrived drives
/// the fill below zero: an underflow.
#[derive(Debug, Clone, Default)]
pub struct DecoderBuffer {
    capacity: usize,
    fill: i64,
    /// Decode time and size of every frame still in the buffer.
    frames: VecDeque<(u64, usize)>,
}

impl DecoderBuffer {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as usize,
            ..Self::default()
        }
    }

    pub fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity as usize;
    }

    /// Bytes currently buffered.
    pub fn fill(&self) -> usize {
        self.fill.max(0) as usize
    }

    /// Whether `bytes` more fit. An empty buffer takes anything.
    pub fn fits(&self, bytes: usize) -> bool {
        self.frames.is_empty() || self.fill() + bytes <= self.capacity
    }

    /// A frame of `size` bytes decoded at `dts` starts in the next packet.
    pub fn enter(&mut self, dts: u64, size: usize) {
        self.frames.push_back((dts, size));
    }

    pub fn add(&mut self, bytes: usize) {
        self.fill += bytes as i64;
    }

    /// Removes every frame decoded by `scr`. Returns true on underflow; the
    /// fill is then reset to empty.
    pub fn drain(&mut self, scr: u64) -> bool {
        while let Some(&(dts, size)) = self.frames.front() {
            if dts > scr {
                break;
            }
            self.fill -= size as i64;
            self.frames.pop_front();
        }
        if self.fill < 0 {
            self.fill = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CLOCK_HZ;
    use crate::queue::{Frame, FrameKind};

    fn queue(kinds: &[FrameKind]) -> FrameQueue {
        let mut q = FrameQueue::new();
        for kind in kinds {
            q.push(Frame::new(vec![0; 8], *kind, 1)).unwrap();
        }
        q
    }

    #[test]
    fn test_state_machine() {
        let mut s = Scheduler::new();
        assert_eq!(s.state(), FlushState::Idle);

        let q = queue(&[FrameKind::I, FrameKind::B]);
        s.observe(&q);
        assert_eq!(s.state(), FlushState::Accumulating);
        assert_eq!(s.flushable(&q, true), None);

        let q = queue(&[FrameKind::I, FrameKind::B, FrameKind::I]);
        s.observe(&q);
        assert_eq!(s.state(), FlushState::ReadyToFlush);
        assert_eq!(s.flushable(&q, true), Some(2));
        assert_eq!(s.flushable(&q, false), None);

        s.begin_drain();
        s.observe(&FrameQueue::new());
        assert_eq!(s.state(), FlushState::Draining);
        let q = queue(&[FrameKind::I, FrameKind::P]);
        assert_eq!(s.flushable(&q, false), Some(2));
        s.finish();
        assert_eq!(s.state(), FlushState::Finalized);
    }

    #[test]
    fn test_allowance_rounds_to_units() {
        let budget = AudioBudget::new();
        // 0.5 s at 4000 B/s = 2000 bytes, unit 300 -> 1800
        let a = budget.allowance(CLOCK_HZ / 2, 4000, 300);
        assert_eq!(a.bytes, 1800);
        assert!((a.compensate - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_compensation_tracks_ratio() {
        let mut budget = AudioBudget::new();
        let mut total = 0;
        for _ in 0..1000 {
            let a = budget.allowance(CLOCK_HZ / 25, 24_000, 2000);
            budget.commit(&a);
            total += a.bytes;
        }
        let ideal = 1000.0 * 24_000.0 / 25.0;
        assert!((ideal - total as f64).abs() < 2000.0);
    }

    #[test]
    fn test_borrow_reduces_next_allowance() {
        let mut budget = AudioBudget::new();
        let a = budget.allowance(CLOCK_HZ, 1000, 100);
        budget.commit(&a);
        budget.borrow(50);
        assert_eq!(budget.allowance(CLOCK_HZ, 1000, 100).bytes, 900);
    }

    #[test]
    fn test_decoder_buffer_fills_and_drains() {
        let mut buffer = DecoderBuffer::new(4096);
        assert!(buffer.fits(1 << 20));

        buffer.enter(100, 3000);
        buffer.add(2000);
        assert!(buffer.fits(2000));
        buffer.add(1000);
        buffer.enter(200, 3000);
        buffer.add(1000);
        assert_eq!(buffer.fill(), 4000);
        assert!(!buffer.fits(2000));

        // first frame decoded, the second is still arriving
        assert!(!buffer.drain(150));
        assert_eq!(buffer.fill(), 1000);
        assert!(buffer.fits(2000));
    }

    #[test]
    fn test_decoder_buffer_underflow() {
        let mut buffer = DecoderBuffer::new(4096);
        buffer.enter(100, 3000);
        buffer.add(1000);
        assert!(!buffer.drain(99));
        // decoded with 2000 bytes missing
        assert!(buffer.drain(100));
        assert_eq!(buffer.fill(), 0);
        assert!(buffer.fits(10_000));
    }
}
