//! Pending frames of one elementary stream.

use std::collections::VecDeque;

use crate::error::MuxError;

/// Picture type of a queued frame. Audio frames are always `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    I,
    P,
    B,
    Unknown,
}

impl FrameKind {
    pub fn letter(&self) -> char {
        match self {
            FrameKind::I => 'I',
            FrameKind::P => 'P',
            FrameKind::B => 'B',
            FrameKind::Unknown => '-',
        }
    }
}

/// One encoded frame waiting to be packetized.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    /// Bytes already written to packets.
    cursor: usize,
    pub kind: FrameKind,
    /// Temporal reference (MPEG-1/2 video only).
    pub temporal_reference: Option<u16>,
    pub pts: u64,
    pub dts: u64,
    /// Ideal display duration in clock ticks.
    pub duration: u64,
    /// Whether `pts`/`dts` hold final values.
    pub timestamped: bool,
}

impl Frame {
    pub fn new(data: Vec<u8>, kind: FrameKind, duration: u64) -> Self {
        Self {
            data,
            cursor: 0,
            kind,
            temporal_reference: None,
            pts: 0,
            dts: 0,
            duration,
            timestamped: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// No byte of the frame has been written yet.
    pub fn untouched(&self) -> bool {
        self.cursor == 0
    }

    pub fn is_consumed(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Takes up to `max` unwritten bytes.
    pub fn take(&mut self, max: usize) -> &[u8] {
        let start = self.cursor;
        let end = (start + max).min(self.data.len());
        self.cursor = end;
        &self.data[start..end]
    }

    /// Appends bytes that belong to this frame (stray data between audio
    /// frames).
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), MuxError> {
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| MuxError::Allocation {
                what: "frame",
                bytes: bytes.len(),
            })?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Prepends bytes ahead of anything written so far.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), MuxError> {
        if !self.untouched() {
            return self.append(bytes);
        }
        let mut data = Vec::new();
        data.try_reserve(bytes.len() + self.data.len())
            .map_err(|_| MuxError::Allocation {
                what: "frame",
                bytes: bytes.len() + self.data.len(),
            })?;
        data.extend_from_slice(bytes);
        data.extend_from_slice(&self.data);
        self.data = data;
        Ok(())
    }
}

/// Arrival-ordered frames of one stream.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<Frame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), MuxError> {
        self.frames
            .try_reserve(1)
            .map_err(|_| MuxError::Allocation {
                what: "frame queue",
                bytes: std::mem::size_of::<Frame>(),
            })?;
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn front(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Frame> {
        self.frames.front_mut()
    }

    pub fn back_mut(&mut self) -> Option<&mut Frame> {
        self.frames.back_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Frame> {
        self.frames.iter_mut()
    }

    /// Unwritten bytes of the first `count` frames.
    pub fn pending_bytes(&self, count: usize) -> usize {
        self.frames.iter().take(count).map(Frame::remaining).sum()
    }

    /// Unwritten bytes of every queued frame.
    pub fn total_bytes(&self) -> usize {
        self.pending_bytes(self.frames.len())
    }

    /// Index of the first I-frame after position 0.
    pub fn next_group_boundary(&self) -> Option<usize> {
        self.frames
            .iter()
            .skip(1)
            .position(|f| f.kind == FrameKind::I)
            .map(|p| p + 1)
    }

    /// Drops fully written frames from the front, returning how many.
    pub fn pop_consumed(&mut self) -> usize {
        let mut n = 0;
        while self.frames.front().is_some_and(Frame::is_consumed) {
            self.frames.pop_front();
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, kind: FrameKind) -> Frame {
        Frame::new(vec![0xaa; len], kind, 1000)
    }

    #[test]
    fn test_take_splits_frame() {
        let mut f = frame(10, FrameKind::I);
        assert_eq!(f.take(4).len(), 4);
        assert!(!f.untouched());
        assert_eq!(f.remaining(), 6);
        assert_eq!(f.take(100).len(), 6);
        assert!(f.is_consumed());
        assert!(f.take(1).is_empty());
    }

    #[test]
    fn test_group_boundary() {
        let mut q = FrameQueue::new();
        for kind in [FrameKind::I, FrameKind::B, FrameKind::P, FrameKind::I, FrameKind::B] {
            q.push(frame(10, kind)).unwrap();
        }
        assert_eq!(q.next_group_boundary(), Some(3));
        assert_eq!(q.pending_bytes(3), 30);
        assert_eq!(q.total_bytes(), 50);
    }

    #[test]
    fn test_pop_consumed() {
        let mut q = FrameQueue::new();
        q.push(frame(4, FrameKind::I)).unwrap();
        q.push(frame(4, FrameKind::P)).unwrap();
        q.front_mut().unwrap().take(4);
        q.get_mut(1).unwrap().take(2);
        assert_eq!(q.pop_consumed(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_bytes(), 2);
    }

    #[test]
    fn test_prepend_and_append() {
        let mut f = Frame::new(vec![2, 3], FrameKind::Unknown, 0);
        f.prepend(&[1]).unwrap();
        f.append(&[4]).unwrap();
        assert_eq!(f.take(10), &[1, 2, 3, 4]);
    }
}
