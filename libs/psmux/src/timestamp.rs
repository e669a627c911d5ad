//! Decode and presentation timestamps on the 27 MHz clock.
//!
//! Video frames arrive in decode order. For MPEG-1/2 the presentation order
//! of a group is rebuilt from temporal references once the whole group is
//! queued; MPEG-4 frames are stamped on arrival from their VOP time
//! increments. Audio has no reordering and is stamped on arrival.

use tracing::{debug, warn};

use crate::clock::{CLOCK_HZ, ticks_to_secs};
use crate::codec::VopTime;
use crate::queue::Frame;

/// Spread of temporal references beyond which the set is taken to straddle
/// the 10 bit rollover.
pub const WRAP_SPREAD: i64 = 600;

/// Maps temporal references to a strictly ordered scale, unwrapping values
/// that rolled over from 1023 to 0 within the set.
pub fn unwrap_temporal_references(refs: &[u16]) -> Vec<i64> {
    let (Some(min), Some(max)) = (refs.iter().min(), refs.iter().max()) else {
        return Vec::new();
    };
    let wrapped = (*max as i64 - *min as i64) > WRAP_SPREAD;
    refs.iter()
        .map(|r| {
            let r = *r as i64;
            if wrapped && r < 512 { r + 1024 } else { r }
        })
        .collect()
}

/// Presentation offsets of a group: for each frame, the summed duration of
/// every frame displayed before it. Frames without a temporal reference keep
/// their arrival position.
pub fn presentation_offsets(refs: &[Option<u16>], durations: &[u64]) -> Vec<u64> {
    let known: Vec<u16> = refs.iter().flatten().copied().collect();
    let unwrapped = unwrap_temporal_references(&known);
    let mut it = unwrapped.into_iter();
    let keys: Vec<i64> = refs
        .iter()
        .enumerate()
        .map(|(i, r)| match r {
            Some(_) => it.next().unwrap_or(i as i64),
            None => i as i64,
        })
        .collect();

    let mut order: Vec<usize> = (0..refs.len()).collect();
    order.sort_by_key(|&i| (keys[i], i));

    let mut offsets = vec![0; refs.len()];
    let mut acc = 0;
    for i in order {
        offsets[i] = acc;
        acc += durations[i];
    }
    offsets
}

/// Timeline of an MPEG-1/2 video stream, advanced one group at a time.
#[derive(Debug, Clone)]
pub struct VideoClock {
    next_dts: u64,
    pts_base: u64,
    skew: Option<u64>,
}

/// Outcome of stamping one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTiming {
    /// This was the first group of the stream.
    pub first: bool,
    /// Skew added to presentation times, so far.
    pub skew: u64,
    /// Total duration of the group.
    pub duration: u64,
}

impl VideoClock {
    /// `anchor` is the decode time of the first frame.
    pub fn new(anchor: u64) -> Self {
        Self {
            next_dts: anchor,
            pts_base: anchor,
            skew: None,
        }
    }

    pub fn skew(&self) -> Option<u64> {
        self.skew
    }

    /// Advances the timeline without a frame (skipped picture).
    pub fn skip(&mut self, duration: u64) {
        self.next_dts += duration;
        self.pts_base += duration;
    }

    /// Stamps one group of frames given in decode order.
    pub fn assign_group(&mut self, frames: &mut [&mut Frame]) -> GroupTiming {
        let refs: Vec<Option<u16>> = frames.iter().map(|f| f.temporal_reference).collect();
        let durations: Vec<u64> = frames.iter().map(|f| f.duration).collect();
        let offsets = presentation_offsets(&refs, &durations);

        let mut dts = self.next_dts;
        let mut need = 0;
        for (frame, offset) in frames.iter_mut().zip(&offsets) {
            frame.dts = dts;
            let raw = self.pts_base + offset;
            need = need.max(dts.saturating_sub(raw));
            dts += frame.duration;
        }

        let first = self.skew.is_none();
        let skew = match self.skew {
            None => need,
            Some(skew) if need > skew => {
                warn!(
                    old = ticks_to_secs(skew),
                    new = ticks_to_secs(need),
                    "group reorders deeper than the first one, presentation delay raised"
                );
                need
            }
            Some(skew) => skew,
        };
        self.skew = Some(skew);

        for (frame, offset) in frames.iter_mut().zip(&offsets) {
            frame.pts = self.pts_base + offset + skew;
            frame.timestamped = true;
        }

        let duration: u64 = durations.iter().sum();
        self.next_dts += duration;
        self.pts_base += duration;
        debug!(
            frames = frames.len(),
            duration = ticks_to_secs(duration),
            skew = ticks_to_secs(skew),
            "video group timestamped"
        );
        GroupTiming {
            first,
            skew,
            duration,
        }
    }
}

/// Timeline of an MPEG-4 video stream.
#[derive(Debug, Clone)]
pub struct Mpeg4Clock {
    last_pts: i64,
    last_dts: i64,
    last_increment: Option<u32>,
    frame_duration: Option<u64>,
    nominal: u64,
}

impl Mpeg4Clock {
    pub fn new(anchor: u64, nominal: u64) -> Self {
        Self {
            last_pts: anchor as i64,
            last_dts: anchor as i64,
            last_increment: None,
            frame_duration: None,
            nominal,
        }
    }

    pub fn frame_duration(&self) -> Option<u64> {
        self.frame_duration
    }

    /// Signed tick distance between two VOP time increments, wrapping at
    /// half the resolution.
    pub fn increment_delta(last: u32, current: u32, resolution: u32) -> i64 {
        let res = resolution as i64;
        let mut delta = current as i64 - last as i64;
        if delta > res / 2 {
            delta -= res;
        } else if delta < -(res / 2) {
            delta += res;
        }
        delta * CLOCK_HZ as i64 / res
    }

    /// Stamps a newly arrived frame.
    pub fn stamp(&mut self, frame: &mut Frame, time: Option<VopTime>) {
        let delta = match (self.last_increment, time) {
            (Some(last), Some(t)) => Self::increment_delta(last, t.increment, t.resolution),
            (Some(_), None) => self.nominal as i64,
            (None, _) => 0,
        };
        if self.last_increment.is_some() {
            self.last_pts += delta;
            self.last_dts += self.frame_duration.unwrap_or(0) as i64;
        }
        if let Some(t) = time {
            self.last_increment = Some(t.increment);
        } else if self.last_increment.is_none() {
            self.last_increment = Some(0);
        }
        frame.pts = self.last_pts.max(0) as u64;
        frame.dts = self.last_dts.max(0) as u64;
        frame.timestamped = self.frame_duration.is_some();
    }

    /// Infers the frame duration from the first three frames and fixes their
    /// timestamps. Returns the duration once known.
    pub fn infer_duration(&mut self, first_three: &mut [&mut Frame]) -> Option<u64> {
        if self.frame_duration.is_some() || first_three.len() < 3 {
            return self.frame_duration;
        }
        let mut pts: Vec<u64> = first_three.iter().map(|f| f.pts).collect();
        pts.sort_unstable();
        let (mn, md, mx) = (pts[0], pts[1], pts[2]);
        let mut gap = (md - mn).min(mx - md);
        if gap == 0 {
            warn!(
                nominal = ticks_to_secs(self.nominal),
                "cannot infer MPEG-4 frame duration, using nominal frame rate"
            );
            gap = self.nominal;
        }
        for (i, frame) in first_three.iter_mut().enumerate() {
            frame.pts += gap;
            frame.dts += i as u64 * gap;
            frame.timestamped = true;
        }
        self.last_pts += gap as i64;
        self.last_dts = first_three[2].dts as i64;
        self.frame_duration = Some(gap);
        debug!(duration = ticks_to_secs(gap), "MPEG-4 frame duration inferred");
        Some(gap)
    }
}

/// Timeline of an audio stream.
#[derive(Debug, Clone)]
pub struct AudioClock {
    next_pts: u64,
    elapsed: u64,
    drop_window: u64,
}

impl AudioClock {
    /// Frames ending within `drop_window` of the stream start are discarded.
    pub fn new(anchor: u64, drop_window: u64) -> Self {
        Self {
            next_pts: anchor,
            elapsed: 0,
            drop_window,
        }
    }

    pub fn next_pts(&self) -> u64 {
        self.next_pts
    }

    /// Presentation time of a frame lasting `duration`, or `None` if the
    /// frame falls in the drop window.
    pub fn stamp(&mut self, duration: u64) -> Option<u64> {
        self.elapsed += duration;
        if self.elapsed <= self.drop_window {
            return None;
        }
        let pts = self.next_pts;
        self.next_pts += duration;
        Some(pts)
    }

    /// Delays every future frame by `offset`.
    pub fn shift(&mut self, offset: u64) {
        self.next_pts += offset;
    }
}
