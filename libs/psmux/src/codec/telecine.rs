//! Soft telecine: field-repeat flag cadences for frame rate conversion
//! without re-encoding.
//!
//! Each displayed frame receives a combination of `top_field_first` and
//! `repeat_first_field`. The cadence comes from an accumulator that adds the
//! field deficit of every frame and emits a repeated field whenever a whole
//! source-frame's worth has built up. Repeating a field also flips field
//! parity for the following frames.

use crate::clock::FrameRate;

/// `repeat_first_field` bit of the picture coding extension's fourth byte.
pub const RFF: u8 = 0x02;
/// `top_field_first` bit of the picture coding extension's fourth byte.
pub const TFF: u8 = 0x80;

const FLAG_TABLE: [u8; 4] = [0, RFF, TFF, TFF | RFF];

/// Longest cadence we are willing to precompute.
const MAX_PERIOD: usize = 1 << 18;

/// A precomputed flag cadence with a rotating phase.
///
/// The phase is never reset: it keeps counting across GOP boundaries and
/// stream discontinuities so the field cadence stays continuous. A picture
/// takes the flags at the current phase; its display step then moves the
/// phase for the next one.
#[derive(Debug, Clone)]
pub struct TelecinePattern {
    flags: Vec<u8>,
    phase: usize,
    target: FrameRate,
}

impl TelecinePattern {
    /// Builds the cadence converting `source` to `target`. Returns `None` if
    /// the conversion needs no repeated fields or has no finite period.
    pub fn new(source: FrameRate, target: FrameRate) -> Option<Self> {
        let mut src = source.scaled_1001();
        let mut dst = target.scaled_1001();
        if src == 0 || dst <= src {
            return None;
        }
        if src % 2 == 1 || dst % 2 == 1 {
            src *= 2;
            dst *= 2;
        }

        let step = (dst - src) * 2;
        let start = src / 2;
        let mut acc = start;
        let mut parity = 0usize;
        let mut flags = Vec::new();
        loop {
            acc += step;
            if acc >= src {
                acc -= src;
                flags.push(FLAG_TABLE[parity + 1]);
                parity ^= 2;
            } else {
                flags.push(FLAG_TABLE[parity]);
            }
            if acc == start && parity == 0 {
                break;
            }
            if flags.len() >= MAX_PERIOD {
                return None;
            }
        }

        Some(Self {
            flags,
            phase: 0,
            target,
        })
    }

    /// 3:2 pulldown from film to NTSC video.
    pub fn pulldown32(source: FrameRate) -> Option<Self> {
        Self::new(source, FrameRate::new(30000, 1001))
    }

    /// Film to PAL speed-up using repeated fields.
    pub fn film_to_pal(source: FrameRate) -> Option<Self> {
        Self::new(source, FrameRate::new(25, 1))
    }

    pub fn target(&self) -> FrameRate {
        self.target
    }

    pub fn period(&self) -> usize {
        self.flags.len()
    }

    pub fn flags(&self) -> &[u8] {
        &self.flags
    }

    /// Returns the flags at the current phase, then moves the phase by
    /// `step` display positions (negative for pictures displayed before
    /// their predecessor in decode order).
    pub fn advance(&mut self, step: i64) -> u8 {
        let flags = self.flags[self.phase];
        let period = self.flags.len() as i64;
        self.phase = (self.phase as i64 + step).rem_euclid(period) as usize;
        flags
    }

    pub fn phase(&self) -> usize {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(flags: &[u8]) -> usize {
        flags.iter().map(|f| if f & RFF != 0 { 3 } else { 2 }).sum()
    }

    #[test]
    fn test_pulldown32_cadence() {
        let p = TelecinePattern::pulldown32(FrameRate::new(24000, 1001)).unwrap();
        assert_eq!(p.period(), 4);
        assert_eq!(p.flags(), &[RFF, TFF, TFF | RFF, 0]);
        // four film frames become ten fields
        assert_eq!(fields(p.flags()), 10);
        assert_eq!(p.target().code(), Some(4));
    }

    #[test]
    fn test_film_to_pal_cadence() {
        let p = TelecinePattern::film_to_pal(FrameRate::new(24, 1)).unwrap();
        // one repeated field every 12 frames, parity flips so the full
        // cycle spans 24 frames
        assert_eq!(p.period(), 24);
        let repeats = p.flags()[..12].iter().filter(|f| *f & RFF != 0).count();
        assert_eq!(repeats, 1);
        assert_eq!(fields(p.flags()), 50);
    }

    #[test]
    fn test_phase_rotates_without_reset() {
        let mut p = TelecinePattern::pulldown32(FrameRate::new(24000, 1001)).unwrap();
        let seen: Vec<u8> = (0..6).map(|_| p.advance(1)).collect();
        assert_eq!(seen, vec![RFF, TFF, TFF | RFF, 0, RFF, TFF]);
        assert_eq!(p.phase(), 2);
        assert_eq!(p.advance(3), TFF | RFF);
        assert_eq!(p.phase(), 1);
    }

    #[test]
    fn test_flags_read_before_the_step() {
        // decode order I0 P3 B1 B2 steps 1, 3, -2, 1: each picture takes
        // the flags where the previous step left the phase
        let mut p = TelecinePattern::pulldown32(FrameRate::new(24000, 1001)).unwrap();
        let flags: Vec<u8> = [1, 3, -2, 1].iter().map(|d| p.advance(*d)).collect();
        assert_eq!(flags, vec![RFF, TFF, RFF, TFF | RFF]);
        assert_eq!(p.phase(), 3);
    }

    #[test]
    fn test_no_pattern_when_rates_do_not_increase() {
        assert!(TelecinePattern::new(FrameRate::new(25, 1), FrameRate::new(25, 1)).is_none());
        assert!(TelecinePattern::new(FrameRate::new(30, 1), FrameRate::new(25, 1)).is_none());
    }
}
