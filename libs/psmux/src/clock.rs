//! The 27 MHz system clock and conversions to the units used on the wire.
//!
//! Every timestamp inside the muxer is a `u64` count of 27 MHz ticks. PTS/DTS
//! fields carry ticks / 300 (90 kHz); the SCR carries both parts.

/// System clock frequency.
pub const CLOCK_HZ: u64 = 27_000_000;

/// Ticks per 90 kHz PTS unit.
pub const TICKS_PER_PTS_UNIT: u64 = 300;

/// Ticks per millisecond.
pub const TICKS_PER_MS: u64 = CLOCK_HZ / 1000;

/// Maximum distance the SCR may trail the next decode time (0.7 s).
pub const MAX_DECODER_LEAD: u64 = 63_000 * TICKS_PER_PTS_UNIT;

/// Longest allowed gap between two written video timestamps (0.4 s).
pub const MAX_TIMESTAMP_GAP: u64 = 36_000 * TICKS_PER_PTS_UNIT;

/// Converts milliseconds to ticks.
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * TICKS_PER_MS
}

/// Converts ticks to (fractional) seconds, for reporting.
pub fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / CLOCK_HZ as f64
}

/// Converts a seconds value to ticks, rounding to the nearest tick.
pub fn secs_to_ticks(secs: f64) -> u64 {
    (secs * CLOCK_HZ as f64).round().max(0.0) as u64
}

/// Duration of `samples` audio samples at `sample_rate`.
pub fn sample_duration(samples: u32, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    CLOCK_HZ * samples as u64 / sample_rate as u64
}

/// Frame rate as an exact fraction (e.g. `30000/1001`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

/// MPEG-1/2 `frame_rate_code` values 1..=8.
const FRAME_RATES: [(u8, FrameRate); 8] = [
    (1, FrameRate::new(24000, 1001)),
    (2, FrameRate::new(24, 1)),
    (3, FrameRate::new(25, 1)),
    (4, FrameRate::new(30000, 1001)),
    (5, FrameRate::new(30, 1)),
    (6, FrameRate::new(50, 1)),
    (7, FrameRate::new(60000, 1001)),
    (8, FrameRate::new(60, 1)),
];

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Approximates a floating point rate, snapping to the NTSC fractions.
    pub fn from_fps(fps: f64) -> Self {
        let scaled = (fps * 1001.0).round() as u32;
        if scaled % 1000 == 0 {
            return Self::new(scaled, 1001);
        }
        let whole = fps.round();
        if (fps - whole).abs() < 1e-6 {
            return Self::new(whole as u32, 1);
        }
        Self::new((fps * 1000.0).round() as u32, 1000)
    }

    pub fn from_code(code: u8) -> Option<Self> {
        FRAME_RATES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, rate)| *rate)
    }

    /// The sequence header code for this rate, if it is one of the eight
    /// standard rates.
    pub fn code(&self) -> Option<u8> {
        let scaled = self.scaled_1001();
        FRAME_RATES
            .iter()
            .find(|(_, rate)| rate.scaled_1001() == scaled)
            .map(|(c, _)| *c)
    }

    /// `round(fps * 1001)`: 24000 for film, 25025 for PAL, 30000 for NTSC.
    pub fn scaled_1001(&self) -> u64 {
        if self.den == 0 {
            return 0;
        }
        (self.num as u64 * 1001 + self.den as u64 / 2) / self.den as u64
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Ticks per frame.
    pub fn frame_duration(&self) -> u64 {
        if self.num == 0 {
            return 0;
        }
        CLOCK_HZ * self.den as u64 / self.num as u64
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl std::str::FromStr for FrameRate {
    type Err = String;

    /// Accepts `25`, `29.97` or `30000/1001`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((n, d)) = s.split_once('/') {
            let num = n.trim().parse().map_err(|_| format!("bad numerator in {s:?}"))?;
            let den: u32 = d.trim().parse().map_err(|_| format!("bad denominator in {s:?}"))?;
            if den == 0 {
                return Err(format!("zero denominator in {s:?}"));
            }
            return Ok(Self::new(num, den));
        }
        let fps: f64 = s.trim().parse().map_err(|_| format!("bad frame rate {s:?}"))?;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(format!("bad frame rate {s:?}"));
        }
        Ok(Self::from_fps(fps))
    }
}
