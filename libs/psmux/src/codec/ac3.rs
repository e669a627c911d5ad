//! AC-3 (ATSC A/52) sync frames.

use crate::codec::{AudioFraming, AudioFrameInfo};
use crate::error::ParseError;

/// Samples per AC-3 sync frame.
pub const SAMPLES_PER_FRAME: u32 = 1536;

const BITRATES_KBPS: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

const CHANNELS: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Frame length in bytes for a `fscod`/`frmsizecod` pair.
pub fn frame_len(fscod: u8, frmsizecod: u8) -> Option<usize> {
    let kbps = *BITRATES_KBPS.get((frmsizecod >> 1) as usize)?;
    let words = match fscod {
        0 => 2 * kbps,
        // 44.1 kHz frames alternate between two sizes
        1 => kbps * 320 / 147 + (frmsizecod & 1) as u32,
        2 => 3 * kbps,
        _ => return None,
    };
    Some(words as usize * 2)
}

/// Framing for AC-3 bitstreams (bsid up to 10).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ac3Framing;

impl AudioFraming for Ac3Framing {
    const HEADER_LEN: usize = 7;
    // 640 kbit/s at 32 kHz
    const MAX_FRAME_LEN: usize = 3840;

    fn is_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0x0b && data[1] == 0x77
    }

    fn parse(&self, data: &[u8]) -> Result<AudioFrameInfo, ParseError> {
        if data.len() < Self::HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        if !Self::is_sync(data) {
            return Err(ParseError::InvalidHeader("ac3 sync"));
        }
        let fscod = data[4] >> 6;
        let frmsizecod = data[4] & 0x3f;
        let bsid = data[5] >> 3;
        if bsid > 10 {
            return Err(ParseError::InvalidHeader("ac3 bsid"));
        }
        let sample_rate = match fscod {
            0 => 48_000,
            1 => 44_100,
            2 => 32_000,
            _ => return Err(ParseError::InvalidHeader("ac3 fscod")),
        };
        let frame_len = frame_len(fscod, frmsizecod).ok_or(ParseError::InvalidHeader("ac3 frmsizecod"))?;
        Ok(AudioFrameInfo {
            frame_len,
            samples: SAMPLES_PER_FRAME,
            sample_rate,
            bitrate: BITRATES_KBPS[(frmsizecod >> 1) as usize] * 1000,
            channels: CHANNELS[(data[6] >> 5) as usize],
        })
    }
}
