//! MPEG-1/2 audio layers I, II and III frame headers.

use crate::codec::{AudioFraming, AudioFrameInfo};
use crate::error::ParseError;

/// Bit rates in kbit/s, indexed by `[lsf][layer - 1][bitrate_index]`.
const BITRATES: [[[u16; 15]; 3]; 2] = [
    [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    ],
    [
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    ],
];

const SAMPLE_RATES: [[u32; 3]; 2] = [[44_100, 48_000, 32_000], [22_050, 24_000, 16_000]];

/// Header fields of an MPEG audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpaHeader {
    /// MPEG-2 low sampling frequency extension.
    pub lsf: bool,
    pub layer: u8,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u8,
}

impl MpaHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 4 {
            return Err(ParseError::Truncated);
        }
        if data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
            return Err(ParseError::InvalidHeader("mpeg audio sync"));
        }
        let lsf = data[1] & 0x08 == 0;
        let layer = match (data[1] >> 1) & 0x03 {
            3 => 1,
            2 => 2,
            1 => 3,
            _ => return Err(ParseError::InvalidHeader("mpeg audio layer")),
        };
        let bitrate_index = (data[2] >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return Err(ParseError::InvalidHeader("mpeg audio bitrate_index"));
        }
        let rate_index = ((data[2] >> 2) & 0x03) as usize;
        if rate_index == 3 {
            return Err(ParseError::InvalidHeader("mpeg audio sampling_frequency"));
        }
        Ok(Self {
            lsf,
            layer,
            bitrate_kbps: BITRATES[lsf as usize][layer as usize - 1][bitrate_index] as u32,
            sample_rate: SAMPLE_RATES[lsf as usize][rate_index],
            padding: data[2] & 0x02 != 0,
            channels: if data[3] >> 6 == 3 { 1 } else { 2 },
        })
    }

    pub fn samples(&self) -> u32 {
        match (self.layer, self.lsf) {
            (1, _) => 384,
            (3, true) => 576,
            _ => 1152,
        }
    }

    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate_kbps * 1000;
        let pad = self.padding as u32;
        let len = match (self.layer, self.lsf) {
            (1, _) => (12 * bitrate / self.sample_rate + pad) * 4,
            (3, true) => 72 * bitrate / self.sample_rate + pad,
            _ => 144 * bitrate / self.sample_rate + pad,
        };
        len as usize
    }
}

/// Framing for one MPEG audio layer; frames of other layers are rejected.
#[derive(Debug, Clone, Copy)]
pub struct MpaFraming {
    layer: u8,
}

impl MpaFraming {
    pub fn new(layer: u8) -> Self {
        Self { layer }
    }
}

impl AudioFraming for MpaFraming {
    const HEADER_LEN: usize = 4;
    // layer II, 384 kbit/s at 32 kHz
    const MAX_FRAME_LEN: usize = 1728;

    fn is_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xff && data[1] & 0xf0 == 0xf0
    }

    fn parse(&self, data: &[u8]) -> Result<AudioFrameInfo, ParseError> {
        let header = MpaHeader::parse(data)?;
        if header.layer != self.layer {
            return Err(ParseError::LayerMismatch {
                expected: self.layer,
                found: header.layer,
            });
        }
        Ok(AudioFrameInfo {
            frame_len: header.frame_len(),
            samples: header.samples(),
            sample_rate: header.sample_rate,
            bitrate: header.bitrate_kbps * 1000,
            channels: header.channels,
        })
    }
}
