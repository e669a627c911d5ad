//! AAC in ADTS framing.

use crate::codec::{AudioFraming, AudioFrameInfo};
use crate::error::ParseError;

const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Fixed ADTS header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub protection_absent: bool,
    pub profile: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    pub frame_len: usize,
    pub raw_blocks: u8,
}

impl AdtsHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 7 {
            return Err(ParseError::Truncated);
        }
        if data[0] != 0xff || data[1] & 0xf6 != 0xf0 {
            return Err(ParseError::InvalidHeader("adts sync"));
        }
        let protection_absent = data[1] & 0x01 != 0;
        let rate_index = ((data[2] >> 2) & 0x0f) as usize;
        let sample_rate = *SAMPLE_RATES
            .get(rate_index)
            .ok_or(ParseError::InvalidHeader("adts sampling_frequency_index"))?;
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | (data[5] as usize >> 5);
        let min_len = if protection_absent { 7 } else { 9 };
        if frame_len < min_len {
            return Err(ParseError::InvalidHeader("adts frame_length"));
        }
        Ok(Self {
            protection_absent,
            profile: data[2] >> 6,
            sample_rate,
            channel_config: ((data[2] & 0x01) << 2) | (data[3] >> 6),
            frame_len,
            raw_blocks: (data[6] & 0x03) + 1,
        })
    }

    pub fn samples(&self) -> u32 {
        1024 * self.raw_blocks as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdtsFraming;

impl AudioFraming for AdtsFraming {
    const HEADER_LEN: usize = 7;
    // 13 bit frame_length
    const MAX_FRAME_LEN: usize = 8191;

    fn is_sync(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xff && data[1] & 0xf6 == 0xf0
    }

    fn parse(&self, data: &[u8]) -> Result<AudioFrameInfo, ParseError> {
        let header = AdtsHeader::parse(data)?;
        let samples = header.samples();
        Ok(AudioFrameInfo {
            frame_len: header.frame_len,
            samples,
            sample_rate: header.sample_rate,
            bitrate: (header.frame_len as u64 * 8 * header.sample_rate as u64 / samples as u64)
                as u32,
            channels: header.channel_config,
        })
    }
}

/// Builds a 7 byte ADTS header, used by tests and the CLI's probe.
pub fn adts_header(rate_index: u8, channels: u8, frame_len: usize) -> [u8; 7] {
    let len = frame_len as u32;
    [
        0xff,
        0xf1,
        (1 << 6) | (rate_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((len >> 11) & 0x03) as u8,
        ((len >> 3) & 0xff) as u8,
        (((len & 0x07) << 5) as u8) | 0x1f,
        0xfc,
    ]
}
