//! MPEG-4 Part 2 video: VOL and VOP headers.
//!
//! MPEG-4 has no temporal reference; timing comes from the VOP time
//! increment, measured in units of the VOL's `vop_time_increment_resolution`.

use crate::codec::common::{BitReader, StartCodeIter, bits_for_range};
use crate::codec::{VideoMeta, VopTime};
use crate::error::ParseError;
use crate::queue::FrameKind;

const VOP: u8 = 0xb6;
const GROUP_OF_VOP: u8 = 0xb3;

/// Fields of a video object layer header the muxer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolHeader {
    pub time_increment_resolution: u32,
    pub fixed_vop_time_increment: Option<u32>,
}

/// Parses a VOL header. `payload` starts right after the start code.
pub fn parse_vol(payload: &[u8]) -> Result<VolHeader, ParseError> {
    let mut r = BitReader::new(payload);
    read_vol(&mut r).ok_or(ParseError::Truncated)?
}

fn read_vol(r: &mut BitReader<'_>) -> Option<Result<VolHeader, ParseError>> {
    r.skip(1)?; // random_accessible_vol
    r.skip(8)?; // video_object_type_indication
    let mut verid = 1;
    if r.read_bit()? {
        verid = r.read_bits(4)?;
        r.skip(3)?; // priority
    }
    if r.read_bits(4)? == 0x0f {
        r.skip(16)?; // par_width, par_height
    }
    if r.read_bit()? {
        r.skip(3)?; // chroma_format, low_delay
        if r.read_bit()? {
            r.skip(79)?; // vbv parameters
        }
    }
    let shape = r.read_bits(2)?;
    if shape == 3 && verid != 1 {
        r.skip(4)?;
    }
    if !r.read_bit()? {
        return Some(Err(ParseError::InvalidHeader("vol marker")));
    }
    let resolution = r.read_bits(16)?;
    if resolution == 0 {
        return Some(Err(ParseError::InvalidHeader("vop_time_increment_resolution")));
    }
    r.skip(1)?; // marker
    let fixed = if r.read_bit()? {
        Some(r.read_bits(bits_for_range(resolution))?)
    } else {
        None
    };
    Some(Ok(VolHeader {
        time_increment_resolution: resolution,
        fixed_vop_time_increment: fixed,
    }))
}

/// Parses a VOP header. `payload` starts right after the start code.
pub fn parse_vop(payload: &[u8], resolution: u32) -> Result<(FrameKind, u32), ParseError> {
    let mut r = BitReader::new(payload);
    let coding_type = r.read_bits(2).ok_or(ParseError::Truncated)?;
    loop {
        match r.read_bit() {
            Some(true) => continue,
            Some(false) => break,
            None => return Err(ParseError::Truncated),
        }
    }
    r.skip(1).ok_or(ParseError::Truncated)?;
    let increment = r
        .read_bits(bits_for_range(resolution))
        .ok_or(ParseError::Truncated)?;
    let kind = match coding_type {
        0 => FrameKind::I,
        2 => FrameKind::B,
        // S-VOPs are predicted like P-VOPs
        _ => FrameKind::P,
    };
    Ok((kind, increment))
}

#[derive(Debug, Default)]
pub struct Mpeg4Parser {
    vol: Option<VolHeader>,
}

impl Mpeg4Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_increment_resolution(&self) -> Option<u32> {
        self.vol.map(|v| v.time_increment_resolution)
    }

    pub fn parse(&mut self, frame: &mut [u8]) -> Result<VideoMeta, ParseError> {
        let mut meta = VideoMeta::default();
        for (pos, code) in StartCodeIter::new(frame) {
            match code {
                0x20..=0x2f => {
                    self.vol = Some(parse_vol(&frame[pos + 4..])?);
                    meta.sequence_header = true;
                }
                GROUP_OF_VOP => meta.gop_start = true,
                VOP => {
                    let vol = self
                        .vol
                        .ok_or(ParseError::InvalidHeader("VOP before VOL"))?;
                    let resolution = vol.time_increment_resolution;
                    let (kind, increment) = parse_vop(&frame[pos + 4..], resolution)?;
                    meta.kind = kind;
                    meta.vop_time = Some(VopTime {
                        resolution,
                        increment,
                    });
                    break;
                }
                _ => {}
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::common::put_bits;

    /// A minimal VOL with the given resolution and no optional fields.
    pub(crate) fn vol(resolution: u16) -> Vec<u8> {
        let mut payload = [0u8; 6];
        // random_accessible_vol=0, type=1, is_object_layer_identifier=0,
        // aspect=1, vol_control_parameters=0, shape=0, marker=1
        let mut bit = 0;
        for (n, v) in [(1, 0), (8, 1), (1, 0), (4, 1), (1, 0), (2, 0), (1, 1)] {
            put_bits(&mut payload, bit, n, v);
            bit += n as usize;
        }
        put_bits(&mut payload, bit, 16, resolution as u32);
        put_bits(&mut payload, bit + 16, 1, 1);
        let mut v = vec![0x00, 0x00, 0x01, 0x20];
        v.extend_from_slice(&payload);
        v
    }

    pub(crate) fn vop(coding_type: u32, increment: u32, resolution: u32) -> Vec<u8> {
        let mut payload = [0u8; 6];
        put_bits(&mut payload, 0, 2, coding_type);
        // modulo_time_base=0, marker=1
        put_bits(&mut payload, 2, 2, 0b01);
        put_bits(&mut payload, 4, bits_for_range(resolution), increment);
        let mut v = vec![0x00, 0x00, 0x01, 0xb6];
        v.extend_from_slice(&payload);
        v
    }

    #[test]
    fn test_parse_vol_resolution() {
        let data = vol(30000);
        let hdr = parse_vol(&data[4..]).unwrap();
        assert_eq!(hdr.time_increment_resolution, 30000);
        assert_eq!(hdr.fixed_vop_time_increment, None);
    }

    #[test]
    fn test_parse_vop() {
        let data = vop(2, 1001, 30000);
        assert_eq!(parse_vop(&data[4..], 30000).unwrap(), (FrameKind::B, 1001));
        let data = vop(0, 7, 25);
        assert_eq!(parse_vop(&data[4..], 25).unwrap(), (FrameKind::I, 7));
    }

    #[test]
    fn test_parser_requires_vol() {
        let mut parser = Mpeg4Parser::new();
        let mut orphan = vop(1, 0, 25);
        assert!(parser.parse(&mut orphan).is_err());

        let mut first = [vol(25), vop(0, 3, 25)].concat();
        let meta = parser.parse(&mut first).unwrap();
        assert_eq!(meta.kind, FrameKind::I);
        assert_eq!(
            meta.vop_time,
            Some(VopTime {
                resolution: 25,
                increment: 3
            })
        );
        assert_eq!(parser.time_increment_resolution(), Some(25));
    }
}
