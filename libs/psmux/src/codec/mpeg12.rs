//! MPEG-1/MPEG-2 video (ISO/IEC 11172-2, 13818-2) picture analysis.
//!
//! Every submitted frame is one coded picture, optionally preceded by a
//! sequence header and a GOP header. The parser reads what the scheduler
//! needs (picture type, temporal reference, display duration) and rewrites
//! header fields in place when overrides or soft telecine are configured.

use tracing::warn;

use crate::clock::FrameRate;
use crate::codec::VideoMeta;
use crate::codec::common::{StartCodeIter, put_bits};
use crate::codec::telecine::{RFF, TFF, TelecinePattern};
use crate::config::{ResolvedConfig, Telecine};
use crate::error::ParseError;
use crate::queue::FrameKind;

pub const SEQUENCE_HEADER: u8 = 0xb3;
pub const EXTENSION: u8 = 0xb5;
pub const GROUP_OF_PICTURES: u8 = 0xb8;
pub const PICTURE: u8 = 0x00;

const SEQUENCE_EXTENSION_ID: u8 = 0x1;
const SEQUENCE_DISPLAY_EXTENSION_ID: u8 = 0x2;
const PICTURE_CODING_EXTENSION_ID: u8 = 0x8;

/// Temporal references count modulo 1024.
pub const TEMPORAL_REFERENCE_MODULUS: i64 = 1024;

/// Decoded fields of a sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub width: u16,
    pub height: u16,
    pub aspect_code: u8,
    pub frame_rate_code: u8,
    /// Bit rate in 400 bit/s units.
    pub bit_rate: u32,
    /// VBV buffer size in bytes.
    pub vbv_buffer_size: u32,
}

/// Reads a sequence header. `data` starts at the `00 00 01 b3` prefix.
pub fn parse_sequence_header(data: &[u8]) -> Result<SequenceHeader, ParseError> {
    if data.len() < 12 {
        return Err(ParseError::Truncated);
    }
    let b = &data[4..12];
    let vbv = ((b[6] as u32 & 0x1f) << 5) | (b[7] as u32 >> 3);
    Ok(SequenceHeader {
        width: ((b[0] as u16) << 4) | (b[1] as u16 >> 4),
        height: ((b[1] as u16 & 0x0f) << 8) | b[2] as u16,
        aspect_code: b[3] >> 4,
        frame_rate_code: b[3] & 0x0f,
        bit_rate: ((b[4] as u32) << 10) | ((b[5] as u32) << 2) | (b[6] as u32 >> 6),
        vbv_buffer_size: vbv * 2048,
    })
}

/// Sequence header overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SequencePatch {
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub aspect_code: Option<u8>,
    pub frame_rate_code: Option<u8>,
    /// Bit rate in 400 bit/s units.
    pub bit_rate: Option<u32>,
    pub panscan_width: Option<u16>,
    pub panscan_height: Option<u16>,
}

impl SequencePatch {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            width: config.vwidth,
            height: config.vheight,
            aspect_code: config.vaspect,
            frame_rate_code: config.vframerate.and_then(|r| r.code()),
            bit_rate: config.vbitrate.map(|kbps| kbps * 10 / 4),
            panscan_width: config.vpswidth,
            panscan_height: config.vpsheight,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Applies `patch` to the sequence header at the start of `buf`.
pub fn patch_sequence_header(buf: &mut [u8], patch: &SequencePatch) -> Result<(), ParseError> {
    if buf.len() < 12 {
        return Err(ParseError::Truncated);
    }
    if let Some(w) = patch.width {
        buf[4] = (w >> 4) as u8;
        buf[5] = (buf[5] & 0x0f) | (((w & 0x0f) as u8) << 4);
    }
    if let Some(h) = patch.height {
        buf[5] = (buf[5] & 0xf0) | ((h >> 8) & 0x0f) as u8;
        buf[6] = (h & 0xff) as u8;
    }
    if let Some(a) = patch.aspect_code {
        buf[7] = (buf[7] & 0x0f) | (a << 4);
    }
    if let Some(code) = patch.frame_rate_code {
        buf[7] = (buf[7] & 0xf0) | (code & 0x0f);
    }
    if let Some(br) = patch.bit_rate {
        buf[8] = ((br >> 10) & 0xff) as u8;
        buf[9] = ((br >> 2) & 0xff) as u8;
        buf[10] = (buf[10] & 0x3f) | (((br & 0x3) as u8) << 6);
    }
    Ok(())
}

/// Rewrites the display size of a sequence display extension. `buf` starts at
/// the `00 00 01 b5` prefix.
pub fn patch_display_extension(
    buf: &mut [u8],
    width: Option<u16>,
    height: Option<u16>,
) -> Result<(), ParseError> {
    if buf.len() < 5 {
        return Err(ParseError::Truncated);
    }
    let colour_description = buf[4] & 0x01 != 0;
    let start = 5 * 8 + if colour_description { 24 } else { 0 };
    let ok_w = width.is_none_or(|w| put_bits(buf, start, 14, w as u32));
    let ok_h = height.is_none_or(|h| put_bits(buf, start + 15, 14, h as u32));
    if ok_w && ok_h {
        Ok(())
    } else {
        Err(ParseError::Truncated)
    }
}

/// Reads `(temporal_reference, kind)` from a picture header at the start of
/// `data`.
pub fn parse_picture_header(data: &[u8]) -> Result<(u16, FrameKind), ParseError> {
    if data.len() < 6 {
        return Err(ParseError::Truncated);
    }
    let temporal_reference = ((data[4] as u16) << 2) | (data[5] as u16 >> 6);
    let kind = match (data[5] >> 3) & 0x07 {
        // D-pictures are intra coded
        1 | 4 => FrameKind::I,
        2 => FrameKind::P,
        3 => FrameKind::B,
        _ => return Err(ParseError::InvalidHeader("picture_coding_type")),
    };
    Ok((temporal_reference, kind))
}

/// Display duration of a picture in percent of the nominal frame duration,
/// from the picture coding extension's flag byte and `progressive_frame`.
pub fn display_percent(progressive_sequence: bool, flags: u8, progressive_frame: bool) -> u32 {
    let mut percent = 100;
    if flags & RFF != 0 {
        if progressive_sequence {
            percent += if flags & TFF != 0 { 200 } else { 100 };
        } else if progressive_frame {
            percent += 50;
        }
    }
    percent
}

#[derive(Debug, Clone, Copy, Default)]
struct Layout {
    sequence_header: Option<usize>,
    sequence_extension: Option<usize>,
    display_extension: Option<usize>,
    picture_coding_extension: Option<usize>,
    gop: Option<usize>,
    picture: Option<usize>,
}

fn scan_layout(data: &[u8]) -> Layout {
    let mut layout = Layout::default();
    for (pos, code) in StartCodeIter::new(data) {
        match code {
            SEQUENCE_HEADER => layout.sequence_header = Some(pos),
            GROUP_OF_PICTURES => layout.gop = Some(pos),
            PICTURE => layout.picture = Some(pos),
            EXTENSION => match data.get(pos + 4).map(|b| b >> 4) {
                Some(SEQUENCE_EXTENSION_ID) => layout.sequence_extension = Some(pos),
                Some(SEQUENCE_DISPLAY_EXTENSION_ID) => layout.display_extension = Some(pos),
                Some(PICTURE_CODING_EXTENSION_ID) => layout.picture_coding_extension = Some(pos),
                _ => {}
            },
            0x01..=0xaf => break,
            _ => {}
        }
    }
    layout
}

/// Stateful MPEG-1/2 video analyzer for one stream.
#[derive(Debug)]
pub struct Mpeg12Parser {
    patch: SequencePatch,
    telecine: Telecine,
    telecine_source: Option<FrameRate>,
    pattern: Option<TelecinePattern>,
    frame_rate: Option<FrameRate>,
    progressive_sequence: bool,
    last_temporal_reference: Option<i64>,
    max_temporal_reference: i64,
}

impl Mpeg12Parser {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self {
            patch: SequencePatch::from_config(config),
            telecine: config.telecine,
            telecine_source: config.tele_src,
            pattern: None,
            frame_rate: None,
            progressive_sequence: false,
            last_temporal_reference: None,
            max_temporal_reference: 0,
        }
    }

    /// Nominal frame rate of the emitted stream, once a sequence header has
    /// been seen.
    pub fn frame_rate(&self) -> Option<FrameRate> {
        self.frame_rate
    }

    pub fn telecine_active(&self) -> bool {
        self.telecine != Telecine::Off
    }

    fn disable_telecine(&mut self, reason: &str) {
        if self.telecine != Telecine::Off {
            warn!("soft telecine disabled: {reason}");
        }
        self.telecine = Telecine::Off;
        self.pattern = None;
    }

    /// Analyzes one coded picture, patching headers in place.
    pub fn parse(&mut self, frame: &mut [u8]) -> Result<VideoMeta, ParseError> {
        let layout = scan_layout(frame);
        let mut meta = VideoMeta::default();

        if self.telecine != Telecine::Off {
            if let Some(pos) = layout.picture_coding_extension {
                if frame.get(pos + 7).is_some_and(|b| b & RFF != 0) {
                    self.disable_telecine("stream already carries repeat_first_field flags");
                }
            }
        }

        if let Some(pos) = layout.sequence_header {
            self.sequence_header(&mut frame[pos..], &layout, &mut meta)?;
        }

        if let Some(pos) = layout.sequence_extension {
            let byte = frame.get_mut(pos + 5).ok_or(ParseError::Truncated)?;
            if self.pattern.is_some() {
                *byte &= !0x08;
            }
            self.progressive_sequence = *byte & 0x08 != 0;
        }

        if let Some(pos) = layout.display_extension {
            if self.patch.panscan_width.is_some() || self.patch.panscan_height.is_some() {
                patch_display_extension(
                    &mut frame[pos..],
                    self.patch.panscan_width,
                    self.patch.panscan_height,
                )?;
            }
        }

        meta.gop_start = layout.gop.is_some();
        if let Some(pos) = layout.gop {
            meta.closed_gop = frame.get(pos + 7).is_some_and(|b| b & 0x40 != 0);
        }

        let Some(pos) = layout.picture else {
            return Ok(meta);
        };
        let (temporal_reference, kind) = parse_picture_header(&frame[pos..])?;
        meta.kind = kind;
        meta.temporal_reference = Some(temporal_reference);
        let step = self.display_step(temporal_reference as i64, meta.gop_start);

        if let Some(pos) = layout.picture_coding_extension {
            if frame.len() < pos + 9 {
                return Err(ParseError::Truncated);
            }
            if let Some(pattern) = self.pattern.as_mut() {
                let flags = pattern.advance(step);
                frame[pos + 7] = (frame[pos + 7] & !(TFF | RFF)) | flags;
                frame[pos + 8] |= 0x80;
            }
            let progressive_frame = frame[pos + 8] & 0x80 != 0;
            meta.display_percent =
                display_percent(self.progressive_sequence, frame[pos + 7], progressive_frame);
        }
        meta.frame_rate = self.frame_rate;
        Ok(meta)
    }

    fn sequence_header(
        &mut self,
        buf: &mut [u8],
        layout: &Layout,
        meta: &mut VideoMeta,
    ) -> Result<(), ParseError> {
        let header = parse_sequence_header(buf)?;
        let coded_rate = FrameRate::from_code(header.frame_rate_code);

        if self.telecine != Telecine::Off && self.pattern.is_none() {
            if layout.sequence_extension.is_none() {
                self.disable_telecine("MPEG-1 video has no picture coding extension");
            } else {
                let film = FrameRate::new(24000, 1001);
                let source = match self.telecine {
                    Telecine::Custom(_) => self.telecine_source.or(coded_rate).unwrap_or(film),
                    _ => self.telecine_source.unwrap_or(film),
                };
                self.pattern = match self.telecine {
                    Telecine::Pulldown32 => TelecinePattern::pulldown32(source),
                    Telecine::FilmToPal => TelecinePattern::film_to_pal(source),
                    Telecine::Custom(target) => TelecinePattern::new(source, target),
                    Telecine::Off => None,
                };
                if self.pattern.is_none() {
                    self.disable_telecine("source frame rate cannot be converted");
                }
            }
        }

        let mut patch = self.patch;
        if let Some(pattern) = &self.pattern {
            patch.frame_rate_code = pattern.target().code();
        }
        if !patch.is_empty() {
            patch_sequence_header(buf, &patch)?;
        }

        let rate_code = patch.frame_rate_code.unwrap_or(header.frame_rate_code);
        self.frame_rate = FrameRate::from_code(rate_code).or(self.frame_rate);
        if self.frame_rate.is_none() {
            warn!(code = rate_code, "unknown frame_rate_code in sequence header");
        }
        meta.sequence_header = true;
        meta.vbv_buffer_size = Some(header.vbv_buffer_size);
        Ok(())
    }

    /// Display-order distance from the previous picture, derived from
    /// temporal references.
    fn display_step(&mut self, temporal_reference: i64, gop_start: bool) -> i64 {
        let Some(last) = self.last_temporal_reference else {
            self.last_temporal_reference = Some(temporal_reference);
            self.max_temporal_reference = temporal_reference;
            return 1;
        };
        let step = if gop_start {
            let step = self.max_temporal_reference + 1 - last + temporal_reference;
            self.max_temporal_reference = temporal_reference;
            step
        } else {
            let mut d = temporal_reference - last;
            if d < -TEMPORAL_REFERENCE_MODULUS / 2 {
                d += TEMPORAL_REFERENCE_MODULUS;
            } else if d > TEMPORAL_REFERENCE_MODULUS / 2 {
                d -= TEMPORAL_REFERENCE_MODULUS;
            }
            self.max_temporal_reference = self.max_temporal_reference.max(temporal_reference);
            // a repeated temporal reference still moves one picture
            if d == 0 { 1 } else { d }
        };
        self.last_temporal_reference = Some(temporal_reference);
        step
    }
}
