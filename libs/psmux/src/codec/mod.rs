//! Elementary stream analysis.
//!
//! The muxer never decodes; it only reads enough of every frame to schedule
//! it. Video parsers report picture type, temporal ordering and display
//! duration. Audio framers split an arbitrary byte stream into whole
//! frames and report their sample counts.

pub mod aac;
pub mod ac3;
pub mod common;
pub mod mpa;
pub mod mpeg12;
pub mod mpeg4;
pub mod telecine;

pub use common::{BitReader, StartCodeIter, find_start_code};

use crate::api::{AudioCodec, AudioParams, VideoCodec};
use crate::clock::FrameRate;
use crate::config::ResolvedConfig;
use crate::error::ParseError;
use crate::queue::FrameKind;

/// Scheduling facts extracted from one coded picture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub kind: FrameKind,
    /// MPEG-1/2 temporal reference (10 bit, wrapping).
    pub temporal_reference: Option<u16>,
    /// A GOP (or MPEG-4 GOV) header precedes the picture.
    pub gop_start: bool,
    pub closed_gop: bool,
    pub sequence_header: bool,
    /// Display duration in percent of the nominal frame duration.
    pub display_percent: u32,
    /// Frame rate announced by the most recent sequence header.
    pub frame_rate: Option<FrameRate>,
    pub vbv_buffer_size: Option<u32>,
    /// MPEG-4 VOP timing.
    pub vop_time: Option<VopTime>,
}

impl Default for VideoMeta {
    fn default() -> Self {
        Self {
            kind: FrameKind::Unknown,
            temporal_reference: None,
            gop_start: false,
            closed_gop: false,
            sequence_header: false,
            display_percent: 100,
            frame_rate: None,
            vbv_buffer_size: None,
            vop_time: None,
        }
    }
}

/// Time position of an MPEG-4 VOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VopTime {
    /// `vop_time_increment_resolution`, ticks per second.
    pub resolution: u32,
    pub increment: u32,
}

/// Facts about one audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrameInfo {
    /// Frame length in bytes, header included.
    pub frame_len: usize,
    pub samples: u32,
    pub sample_rate: u32,
    /// Bits per second.
    pub bitrate: u32,
    pub channels: u8,
}

/// Frame synchronization for one audio bitstream format.
pub trait AudioFraming {
    /// Bytes needed before a header can be parsed.
    const HEADER_LEN: usize;
    /// Largest legal frame.
    const MAX_FRAME_LEN: usize;

    /// Cheap check for the sync word at the start of `data`.
    fn is_sync(data: &[u8]) -> bool;

    /// Parses the header at the start of `data`.
    fn parse(&self, data: &[u8]) -> Result<AudioFrameInfo, ParseError>;
}

/// Output of an [`AudioScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioUnit {
    Frame { data: Vec<u8>, info: AudioFrameInfo },
    /// Bytes between frames that did not parse.
    Junk(Vec<u8>),
}

/// Result of scanning one chunk of audio input.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub units: Vec<AudioUnit>,
    pub errors: Vec<ParseError>,
}

/// Splits an audio byte stream into frames, carrying partial frames over to
/// the next call.
#[derive(Debug)]
pub struct AudioScanner<F> {
    framing: F,
    sample_rate: u32,
    carry: Vec<u8>,
    /// Offset into `carry` where scanning resumes.
    resume: usize,
}

impl<F: AudioFraming> AudioScanner<F> {
    pub fn new(framing: F, sample_rate: u32) -> Self {
        Self {
            framing,
            sample_rate,
            carry: Vec::new(),
            resume: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    pub fn scan(&mut self, input: &[u8]) -> ScanResult {
        let mut result = ScanResult::default();
        self.carry.extend_from_slice(input);

        let mut junk_start = 0;
        let mut i = self.resume;
        while self.carry.len() - i >= F::HEADER_LEN {
            let rest = &self.carry[i..];
            if !F::is_sync(rest) {
                i += 1;
                continue;
            }
            let info = match self.framing.parse(rest) {
                Ok(info) if info.sample_rate != self.sample_rate => {
                    result.errors.push(ParseError::SampleRateMismatch {
                        expected: self.sample_rate,
                        found: info.sample_rate,
                    });
                    i += 1;
                    continue;
                }
                Ok(info) => info,
                Err(e) => {
                    result.errors.push(e);
                    i += 1;
                    continue;
                }
            };
            if info.frame_len > rest.len() {
                break;
            }
            if junk_start < i {
                result
                    .units
                    .push(AudioUnit::Junk(self.carry[junk_start..i].to_vec()));
            }
            result.units.push(AudioUnit::Frame {
                data: rest[..info.frame_len].to_vec(),
                info,
            });
            i += info.frame_len;
            junk_start = i;
        }

        let unsynced = i - junk_start;
        if unsynced > 2 * F::MAX_FRAME_LEN {
            result.errors.push(ParseError::NoSync(unsynced));
            junk_start = i;
        }
        self.carry.drain(..junk_start);
        self.resume = i - junk_start;
        result
    }

    /// Discards whatever is left in the carry buffer, returning its length.
    pub fn finish(&mut self) -> usize {
        let left = self.carry.len();
        self.carry.clear();
        self.resume = 0;
        left
    }
}

/// Per-stream parser, selected at registration from the stream's codec.
#[derive(Debug)]
pub enum ElementaryStreamParser {
    Mpeg12Video(mpeg12::Mpeg12Parser),
    Mpeg4Video(mpeg4::Mpeg4Parser),
    MpegAudio(AudioScanner<mpa::MpaFraming>),
    Ac3Audio(AudioScanner<ac3::Ac3Framing>),
    AacAudio(AudioScanner<aac::AdtsFraming>),
}

impl ElementaryStreamParser {
    pub fn for_video(codec: VideoCodec, config: &ResolvedConfig) -> Self {
        match codec {
            VideoCodec::Mpeg1 | VideoCodec::Mpeg2 => {
                ElementaryStreamParser::Mpeg12Video(mpeg12::Mpeg12Parser::new(config))
            }
            VideoCodec::Mpeg4 => ElementaryStreamParser::Mpeg4Video(mpeg4::Mpeg4Parser::new()),
        }
    }

    pub fn for_audio(params: &AudioParams) -> Self {
        let rate = params.sample_rate;
        match params.codec {
            AudioCodec::Mp1 => {
                ElementaryStreamParser::MpegAudio(AudioScanner::new(mpa::MpaFraming::new(1), rate))
            }
            AudioCodec::Mp2 => {
                ElementaryStreamParser::MpegAudio(AudioScanner::new(mpa::MpaFraming::new(2), rate))
            }
            AudioCodec::Mp3 => {
                ElementaryStreamParser::MpegAudio(AudioScanner::new(mpa::MpaFraming::new(3), rate))
            }
            AudioCodec::Ac3 => {
                ElementaryStreamParser::Ac3Audio(AudioScanner::new(ac3::Ac3Framing, rate))
            }
            AudioCodec::Aac => {
                ElementaryStreamParser::AacAudio(AudioScanner::new(aac::AdtsFraming, rate))
            }
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            ElementaryStreamParser::Mpeg12Video(_) | ElementaryStreamParser::Mpeg4Video(_)
        )
    }

    /// Analyzes a video frame. Audio parsers reject the call.
    pub fn parse_video(&mut self, frame: &mut [u8]) -> Result<VideoMeta, ParseError> {
        match self {
            ElementaryStreamParser::Mpeg12Video(p) => p.parse(frame),
            ElementaryStreamParser::Mpeg4Video(p) => p.parse(frame),
            _ => Err(ParseError::InvalidHeader("not a video stream")),
        }
    }

    /// Feeds audio bytes. Video parsers return an empty result.
    pub fn scan_audio(&mut self, input: &[u8]) -> ScanResult {
        match self {
            ElementaryStreamParser::MpegAudio(s) => s.scan(input),
            ElementaryStreamParser::Ac3Audio(s) => s.scan(input),
            ElementaryStreamParser::AacAudio(s) => s.scan(input),
            _ => ScanResult::default(),
        }
    }

    pub fn finish_audio(&mut self) -> usize {
        match self {
            ElementaryStreamParser::MpegAudio(s) => s.finish(),
            ElementaryStreamParser::Ac3Audio(s) => s.finish(),
            ElementaryStreamParser::AacAudio(s) => s.finish(),
            _ => 0,
        }
    }
}

/// Splits a raw video elementary stream into one slice per coded picture.
/// Sequence, GOP and VOL headers stay with the picture that follows them.
pub fn split_video(data: &[u8], codec: VideoCodec) -> Vec<&[u8]> {
    let (is_header, is_picture): (fn(u8) -> bool, fn(u8) -> bool) = match codec {
        VideoCodec::Mpeg1 | VideoCodec::Mpeg2 => (
            |code| {
                matches!(
                    code,
                    mpeg12::SEQUENCE_HEADER | mpeg12::GROUP_OF_PICTURES | mpeg12::PICTURE
                )
            },
            |code| code == mpeg12::PICTURE,
        ),
        // video object, VOL, VOS, GOV, visual object, VOP
        VideoCodec::Mpeg4 => (
            |code| code <= 0x2f || matches!(code, 0xb0 | 0xb3 | 0xb5 | 0xb6),
            |code| code == 0xb6,
        ),
    };
    let mut frames = Vec::new();
    let mut start = 0;
    let mut picture_seen = false;
    for (pos, code) in StartCodeIter::new(data) {
        if is_header(code) && picture_seen {
            frames.push(&data[start..pos]);
            start = pos;
            picture_seen = false;
        }
        if is_picture(code) {
            picture_seen = true;
        }
    }
    if start < data.len() {
        frames.push(&data[start..]);
    }
    frames
}
