//! Public API of the multiplexer.
//!
//! A [`Muxer`] owns the output sink and one session. Streams are registered
//! first, then encoded frames are handed over one call at a time; each call
//! runs the whole parse, timestamp, schedule and serialize pipeline before
//! returning. [`Muxer::finalize`] drains the queues and writes the end code.

use std::fmt;
use std::io::Write;

use serde::Serialize;

use crate::clock::FrameRate;
use crate::config::{MuxerConfig, ResolvedConfig};
use crate::error::MuxError;
use crate::muxer::PsWriter;
use crate::rendezvous::{Chunk, Rendezvous};

/// Media kind of a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamKind {
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// MPEG-1 video (ISO/IEC 11172-2).
    Mpeg1,
    /// MPEG-2 video (ISO/IEC 13818-2).
    Mpeg2,
    /// MPEG-4 Part 2 visual.
    Mpeg4,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::Mpeg1 => write!(f, "MPEG-1"),
            VideoCodec::Mpeg2 => write!(f, "MPEG-2"),
            VideoCodec::Mpeg4 => write!(f, "MPEG-4"),
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mpeg1" | "mpeg-1" | "m1v" => Ok(VideoCodec::Mpeg1),
            "mpeg2" | "mpeg-2" | "m2v" => Ok(VideoCodec::Mpeg2),
            "mpeg4" | "mpeg-4" | "m4v" | "divx" | "xvid" => Ok(VideoCodec::Mpeg4),
            _ => Err(format!("Unknown video codec: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    /// MPEG-1/2 layer I.
    Mp1,
    /// MPEG-1/2 layer II.
    Mp2,
    /// MPEG-1/2 layer III.
    Mp3,
    /// Dolby AC-3, carried in private stream 1.
    Ac3,
    /// AAC with ADTS framing.
    Aac,
}

impl AudioCodec {
    /// Whether the codec travels in private stream 1 (`0xBD`).
    pub fn is_private(&self) -> bool {
        matches!(self, AudioCodec::Ac3)
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioCodec::Mp1 => write!(f, "MP1"),
            AudioCodec::Mp2 => write!(f, "MP2"),
            AudioCodec::Mp3 => write!(f, "MP3"),
            AudioCodec::Ac3 => write!(f, "AC-3"),
            AudioCodec::Aac => write!(f, "AAC"),
        }
    }
}

impl std::str::FromStr for AudioCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mp1" => Ok(AudioCodec::Mp1),
            "mp2" | "mpa" => Ok(AudioCodec::Mp2),
            "mp3" => Ok(AudioCodec::Mp3),
            "ac3" | "ac-3" | "a52" => Ok(AudioCodec::Ac3),
            "aac" | "adts" => Ok(AudioCodec::Aac),
            _ => Err(format!("Unknown audio codec: {}", s)),
        }
    }
}

/// Parameters of a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParams {
    pub codec: VideoCodec,
    /// Nominal frame rate. MPEG-1/2 streams take it from the sequence
    /// header; this value is the fallback.
    pub frame_rate: Option<FrameRate>,
    /// Bits per second, informational.
    pub bitrate: Option<u32>,
}

impl VideoParams {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            frame_rate: None,
            bitrate: None,
        }
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn with_bitrate(mut self, bps: u32) -> Self {
        self.bitrate = Some(bps);
        self
    }
}

/// Parameters of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    pub codec: AudioCodec,
    /// Frames with a different sample rate are rejected.
    pub sample_rate: u32,
    pub channels: u8,
    /// Bits per second. Probed from the first frame when absent.
    pub bitrate: Option<u32>,
}

impl AudioParams {
    pub fn new(codec: AudioCodec, sample_rate: u32) -> Self {
        Self {
            codec,
            sample_rate,
            channels: 2,
            bitrate: None,
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_bitrate(mut self, bps: u32) -> Self {
        self.bitrate = Some(bps);
        self
    }
}

/// Parameters given at stream registration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamParams {
    Video(VideoParams),
    Audio(AudioParams),
}

impl StreamParams {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamParams::Video(_) => StreamKind::Video,
            StreamParams::Audio(_) => StreamKind::Audio,
        }
    }
}

impl From<VideoParams> for StreamParams {
    fn from(p: VideoParams) -> Self {
        StreamParams::Video(p)
    }
}

impl From<AudioParams> for StreamParams {
    fn from(p: AudioParams) -> Self {
        StreamParams::Audio(p)
    }
}

/// Identifies a registered stream. Handles are numbered in registration
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) usize);

impl StreamHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Summary returned by [`Muxer::finalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MuxerStats {
    /// Pack, system, PSM and PES header bytes, NAV packs and end code.
    pub header_bytes: u64,
    /// Elementary stream bytes.
    pub payload_bytes: u64,
    /// Padding packets and PES stuffing.
    pub padding_bytes: u64,
    pub bytes_written: u64,
    pub packs: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub dropped_audio_frames: u64,
    pub suppressed_timestamps: u64,
    /// Final mux rate in bytes per second.
    pub muxrate: u32,
    /// Times a decoder buffer ran dry and the mux rate was raised.
    pub muxrate_raises: u64,
    /// Pack intervals the SCR idled because every decoder buffer was full.
    pub decoder_waits: u64,
    pub duration_secs: f64,
}

impl MuxerStats {
    /// Share of the output that is not elementary stream data.
    pub fn overhead_percent(&self) -> f64 {
        if self.bytes_written == 0 {
            return 0.0;
        }
        (self.bytes_written - self.payload_bytes) as f64 * 100.0 / self.bytes_written as f64
    }
}

/// Builder for a [`Muxer`] with a fixed set of streams.
pub struct MuxerBuilder<Writer> {
    writer: Writer,
    config: MuxerConfig,
    streams: Vec<StreamParams>,
}

impl<Writer> MuxerBuilder<Writer> {
    pub fn new(writer: Writer) -> Self {
        Self {
            writer,
            config: MuxerConfig::default(),
            streams: Vec::new(),
        }
    }

    pub fn config(mut self, config: MuxerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the configuration with one parsed from an option string.
    pub fn options(mut self, options: &str) -> Self {
        self.config = MuxerConfig::from_options(options);
        self
    }

    pub fn video(mut self, params: VideoParams) -> Self {
        self.streams.push(StreamParams::Video(params));
        self
    }

    pub fn audio(mut self, params: AudioParams) -> Self {
        self.streams.push(StreamParams::Audio(params));
        self
    }

    /// Creates the muxer and registers the configured streams in order.
    ///
    /// # Errors
    ///
    /// Fails if a stream limit is exceeded.
    pub fn build(self) -> Result<Muxer<Writer>, MuxError>
    where
        Writer: Write,
    {
        let mut muxer = Muxer::new(self.writer, &self.config);
        for params in self.streams {
            muxer.register_stream(params)?;
        }
        Ok(muxer)
    }
}

/// A multiplexing session writing an MPEG program stream.
///
/// # Thread Safety
///
/// `Muxer<W>` is `Send` when `W: Send`. The session itself is strictly
/// sequential.
pub struct Muxer<Writer: Write> {
    rendezvous: Rendezvous<PsWriter<Writer>>,
    handles: Vec<(StreamHandle, StreamKind)>,
    finished: bool,
}

impl<Writer: Write> Muxer<Writer> {
    pub fn new(writer: Writer, config: &MuxerConfig) -> Self {
        let config = config.resolve();
        Self {
            rendezvous: Rendezvous::new(PsWriter::new(writer, config)),
            handles: Vec::new(),
            finished: false,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        self.rendezvous.writer().config()
    }

    /// Registers a stream. Only possible until every registered stream has
    /// delivered its first frame.
    pub fn register_stream(
        &mut self,
        params: impl Into<StreamParams>,
    ) -> Result<StreamHandle, MuxError> {
        if self.finished {
            return Err(MuxError::AlreadyFinalized);
        }
        if self.rendezvous.is_open() {
            return Err(MuxError::RegistrationClosed);
        }
        let params = params.into();
        let index = self.rendezvous.writer_mut().add_stream(params)?;
        self.rendezvous.register();
        let handle = StreamHandle(index);
        self.handles.push((handle, params.kind()));
        Ok(handle)
    }

    pub fn register_video(&mut self, params: VideoParams) -> Result<StreamHandle, MuxError> {
        self.register_stream(params)
    }

    pub fn register_audio(&mut self, params: AudioParams) -> Result<StreamHandle, MuxError> {
        self.register_stream(params)
    }

    pub fn video_handle(&self) -> Option<StreamHandle> {
        self.handles
            .iter()
            .find(|(_, kind)| *kind == StreamKind::Video)
            .map(|(h, _)| *h)
    }

    pub fn audio_handles(&self) -> Vec<StreamHandle> {
        self.handles
            .iter()
            .filter(|(_, kind)| *kind == StreamKind::Audio)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Hands over one encoded frame (video) or an arbitrary slice of the
    /// audio bitstream.
    ///
    /// `dts` and `pts` are producer hints in seconds. They are validated but
    /// timestamps are always recomputed from the bitstream. An empty video
    /// frame marks a skipped picture.
    pub fn write_frame(
        &mut self,
        handle: StreamHandle,
        data: &[u8],
        is_keyframe: bool,
        dts: Option<f64>,
        pts: Option<f64>,
    ) -> Result<(), MuxError> {
        if self.finished {
            return Err(MuxError::AlreadyFinalized);
        }
        if handle.0 >= self.handles.len() {
            return Err(MuxError::UnknownStream(handle.0));
        }
        for value in [dts, pts].into_iter().flatten() {
            if !value.is_finite() || value < 0.0 {
                return Err(MuxError::InvalidTimestampHint {
                    stream: handle.0,
                    value,
                });
            }
        }

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(data.len())
            .map_err(|_| MuxError::Allocation {
                what: "submitted frame",
                bytes: data.len(),
            })?;
        owned.extend_from_slice(data);
        self.rendezvous.submit(
            handle.0,
            Chunk {
                data: owned,
                is_keyframe,
                dts,
                pts,
            },
        )
    }

    /// Drains every queue, writes the end of stream and flushes the sink.
    pub fn finalize(&mut self) -> Result<MuxerStats, MuxError> {
        if self.finished {
            return Err(MuxError::AlreadyFinalized);
        }
        self.finished = true;
        self.rendezvous.open()?;
        self.rendezvous.writer_mut().finalize()
    }

    /// Returns the sink. Call after [`Muxer::finalize`].
    pub fn into_inner(self) -> Writer {
        self.rendezvous.into_writer().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_names_round_trip() {
        for codec in [VideoCodec::Mpeg1, VideoCodec::Mpeg2, VideoCodec::Mpeg4] {
            let name = codec.to_string().to_lowercase();
            assert_eq!(name.parse::<VideoCodec>().unwrap(), codec);
        }
        assert_eq!("AC-3".parse::<AudioCodec>().unwrap(), AudioCodec::Ac3);
        assert!("opus".parse::<AudioCodec>().is_err());
    }

    #[test]
    fn test_muxer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Muxer<Vec<u8>>>();
        assert_send::<Muxer<std::fs::File>>();
    }

    #[test]
    fn test_overhead_percent() {
        let stats = MuxerStats {
            bytes_written: 2048,
            payload_bytes: 1536,
            ..Default::default()
        };
        assert_eq!(stats.overhead_percent(), 25.0);
        assert_eq!(MuxerStats::default().overhead_percent(), 0.0);
    }

    #[test]
    fn test_write_after_finalize_fails() {
        let mut muxer = MuxerBuilder::new(Vec::new())
            .audio(AudioParams::new(AudioCodec::Mp2, 48_000))
            .build()
            .unwrap();
        let handle = muxer.audio_handles()[0];
        muxer.finalize().unwrap();
        assert!(matches!(
            muxer.write_frame(handle, &[0xff], false, None, None),
            Err(MuxError::AlreadyFinalized)
        ));
        assert!(matches!(muxer.finalize(), Err(MuxError::AlreadyFinalized)));
    }

    #[test]
    fn test_rejects_bad_hints_and_handles() {
        let mut muxer = MuxerBuilder::new(Vec::new())
            .video(VideoParams::new(VideoCodec::Mpeg2))
            .build()
            .unwrap();
        let video = muxer.video_handle().unwrap();
        assert!(matches!(
            muxer.write_frame(video, &[0], true, Some(f64::NAN), None),
            Err(MuxError::InvalidTimestampHint { .. })
        ));
        assert!(matches!(
            muxer.write_frame(StreamHandle(7), &[0], true, None, None),
            Err(MuxError::UnknownStream(7))
        ));
    }
}
