//! The program stream session.
//!
//! [`PsWriter`] owns everything between parsed frames and the sink: the
//! per-stream queues and clocks, the System Clock Reference, the flush
//! scheduler and the packetizer. It sits behind the [`Rendezvous`] of
//! [`crate::api::Muxer`], which guarantees that [`ContainerWriter::write_header`]
//! runs once every stream has delivered its first frame.
//!
//! Video is written one group (I-frame up to the next I-frame) at a time,
//! interleaved with the audio that covers the same span. Within a flush the
//! next packet goes to the stream with the earliest pending decode time whose
//! decoder buffer has room for it. When no buffer has room the SCR idles
//! forward until one drains; when a frame is decoded before all of its bytes
//! arrived the mux rate is raised by a tenth.
//!
//! [`Rendezvous`]: crate::rendezvous::Rendezvous

pub mod pack;

use std::io::Write;

use tracing::{debug, info, trace, warn};

use crate::api::{AudioCodec, MuxerStats, StreamKind, StreamParams, VideoCodec};
use crate::assert_invariant;
use crate::clock::{
    CLOCK_HZ, FrameRate, MAX_DECODER_LEAD, MAX_TIMESTAMP_GAP, sample_duration, ticks_to_secs,
};
use crate::codec::{AudioUnit, ElementaryStreamParser, StartCodeIter, VideoMeta, mpeg12};
use crate::config::ResolvedConfig;
use crate::error::MuxError;
use crate::profile::{BufferScale, StreamBound};
use crate::queue::{Frame, FrameKind, FrameQueue};
use crate::rendezvous::{Chunk, ContainerWriter};
use crate::scheduler::{AudioBudget, DecoderBuffer, Scheduler};
use crate::timestamp::{AudioClock, Mpeg4Clock, VideoClock};

use pack::{
    END_CODE, MAX_STUFFING, PADDING_HEADER_LEN, PRIVATE_STREAM_1, PesHeader, PsmEntry,
    SystemHeader, build_nav_pack, build_pack_header, build_padding, build_psm,
    build_system_header,
};

const MAX_AUDIO_STREAMS: usize = 16;
const VIDEO_STREAM_ID: u8 = 0xe0;
const MPEG_AUDIO_STREAM_ID: u8 = 0xc0;
const AC3_SUBSTREAM_ID: u8 = 0x80;
const PRIVATE_HEADER_LEN: usize = 4;
const FALLBACK_FRAME_RATE: FrameRate = FrameRate::new(25, 1);

#[derive(Debug)]
enum Timing {
    Group(VideoClock),
    Vop(Mpeg4Clock),
    Audio(AudioClock),
}

/// Per-stream state.
#[derive(Debug)]
struct StreamContext {
    params: StreamParams,
    kind: StreamKind,
    stream_id: u8,
    /// AC-3 substream id inside private stream 1.
    substream: Option<u8>,
    parser: ElementaryStreamParser,
    queue: FrameQueue,
    timing: Timing,
    /// Nominal frame duration, ticks.
    nominal: u64,
    scale: BufferScale,
    /// Declared decoder buffer bound, bytes.
    bound: u32,
    buffer: DecoderBuffer,
    /// The next packet carries the P-STD buffer field.
    std_pending: bool,
    /// Audio bytes per second.
    byterate: u32,
    budget: AudioBudget,
    /// Junk seen before the first audio frame.
    pending_junk: Vec<u8>,
    frames: u64,
    dropped: u64,
}

impl StreamContext {
    fn private_header_len(&self) -> usize {
        if self.substream.is_some() { PRIVATE_HEADER_LEN } else { 0 }
    }

    /// Index of the first frame with unwritten bytes among the first `limit`.
    fn cursor(&self, limit: usize) -> Option<usize> {
        self.queue
            .iter()
            .take(limit)
            .position(|f| !f.is_consumed())
    }

    /// Decode time of the next unwritten byte.
    fn next_dts(&self, limit: usize) -> Option<u64> {
        self.cursor(limit)
            .and_then(|i| self.queue.get(i))
            .map(|f| f.dts)
    }

    fn psm_entry(&self) -> PsmEntry {
        let (stream_type, format) = match self.params {
            StreamParams::Video(v) => match v.codec {
                VideoCodec::Mpeg1 => (0x01, *b"mpgv"),
                VideoCodec::Mpeg2 => (0x02, *b"mpgv"),
                VideoCodec::Mpeg4 => (0x10, *b"mp4v"),
            },
            StreamParams::Audio(a) => match a.codec {
                AudioCodec::Mp1 | AudioCodec::Mp2 | AudioCodec::Mp3 => (0x03, *b"mpga"),
                AudioCodec::Aac => (0x0f, *b"mp4a"),
                AudioCodec::Ac3 => (0x81, *b"AC-3"),
            },
        };
        PsmEntry {
            stream_type,
            stream_id: self.stream_id,
            format,
        }
    }
}

/// Offset of the first frame starting within the next `window` unwritten
/// bytes, with the frame's index.
fn first_start(queue: &FrameQueue, limit: usize, window: usize) -> Option<(usize, usize)> {
    let mut offset = 0;
    for (i, frame) in queue.iter().enumerate().take(limit) {
        if frame.is_consumed() {
            continue;
        }
        if offset >= window {
            break;
        }
        if frame.untouched() {
            return Some((i, offset));
        }
        offset += frame.remaining();
    }
    None
}

fn count_starts(queue: &FrameQueue, limit: usize, window: usize) -> usize {
    let mut offset = 0;
    let mut count = 0;
    for frame in queue.iter().take(limit) {
        if frame.is_consumed() {
            continue;
        }
        if offset >= window {
            break;
        }
        if frame.untouched() {
            count += 1;
        }
        offset += frame.remaining();
    }
    count
}

/// Outcome of choosing the next packet of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pick<K> {
    Stream(K),
    /// Every candidate's decoder buffer is full.
    Wait,
}

/// A packet decided but not yet written.
#[derive(Debug)]
struct PacketPlan {
    header: PesHeader,
    payload: usize,
    padding: usize,
    private: Option<[u8; PRIVATE_HEADER_LEN]>,
    /// Decode time of a timestamp that was due but fell behind the SCR.
    suppressed: Option<u64>,
    /// Offset of the timestamped frame in the payload.
    stamped_offset: Option<usize>,
}

/// Writes an MPEG program stream to `W`.
#[derive(Debug)]
pub struct PsWriter<W: Write> {
    sink: W,
    config: ResolvedConfig,
    streams: Vec<StreamContext>,
    video: Option<usize>,
    scheduler: Scheduler,
    scr: u64,
    delta_scr: u64,
    /// Mux rate in bytes per second, raised on decoder buffer underflow.
    muxrate: u32,
    system_header_dirty: bool,
    header_written: bool,
    lag_reported: bool,
    last_video_timestamp: Option<u64>,
    first_pts: Option<u64>,
    last_end: u64,
    stats: MuxerStats,
}

impl<W: Write> PsWriter<W> {
    pub fn new(sink: W, config: ResolvedConfig) -> Self {
        let delta_scr = pack_duration(config.packet_size, config.muxrate);
        let muxrate = config.muxrate;
        Self {
            sink,
            config,
            streams: Vec::new(),
            video: None,
            scheduler: Scheduler::new(),
            scr: 0,
            delta_scr,
            muxrate,
            system_header_dirty: false,
            header_written: false,
            lag_reported: false,
            last_video_timestamp: None,
            first_pts: None,
            last_end: 0,
            stats: MuxerStats::default(),
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Creates the context of a new stream and returns its index.
    pub fn add_stream(&mut self, params: StreamParams) -> Result<usize, MuxError> {
        let profile = self.config.profile;
        let index = self.streams.len();
        let context = match params {
            StreamParams::Video(v) => {
                if self.video.is_some() {
                    return Err(MuxError::StreamLimit("one video stream"));
                }
                let rate = v
                    .frame_rate
                    .or(self.config.vframerate)
                    .unwrap_or(FALLBACK_FRAME_RATE);
                let nominal = rate.frame_duration();
                let anchor = self.config.video_anchor();
                let timing = match v.codec {
                    VideoCodec::Mpeg4 => Timing::Vop(Mpeg4Clock::new(anchor, nominal)),
                    VideoCodec::Mpeg1 | VideoCodec::Mpeg2 => Timing::Group(VideoClock::new(anchor)),
                };
                let bound = self
                    .config
                    .vbuf_size
                    .unwrap_or(profile.default_buffer(StreamKind::Video, false))
                    .min(profile.max_video_buffer());
                self.video = Some(index);
                StreamContext {
                    params,
                    kind: StreamKind::Video,
                    stream_id: VIDEO_STREAM_ID,
                    substream: None,
                    parser: ElementaryStreamParser::for_video(v.codec, &self.config),
                    queue: FrameQueue::new(),
                    timing,
                    nominal,
                    scale: BufferScale::for_stream(StreamKind::Video, false),
                    bound,
                    buffer: DecoderBuffer::new(bound),
                    std_pending: profile.std_in_first_packet(),
                    byterate: v.bitrate.map_or(0, |b| b / 8),
                    budget: AudioBudget::new(),
                    pending_junk: Vec::new(),
                    frames: 0,
                    dropped: 0,
                }
            }
            StreamParams::Audio(a) => {
                let audio: Vec<&StreamContext> = self
                    .streams
                    .iter()
                    .filter(|s| s.kind == StreamKind::Audio)
                    .collect();
                if audio.len() >= MAX_AUDIO_STREAMS {
                    return Err(MuxError::StreamLimit("16 audio streams"));
                }
                let private = a.codec.is_private();
                let same_family = audio
                    .iter()
                    .filter(|s| s.substream.is_some() == private)
                    .count() as u8;
                let (stream_id, substream) = if private {
                    (PRIVATE_STREAM_1, Some(AC3_SUBSTREAM_ID + same_family))
                } else {
                    (MPEG_AUDIO_STREAM_ID + same_family, None)
                };
                if private && profile.is_vcd() {
                    warn!(codec = %a.codec, profile = %profile, "private stream audio on a VCD profile");
                }
                let bound = self
                    .config
                    .abuf_size
                    .unwrap_or(profile.default_buffer(StreamKind::Audio, private));
                StreamContext {
                    params,
                    kind: StreamKind::Audio,
                    stream_id,
                    substream,
                    parser: ElementaryStreamParser::for_audio(&a),
                    queue: FrameQueue::new(),
                    timing: Timing::Audio(AudioClock::new(
                        self.config.audio_anchor(),
                        self.config.audio_drop_window(),
                    )),
                    nominal: 0,
                    scale: BufferScale::for_stream(StreamKind::Audio, private),
                    bound,
                    buffer: DecoderBuffer::new(bound),
                    std_pending: profile.std_in_first_packet(),
                    byterate: a.bitrate.map_or(0, |b| b / 8),
                    budget: AudioBudget::new(),
                    pending_junk: Vec::new(),
                    frames: 0,
                    dropped: 0,
                }
            }
        };
        debug!(
            stream = index,
            id = format_args!("{:#04x}", context.stream_id),
            kind = %context.kind,
            "stream registered"
        );
        self.streams.push(context);
        Ok(index)
    }

    fn audio_streams(&self) -> impl Iterator<Item = usize> + '_ {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == StreamKind::Audio)
            .map(|(i, _)| i)
    }

    /// Raises a generic profile's video buffer bound to the VBV size the
    /// bitstream asks for.
    fn raise_video_bound(&mut self, index: usize, vbv: u32) {
        let profile = self.config.profile;
        if !profile.is_generic() || self.config.vbuf_size.is_some() {
            return;
        }
        let wanted = vbv.min(profile.max_video_buffer());
        let stream = &mut self.streams[index];
        if wanted > stream.bound {
            debug!(from = stream.bound, to = wanted, "video buffer bound raised");
            stream.bound = wanted;
            stream.buffer.set_capacity(wanted);
            if self.header_written {
                self.system_header_dirty = true;
            }
        }
    }

    /// Delays all queued and future audio by `offset`.
    fn shift_audio(&mut self, offset: u64) {
        if offset == 0 {
            return;
        }
        debug!(offset = ticks_to_secs(offset), "audio delayed to match video");
        for stream in self.streams.iter_mut() {
            if let Timing::Audio(clock) = &mut stream.timing {
                clock.shift(offset);
                for frame in stream.queue.iter_mut() {
                    frame.pts += offset;
                    frame.dts += offset;
                }
            }
        }
    }

    fn ingest_video(&mut self, index: usize, chunk: Chunk) -> Result<(), MuxError> {
        let mut data = chunk.data;
        let stream = &mut self.streams[index];

        if data.is_empty() {
            // skipped picture
            let nominal = stream.nominal;
            match stream.queue.back_mut() {
                Some(back) if !back.timestamped => back.duration += nominal,
                _ => match &mut stream.timing {
                    Timing::Group(clock) => clock.skip(nominal),
                    Timing::Vop(_) | Timing::Audio(_) => {}
                },
            }
            trace!(stream = index, "skipped picture");
            return Ok(());
        }

        let meta = match stream.parser.parse_video(&mut data) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(stream = index, "video frame header: {e}");
                VideoMeta::default()
            }
        };
        let kind = match meta.kind {
            FrameKind::Unknown if chunk.is_keyframe => FrameKind::I,
            FrameKind::Unknown => FrameKind::P,
            kind => kind,
        };

        let rate = meta.frame_rate.or(match &stream.parser {
            ElementaryStreamParser::Mpeg12Video(p) => p.frame_rate(),
            _ => None,
        });
        if let Some(rate) = rate {
            stream.nominal = rate.frame_duration();
        }
        let duration = stream.nominal * meta.display_percent as u64 / 100;

        let mut frame = Frame::new(data, kind, duration);
        frame.temporal_reference = meta.temporal_reference;

        let mut inferred = None;
        if let Timing::Vop(clock) = &mut stream.timing {
            let known = clock.frame_duration().is_some();
            clock.stamp(&mut frame, meta.vop_time);
            stream.queue.push(frame)?;
            if !known && stream.queue.len() >= 3 {
                let mut first: Vec<&mut Frame> = stream.queue.iter_mut().take(3).collect();
                inferred = clock.infer_duration(&mut first);
            }
        } else {
            stream.queue.push(frame)?;
        }
        stream.frames += 1;
        self.stats.video_frames += 1;

        if let Some(gap) = inferred {
            self.shift_audio(gap);
        }
        if let Some(vbv) = meta.vbv_buffer_size {
            self.raise_video_bound(index, vbv);
        }
        self.scheduler.observe(&self.streams[index].queue);
        Ok(())
    }

    fn ingest_audio(&mut self, index: usize, chunk: Chunk) -> Result<(), MuxError> {
        let stream = &mut self.streams[index];
        let result = stream.parser.scan_audio(&chunk.data);
        for e in &result.errors {
            warn!(stream = index, "audio: {e}");
        }
        for unit in result.units {
            match unit {
                AudioUnit::Junk(bytes) => match stream.queue.back_mut() {
                    Some(back) => back.append(&bytes)?,
                    None => stream.pending_junk.extend_from_slice(&bytes),
                },
                AudioUnit::Frame { data, info } => {
                    let duration = sample_duration(info.samples, info.sample_rate);
                    let Timing::Audio(clock) = &mut stream.timing else {
                        continue;
                    };
                    let Some(pts) = clock.stamp(duration) else {
                        stream.dropped += 1;
                        self.stats.dropped_audio_frames += 1;
                        debug!(stream = index, "audio frame inside the drop window discarded");
                        continue;
                    };
                    let mut frame = Frame::new(data, FrameKind::Unknown, duration);
                    frame.pts = pts;
                    frame.dts = pts;
                    frame.timestamped = true;
                    if !stream.pending_junk.is_empty() {
                        let junk = std::mem::take(&mut stream.pending_junk);
                        frame.prepend(&junk)?;
                    }
                    if stream.byterate == 0 {
                        stream.byterate = probed_byterate(info.frame_len, info.sample_rate, info.samples);
                    }
                    stream.queue.push(frame)?;
                    stream.frames += 1;
                    self.stats.audio_frames += 1;
                }
            }
        }
        Ok(())
    }

    /// Payload bytes of a timestamped audio packet of stream `index`.
    fn audio_unit(&self, index: usize) -> usize {
        let profile = self.config.profile;
        let stream = &self.streams[index];
        let header = PesHeader {
            stream_id: stream.stream_id,
            mpeg2: profile.is_mpeg2(),
            pts: Some(0),
            ..Default::default()
        };
        let pes = header
            .encoded_len()
            .max(profile.min_pes_header_len(StreamKind::Audio));
        self.config
            .packet_size
            .saturating_sub(profile.pack_header_len() + pes + stream.private_header_len())
    }

    fn wants_timestamp(&self, kind: StreamKind, frame: &Frame) -> bool {
        match kind {
            StreamKind::Audio => true,
            StreamKind::Video => {
                frame.kind == FrameKind::I
                    || self.config.tsaf
                    || self.config.profile.timestamps_all_frames()
                    || self
                        .last_video_timestamp
                        .is_none_or(|last| frame.dts.saturating_sub(last) >= MAX_TIMESTAMP_GAP)
            }
        }
    }

    /// Moves the SCR to the next pack and returns it.
    fn advance_scr(&mut self, next_dts: Option<u64>) -> u64 {
        let previous = self.scr;
        if self.stats.packs > 0 {
            self.scr += self.delta_scr;
        }
        if let Some(dts) = next_dts {
            let floor = dts.saturating_sub(MAX_DECODER_LEAD);
            if floor > self.scr {
                if self.lag_reported {
                    trace!(scr = ticks_to_secs(self.scr), dts = ticks_to_secs(dts), "SCR raised");
                } else {
                    warn!(
                        scr = ticks_to_secs(self.scr),
                        dts = ticks_to_secs(dts),
                        "SCR lags decode time by more than 0.7 s, raised"
                    );
                    self.lag_reported = true;
                }
                self.scr = floor;
            }
        }
        assert_invariant!(self.scr >= previous, "SCR is non-decreasing", "advance_scr");
        self.stats.packs += 1;
        self.drain_buffers();
        self.scr
    }

    /// Removes the frames decoded by the current SCR from every decoder
    /// buffer, raising the mux rate if any of them ran dry.
    fn drain_buffers(&mut self) {
        let scr = self.scr;
        let mut underflow = false;
        for stream in self.streams.iter_mut() {
            underflow |= stream.buffer.drain(scr);
        }
        if !underflow {
            return;
        }
        let from = self.muxrate;
        self.muxrate = self.muxrate.saturating_add(self.muxrate / 10);
        self.delta_scr = pack_duration(self.config.packet_size, self.muxrate);
        self.stats.muxrate_raises += 1;
        warn!(
            scr = ticks_to_secs(scr),
            from,
            to = self.muxrate,
            "decoder buffer underflow, mux rate raised"
        );
        if self.config.profile.is_generic() && self.header_written {
            self.system_header_dirty = true;
        }
    }

    /// Advances the SCR by one pack without writing anything, letting the
    /// decoders consume.
    fn idle(&mut self) {
        self.scr += self.delta_scr;
        self.stats.decoder_waits += 1;
        trace!(scr = ticks_to_secs(self.scr), "decoder buffers full, SCR idles");
        self.drain_buffers();
    }

    /// Chooses among `(stream, decode time, key)` candidates, in priority
    /// order, the earliest whose decoder buffer takes another packet.
    fn pick<K: Copy>(&self, candidates: &[(usize, u64, K)]) -> Option<Pick<K>> {
        if candidates.is_empty() {
            return None;
        }
        let mut best: Option<(u64, K)> = None;
        for &(index, dts, key) in candidates {
            let stream = &self.streams[index];
            let bytes = stream.queue.total_bytes().min(self.config.packet_size);
            if !stream.buffer.fits(bytes) {
                continue;
            }
            if best.is_none_or(|(earliest, _)| dts < earliest) {
                best = Some((dts, key));
            }
        }
        Some(best.map_or(Pick::Wait, |(_, key)| Pick::Stream(key)))
    }

    fn system_header(&self) -> Vec<u8> {
        let profile = self.config.profile;
        let (csps, audio_lock, video_lock) = profile.system_flags();
        let largest = |private: bool| {
            self.streams
                .iter()
                .filter(|s| s.kind == StreamKind::Audio && s.substream.is_some() == private)
                .map(|s| s.bound)
                .max()
        };
        let video = self.video.map_or_else(
            || {
                self.config
                    .vbuf_size
                    .unwrap_or(profile.default_buffer(StreamKind::Video, false))
                    .min(profile.max_video_buffer())
            },
            |index| self.streams[index].bound,
        );
        let audio = largest(false).unwrap_or_else(|| {
            self.config
                .abuf_size
                .unwrap_or(profile.default_buffer(StreamKind::Audio, false))
        });
        let private = largest(true).unwrap_or(0);
        let bounds = profile.fixed_bounds(video, audio, private).unwrap_or_else(|| {
            let mut bounds: Vec<StreamBound> = Vec::new();
            for stream in &self.streams {
                match bounds.iter_mut().find(|b| b.stream_id == stream.stream_id) {
                    Some(b) => b.size = b.size.max(stream.bound),
                    None => bounds.push(StreamBound {
                        stream_id: stream.stream_id,
                        scale: stream.scale,
                        size: stream.bound,
                    }),
                }
            }
            bounds
        });
        build_system_header(&SystemHeader {
            muxrate: self.muxrate,
            audio_bound: self.audio_streams().count() as u8,
            video_bound: self.video.is_some() as u8,
            csps,
            audio_lock,
            video_lock,
            mpeg2: profile.is_mpeg2(),
            bounds,
        })
    }

    fn needs_psm(&self) -> bool {
        self.config.profile.program_stream_map()
            && self.streams.iter().any(|s| match s.params {
                StreamParams::Video(v) => v.codec == VideoCodec::Mpeg4,
                StreamParams::Audio(a) => matches!(a.codec, AudioCodec::Aac | AudioCodec::Ac3),
            })
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), MuxError> {
        self.sink.write_all(bytes)?;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn write_nav_pack(&mut self, next_dts: u64) -> Result<(), MuxError> {
        let scr = self.advance_scr(Some(next_dts));
        let pack = build_pack_header(scr, self.muxrate, true);
        let nav = build_nav_pack(&pack, &self.system_header());
        self.stats.header_bytes += nav.len() as u64;
        trace!(scr = ticks_to_secs(scr), "NAV pack");
        self.emit(&nav)
    }

    /// Decides header, payload and padding of the next packet of `index`.
    ///
    /// `limit` restricts the packet to the leading frames of the queue,
    /// `budget` to a byte count unless `borrow` lets it fill the packet.
    fn plan_packet(
        &self,
        index: usize,
        prefix: usize,
        budget: usize,
        limit: usize,
        borrow: bool,
    ) -> PacketPlan {
        let profile = self.config.profile;
        let stream = &self.streams[index];
        let private_len = stream.private_header_len();
        let min_header = profile.min_pes_header_len(stream.kind);
        let aligned = stream
            .cursor(limit)
            .and_then(|i| stream.queue.get(i))
            .is_some_and(Frame::untouched);
        let mut header = PesHeader {
            stream_id: stream.stream_id,
            mpeg2: profile.is_mpeg2(),
            pts: None,
            dts: None,
            std_buffer: stream.std_pending.then_some((stream.scale, stream.bound)),
            aligned,
            stuffing: 0,
        };

        let mut suppressed = None;
        let mut stamped_offset = None;
        if let Some((i, offset)) = first_start(&stream.queue, limit, usize::MAX) {
            if let Some(frame) = stream.queue.get(i) {
                let mut stamped = header;
                stamped.pts = Some(frame.pts);
                stamped.dts = (stream.kind == StreamKind::Video && frame.dts != frame.pts)
                    .then_some(frame.dts);
                let capacity = self.config.packet_size.saturating_sub(
                    prefix + stamped.encoded_len().max(min_header) + private_len,
                );
                let reachable = offset < capacity && (borrow || offset < budget);
                if reachable && self.wants_timestamp(stream.kind, frame) {
                    let decode = stamped.dts.unwrap_or(frame.pts);
                    if decode > self.scr + self.delta_scr {
                        header = stamped;
                        stamped_offset = Some(offset);
                    } else {
                        suppressed = Some(decode);
                    }
                }
            }
        }

        header.stuffing = min_header.saturating_sub(header.encoded_len());
        let capacity = self
            .config
            .packet_size
            .saturating_sub(prefix + header.encoded_len() + private_len);
        let queued = stream.queue.pending_bytes(limit);
        let wanted = if borrow { queued } else { budget.min(queued) };
        let mut payload = wanted.min(capacity);
        let mut padding = 0;
        let shortfall = capacity - payload;
        if shortfall > 0 && !self.config.skip_padding {
            if shortfall < 7 && header.stuffing + shortfall <= MAX_STUFFING {
                header.stuffing += shortfall;
            } else if shortfall >= PADDING_HEADER_LEN {
                padding = shortfall;
            } else {
                payload -= PADDING_HEADER_LEN - shortfall;
                padding = PADDING_HEADER_LEN;
            }
        }

        let private = stream.substream.map(|id| {
            let starts = count_starts(&stream.queue, limit, payload);
            let pointer = first_start(&stream.queue, limit, payload)
                .map_or(0, |(_, offset)| offset + 1) as u16;
            let [hi, lo] = pointer.to_be_bytes();
            [id, starts as u8, hi, lo]
        });

        PacketPlan {
            header,
            payload,
            padding,
            private,
            suppressed,
            stamped_offset,
        }
    }

    /// Writes one pack carrying a packet of stream `index`. Returns the
    /// payload bytes written.
    fn write_packet(
        &mut self,
        index: usize,
        budget: usize,
        limit: usize,
        borrow: bool,
    ) -> Result<usize, MuxError> {
        let profile = self.config.profile;
        let (next_dts, starts_intra) = {
            let stream = &self.streams[index];
            let Some(i) = stream.cursor(limit) else {
                return Ok(0);
            };
            let Some(frame) = stream.queue.get(i) else {
                return Ok(0);
            };
            let intra = stream.kind == StreamKind::Video
                && frame.untouched()
                && frame.kind == FrameKind::I;
            (frame.dts, intra)
        };

        if profile.nav_packs() && (self.stats.packs == 0 || starts_intra) {
            self.write_nav_pack(next_dts)?;
        }

        let scr = self.advance_scr(Some(next_dts));
        let mut out = build_pack_header(scr, self.muxrate, profile.is_mpeg2());
        if self.system_header_dirty && profile.is_generic() {
            out.extend_from_slice(&self.system_header());
            self.system_header_dirty = false;
        }

        let plan = self.plan_packet(index, out.len(), budget, limit, borrow);
        if let Some(decode) = plan.suppressed {
            self.stats.suppressed_timestamps += 1;
            warn!(
                stream = index,
                timestamp = ticks_to_secs(decode),
                scr = ticks_to_secs(scr),
                "timestamp not ahead of the SCR, suppressed"
            );
        }
        if let Some(offset) = plan.stamped_offset {
            assert_invariant!(
                offset < plan.payload.max(1),
                "timestamped frame starts inside its packet",
                "write_packet"
            );
        }

        let private_len = plan.private.map_or(0, |p| p.len());
        out.extend_from_slice(&plan.header.build(private_len + plan.payload));
        if let Some(private) = plan.private {
            out.extend_from_slice(&private);
        }
        let overhead = out.len() - plan.header.stuffing;

        let mut first_pts = None;
        let mut last_end = 0;
        {
            let stream = &mut self.streams[index];
            let mut remaining = plan.payload;
            for frame in stream.queue.iter_mut().take(limit) {
                if remaining == 0 {
                    break;
                }
                if frame.is_consumed() {
                    continue;
                }
                if frame.untouched() {
                    first_pts = Some(first_pts.map_or(frame.pts, |p: u64| p.min(frame.pts)));
                    last_end = last_end.max(frame.pts + frame.duration);
                    stream.buffer.enter(frame.dts, frame.len());
                }
                let bytes = frame.take(remaining);
                remaining -= bytes.len();
                out.extend_from_slice(bytes);
            }
            stream.buffer.add(plan.payload);
            stream.std_pending = false;
        }
        if plan.padding > 0 {
            out.extend_from_slice(&build_padding(plan.padding));
        }

        if !self.config.skip_padding {
            assert_invariant!(
                out.len() == self.config.packet_size,
                "packets fill the profile's packet size",
                "write_packet"
            );
        }
        if let Some(pts) = plan.header.pts {
            let decode = plan.header.dts.unwrap_or(pts);
            assert_invariant!(decode > scr, "SCR precedes every written timestamp", "write_packet");
            if self.streams[index].kind == StreamKind::Video {
                self.last_video_timestamp = Some(decode);
            }
        }

        if let Some(pts) = first_pts {
            self.first_pts = Some(self.first_pts.map_or(pts, |p| p.min(pts)));
            self.last_end = self.last_end.max(last_end);
        }
        self.stats.header_bytes += overhead as u64;
        self.stats.payload_bytes += plan.payload as u64;
        self.stats.padding_bytes += (plan.header.stuffing + plan.padding) as u64;
        trace!(
            stream = index,
            scr = ticks_to_secs(scr),
            payload = plan.payload,
            padding = plan.padding,
            pts = plan.header.pts.map(ticks_to_secs),
            "packet"
        );
        self.emit(&out)?;
        let stream = &mut self.streams[index];
        if stream.kind == StreamKind::Audio {
            stream.queue.pop_consumed();
        }
        Ok(plan.payload)
    }

    /// Flushes the next complete video group with its audio. Returns
    /// whether anything was written.
    fn flush_video_group(&mut self, video: usize) -> Result<bool, MuxError> {
        let timing_known = match &self.streams[video].timing {
            Timing::Vop(clock) => clock.frame_duration().is_some(),
            _ => true,
        };
        let Some(count) = self.scheduler.flushable(&self.streams[video].queue, timing_known)
        else {
            return Ok(false);
        };

        let mut skew = None;
        let group_duration = {
            let stream = &mut self.streams[video];
            match &mut stream.timing {
                Timing::Group(clock) => {
                    let stamped = stream.queue.front().is_some_and(|f| f.timestamped);
                    if !stamped {
                        let mut group: Vec<&mut Frame> =
                            stream.queue.iter_mut().take(count).collect();
                        let timing = clock.assign_group(&mut group);
                        if timing.first {
                            skew = Some(timing.skew);
                        }
                    }
                    stream.queue.iter().take(count).map(|f| f.duration).sum()
                }
                Timing::Vop(clock) => {
                    clock.frame_duration().unwrap_or(stream.nominal) * count as u64
                }
                Timing::Audio(_) => 0,
            }
        };
        if let Some(skew) = skew {
            self.shift_audio(skew);
        }

        let draining = self.scheduler.draining();
        let mut audio_left = Vec::new();
        for index in self.audio_streams().collect::<Vec<_>>() {
            let unit = self.audio_unit(index);
            let stream = &self.streams[index];
            let allowance = stream
                .budget
                .allowance(group_duration, stream.byterate, unit);
            let queued = stream.queue.total_bytes();
            if queued < allowance.bytes && !draining {
                trace!(stream = index, queued, wanted = allowance.bytes, "waiting for audio");
                return Ok(false);
            }
            audio_left.push((index, allowance));
        }
        let mut audio_left: Vec<(usize, usize)> = audio_left
            .into_iter()
            .map(|(index, allowance)| {
                let stream = &mut self.streams[index];
                stream.budget.commit(&allowance);
                (index, allowance.bytes.min(stream.queue.total_bytes()))
            })
            .collect();

        debug!(
            frames = count,
            bytes = self.streams[video].queue.pending_bytes(count),
            duration = ticks_to_secs(group_duration),
            audio = ?audio_left,
            "flushing video group"
        );

        let borrow = !self.config.skip_padding;
        let mut video_left = self.streams[video].queue.pending_bytes(count);
        loop {
            let mut candidates = Vec::new();
            if video_left > 0 {
                if let Some(dts) = self.streams[video].next_dts(count) {
                    candidates.push((video, dts, None));
                }
            }
            for (slot, (index, left)) in audio_left.iter().enumerate() {
                if *left == 0 {
                    continue;
                }
                if let Some(pts) = self.streams[*index].next_dts(usize::MAX) {
                    candidates.push((*index, pts, Some(slot)));
                }
            }
            match self.pick(&candidates) {
                None => break,
                Some(Pick::Wait) => self.idle(),
                Some(Pick::Stream(None)) => {
                    let written = self.write_packet(video, video_left, count, false)?;
                    if written == 0 {
                        break;
                    }
                    video_left -= written;
                }
                Some(Pick::Stream(Some(slot))) => {
                    let (index, left) = audio_left[slot];
                    let written = self.write_packet(index, left, usize::MAX, borrow)?;
                    if written > left {
                        self.streams[index].budget.borrow(written - left);
                        audio_left[slot].1 = 0;
                    } else if written == 0 {
                        audio_left[slot].1 = 0;
                    } else {
                        audio_left[slot].1 = left - written;
                    }
                }
            }
        }

        let popped = self.streams[video].queue.pop_consumed();
        assert_invariant!(popped == count, "flushed group leaves the queue", "flush_video_group");
        self.scheduler.observe(&self.streams[video].queue);
        Ok(true)
    }

    /// Without video, writes one audio packet once every stream has a full
    /// payload queued.
    fn flush_audio(&mut self) -> Result<bool, MuxError> {
        let draining = self.scheduler.draining();
        for index in self.audio_streams() {
            if !draining && self.streams[index].queue.total_bytes() < self.audio_unit(index) {
                return Ok(false);
            }
        }
        self.write_next_audio()
    }

    /// Writes one packet of the audio stream decoded first, or idles when no
    /// decoder has room. Returns false once every audio queue is empty.
    fn write_next_audio(&mut self) -> Result<bool, MuxError> {
        let candidates: Vec<(usize, u64, usize)> = self
            .audio_streams()
            .filter_map(|index| {
                self.streams[index]
                    .next_dts(usize::MAX)
                    .map(|pts| (index, pts, index))
            })
            .collect();
        match self.pick(&candidates) {
            None => Ok(false),
            Some(Pick::Wait) => {
                self.idle();
                Ok(true)
            }
            Some(Pick::Stream(index)) => {
                let queued = self.streams[index].queue.total_bytes();
                Ok(self.write_packet(index, queued, usize::MAX, false)? > 0)
            }
        }
    }

    fn try_flush(&mut self) -> Result<(), MuxError> {
        loop {
            let progressed = match self.video {
                Some(video) => self.flush_video_group(video)?,
                None => self.flush_audio()?,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Drains every queue, writes the end of the stream and returns the
    /// session statistics.
    pub fn finalize(&mut self) -> Result<MuxerStats, MuxError> {
        self.scheduler.begin_drain();
        self.try_flush()?;

        // audio past the last video group
        while self.write_next_audio()? {}

        for (index, stream) in self.streams.iter_mut().enumerate() {
            debug!(stream = index, frames = stream.frames, "stream drained");
            let left = stream.parser.finish_audio();
            if left > 0 {
                debug!(stream = index, bytes = left, "trailing partial audio frame discarded");
            }
            if stream.dropped > 0 {
                warn!(stream = index, frames = stream.dropped, "audio frames dropped");
            }
        }

        self.write_end()?;
        self.sink.flush()?;
        self.scheduler.finish();

        self.stats.muxrate = self.muxrate;
        self.stats.duration_secs = self
            .first_pts
            .map_or(0.0, |first| ticks_to_secs(self.last_end.saturating_sub(first)));
        info!(
            bytes = self.stats.bytes_written,
            packs = self.stats.packs,
            payload = self.stats.payload_bytes,
            padding = self.stats.padding_bytes,
            overhead_percent = format_args!("{:.2}", self.stats.overhead_percent()),
            muxrate = self.muxrate,
            decoder_waits = self.stats.decoder_waits,
            "program stream finished"
        );
        Ok(self.stats)
    }

    fn write_end(&mut self) -> Result<(), MuxError> {
        let profile = self.config.profile;
        if !profile.is_generic() {
            self.stats.header_bytes += END_CODE.len() as u64;
            return self.emit(&END_CODE);
        }
        let scr = self.advance_scr(None);
        let mut out = build_pack_header(scr, self.muxrate, profile.is_mpeg2());
        let padding = self
            .config
            .packet_size
            .saturating_sub(out.len() + END_CODE.len())
            .max(PADDING_HEADER_LEN);
        out.extend_from_slice(&build_padding(padding));
        out.extend_from_slice(&END_CODE);
        self.stats.header_bytes += (out.len() - padding) as u64;
        self.stats.padding_bytes += padding as u64;
        self.emit(&out)
    }
}

/// Ticks one pack of `packet_size` bytes lasts at `muxrate` bytes per second.
fn pack_duration(packet_size: usize, muxrate: u32) -> u64 {
    CLOCK_HZ * packet_size as u64 / muxrate.max(1) as u64
}

/// Bytes per second of a constant bit rate audio stream, from one frame.
fn probed_byterate(frame_len: usize, sample_rate: u32, samples: u32) -> u32 {
    if samples == 0 {
        return 0;
    }
    (frame_len as u64 * sample_rate as u64 / samples as u64) as u32
}

impl<W: Write> ContainerWriter for PsWriter<W> {
    fn fix_stream_parameters(&mut self, stream: usize, first: &Chunk) -> Result<(), MuxError> {
        let context = self
            .streams
            .get_mut(stream)
            .ok_or(MuxError::UnknownStream(stream))?;
        let params = context.params;
        match params {
            StreamParams::Video(v) if v.codec != VideoCodec::Mpeg4 => {
                let header = StartCodeIter::new(&first.data)
                    .find(|(_, code)| *code == mpeg12::SEQUENCE_HEADER)
                    .map(|(pos, _)| mpeg12::parse_sequence_header(&first.data[pos..]));
                match header {
                    Some(Ok(header)) => {
                        if v.frame_rate.is_none() {
                            if let Some(rate) = FrameRate::from_code(header.frame_rate_code) {
                                context.nominal = rate.frame_duration();
                            }
                        }
                        debug!(
                            width = header.width,
                            height = header.height,
                            vbv = header.vbv_buffer_size,
                            "video sequence header"
                        );
                        self.raise_video_bound(stream, header.vbv_buffer_size);
                    }
                    Some(Err(e)) => warn!(stream, "sequence header: {e}"),
                    None => warn!(stream, "first video frame carries no sequence header"),
                }
            }
            StreamParams::Video(_) => {}
            StreamParams::Audio(a) => {
                if context.byterate == 0 {
                    let probe = ElementaryStreamParser::for_audio(&a).scan_audio(&first.data);
                    let info = probe.units.iter().find_map(|unit| match unit {
                        AudioUnit::Frame { info, .. } => Some(*info),
                        AudioUnit::Junk(_) => None,
                    });
                    match info {
                        Some(info) => {
                            context.byterate =
                                probed_byterate(info.frame_len, info.sample_rate, info.samples);
                            debug!(stream, byterate = context.byterate, "audio byte rate probed");
                        }
                        None => debug!(stream, "no complete audio frame in the first chunk"),
                    }
                }
            }
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), MuxError> {
        let profile = self.config.profile;
        info!(
            profile = %profile,
            packet_size = self.config.packet_size,
            muxrate = self.config.muxrate,
            streams = self.streams.len(),
            "program stream started"
        );
        self.header_written = true;
        if !profile.header_pack() {
            return Ok(());
        }
        let scr = self.advance_scr(None);
        let mut out = build_pack_header(scr, self.muxrate, profile.is_mpeg2());
        out.extend_from_slice(&self.system_header());
        if self.needs_psm() {
            let entries: Vec<PsmEntry> = self.streams.iter().map(StreamContext::psm_entry).collect();
            out.extend_from_slice(&build_psm(&entries));
        }
        let header_len = out.len();
        let padding = self.config.packet_size.saturating_sub(header_len);
        if padding >= PADDING_HEADER_LEN {
            out.extend_from_slice(&build_padding(padding));
            self.stats.padding_bytes += padding as u64;
        }
        self.stats.header_bytes += header_len as u64;
        self.emit(&out)
    }

    fn write_chunk(&mut self, stream: usize, chunk: Chunk) -> Result<(), MuxError> {
        let kind = self
            .streams
            .get(stream)
            .ok_or(MuxError::UnknownStream(stream))?
            .kind;
        match kind {
            StreamKind::Video => self.ingest_video(stream, chunk)?,
            StreamKind::Audio => self.ingest_audio(stream, chunk)?,
        }
        self.try_flush()
    }
}
