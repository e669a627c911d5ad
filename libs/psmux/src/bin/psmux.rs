use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use psmux::api::{AudioCodec, AudioParams, MuxerBuilder, MuxerStats, VideoCodec, VideoParams};
use psmux::assert_invariant;
use psmux::clock::FrameRate;
use psmux::codec::{AudioFraming, StartCodeIter, ac3, aac, mpa, mpeg12, split_video};
use psmux::config::MuxerConfig;
use psmux::profile::FormatProfile;

/// Audio is handed to the muxer in slices of this size.
const AUDIO_CHUNK: usize = 4096;

/// psmux - MPEG program stream multiplexer
///
/// Interleaves MPEG-1/2/4 video and MPEG audio, AC-3 or AAC into an MPEG-1
/// or MPEG-2 program stream, with DVD and (S)VCD profiles.
#[derive(Parser)]
#[command(name = "psmux")]
#[command(version, about, long_about)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Output to JSON (for automation)
    #[arg(long)]
    json: bool,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Multiplex elementary stream files into a program stream
    #[command(alias = "m")]
    Mux {
        /// Raw video elementary stream (.m1v, .m2v, .m4v)
        #[arg(short, long)]
        video: Option<PathBuf>,

        /// Raw audio elementary stream (.mp2, .mp3, .ac3, .aac), repeatable
        #[arg(short, long)]
        audio: Vec<PathBuf>,

        /// Output program stream
        #[arg(short, long)]
        output: PathBuf,

        /// Format profile: mpeg1, mpeg2, dvd, xvcd, xsvcd
        #[arg(short, long)]
        format: Option<String>,

        /// Muxer options, `key=value:key:...`
        #[arg(long)]
        opts: Option<String>,

        /// Video frame rate when the bitstream does not carry one
        #[arg(long)]
        fps: Option<FrameRate>,

        /// Video codec (auto-detected if not specified)
        #[arg(long)]
        video_codec: Option<VideoCodec>,
    },

    /// Display codec and frame information of an elementary stream
    #[command(alias = "i")]
    Info {
        /// Input file to analyze
        input: PathBuf,
    },

    /// List the format profiles
    Profiles,
}

struct ProgressReporter {
    progress: Option<ProgressBar>,
    video_frames: u64,
    audio_bytes: u64,
}

impl ProgressReporter {
    fn new(enabled: bool) -> Self {
        let progress = enabled.then(|| {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            {
                pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
            }
            pb.set_message("Muxing...");
            pb
        });
        Self {
            progress,
            video_frames: 0,
            audio_bytes: 0,
        }
    }

    fn update(&mut self, video_frames: u64, audio_bytes: u64) {
        self.video_frames += video_frames;
        self.audio_bytes += audio_bytes;
        if let Some(pb) = &self.progress {
            pb.set_message(format!(
                "Muxing... (video frames: {}, audio bytes: {})",
                self.video_frames, self.audio_bytes
            ));
            pb.tick();
        }
    }

    fn finish(self) {
        if let Some(pb) = self.progress {
            pb.finish_with_message("Muxing complete");
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Mux {
            video,
            audio,
            output,
            format,
            opts,
            fps,
            video_codec,
        } => {
            let progress = ProgressReporter::new(!cli.no_progress && !cli.json);
            let job = MuxJob {
                video,
                video_codec,
                audio,
                output,
                format,
                opts,
                fps,
            };
            mux_command(job, progress, cli.json)
        }
        Commands::Info { input } => info_command(&input, cli.json),
        Commands::Profiles => profiles_command(cli.json),
    }
}

struct MuxJob {
    video: Option<PathBuf>,
    video_codec: Option<VideoCodec>,
    audio: Vec<PathBuf>,
    output: PathBuf,
    format: Option<String>,
    opts: Option<String>,
    fps: Option<FrameRate>,
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Identifies a raw video elementary stream from its first start codes.
fn detect_video(data: &[u8]) -> Option<VideoCodec> {
    let mut codes = StartCodeIter::new(data);
    let (pos, first) = codes.next()?;
    match first {
        mpeg12::SEQUENCE_HEADER => {
            let mpeg2 = StartCodeIter::new(&data[pos..])
                .take(8)
                .any(|(p, code)| {
                    code == mpeg12::EXTENSION && data.get(pos + p + 4).is_some_and(|b| b >> 4 == 1)
                });
            Some(if mpeg2 { VideoCodec::Mpeg2 } else { VideoCodec::Mpeg1 })
        }
        0x00..=0x2f | 0xb0 | 0xb5 => Some(VideoCodec::Mpeg4),
        _ => None,
    }
}

/// Identifies a raw audio elementary stream from its first sync word.
/// Returns the codec and the sample rate of the first frame.
fn detect_audio(data: &[u8]) -> Option<(AudioCodec, u32)> {
    for i in 0..data.len().saturating_sub(7) {
        let rest = &data[i..];
        if ac3::Ac3Framing::is_sync(rest) {
            if let Ok(info) = ac3::Ac3Framing.parse(rest) {
                return Some((AudioCodec::Ac3, info.sample_rate));
            }
        }
        if aac::AdtsFraming::is_sync(rest) {
            if let Ok(header) = aac::AdtsHeader::parse(rest) {
                return Some((AudioCodec::Aac, header.sample_rate));
            }
        }
        if let Ok(header) = mpa::MpaHeader::parse(rest) {
            let codec = match header.layer {
                1 => AudioCodec::Mp1,
                2 => AudioCodec::Mp2,
                _ => AudioCodec::Mp3,
            };
            return Some((codec, header.sample_rate));
        }
    }
    None
}

fn mux_command(job: MuxJob, mut progress: ProgressReporter, json: bool) -> Result<()> {
    if job.video.is_none() && job.audio.is_empty() {
        bail!("At least one of --video or --audio must be specified");
    }

    let mut config = match &job.opts {
        Some(opts) => MuxerConfig::from_options(opts),
        None => MuxerConfig::default(),
    };
    if let Some(format) = job.format {
        config = config.with_format(format);
    }

    let output = File::create(&job.output)
        .with_context(|| format!("Failed to create output file: {}", job.output.display()))?;
    let mut builder = MuxerBuilder::new(BufWriter::new(output)).config(config);

    let video = match &job.video {
        Some(path) => {
            let data = read_input(path)?;
            let codec = match job.video_codec.or_else(|| detect_video(&data)) {
                Some(codec) => codec,
                None => bail!("Cannot detect the video codec of {}", path.display()),
            };
            let mut params = VideoParams::new(codec);
            if let Some(fps) = job.fps {
                params = params.with_frame_rate(fps);
            }
            builder = builder.video(params);
            Some((codec, data))
        }
        None => None,
    };

    let mut audio = Vec::new();
    for path in &job.audio {
        let data = read_input(path)?;
        let Some((codec, sample_rate)) = detect_audio(&data) else {
            bail!("Cannot detect the audio codec of {}", path.display());
        };
        builder = builder.audio(AudioParams::new(codec, sample_rate));
        audio.push(data);
    }

    let mut muxer = builder.build().context("Failed to set up the muxer")?;
    let video_handle = muxer.video_handle();
    let audio_handles = muxer.audio_handles();

    let frames = match (&video, video_handle) {
        (Some((codec, data)), Some(_)) => split_video(data, *codec),
        _ => Vec::new(),
    };

    // feed audio in step with video so the queues stay short
    let mut audio_sent = vec![0usize; audio.len()];
    let steps = frames.len().max(1);
    for step in 0..steps {
        if let (Some(handle), Some(frame)) = (video_handle, frames.get(step)) {
            muxer
                .write_frame(handle, frame, step == 0, None, None)
                .with_context(|| format!("Failed to write video frame {step}"))?;
            progress.update(1, 0);
        }
        for ((data, sent), handle) in audio.iter().zip(audio_sent.iter_mut()).zip(&audio_handles) {
            let target = data.len() * (step + 1) / steps;
            while *sent < target {
                let end = (*sent + AUDIO_CHUNK).min(target);
                muxer
                    .write_frame(*handle, &data[*sent..end], false, None, None)
                    .context("Failed to write audio")?;
                progress.update(0, (end - *sent) as u64);
                *sent = end;
            }
        }
    }

    let stats = muxer.finalize().context("Failed to finalize the program stream")?;
    let mut sink = muxer.into_inner();
    sink.flush().context("Failed to flush the output")?;
    drop(sink);
    progress.finish();

    let written = std::fs::metadata(&job.output)
        .with_context(|| format!("Failed to stat {}", job.output.display()))?
        .len();
    assert_invariant!(
        written == stats.bytes_written,
        "Output file holds every byte the muxer wrote",
        "cli::mux_command"
    );

    print_stats(&stats, &job.output, json)
}

fn print_stats(stats: &MuxerStats, output: &Path, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    println!("Wrote {}", output.display());
    println!("   Bytes:      {}", stats.bytes_written);
    println!("   Packs:      {}", stats.packs);
    println!("   Video:      {} frames", stats.video_frames);
    println!(
        "   Audio:      {} frames ({} dropped)",
        stats.audio_frames, stats.dropped_audio_frames
    );
    println!("   Duration:   {:.3} s", stats.duration_secs);
    println!("   Overhead:   {:.2}%", stats.overhead_percent());
    println!("   Mux rate:   {} kbit/s", stats.muxrate / 125);
    if stats.muxrate_raises > 0 {
        println!(
            "   Warning:    mux rate raised {} times after decoder buffer underflow",
            stats.muxrate_raises
        );
    }
    if stats.suppressed_timestamps > 0 {
        println!(
            "   Warning:    {} timestamps suppressed, mux rate may be too low",
            stats.suppressed_timestamps
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct InfoReport {
    file: String,
    kind: &'static str,
    codec: String,
    frames: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_rate_code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
}

fn info_command(input: &Path, json: bool) -> Result<()> {
    let data = read_input(input)?;
    let file = input.display().to_string();

    let report = if let Some(codec) = detect_video(&data) {
        let header = StartCodeIter::new(&data)
            .find(|(_, code)| *code == mpeg12::SEQUENCE_HEADER)
            .and_then(|(pos, _)| mpeg12::parse_sequence_header(&data[pos..]).ok());
        let code = header.map(|h| h.frame_rate_code);
        InfoReport {
            file,
            kind: "video",
            codec: codec.to_string(),
            frames: split_video(&data, codec).len(),
            frame_rate_code: code,
            frame_rate: code.and_then(FrameRate::from_code).map(|r| r.as_f64()),
            sample_rate: None,
        }
    } else if let Some((codec, sample_rate)) = detect_audio(&data) {
        let params = AudioParams::new(codec, sample_rate);
        let mut parser = psmux::codec::ElementaryStreamParser::for_audio(&params);
        let scan = parser.scan_audio(&data);
        let frames = scan
            .units
            .iter()
            .filter(|u| matches!(u, psmux::codec::AudioUnit::Frame { .. }))
            .count();
        InfoReport {
            file,
            kind: "audio",
            codec: codec.to_string(),
            frames,
            frame_rate_code: None,
            frame_rate: None,
            sample_rate: Some(sample_rate),
        }
    } else {
        bail!("Unrecognized elementary stream: {}", input.display());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.file);
        println!("   Type:   {} ({})", report.kind, report.codec);
        println!("   Frames: {}", report.frames);
        if let (Some(code), Some(rate)) = (report.frame_rate_code, report.frame_rate) {
            println!("   Rate:   {rate:.3} fps (code {code})");
        }
        if let Some(rate) = report.sample_rate {
            println!("   Rate:   {rate} Hz");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ProfileReport {
    name: &'static str,
    mpeg2: bool,
    packet_size: usize,
    muxrate: u32,
    nav_packs: bool,
    program_stream_map: bool,
    timestamps_all_frames: bool,
}

fn profiles_command(json: bool) -> Result<()> {
    let reports: Vec<ProfileReport> = FormatProfile::ALL
        .iter()
        .map(|p| ProfileReport {
            name: p.name(),
            mpeg2: p.is_mpeg2(),
            packet_size: p.packet_size(),
            muxrate: p.default_muxrate(),
            nav_packs: p.nav_packs(),
            program_stream_map: p.program_stream_map(),
            timestamps_all_frames: p.timestamps_all_frames(),
        })
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    println!("{:<8} {:>6} {:>8} {:>10}  extras", "name", "mpeg", "packet", "bytes/s");
    for r in &reports {
        let mut extras = Vec::new();
        if r.nav_packs {
            extras.push("nav");
        }
        if r.program_stream_map {
            extras.push("psm");
        }
        if r.timestamps_all_frames {
            extras.push("tsaf");
        }
        println!(
            "{:<8} {:>6} {:>8} {:>10}  {}",
            r.name,
            if r.mpeg2 { 2 } else { 1 },
            r.packet_size,
            r.muxrate,
            extras.join(",")
        );
    }
    Ok(())
}
