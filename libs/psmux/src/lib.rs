//! # psmux
//!
//! **MPEG-1/MPEG-2 Program Stream multiplexer with DVD and (S)VCD profiles.**
//!
//! psmux interleaves already-encoded video and audio elementary streams into
//! a program stream a hardware player can decode with bounded buffering:
//! pack headers carrying a modeled System Clock Reference, system headers,
//! PES packets with reconstructed PTS/DTS, and profile specific framing such
//! as DVD navigation packs.
//!
//! ## What psmux does
//!
//! - Accepts MPEG-1/2 and MPEG-4 Part 2 video, one picture per call
//! - Accepts MPEG audio layers I-III, AC-3 and ADTS AAC as arbitrary byte slices
//! - Recovers presentation order from temporal references, including
//!   counter wraparound and variable display durations
//! - Optionally injects soft telecine (3:2 pulldown, film to PAL)
//! - Writes fixed size packets for DVD, xvcd and xsvcd, or generic MPEG-1/2
//!
//! ## What psmux does NOT do
//!
//! - Encode, decode or verify elementary streams
//! - Transport streams
//! - Demux
//!
//! # Example
//!
//! ```no_run
//! use psmux::api::{AudioCodec, AudioParams, MuxerBuilder, VideoCodec, VideoParams};
//! use std::fs::File;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = File::create("out.mpg")?;
//! let mut muxer = MuxerBuilder::new(file)
//!     .options("format=dvd:vaspect=16/9")
//!     .video(VideoParams::new(VideoCodec::Mpeg2))
//!     .audio(AudioParams::new(AudioCodec::Ac3, 48_000))
//!     .build()?;
//!
//! // Hand over encoded pictures and audio bytes as they come.
//! // muxer.write_frame(video, &picture, is_keyframe, None, None)?;
//!
//! let stats = muxer.finalize()?;
//! println!("{:.2}% overhead", stats.overhead_percent());
//! # Ok(())
//! # }
//! ```

pub mod api;

pub mod clock;

// Elementary stream analysis (headers only, no decoding)
pub mod codec;

pub mod config;

pub mod error;

pub mod invariant;

pub mod muxer;

pub mod profile;

pub mod queue;

pub mod rendezvous;

pub mod scheduler;

pub mod timestamp;

pub use api::{
    AudioCodec, AudioParams, Muxer, MuxerBuilder, MuxerStats, StreamHandle, StreamKind,
    StreamParams, VideoCodec, VideoParams,
};
pub use clock::FrameRate;
pub use config::{MuxerConfig, ResolvedConfig, Telecine};
pub use error::{ConfigError, MuxError, ParseError};
pub use profile::FormatProfile;
