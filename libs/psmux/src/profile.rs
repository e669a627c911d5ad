//! Per-target constants for the supported Program Stream flavors.

use crate::api::StreamKind;

const KIB: u32 = 1024;

/// Target format of the multiplexed stream.
///
/// A closed set: every other component asks the profile for packet sizes,
/// header emission rules and decoder buffer bounds instead of checking the
/// target by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatProfile {
    /// Generic MPEG-1 system stream.
    Mpeg1,
    /// Generic MPEG-2 program stream.
    #[default]
    Mpeg2,
    /// DVD-Video VOB layout (NAV packs, private stream 1 audio).
    Dvd,
    /// Extended VCD: MPEG-1 system stream with 2324 byte sectors.
    Xvcd,
    /// Extended SVCD: MPEG-2 program stream with 2324 byte sectors.
    Xsvcd,
}

/// An entry of the system header's stream bound table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBound {
    pub stream_id: u8,
    pub scale: BufferScale,
    /// Decoder buffer size in bytes.
    pub size: u32,
}

/// Unit of a P-STD buffer size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferScale {
    /// 128 byte units, used for MPEG audio.
    Bytes128,
    /// 1024 byte units, used for video and private streams.
    Kilobytes,
}

impl BufferScale {
    pub fn for_stream(kind: StreamKind, private_stream: bool) -> Self {
        match (kind, private_stream) {
            (StreamKind::Audio, false) => BufferScale::Bytes128,
            _ => BufferScale::Kilobytes,
        }
    }
}

impl FormatProfile {
    pub const ALL: [FormatProfile; 5] = [
        FormatProfile::Mpeg1,
        FormatProfile::Mpeg2,
        FormatProfile::Dvd,
        FormatProfile::Xvcd,
        FormatProfile::Xsvcd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FormatProfile::Mpeg1 => "mpeg1",
            FormatProfile::Mpeg2 => "mpeg2",
            FormatProfile::Dvd => "dvd",
            FormatProfile::Xvcd => "xvcd",
            FormatProfile::Xsvcd => "xsvcd",
        }
    }

    /// Whether packs and PES headers use the MPEG-2 layout.
    pub fn is_mpeg2(&self) -> bool {
        matches!(
            self,
            FormatProfile::Mpeg2 | FormatProfile::Dvd | FormatProfile::Xsvcd
        )
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, FormatProfile::Mpeg1 | FormatProfile::Mpeg2)
    }

    pub fn is_vcd(&self) -> bool {
        matches!(self, FormatProfile::Xvcd | FormatProfile::Xsvcd)
    }

    pub fn packet_size(&self) -> usize {
        match self {
            FormatProfile::Xvcd | FormatProfile::Xsvcd => 2324,
            _ => 2048,
        }
    }

    /// Default mux rate in bytes per second.
    pub fn default_muxrate(&self) -> u32 {
        match self {
            FormatProfile::Mpeg1 | FormatProfile::Mpeg2 => 1800 * 125,
            FormatProfile::Dvd => 10080 * 125,
            FormatProfile::Xsvcd => 150 * 2324,
            FormatProfile::Xvcd => 75 * 2352,
        }
    }

    pub fn pack_header_len(&self) -> usize {
        if self.is_mpeg2() { 14 } else { 12 }
    }

    pub fn nav_packs(&self) -> bool {
        matches!(self, FormatProfile::Dvd)
    }

    /// Whether a program stream map is written when a stream outside the
    /// base MPEG codec set is present.
    pub fn program_stream_map(&self) -> bool {
        matches!(self, FormatProfile::Mpeg2)
    }

    /// Whether the stream opens with a standalone pack holding the system
    /// header. DVD carries the system header inside every NAV pack instead.
    pub fn header_pack(&self) -> bool {
        !self.nav_packs()
    }

    /// Whether every video frame is timestamped, not just I-frames.
    pub fn timestamps_all_frames(&self) -> bool {
        matches!(
            self,
            FormatProfile::Dvd | FormatProfile::Xvcd | FormatProfile::Xsvcd
        )
    }

    /// Whether `skip_padding` may shorten packets.
    pub fn allows_variable_packets(&self) -> bool {
        self.is_generic()
    }

    /// Whether the first PES packet of every stream carries a P-STD buffer field.
    pub fn std_in_first_packet(&self) -> bool {
        !self.is_generic()
    }

    /// Minimum PES header length, including the 6 byte packet prefix.
    pub fn min_pes_header_len(&self, kind: StreamKind) -> usize {
        match (self, kind) {
            (FormatProfile::Xvcd, StreamKind::Video) => 18,
            (FormatProfile::Xvcd, StreamKind::Audio) => 13,
            (FormatProfile::Xsvcd | FormatProfile::Dvd, StreamKind::Video) => 22,
            (FormatProfile::Xsvcd | FormatProfile::Dvd, StreamKind::Audio) => 17,
            _ => 0,
        }
    }

    /// System header flags: (constrained parameters, audio lock, video lock).
    pub fn system_flags(&self) -> (bool, bool, bool) {
        match self {
            FormatProfile::Xvcd => (true, true, true),
            FormatProfile::Xsvcd | FormatProfile::Dvd => (false, true, true),
            _ => (false, false, false),
        }
    }

    /// Largest decoder buffer a video stream may declare.
    pub fn max_video_buffer(&self) -> u32 {
        match self {
            FormatProfile::Xsvcd => 230 * KIB,
            FormatProfile::Xvcd => 46 * KIB,
            _ => 232 * KIB,
        }
    }

    /// Initial decoder buffer bound for a newly registered stream. Generic
    /// profiles start video small and grow it to the bitstream's VBV size.
    pub fn default_buffer(&self, kind: StreamKind, private_stream: bool) -> u32 {
        match (kind, private_stream) {
            (StreamKind::Video, _) if self.is_generic() => 46 * KIB,
            (StreamKind::Video, _) => self.max_video_buffer(),
            (StreamKind::Audio, true) => 58 * KIB,
            (StreamKind::Audio, false) => 4 * KIB,
        }
    }

    /// The fixed system header bound table for profiles that do not list
    /// streams individually, built from the video, MPEG audio and largest
    /// private stream 1 audio bounds in use.
    pub fn fixed_bounds(&self, video: u32, audio: u32, private: u32) -> Option<Vec<StreamBound>> {
        match self {
            FormatProfile::Dvd => Some(vec![
                StreamBound {
                    stream_id: 0xb9,
                    scale: BufferScale::Kilobytes,
                    size: video,
                },
                StreamBound {
                    stream_id: 0xb8,
                    scale: BufferScale::Bytes128,
                    size: audio,
                },
                StreamBound {
                    stream_id: 0xbd,
                    scale: BufferScale::Kilobytes,
                    size: private.max(58 * KIB),
                },
                StreamBound {
                    stream_id: 0xbf,
                    scale: BufferScale::Kilobytes,
                    size: 2 * KIB,
                },
            ]),
            FormatProfile::Xvcd | FormatProfile::Xsvcd => Some(vec![
                StreamBound {
                    stream_id: 0xe0,
                    scale: BufferScale::Kilobytes,
                    size: video,
                },
                StreamBound {
                    stream_id: 0xc0,
                    scale: BufferScale::Bytes128,
                    size: audio,
                },
            ]),
            _ => None,
        }
    }
}

impl std::fmt::Display for FormatProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for FormatProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mpeg1" => Ok(FormatProfile::Mpeg1),
            "mpeg2" => Ok(FormatProfile::Mpeg2),
            "dvd" => Ok(FormatProfile::Dvd),
            "xvcd" => Ok(FormatProfile::Xvcd),
            "xsvcd" => Ok(FormatProfile::Xsvcd),
            _ => Err(format!("unknown format profile: {s}")),
        }
    }
}
