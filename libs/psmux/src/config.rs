//! Session configuration.
//!
//! [`MuxerConfig`] holds the options as given, either through the `with_*`
//! builders or parsed from a `key=value:key:...` option string. It is turned
//! into an immutable [`ResolvedConfig`] once, when the session is created;
//! every component reads its settings from there.

use tracing::warn;

use crate::clock::{FrameRate, ms_to_ticks};
use crate::error::ConfigError;
use crate::profile::FormatProfile;

const KIB: u32 = 1024;

/// Valid range of the initial timestamp anchors, in milliseconds.
pub const INIT_PTS_RANGE: (i64, i64) = (100, 700);
const DEFAULT_INIT_PTS_MS: i64 = 200;

const VBUF_RANGE: (i64, i64) = (40, 1194);
const ABUF_RANGE: (i64, i64) = (1, 64);

/// Soft telecine conversion applied to MPEG-2 video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Telecine {
    #[default]
    Off,
    /// 3:2 pulldown to 30000/1001.
    Pulldown32,
    /// Film rate to 25 fps.
    FilmToPal,
    /// Arbitrary target rate.
    Custom(FrameRate),
}

/// Options as supplied by the caller.
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    pub format: String,
    /// Packet size override in bytes.
    pub size: Option<usize>,
    /// Mux rate override in kbit/s.
    pub muxrate: Option<u32>,
    /// MPEG aspect ratio code.
    pub vaspect: Option<u8>,
    pub vframerate: Option<FrameRate>,
    pub vwidth: Option<u16>,
    pub vheight: Option<u16>,
    pub vpswidth: Option<u16>,
    pub vpsheight: Option<u16>,
    /// Video bit rate override in kbit/s.
    pub vbitrate: Option<u32>,
    pub init_vpts: i64,
    pub init_apts: i64,
    /// Audio/video offset in milliseconds. Positive delays video.
    pub vdelay: i64,
    pub drop: bool,
    pub tsaf: bool,
    pub skip_padding: bool,
    pub telecine: bool,
    pub film2pal: bool,
    pub tele_src: Option<FrameRate>,
    pub tele_dest: Option<FrameRate>,
    /// Video decoder buffer bound in KiB.
    pub vbuf_size: Option<u32>,
    /// Audio decoder buffer bound in KiB.
    pub abuf_size: Option<u32>,
    /// Problems found while parsing an option string.
    parse_warnings: Vec<ConfigError>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            format: FormatProfile::default().name().to_string(),
            size: None,
            muxrate: None,
            vaspect: None,
            vframerate: None,
            vwidth: None,
            vheight: None,
            vpswidth: None,
            vpsheight: None,
            vbitrate: None,
            init_vpts: DEFAULT_INIT_PTS_MS,
            init_apts: DEFAULT_INIT_PTS_MS,
            vdelay: 0,
            drop: false,
            tsaf: false,
            skip_padding: false,
            telecine: false,
            film2pal: false,
            tele_src: None,
            tele_dest: None,
            vbuf_size: None,
            abuf_size: None,
            parse_warnings: Vec::new(),
        }
    }
}

/// Parses an aspect ratio option into its MPEG code.
pub fn aspect_code(value: &str) -> Option<u8> {
    match value.trim() {
        "1" | "1:1" | "1/1" => Some(1),
        "4/3" | "4:3" => Some(2),
        "16/9" | "16:9" => Some(3),
        "2.21" | "2.21:1" => Some(4),
        _ => None,
    }
}

fn parse_flag(value: Option<&str>) -> Option<bool> {
    match value {
        None => Some(true),
        Some("1" | "true" | "yes" | "on") => Some(true),
        Some("0" | "false" | "no" | "off") => Some(false),
        Some(_) => None,
    }
}

fn clamp(
    warnings: &mut Vec<ConfigError>,
    key: &'static str,
    value: i64,
    (lo, hi): (i64, i64),
) -> i64 {
    let clamped = value.clamp(lo, hi);
    if clamped != value {
        warnings.push(ConfigError::OutOfRange {
            key,
            value,
            clamped,
        });
    }
    clamped
}

impl MuxerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a colon separated option string such as
    /// `format=dvd:tsaf:vaspect=16/9`.
    ///
    /// Parsing never fails. Unknown keys and bad values are kept as warnings
    /// and reported by [`MuxerConfig::resolve`].
    pub fn from_options(options: &str) -> Self {
        let mut config = Self::default();
        for item in options.split(':').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (item, None),
            };
            if let Err(e) = config.set_option(key, value) {
                config.parse_warnings.push(e);
            }
        }
        config
    }

    /// Applies a single option.
    pub fn set_option(&mut self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.unwrap_or_default().to_string(),
        };
        fn num<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }
        fn rate(value: Option<&str>) -> Option<FrameRate> {
            value.and_then(|v| v.parse().ok())
        }

        match key {
            "format" => self.format = value.ok_or_else(invalid)?.to_string(),
            "size" => self.size = Some(num(value).ok_or_else(invalid)?),
            "muxrate" => self.muxrate = Some(num(value).ok_or_else(invalid)?),
            "vaspect" => self.vaspect = Some(value.and_then(aspect_code).ok_or_else(invalid)?),
            "vframerate" => self.vframerate = Some(rate(value).ok_or_else(invalid)?),
            "vwidth" => self.vwidth = Some(num(value).ok_or_else(invalid)?),
            "vheight" => self.vheight = Some(num(value).ok_or_else(invalid)?),
            "vpswidth" => self.vpswidth = Some(num(value).ok_or_else(invalid)?),
            "vpsheight" => self.vpsheight = Some(num(value).ok_or_else(invalid)?),
            "vbitrate" => self.vbitrate = Some(num(value).ok_or_else(invalid)?),
            "init_vpts" => self.init_vpts = num(value).ok_or_else(invalid)?,
            "init_apts" => self.init_apts = num(value).ok_or_else(invalid)?,
            "vdelay" => self.vdelay = num(value).ok_or_else(invalid)?,
            "drop" => self.drop = parse_flag(value).ok_or_else(invalid)?,
            "tsaf" => self.tsaf = parse_flag(value).ok_or_else(invalid)?,
            "skip_padding" => self.skip_padding = parse_flag(value).ok_or_else(invalid)?,
            "telecine" => self.telecine = parse_flag(value).ok_or_else(invalid)?,
            "film2pal" => self.film2pal = parse_flag(value).ok_or_else(invalid)?,
            "tele_src" => self.tele_src = Some(rate(value).ok_or_else(invalid)?),
            "tele_dest" => self.tele_dest = Some(rate(value).ok_or_else(invalid)?),
            "vbuf_size" => self.vbuf_size = Some(num(value).ok_or_else(invalid)?),
            "abuf_size" => self.abuf_size = Some(num(value).ok_or_else(invalid)?),
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    pub fn with_profile(mut self, profile: FormatProfile) -> Self {
        self.format = profile.name().to_string();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Mux rate in kbit/s.
    pub fn with_muxrate(mut self, kbps: u32) -> Self {
        self.muxrate = Some(kbps);
        self
    }

    pub fn with_init_vpts(mut self, ms: i64) -> Self {
        self.init_vpts = ms;
        self
    }

    pub fn with_init_apts(mut self, ms: i64) -> Self {
        self.init_apts = ms;
        self
    }

    pub fn with_vdelay(mut self, ms: i64, drop: bool) -> Self {
        self.vdelay = ms;
        self.drop = drop;
        self
    }

    pub fn with_tsaf(mut self, enabled: bool) -> Self {
        self.tsaf = enabled;
        self
    }

    pub fn with_skip_padding(mut self, enabled: bool) -> Self {
        self.skip_padding = enabled;
        self
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.vframerate = Some(rate);
        self
    }

    pub fn with_telecine(mut self, telecine: Telecine) -> Self {
        self.telecine = false;
        self.film2pal = false;
        self.tele_dest = None;
        match telecine {
            Telecine::Off => {}
            Telecine::Pulldown32 => self.telecine = true,
            Telecine::FilmToPal => self.film2pal = true,
            Telecine::Custom(rate) => self.tele_dest = Some(rate),
        }
        self
    }

    pub fn with_telecine_source(mut self, rate: FrameRate) -> Self {
        self.tele_src = Some(rate);
        self
    }

    pub fn with_buffer_sizes(mut self, video_kib: Option<u32>, audio_kib: Option<u32>) -> Self {
        self.vbuf_size = video_kib;
        self.abuf_size = audio_kib;
        self
    }

    /// Validates the options and derives the effective settings. Every
    /// adjustment is logged and kept in [`ResolvedConfig::warnings`].
    pub fn resolve(&self) -> ResolvedConfig {
        let mut warnings = self.parse_warnings.clone();

        let profile = self.format.parse::<FormatProfile>().unwrap_or_else(|_| {
            warnings.push(ConfigError::UnknownFormat(self.format.clone()));
            FormatProfile::Mpeg2
        });

        let init_vpts = clamp(&mut warnings, "init_vpts", self.init_vpts, INIT_PTS_RANGE);
        let init_apts = clamp(&mut warnings, "init_apts", self.init_apts, INIT_PTS_RANGE);
        let vbuf_size = self
            .vbuf_size
            .map(|k| clamp(&mut warnings, "vbuf_size", k as i64, VBUF_RANGE) as u32 * KIB);
        let abuf_size = self
            .abuf_size
            .map(|k| clamp(&mut warnings, "abuf_size", k as i64, ABUF_RANGE) as u32 * KIB);

        let packet_size = match self.size {
            Some(size) if profile.is_generic() => {
                clamp(&mut warnings, "size", size as i64, (512, 65535)) as usize
            }
            Some(_) => {
                warnings.push(ConfigError::Unsupported("size", profile.name()));
                profile.packet_size()
            }
            None => profile.packet_size(),
        };

        let muxrate = match self.muxrate {
            Some(kbps) if kbps > 0 => kbps.checked_mul(125).unwrap_or_else(|| {
                let clamped = u32::MAX / 125;
                warnings.push(ConfigError::OutOfRange {
                    key: "muxrate",
                    value: kbps as i64,
                    clamped: clamped as i64,
                });
                clamped * 125
            }),
            Some(_) => {
                warnings.push(ConfigError::InvalidValue {
                    key: "muxrate".into(),
                    value: "0".into(),
                });
                profile.default_muxrate()
            }
            None => profile.default_muxrate(),
        };

        let mut telecine = Telecine::Off;
        if self.telecine {
            telecine = Telecine::Pulldown32;
            if self.film2pal {
                warnings.push(ConfigError::Exclusive {
                    enabled: "telecine",
                    disabled: "film2pal",
                });
            }
        } else if self.film2pal {
            telecine = Telecine::FilmToPal;
        }
        if let Some(dest) = self.tele_dest {
            if telecine == Telecine::Off {
                telecine = Telecine::Custom(dest);
            } else {
                warnings.push(ConfigError::Exclusive {
                    enabled: if self.telecine { "telecine" } else { "film2pal" },
                    disabled: "tele_dest",
                });
            }
        }

        let mut vframerate = self.vframerate;
        if telecine != Telecine::Off && vframerate.is_some() {
            warnings.push(ConfigError::Exclusive {
                enabled: "telecine",
                disabled: "vframerate",
            });
            vframerate = None;
        }

        let mut drop = self.drop;
        if drop && self.vdelay > 0 {
            warnings.push(ConfigError::Exclusive {
                enabled: "vdelay",
                disabled: "drop",
            });
            drop = false;
        }

        let mut skip_padding = self.skip_padding;
        if skip_padding && !profile.allows_variable_packets() {
            warnings.push(ConfigError::Unsupported("skip_padding", profile.name()));
            skip_padding = false;
        }

        for w in &warnings {
            warn!("{w}");
        }

        ResolvedConfig {
            profile,
            packet_size,
            muxrate,
            vaspect: self.vaspect,
            vframerate,
            vwidth: self.vwidth,
            vheight: self.vheight,
            vpswidth: self.vpswidth,
            vpsheight: self.vpsheight,
            vbitrate: self.vbitrate,
            init_vpts: init_vpts as u64,
            init_apts: init_apts as u64,
            vdelay: self.vdelay,
            drop,
            tsaf: self.tsaf || profile.is_vcd(),
            skip_padding,
            telecine,
            tele_src: self.tele_src,
            vbuf_size,
            abuf_size,
            warnings,
        }
    }
}

/// Effective, validated session settings.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub profile: FormatProfile,
    pub packet_size: usize,
    /// Bytes per second.
    pub muxrate: u32,
    pub vaspect: Option<u8>,
    pub vframerate: Option<FrameRate>,
    pub vwidth: Option<u16>,
    pub vheight: Option<u16>,
    pub vpswidth: Option<u16>,
    pub vpsheight: Option<u16>,
    pub vbitrate: Option<u32>,
    /// Milliseconds.
    pub init_vpts: u64,
    /// Milliseconds.
    pub init_apts: u64,
    /// Milliseconds.
    pub vdelay: i64,
    pub drop: bool,
    pub tsaf: bool,
    pub skip_padding: bool,
    pub telecine: Telecine,
    pub tele_src: Option<FrameRate>,
    /// Bytes.
    pub vbuf_size: Option<u32>,
    /// Bytes.
    pub abuf_size: Option<u32>,
    pub warnings: Vec<ConfigError>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        MuxerConfig::default().resolve()
    }
}

impl ResolvedConfig {
    /// Decode time of the first video frame.
    pub fn video_anchor(&self) -> u64 {
        ms_to_ticks(self.init_vpts + self.vdelay.max(0) as u64)
    }

    /// Presentation time of the first kept audio frame.
    pub fn audio_anchor(&self) -> u64 {
        let mut ms = self.init_apts;
        if self.vdelay < 0 && !self.drop {
            ms += self.vdelay.unsigned_abs();
        }
        ms_to_ticks(ms)
    }

    /// Leading span of audio that is discarded.
    pub fn audio_drop_window(&self) -> u64 {
        if self.drop && self.vdelay < 0 {
            ms_to_ticks(self.vdelay.unsigned_abs())
        } else {
            0
        }
    }
}
