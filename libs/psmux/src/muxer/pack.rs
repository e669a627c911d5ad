//! Byte layouts of program stream packets.
//!
//! Every function here is pure: it takes already-decided values and returns
//! the encoded bytes. Deciding what to write lives in the session.

use crate::assert_invariant;
use crate::clock::TICKS_PER_PTS_UNIT;
use crate::profile::{BufferScale, StreamBound};

pub const PACK_START: u8 = 0xba;
pub const SYSTEM_HEADER_START: u8 = 0xbb;
pub const PSM_START: u8 = 0xbc;
pub const PRIVATE_STREAM_1: u8 = 0xbd;
pub const PADDING_STREAM: u8 = 0xbe;
pub const PRIVATE_STREAM_2: u8 = 0xbf;
pub const END_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0xb9];

/// Smallest padding packet: start code, stream id and length.
pub const PADDING_HEADER_LEN: usize = 6;
/// Most stuffing bytes allowed in a PES header.
pub const MAX_STUFFING: usize = 16;

const PCI_LEN: usize = 980;
/// Total size of a DVD navigation pack.
pub const NAV_PACK_LEN: usize = 2048;

const PSM_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2);

/// Timestamp field markers.
pub const MARKER_PTS_ONLY: u8 = 0x20;
pub const MARKER_PTS_WITH_DTS: u8 = 0x30;
pub const MARKER_DTS: u8 = 0x10;

/// Encodes a 33 bit, 90 kHz timestamp (given in 27 MHz ticks) in the five
/// byte PTS/DTS layout.
pub fn encode_timestamp(marker: u8, ticks: u64) -> [u8; 5] {
    let ts = (ticks / TICKS_PER_PTS_UNIT) & 0x1_ffff_ffff;
    [
        marker | ((ts >> 29) & 0x0e) as u8 | 1,
        (ts >> 22) as u8,
        ((ts >> 14) & 0xfe) as u8 | 1,
        (ts >> 7) as u8,
        ((ts << 1) & 0xfe) as u8 | 1,
    ]
}

/// Mux rate in the 50 bytes/s units of the pack and system headers.
pub fn rate_units(bytes_per_sec: u32) -> u32 {
    bytes_per_sec.div_ceil(50)
}

fn mpeg1_rate(units: u32) -> [u8; 3] {
    [
        0x80 | ((units >> 15) & 0x7f) as u8,
        (units >> 7) as u8,
        ((units << 1) & 0xfe) as u8 | 1,
    ]
}

fn encode_scr_mpeg2(ticks: u64) -> [u8; 6] {
    let base = (ticks / TICKS_PER_PTS_UNIT) & 0x1_ffff_ffff;
    let ext = ticks % TICKS_PER_PTS_UNIT;
    let t1 = (base >> 30) & 0x07;
    let t2 = (base >> 15) & 0x7fff;
    let t3 = base & 0x7fff;
    [
        (0x44 | (t1 << 3) | ((t2 >> 13) & 0x03)) as u8,
        (t2 >> 5) as u8,
        (((t2 & 0x1f) << 3) | 0x04 | ((t3 >> 13) & 0x03)) as u8,
        (t3 >> 5) as u8,
        (((t3 & 0x1f) << 3) | 0x04 | ((ext >> 7) & 0x03)) as u8,
        (((ext << 1) & 0xfe) | 1) as u8,
    ]
}

/// Pack header: 12 bytes (MPEG-1) or 14 bytes (MPEG-2).
pub fn build_pack_header(scr: u64, muxrate: u32, mpeg2: bool) -> Vec<u8> {
    let units = rate_units(muxrate);
    let mut out = Vec::with_capacity(14);
    out.extend_from_slice(&[0x00, 0x00, 0x01, PACK_START]);
    if mpeg2 {
        out.extend_from_slice(&encode_scr_mpeg2(scr));
        out.extend_from_slice(&[
            (units >> 14) as u8,
            (units >> 6) as u8,
            (((units & 0x3f) << 2) | 0x03) as u8,
            0xf8,
        ]);
    } else {
        out.extend_from_slice(&encode_timestamp(MARKER_PTS_ONLY, scr));
        out.extend_from_slice(&mpeg1_rate(units));
    }
    assert_invariant!(
        out.len() == if mpeg2 { 14 } else { 12 },
        "pack header has the layout's fixed length",
        "build_pack_header"
    );
    out
}

/// Contents of a system header.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemHeader {
    pub muxrate: u32,
    pub audio_bound: u8,
    pub video_bound: u8,
    pub csps: bool,
    pub audio_lock: bool,
    pub video_lock: bool,
    pub mpeg2: bool,
    pub bounds: Vec<StreamBound>,
}

fn std_units(scale: BufferScale, size: u32) -> (u8, u32) {
    match scale {
        BufferScale::Bytes128 => (0, size.div_ceil(128)),
        BufferScale::Kilobytes => (1, size.div_ceil(1024)),
    }
}

pub fn build_system_header(header: &SystemHeader) -> Vec<u8> {
    let header_len = 6 + 3 * header.bounds.len();
    let mut out = Vec::with_capacity(6 + header_len);
    out.extend_from_slice(&[0x00, 0x00, 0x01, SYSTEM_HEADER_START]);
    out.extend_from_slice(&(header_len as u16).to_be_bytes());
    out.extend_from_slice(&mpeg1_rate(rate_units(header.muxrate)));
    // fixed_flag stays clear, the rate is an upper bound
    out.push((header.audio_bound << 2) | u8::from(header.csps));
    out.push(
        (u8::from(header.audio_lock) << 7)
            | (u8::from(header.video_lock) << 6)
            | 0x20
            | (header.video_bound & 0x1f),
    );
    out.push(if header.mpeg2 { 0x7f } else { 0xff });
    for bound in &header.bounds {
        let (scale, units) = std_units(bound.scale, bound.size);
        out.push(bound.stream_id);
        out.push(0xc0 | (scale << 5) | ((units >> 8) & 0x1f) as u8);
        out.push(units as u8);
    }
    out
}

/// One elementary stream of a program stream map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsmEntry {
    pub stream_type: u8,
    pub stream_id: u8,
    /// Registration descriptor format identifier.
    pub format: [u8; 4],
}

pub fn build_psm(entries: &[PsmEntry]) -> Vec<u8> {
    let map_len = 10 * entries.len();
    let psm_len = 10 + map_len;
    let mut out = Vec::with_capacity(6 + psm_len);
    out.extend_from_slice(&[0x00, 0x00, 0x01, PSM_START]);
    out.extend_from_slice(&(psm_len as u16).to_be_bytes());
    // current_next_indicator, version 0; marker
    out.extend_from_slice(&[0xe0, 0xff]);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(map_len as u16).to_be_bytes());
    for entry in entries {
        out.push(entry.stream_type);
        out.push(entry.stream_id);
        out.extend_from_slice(&6u16.to_be_bytes());
        out.extend_from_slice(&[0x05, 0x04]);
        out.extend_from_slice(&entry.format);
    }
    let crc = PSM_CRC.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// A padding packet of exactly `len` bytes, header included.
pub fn build_padding(len: usize) -> Vec<u8> {
    let body = len.saturating_sub(PADDING_HEADER_LEN);
    let mut out = Vec::with_capacity(PADDING_HEADER_LEN + body);
    out.extend_from_slice(&[0x00, 0x00, 0x01, PADDING_STREAM]);
    out.extend_from_slice(&(body as u16).to_be_bytes());
    out.resize(PADDING_HEADER_LEN + body, 0xff);
    out
}

/// DVD navigation pack: pack header, system header and the empty PCI and
/// DSI private stream 2 packets, 2048 bytes in total.
pub fn build_nav_pack(pack_header: &[u8], system_header: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NAV_PACK_LEN);
    out.extend_from_slice(pack_header);
    out.extend_from_slice(system_header);
    let dsi_len = NAV_PACK_LEN - out.len() - 2 * PADDING_HEADER_LEN - PCI_LEN;
    for len in [PCI_LEN, dsi_len] {
        out.extend_from_slice(&[0x00, 0x00, 0x01, PRIVATE_STREAM_2]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.resize(out.len() + len, 0);
    }
    assert_invariant!(
        out.len() == NAV_PACK_LEN,
        "NAV pack fills one sector",
        "build_nav_pack"
    );
    out
}

/// PES packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PesHeader {
    pub stream_id: u8,
    pub mpeg2: bool,
    /// Ticks.
    pub pts: Option<u64>,
    /// Ticks. Only written together with `pts`.
    pub dts: Option<u64>,
    pub std_buffer: Option<(BufferScale, u32)>,
    /// Payload starts with the first byte of an access unit.
    pub aligned: bool,
    pub stuffing: usize,
}

impl PesHeader {
    fn timestamp_len(&self) -> usize {
        match (self.pts, self.dts) {
            (Some(_), Some(_)) => 10,
            (Some(_), None) => 5,
            _ => 0,
        }
    }

    /// Bytes before the payload, start code and length field included.
    pub fn encoded_len(&self) -> usize {
        let ts = self.timestamp_len();
        if self.mpeg2 {
            9 + ts + if self.std_buffer.is_some() { 3 } else { 0 } + self.stuffing
        } else {
            6 + self.stuffing
                + if self.std_buffer.is_some() { 2 } else { 0 }
                + ts.max(1)
        }
    }

    pub fn build(&self, payload_len: usize) -> Vec<u8> {
        let len = self.encoded_len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&[0x00, 0x00, 0x01, self.stream_id]);
        out.extend_from_slice(&((len - 6 + payload_len) as u16).to_be_bytes());

        let timestamps = match (self.pts, self.dts) {
            (Some(pts), Some(dts)) => {
                let mut ts = encode_timestamp(MARKER_PTS_WITH_DTS, pts).to_vec();
                ts.extend_from_slice(&encode_timestamp(MARKER_DTS, dts));
                ts
            }
            (Some(pts), None) => encode_timestamp(MARKER_PTS_ONLY, pts).to_vec(),
            _ => Vec::new(),
        };

        if self.mpeg2 {
            out.push(if self.aligned { 0x84 } else { 0x80 });
            let mut flags = match timestamps.len() {
                10 => 0xc0,
                5 => 0x80,
                _ => 0x00,
            };
            if self.std_buffer.is_some() {
                flags |= 0x01;
            }
            out.push(flags);
            out.push((len - 9) as u8);
            out.extend_from_slice(&timestamps);
            if let Some((scale, size)) = self.std_buffer {
                let (scale, units) = std_units(scale, size);
                // only P-STD_buffer_flag set
                out.push(0x1e);
                out.push(0x40 | (scale << 5) | ((units >> 8) & 0x1f) as u8);
                out.push(units as u8);
            }
            out.resize(out.len() + self.stuffing, 0xff);
        } else {
            out.resize(out.len() + self.stuffing, 0xff);
            if let Some((scale, size)) = self.std_buffer {
                let (scale, units) = std_units(scale, size);
                out.push(0x40 | (scale << 5) | ((units >> 8) & 0x1f) as u8);
                out.push(units as u8);
            }
            if timestamps.is_empty() {
                out.push(0x0f);
            } else {
                out.extend_from_slice(&timestamps);
            }
        }
        assert_invariant!(
            out.len() == len,
            "PES header length matches its declared layout",
            "PesHeader::build"
        );
        out
    }
}
