use std::io::Write;
use std::sync::{Arc, Mutex};

use psmux::codec::aac::adts_header;
use psmux::codec::common::{bits_for_range, put_bits};

/// Thread-safe buffer that captures all writes for reuse in tests.
#[allow(dead_code)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates a new shared buffer and returns it along with a handle to the
    /// stored bytes.
    #[allow(dead_code)]
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let inner = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner: inner.clone(),
            },
            inner,
        )
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One packet inside a pack.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_id: u8,
    pub offset: usize,
    /// Total length, start code included.
    pub size: usize,
    /// PTS in 90 kHz units.
    pub pts: Option<u64>,
    /// DTS in 90 kHz units.
    pub dts: Option<u64>,
    /// `data_alignment_indicator` (MPEG-2 only).
    pub aligned: bool,
    /// Elementary stream bytes (private stream headers included).
    pub payload: std::ops::Range<usize>,
}

/// A pack and the packets it carries.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Pack {
    pub offset: usize,
    pub size: usize,
    /// System clock reference, 27 MHz.
    pub scr: u64,
    pub mpeg2: bool,
    pub packets: Vec<Packet>,
    /// The program end code follows the pack's packets.
    pub ends_stream: bool,
}

#[allow(dead_code)]
impl Pack {
    pub fn has(&self, stream_id: u8) -> bool {
        self.packets.iter().any(|p| p.stream_id == stream_id)
    }
}

/// Decodes a 5 byte PTS/DTS field to 90 kHz units.
#[allow(dead_code)]
pub fn read_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64 >> 1) & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | ((b[2] as u64 >> 1) << 15)
        | ((b[3] as u64) << 7)
        | (b[4] as u64 >> 1)
}

fn read_scr(data: &[u8]) -> (u64, bool, usize) {
    let b = &data[4..];
    if b[0] & 0xc0 == 0x40 {
        let base = (((b[0] as u64 >> 3) & 0x07) << 30)
            | ((b[0] as u64 & 0x03) << 28)
            | ((b[1] as u64) << 20)
            | (((b[2] as u64 >> 3) & 0x1f) << 15)
            | ((b[2] as u64 & 0x03) << 13)
            | ((b[3] as u64) << 5)
            | (b[4] as u64 >> 3);
        let ext = ((b[4] as u64 & 0x03) << 7) | (b[5] as u64 >> 1);
        let stuffing = (b[9] & 0x07) as usize;
        (base * 300 + ext, true, 14 + stuffing)
    } else {
        (read_timestamp(b) * 300, false, 12)
    }
}

fn is_pes(stream_id: u8) -> bool {
    stream_id == 0xbd || (0xc0..=0xef).contains(&stream_id)
}

fn parse_pes(data: &[u8], offset: usize, size: usize, mpeg2: bool) -> Packet {
    let p = &data[offset..offset + size];
    let stream_id = p[3];
    let mut packet = Packet {
        stream_id,
        offset,
        size,
        pts: None,
        dts: None,
        aligned: false,
        payload: offset + 6..offset + size,
    };
    if !is_pes(stream_id) {
        return packet;
    }
    if mpeg2 {
        packet.aligned = p[6] & 0x04 != 0;
        let flags = p[7] >> 6;
        if flags & 0x02 != 0 {
            packet.pts = Some(read_timestamp(&p[9..14]));
        }
        if flags == 0x03 {
            packet.dts = Some(read_timestamp(&p[14..19]));
        }
        packet.payload = offset + 9 + p[8] as usize..offset + size;
    } else {
        let mut i = 6;
        while p[i] == 0xff {
            i += 1;
        }
        if p[i] & 0xc0 == 0x40 {
            i += 2;
        }
        match p[i] >> 4 {
            0x2 => {
                packet.pts = Some(read_timestamp(&p[i..i + 5]));
                i += 5;
            }
            0x3 => {
                packet.pts = Some(read_timestamp(&p[i..i + 5]));
                packet.dts = Some(read_timestamp(&p[i + 5..i + 10]));
                i += 10;
            }
            _ => i += 1,
        }
        packet.payload = offset + i..offset + size;
    }
    packet
}

/// Walks a program stream pack by pack. Panics on anything malformed.
#[allow(dead_code)]
pub fn parse_packs(data: &[u8]) -> Vec<Pack> {
    let mut packs: Vec<Pack> = Vec::new();
    let mut cursor = 0;
    while cursor + 4 <= data.len() {
        assert_eq!(&data[cursor..cursor + 3], &[0, 0, 1], "start code at {cursor}");
        if data[cursor + 3] == 0xb9 {
            if let Some(last) = packs.last_mut() {
                last.ends_stream = true;
            }
            cursor += 4;
            continue;
        }
        assert_eq!(data[cursor + 3], 0xba, "pack header at {cursor}");
        let (scr, mpeg2, header_len) = read_scr(&data[cursor..]);
        let start = cursor;
        cursor += header_len;
        let mut packets = Vec::new();
        let mut ends_stream = false;
        while cursor + 4 <= data.len() {
            let code = data[cursor + 3];
            if code == 0xba {
                break;
            }
            if code == 0xb9 {
                ends_stream = true;
                cursor += 4;
                break;
            }
            let len = u16::from_be_bytes([data[cursor + 4], data[cursor + 5]]) as usize;
            packets.push(parse_pes(data, cursor, 6 + len, mpeg2));
            cursor += 6 + len;
        }
        packs.push(Pack {
            offset: start,
            size: cursor - start,
            scr,
            mpeg2,
            packets,
            ends_stream,
        });
    }
    packs
}

/// Every packet of `stream_id`, in file order.
#[allow(dead_code)]
pub fn packets_of(packs: &[Pack], stream_id: u8) -> Vec<Packet> {
    packs
        .iter()
        .flat_map(|p| p.packets.iter())
        .filter(|p| p.stream_id == stream_id)
        .cloned()
        .collect()
}

/// Concatenated payload of `stream_id`, skipping `skip` bytes of private
/// header in every packet.
#[allow(dead_code)]
pub fn elementary_stream(data: &[u8], packs: &[Pack], stream_id: u8, skip: usize) -> Vec<u8> {
    packets_of(packs, stream_id)
        .iter()
        .flat_map(|p| data[p.payload.start + skip..p.payload.end].iter().copied())
        .collect()
}

/// Buffer bound entries `(stream id, bytes)` of the first system header.
#[allow(dead_code)]
pub fn system_header_bounds(data: &[u8]) -> Vec<(u8, u32)> {
    let start = data
        .windows(4)
        .position(|w| w == [0, 0, 1, 0xbb])
        .expect("system header");
    let len = u16::from_be_bytes([data[start + 4], data[start + 5]]) as usize;
    data[start + 12..start + 6 + len]
        .chunks(3)
        .map(|e| (e[0], buffer_bytes(e[1], e[2])))
        .collect()
}

fn buffer_bytes(hi: u8, lo: u8) -> u32 {
    let size = (((hi & 0x1f) as u32) << 8) | lo as u32;
    if hi & 0x20 != 0 { size * 1024 } else { size * 128 }
}

/// The P-STD buffer size, in bytes, of an MPEG-2 PES packet.
#[allow(dead_code)]
pub fn std_buffer(data: &[u8], packet: &Packet) -> Option<u32> {
    let p = &data[packet.offset..packet.offset + packet.size];
    if p[7] & 0x01 == 0 {
        return None;
    }
    let i = 9 + match p[7] >> 6 {
        0x02 => 5,
        0x03 => 10,
        _ => 0,
    };
    if p[i] & 0x10 == 0 {
        return None;
    }
    Some(buffer_bytes(p[i + 1], p[i + 2]))
}

#[allow(dead_code)]
pub fn count_code(data: &[u8], code: u8) -> usize {
    data.windows(4).filter(|w| *w == [0, 0, 1, code]).count()
}

/// MPEG-2 sequence header with a frame rate code and a VBV size in 16 KiB
/// units, followed by a sequence extension.
#[allow(dead_code)]
pub fn sequence_header(rate_code: u8, vbv: u32) -> Vec<u8> {
    let br: u32 = 24500;
    let mut v = vec![
        0x00,
        0x00,
        0x01,
        0xb3,
        0x2d,
        0x02,
        0x40,
        0x20 | rate_code,
        (br >> 10) as u8,
        (br >> 2) as u8,
        (((br & 3) as u8) << 6) | 0x20 | (vbv >> 5) as u8,
        ((vbv & 0x1f) << 3) as u8,
    ];
    // sequence extension, main profile, interlaced, 4:2:0
    v.extend_from_slice(&[0x00, 0x00, 0x01, 0xb5, 0x14, 0x82, 0x00, 0x01, 0x00, 0x00]);
    v
}

/// Coding type of an MPEG-2 test picture.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pic {
    I,
    P,
    B,
}

/// One coded MPEG-2 picture of `len` bytes. I-pictures open a closed GOP;
/// `header` prepends a sequence header (25 fps unless `rate_code` says
/// otherwise).
#[allow(dead_code)]
pub fn mpeg2_picture(tr: u16, pic: Pic, len: usize, header: Option<u8>) -> Vec<u8> {
    let mut f = header.map(|code| sequence_header(code, 112)).unwrap_or_default();
    if pic == Pic::I {
        f.extend_from_slice(&[0x00, 0x00, 0x01, 0xb8, 0x00, 0x08, 0x00, 0x40]);
    }
    let coding_type = match pic {
        Pic::I => 1,
        Pic::P => 2,
        Pic::B => 3,
    };
    f.extend_from_slice(&[
        0x00,
        0x00,
        0x01,
        0x00,
        (tr >> 2) as u8,
        (((tr & 3) as u8) << 6) | (coding_type << 3),
        0xff,
        0xf8,
    ]);
    // picture coding extension, frame picture, no field repeat
    f.extend_from_slice(&[0x00, 0x00, 0x01, 0xb5, 0x8f, 0xff, 0xf3, 0x40, 0x00]);
    // first slice
    f.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
    assert!(len >= f.len());
    f.resize(len, 0x55);
    f
}

/// MPEG-1 layer II, 192 kbit/s, 48 kHz: 576 bytes, 24 ms.
#[allow(dead_code)]
pub fn mp2_frame() -> Vec<u8> {
    let mut f = vec![0u8; 576];
    f[..4].copy_from_slice(&[0xff, 0xfd, 0xa4, 0x00]);
    f
}

/// AC-3, 448 kbit/s, 48 kHz: 1792 bytes, 32 ms.
#[allow(dead_code)]
pub fn ac3_frame() -> Vec<u8> {
    let mut f = vec![0u8; 1792];
    f[..6].copy_from_slice(&[0x0b, 0x77, 0x00, 0x00, 30, 0x40]);
    f
}

/// ADTS AAC frame of `len` bytes at 48 kHz stereo.
#[allow(dead_code)]
pub fn aac_frame(len: usize) -> Vec<u8> {
    let mut f = adts_header(3, 2, len).to_vec();
    f.resize(len, 0x21);
    f
}

/// Minimal MPEG-4 video object layer with the given time resolution.
#[allow(dead_code)]
pub fn mpeg4_vol(resolution: u16) -> Vec<u8> {
    let mut payload = [0u8; 6];
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

/// MPEG-4 VOP of `len` bytes.
#[allow(dead_code)]
pub fn mpeg4_vop(coding_type: u32, increment: u32, resolution: u32, len: usize) -> Vec<u8> {
    let mut payload = [0u8; 6];
    put_bits(&mut payload, 0, 2, coding_type);
    put_bits(&mut payload, 2, 2, 0b01);
    put_bits(&mut payload, 4, bits_for_range(resolution), increment);
    let mut v = vec![0x00, 0x00, 0x01, 0xb6];
    v.extend_from_slice(&payload);
    v.resize(len.max(v.len()), 0x55);
    v
}
