//! Start code scanning and bit-level helpers shared by the video parsers.
//!
//! MPEG video delimits every syntax element with a `00 00 01 xx` start code,
//! where `xx` identifies the element.

/// Iterator over the start codes of an MPEG video elementary stream.
///
/// Yields `(offset, code)` where `offset` is the position of the
/// `00 00 01` prefix and `code` the byte that follows it.
///
/// # Example
///
/// ```
/// use psmux::codec::StartCodeIter;
///
/// let data = [
///     0x00, 0x00, 0x01, 0xb3, 0x16, 0x00,  // sequence header
///     0x00, 0x00, 0x01, 0x00, 0x00, 0x0f,  // picture header
/// ];
///
/// let codes: Vec<_> = StartCodeIter::new(&data).collect();
/// assert_eq!(codes, vec![(0, 0xb3), (6, 0x00)]);
/// ```
pub struct StartCodeIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> StartCodeIter<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }
}

impl Iterator for StartCodeIter<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = find_start_code(self.data, self.cursor)?;
        let code = *self.data.get(pos + 3)?;
        self.cursor = pos + 3;
        Some((pos, code))
    }
}

/// Position of the next `00 00 01` prefix at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 || from >= data.len() {
        return None;
    }
    data[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

/// MSB-first bit reader over a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bit_position(&self) -> usize {
        self.pos
    }

    pub fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit == 1)
    }

    /// Reads up to 32 bits.
    pub fn read_bits(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n <= 32);
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Some(value)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.data.len() * 8 {
            return None;
        }
        self.pos += n;
        Some(())
    }
}

/// Overwrites `nbits` bits of `buf` starting at bit `bit_pos` (MSB first)
/// with the low bits of `value`. Returns `false` if the range does not fit.
pub fn put_bits(buf: &mut [u8], bit_pos: usize, nbits: u32, value: u32) -> bool {
    if bit_pos + nbits as usize > buf.len() * 8 {
        return false;
    }
    for i in 0..nbits as usize {
        let bit = (value >> (nbits as usize - 1 - i)) & 1;
        let at = bit_pos + i;
        let mask = 0x80u8 >> (at % 8);
        if bit == 1 {
            buf[at / 8] |= mask;
        } else {
            buf[at / 8] &= !mask;
        }
    }
    true
}

/// Number of bits needed to code values in `0..range`, at least one.
pub fn bits_for_range(range: u32) -> u32 {
    if range <= 1 {
        return 1;
    }
    32 - (range - 1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_start_code() {
        let data = [0xab, 0x00, 0x00, 0x01, 0xb3];
        assert_eq!(find_start_code(&data, 0), Some(1));
        assert_eq!(find_start_code(&data, 2), None);
        assert_eq!(find_start_code(&[0x00, 0x00], 0), None);
    }

    #[test]
    fn test_start_code_iter_skips_trailing_prefix() {
        // a prefix with no code byte after it is not reported
        let data = [0x00, 0x00, 0x01, 0xb8, 0x00, 0x00, 0x01];
        let codes: Vec<_> = StartCodeIter::new(&data).collect();
        assert_eq!(codes, vec![(0, 0xb8)]);
    }

    #[test]
    fn test_bit_reader() {
        let data = [0b1010_0000, 0xff];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(3), Some(0b101));
        assert_eq!(r.read_bits(5), Some(0));
        assert_eq!(r.read_bits(8), Some(0xff));
        assert_eq!(r.read_bit(), None);
    }

    #[test]
    fn test_put_bits_crosses_bytes() {
        let mut buf = [0u8; 3];
        assert!(put_bits(&mut buf, 6, 14, 0x3fff));
        assert_eq!(buf, [0x03, 0xff, 0xf0]);
        assert!(!put_bits(&mut buf, 20, 8, 0));
    }

    #[test]
    fn test_bits_for_range() {
        assert_eq!(bits_for_range(1), 1);
        assert_eq!(bits_for_range(2), 1);
        assert_eq!(bits_for_range(30), 5);
        assert_eq!(bits_for_range(30000), 15);
        assert_eq!(bits_for_range(32768), 15);
        assert_eq!(bits_for_range(32769), 16);
    }
}
