//! Internet checksum (RFC 1071) over a header region.

/// Sums `buf` as big-endian 16-bit words. A trailing odd byte is treated as
/// the high byte of a zero-padded word.
///
/// The accumulator does not overflow for regions up to 64 KiB.
#[inline(always)]
pub fn sum_words(buf: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut words = buf.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Folds the carries of a word sum twice and returns its one's complement.
#[inline(always)]
pub const fn fold(sum: u32) -> u16 {
    let sum = (sum & 0xffff) + (sum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    !(sum as u16)
}

/// One's-complement checksum of `buf`, ready to be stored big-endian.
///
/// The caller zeroes the checksum field inside `buf` before calling.
#[inline(always)]
pub fn checksum(buf: &[u8]) -> u16 {
    fold(sum_words(buf))
}

/// Returns true when `header` (checksum field included) sums to zero.
pub fn is_valid(header: &[u8]) -> bool {
    checksum(header) == 0
}
