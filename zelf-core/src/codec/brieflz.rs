//! BriefLZ block format.
//!
//! The stream starts with one literal byte, followed by 16-bit little-endian
//! tag words interleaved with data bytes. Each tag bit selects a literal (0)
//! or a match (1). Matches carry a gamma-coded length and a gamma-coded high
//! offset part followed by the low offset byte. The decoder has to be told the
//! exact decompressed size.

use super::{Codec, CodecKind};
use crate::error::CodecError;

const HASH_BITS: u32 = 17;
const NO_MATCH: usize = usize::MAX;

/// Shortest match worth encoding; 4-byte matches only pay off for near offsets.
const MIN_MATCH: usize = 4;
const FAR_OFFSET_FOR_MIN_MATCH: usize = 0x7E00;

pub struct BriefLz;

impl Codec for BriefLz {
    fn kind(&self) -> CodecKind {
        CodecKind::BriefLz
    }

    fn max_output_size(&self, input_len: usize) -> usize {
        input_len + input_len / 8 + 64
    }

    fn compress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        let packed = pack(input);
        if packed.len() > output.len() {
            return Err(CodecError::OutputTooSmall {
                codec: "BriefLZ",
                capacity: output.len(),
            });
        }
        output[..packed.len()].copy_from_slice(&packed);
        Ok(packed.len())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
        depack(input, output).map_err(|reason| CodecError::Decompress {
            codec: "BriefLZ",
            reason: reason.to_string(),
        })?;
        Ok(output.len())
    }
}

fn hash4(bytes: &[u8]) -> usize {
    let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize
}

struct BitWriter {
    out: Vec<u8>,
    tag_pos: usize,
    tag: u32,
    bits_left: u32,
}

impl BitWriter {
    fn new(capacity: usize) -> Self {
        BitWriter {
            out: Vec::with_capacity(capacity),
            tag_pos: 0,
            tag: 0,
            bits_left: 16,
        }
    }

    fn store_tag(&mut self) {
        let word = (self.tag as u16).to_le_bytes();
        self.out[self.tag_pos..self.tag_pos + 2].copy_from_slice(&word);
    }

    fn reserve_tag(&mut self) {
        self.tag_pos = self.out.len();
        self.out.extend_from_slice(&[0, 0]);
    }

    fn put_bit(&mut self, bit: u32) {
        if self.bits_left == 0 {
            self.store_tag();
            self.reserve_tag();
            self.bits_left = 15;
        } else {
            self.bits_left -= 1;
        }
        self.tag = (self.tag << 1).wrapping_add(bit);
    }

    /// Elias-gamma style code for `val >= 2`: the bits below the leading one,
    /// each followed by a continuation bit.
    fn put_gamma(&mut self, val: usize) {
        debug_assert!(val >= 2);
        let mut mask = (val >> 1).next_power_of_two();
        if mask > val >> 1 {
            mask >>= 1;
        }
        // mask now holds the highest set bit of val >> 1, i.e. the bit just
        // below val's leading one
        self.put_bit(u32::from(val & mask != 0));
        mask >>= 1;
        while mask != 0 {
            self.put_bit(1);
            self.put_bit(u32::from(val & mask != 0));
            mask >>= 1;
        }
        self.put_bit(0);
    }

    fn put_byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn finish(mut self) -> Vec<u8> {
        self.put_bit(1);
        self.tag <<= self.bits_left;
        self.store_tag();
        self.out
    }
}

/// Greedy single-candidate hash-chain compressor.
pub fn pack(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }

    let mut w = BitWriter::new(input.len() + input.len() / 8 + 64);
    w.put_byte(input[0]);
    if input.len() == 1 {
        return w.out;
    }
    w.reserve_tag();

    let mut lookup = vec![NO_MATCH; 1 << HASH_BITS];
    let last_match_pos = input.len().saturating_sub(MIN_MATCH);
    let mut hash_pos = 0;
    let mut cur = 1;

    while cur <= last_match_pos {
        while hash_pos < cur {
            lookup[hash4(&input[hash_pos..])] = hash_pos;
            hash_pos += 1;
        }

        let candidate = lookup[hash4(&input[cur..])];
        let mut len = 0;
        let mut offs = 0;
        if candidate != NO_MATCH {
            offs = cur - candidate - 1;
            let limit = input.len() - cur;
            while len < limit && input[candidate + len] == input[cur + len] {
                len += 1;
            }
        }

        if len > MIN_MATCH || (len == MIN_MATCH && offs < FAR_OFFSET_FOR_MIN_MATCH) {
            w.put_bit(1);
            w.put_gamma(len - 2);
            w.put_gamma((offs >> 8) + 2);
            w.put_byte((offs & 0xFF) as u8);
            cur += len;
        } else {
            w.put_bit(0);
            w.put_byte(input[cur]);
            cur += 1;
        }
    }

    while cur < input.len() {
        w.put_bit(0);
        w.put_byte(input[cur]);
        cur += 1;
    }

    w.finish()
}

struct BitReader<'a> {
    src: &'a [u8],
    pos: usize,
    tag: u32,
    bits_left: u32,
}

impl<'a> BitReader<'a> {
    fn byte(&mut self) -> Result<u8, &'static str> {
        let b = *self.src.get(self.pos).ok_or("input truncated")?;
        self.pos += 1;
        Ok(b)
    }

    fn bit(&mut self) -> Result<u32, &'static str> {
        if self.bits_left == 0 {
            let lo = self.byte()?;
            let hi = self.byte()?;
            self.tag = u32::from(u16::from_le_bytes([lo, hi]));
            self.bits_left = 15;
        } else {
            self.bits_left -= 1;
        }
        let bit = (self.tag & 0x8000) >> 15;
        self.tag <<= 1;
        Ok(bit)
    }

    fn gamma(&mut self) -> Result<usize, &'static str> {
        let mut result: usize = 1;
        loop {
            let bit = self.bit()? as usize;
            result = result
                .checked_mul(2)
                .and_then(|r| r.checked_add(bit))
                .ok_or("gamma code overflow")?;
            if self.bit()? == 0 {
                return Ok(result);
            }
        }
    }
}

/// Decompresses exactly `output.len()` bytes.
pub fn depack(input: &[u8], output: &mut [u8]) -> Result<(), &'static str> {
    if output.is_empty() {
        return Ok(());
    }

    // bits_left = 1 makes the first call return an implicit 0, so the leading
    // raw byte is read as a literal
    let mut r = BitReader {
        src: input,
        pos: 0,
        tag: 0,
        bits_left: 1,
    };
    let mut dst = 0;

    while dst < output.len() {
        if r.bit()? == 1 {
            let len = r.gamma()?.checked_add(2).ok_or("gamma code overflow")?;
            let hi = r.gamma()?.checked_sub(2).ok_or("gamma code underflow")?;
            if hi > dst >> 8 {
                return Err("match offset before start of output");
            }
            let off = (hi << 8) + r.byte()? as usize + 1;
            if off > dst {
                return Err("match offset before start of output");
            }
            if len > output.len() - dst {
                return Err("match runs past end of output");
            }
            // overlapping copies are intentional (run-length style matches)
            for i in 0..len {
                output[dst + i] = output[dst + i - off];
            }
            dst += len;
        } else {
            output[dst] = r.byte()?;
            dst += 1;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &[u8]) {
        let packed = pack(input);
        assert!(packed.len() <= BriefLz.max_output_size(input.len()));
        let mut out = vec![0u8; input.len()];
        depack(&packed, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn empty_and_tiny_inputs() {
        assert!(pack(&[]).is_empty());
        assert_eq!(pack(&[0x7F]), vec![0x7F]);
        round_trip(&[1, 2]);
        round_trip(b"abcd");
        round_trip(b"abcde");
    }

    #[test]
    fn repetitive_input_shrinks() {
        let input = b"\x7fELF\x02\x01\x01".repeat(600);
        let packed = pack(&input);
        assert!(packed.len() < input.len() / 4);
        round_trip(&input);
    }

    #[test]
    fn long_runs_and_far_offsets() {
        let mut input = vec![0u8; 70_000];
        for (i, b) in input.iter_mut().enumerate().skip(1000) {
            *b = (i.wrapping_mul(7919) >> 5) as u8;
        }
        input.extend_from_within(1000..3000);
        round_trip(&input);
    }

    #[test]
    fn leading_bytes_are_literal_then_tag() {
        let packed = pack(b"\x7fELFELFELF");
        assert_eq!(packed[0], 0x7F);
        // the first tag word follows the raw byte; its high bits are the first
        // literal decisions
        let tag = u16::from_le_bytes([packed[1], packed[2]]);
        assert_eq!(tag >> 13, 0b000);
    }

    #[test]
    fn oversized_gamma_codes_are_errors() {
        // one literal, then a match whose length code is all ones
        let mut stream = vec![0x41];
        for _ in 0..7 {
            stream.extend_from_slice(&[0xFF, 0xFF]);
        }
        stream.extend_from_slice(&[0xFC, 0xFF]);
        stream.extend_from_slice(&[0; 8]);
        let mut out = vec![0u8; 64];
        assert_eq!(depack(&stream, &mut out), Err("gamma code overflow"));

        // literal, match bit, length gamma 2, then an offset gamma far beyond dst
        let mut far = vec![0x41];
        far.extend_from_slice(&0b1001_1111_1111_1100u16.to_le_bytes());
        far.extend_from_slice(&[0; 8]);
        assert!(depack(&far, &mut out).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let input = b"some text that is long enough to need several tag words".repeat(4);
        let packed = pack(&input);
        let mut out = vec![0u8; input.len()];
        assert!(depack(&packed[..packed.len() / 2], &mut out).is_err());
    }
}
