//! Kanzi-style executable filter.
//!
//! Output layout: `tag` (0x40 x86, 0x20 ARM64), LE32 code start, LE32 index
//! of the end of the code region in the filtered stream, then the pre-code
//! bytes, the rewritten code region and the untouched tail. Branch targets in
//! the code region are stored as absolute positions so repeated calls to the
//! same function produce identical byte patterns.

use super::Arch;
use crate::error::FilterError;
use std::ops::Range;

pub const TAG_X86: u8 = 0x40;
pub const TAG_ARM64: u8 = 0x20;
pub const HEADER_LEN: usize = 9;

pub const MIN_BLOCK_SIZE: usize = 4096;
pub const MAX_BLOCK_SIZE: usize = (1 << 28) - 1;

const X86_ESCAPE: u8 = 0x9B;
const X86_TWO_BYTE_PREFIX: u8 = 0x0F;
const X86_MASK_JCC: u8 = 0xF0;
const X86_JCC: u8 = 0x80;
const X86_MASK_JUMP: u8 = 0xFE;
const X86_JUMP: u8 = 0xE8;
const X86_ADDR_MASK: i32 = 0x00FF_FFFF;
const MASK_ADDRESS: i32 = 0xF0F0_F0F0u32 as i32;
const X86_MIN_MATCHES: usize = 8;

const ARM_B_OPCODE_MASK: u32 = 0xFC00_0000;
const ARM_OPCODE_B: u32 = 0x1400_0000;
const ARM_OPCODE_BL: u32 = 0x9400_0000;
const ARM_B_ADDR_MASK: u32 = 0x03FF_FFFF;
const ARM_B_ADDR_SGN_MASK: u32 = 1 << 25;
const ARM_CB_OPCODE_MASK: u32 = 0x7F00_0000;
const ARM_OPCODE_CBZ: u32 = 0x3400_0000;
const ARM_OPCODE_CBNZ: u32 = 0x3500_0000;
const ARM_MIN_MATCHES: usize = 16;

const FILTER: &str = "Kanzi-EXE";

pub fn tag_for(arch: Arch) -> u8 {
    match arch {
        Arch::X86 => TAG_X86,
        Arch::Arm64 => TAG_ARM64,
    }
}

/// Architecture of a filtered buffer, judged from its first byte.
pub fn sniff(filtered: &[u8]) -> Option<Arch> {
    if filtered.len() < HEADER_LEN {
        return None;
    }
    match filtered[0] {
        TAG_X86 => Some(Arch::X86),
        TAG_ARM64 => Some(Arch::Arm64),
        _ => None,
    }
}

fn max_encoded_len(len: usize) -> usize {
    if len <= 256 {
        len + 32
    } else {
        len + len / 8
    }
}

fn le32(b: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Filters `src`. `arch` and `code` come from the ELF headers when known;
/// otherwise both are guessed from byte statistics. `None` means refused.
pub fn forward(src: &[u8], arch: Option<Arch>, code: Option<Range<usize>>) -> Option<Vec<u8>> {
    if src.len() < MIN_BLOCK_SIZE || src.len() > MAX_BLOCK_SIZE {
        return None;
    }

    // jump decoding reads 4 bytes past an opcode; keep the code region short
    // of the end so those reads stay in bounds
    let code_limit = src.len() - 8;
    let range = code.unwrap_or(0..code_limit);
    let range = range.start.min(code_limit)..range.end.min(code_limit);
    let arch = match arch {
        Some(arch) => arch,
        None => detect_arch(src, range.clone())?,
    };

    match arch {
        Arch::X86 => forward_x86(src, range),
        Arch::Arm64 => forward_arm64(src, (range.start & !3)..(range.end & !3)),
    }
}

fn forward_x86(src: &[u8], code: Range<usize>) -> Option<Vec<u8>> {
    let count = src.len();
    let dst_end = max_encoded_len(count) - 5;
    let mut dst = Vec::with_capacity(max_encoded_len(count));
    dst.push(TAG_X86);
    dst.extend_from_slice(&[0u8; 8]);
    dst.extend_from_slice(&src[..code.start]);

    let mut i = code.start;
    let mut matches = 0;

    while i < code.end && dst.len() < dst_end {
        if src[i] == X86_TWO_BYTE_PREFIX {
            dst.push(src[i]);
            i += 1;
            if src[i] & X86_MASK_JCC != X86_JCC {
                if src[i] == X86_ESCAPE {
                    dst.push(X86_ESCAPE);
                }
                dst.push(src[i]);
                i += 1;
                continue;
            }
        } else if src[i] & X86_MASK_JUMP != X86_JUMP {
            if src[i] == X86_ESCAPE {
                dst.push(X86_ESCAPE);
            }
            dst.push(src[i]);
            i += 1;
            continue;
        }

        // call/jmp rel32 or jcc rel32 opcode at i
        let sgn = src[i + 4];
        let offset = le32(src, i + 1);
        if (sgn != 0 && sgn != 0xFF) || offset == 0xFF00_0000u32 as i32 {
            dst.push(X86_ESCAPE);
            dst.push(src[i]);
            i += 1;
            continue;
        }

        let rel = if sgn == 0 {
            offset
        } else {
            -(offset.wrapping_neg() & X86_ADDR_MASK)
        };
        let addr = (i as i32).wrapping_add(rel);
        dst.push(src[i]);
        dst.extend_from_slice(&(addr ^ MASK_ADDRESS).to_be_bytes());
        i += 5;
        matches += 1;
    }

    if i < code.end || matches < X86_MIN_MATCHES {
        log::debug!("{FILTER} x86: refused ({matches} matches)");
        return None;
    }
    finish(dst, src, i, code.start, dst_end, count / 25)
}

fn forward_arm64(src: &[u8], code: Range<usize>) -> Option<Vec<u8>> {
    let count = src.len();
    let dst_end = max_encoded_len(count) - 8;
    let mut dst = Vec::with_capacity(max_encoded_len(count));
    dst.push(TAG_ARM64);
    dst.extend_from_slice(&[0u8; 8]);
    dst.extend_from_slice(&src[..code.start]);

    let mut i = code.start;
    let mut matches = 0;

    while i < code.end && dst.len() < dst_end {
        let raw = &src[i..i + 4];
        let instr = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let opcode = instr & ARM_B_OPCODE_MASK;

        if opcode != ARM_OPCODE_B && opcode != ARM_OPCODE_BL {
            dst.extend_from_slice(raw);
            i += 4;
            continue;
        }

        let offset = (instr & ARM_B_ADDR_MASK) as i64;
        let rel = if instr & ARM_B_ADDR_SGN_MASK == 0 {
            offset
        } else {
            -((-offset) & ARM_B_ADDR_MASK as i64)
        };
        let mut addr = (i as i64 + 4 * rel).max(0);
        if (addr >> 2) > ARM_B_ADDR_MASK as i64 {
            // target not representable, store raw like a null target
            addr = 0;
        }

        let val = opcode | (addr >> 2) as u32;
        dst.extend_from_slice(&val.to_le_bytes());
        if addr == 0 {
            dst.extend_from_slice(raw);
        } else {
            matches += 1;
        }
        i += 4;
    }

    if i < code.end || matches < ARM_MIN_MATCHES {
        log::debug!("{FILTER} arm64: refused ({matches} matches)");
        return None;
    }
    finish(dst, src, i, code.start, dst_end, count / 50)
}

/// Writes the sub-header, appends the tail and applies the expansion cap.
fn finish(
    mut dst: Vec<u8>,
    src: &[u8],
    consumed: usize,
    code_start: usize,
    dst_end: usize,
    max_growth: usize,
) -> Option<Vec<u8>> {
    let tail = &src[consumed..];
    if dst.len() + tail.len() > dst_end {
        return None;
    }

    let code_end = i32::try_from(dst.len()).ok()?;
    let code_start = i32::try_from(code_start).ok()?;
    dst[1..5].copy_from_slice(&code_start.to_le_bytes());
    dst[5..9].copy_from_slice(&code_end.to_le_bytes());
    dst.extend_from_slice(tail);

    if dst.len() > src.len() + max_growth {
        log::debug!(
            "{FILTER}: refused, output {} exceeds input {} by more than {max_growth}",
            dst.len(),
            src.len()
        );
        return None;
    }
    Some(dst)
}

/// Statistical architecture guess for inputs without usable headers.
fn detect_arch(src: &[u8], code: Range<usize>) -> Option<Arch> {
    let count = code.len();
    if count == 0 {
        return None;
    }

    let mut histo = [0usize; 256];
    let mut jumps_x86 = 0;
    let mut jumps_arm64 = 0;
    let mut i = code.start;

    while i < code.end {
        let b = src[i];
        histo[b as usize] += 1;

        if b & X86_MASK_JUMP == X86_JUMP {
            if is_ms_byte(src[i + 4]) {
                jumps_x86 += 1;
                i += 1;
                continue;
            }
        } else if b == X86_TWO_BYTE_PREFIX {
            i += 1;
            if src[i] == 0x38 || src[i] == 0x3A {
                i += 1;
            }
            if src[i] & X86_MASK_JCC == X86_JCC {
                jumps_x86 += 1;
                i += 1;
                continue;
            }
        }

        if i & 3 == 0 && i + 4 <= src.len() {
            let instr = u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]]);
            let op1 = instr & ARM_B_OPCODE_MASK;
            let op2 = instr & ARM_CB_OPCODE_MASK;
            if op1 == ARM_OPCODE_B
                || op1 == ARM_OPCODE_BL
                || op2 == ARM_OPCODE_CBZ
                || op2 == ARM_OPCODE_CBNZ
            {
                jumps_arm64 += 1;
            }
        }
        i += 1;
    }

    let printable: usize = histo
        .iter()
        .enumerate()
        .filter(|(b, _)| (0x20..0x7F).contains(b) || matches!(*b, 9 | 10 | 13))
        .map(|(_, n)| n)
        .sum();
    if printable * 10 > count * 9 {
        log::debug!("{FILTER}: input looks like text");
        return None;
    }
    // multimedia-like data has few zeros and 0xFF bytes
    if histo[0] < count / 10 || histo[255] < count / 100 {
        return None;
    }
    let small: usize = histo[..16].iter().sum();
    if small > count / 2 {
        return None;
    }

    if jumps_x86 >= count / 200 && histo[255] >= count / 50 {
        Some(Arch::X86)
    } else if jumps_arm64 >= count / 200 {
        Some(Arch::Arm64)
    } else {
        None
    }
}

fn is_ms_byte(b: u8) -> bool {
    b == 0 || b == 0xFF
}

fn truncated(offset: usize) -> FilterError {
    FilterError::Truncated {
        filter: FILTER,
        offset,
    }
}

/// Reverses [`forward`]. The result must be exactly `expected_len` bytes.
pub fn inverse(src: &[u8], expected_len: usize) -> Result<Vec<u8>, FilterError> {
    let arch = sniff(src).ok_or(FilterError::MalformedHeader { filter: FILTER })?;
    let code_start = le32(src, 1);
    let code_end = le32(src, 5);
    if code_start < 0
        || code_end < 0
        || code_end as usize > src.len()
        || code_start as usize + HEADER_LEN > src.len()
    {
        return Err(FilterError::MalformedHeader { filter: FILTER });
    }
    let code_start = code_start as usize;
    let code_end = code_end as usize;

    let mut out = Vec::with_capacity(expected_len);
    let mut i = HEADER_LEN + code_start;
    out.extend_from_slice(&src[HEADER_LEN..i]);

    match arch {
        Arch::X86 => inverse_x86(src, &mut i, code_end, &mut out)?,
        Arch::Arm64 => inverse_arm64(src, &mut i, code_end, &mut out)?,
    }

    if i < src.len() {
        out.extend_from_slice(&src[i..]);
    }

    if out.len() != expected_len {
        return Err(FilterError::LengthMismatch {
            filter: FILTER,
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

fn inverse_x86(src: &[u8], i: &mut usize, code_end: usize, out: &mut Vec<u8>) -> Result<(), FilterError> {
    let byte = |at: usize| src.get(at).copied().ok_or_else(|| truncated(at));

    while *i < code_end {
        let b = byte(*i)?;
        if b == X86_TWO_BYTE_PREFIX {
            out.push(b);
            *i += 1;
            let next = byte(*i)?;
            if next & X86_MASK_JCC != X86_JCC {
                if next == X86_ESCAPE {
                    *i += 1;
                }
                out.push(byte(*i)?);
                *i += 1;
                continue;
            }
        } else if b & X86_MASK_JUMP != X86_JUMP {
            if b == X86_ESCAPE {
                *i += 1;
            }
            out.push(byte(*i)?);
            *i += 1;
            continue;
        }

        let operand = src.get(*i + 1..*i + 5).ok_or_else(|| truncated(*i + 1))?;
        let addr = i32::from_be_bytes([operand[0], operand[1], operand[2], operand[3]]) ^ MASK_ADDRESS;
        let offset = addr.wrapping_sub(out.len() as i32);
        let rel = if offset >= 0 {
            offset
        } else {
            -(offset.wrapping_neg() & X86_ADDR_MASK)
        };
        out.push(src[*i]);
        out.extend_from_slice(&rel.to_le_bytes());
        *i += 5;
    }
    Ok(())
}

fn inverse_arm64(src: &[u8], i: &mut usize, code_end: usize, out: &mut Vec<u8>) -> Result<(), FilterError> {
    while *i < code_end {
        let word = src.get(*i..*i + 4).ok_or_else(|| truncated(*i))?;
        let val = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        let opcode = val & ARM_B_OPCODE_MASK;
        *i += 4;

        if opcode != ARM_OPCODE_B && opcode != ARM_OPCODE_BL {
            out.extend_from_slice(word);
            continue;
        }

        let addr = ((val & ARM_B_ADDR_MASK) << 2) as i64;
        if addr == 0 {
            let raw = src.get(*i..*i + 4).ok_or_else(|| truncated(*i))?;
            out.extend_from_slice(raw);
            *i += 4;
        } else {
            let offset = (addr - out.len() as i64) >> 2;
            let instr = opcode | (offset as u32 & ARM_B_ADDR_MASK);
            out.extend_from_slice(&instr.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// x86-looking block: calls with short displacements between filler bytes
    /// that contain plenty of zeros and 0xFF.
    fn x86_block(len: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(len);
        let mut n: u32 = 0;
        while v.len() + 16 < len {
            let disp: i32 = if n % 3 == 0 { -0x200 } else { 0x180 + (n as i32 % 7) * 16 };
            v.push(0xE8);
            v.extend_from_slice(&disp.to_le_bytes());
            v.extend_from_slice(&[0x48, 0x89, 0xC7, 0x31, 0xFF, 0x0F, 0x84, 0x10, 0x20, 0x00, 0x00]);
            n += 1;
        }
        v.resize(len, 0x9B);
        v
    }

    fn arm64_block(len: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(len);
        let mut n: u32 = 0;
        while v.len() + 8 <= len {
            let imm = if n % 2 == 0 { 0x20 } else { ARM_B_ADDR_MASK - 3 };
            v.extend_from_slice(&(ARM_OPCODE_BL | imm).to_le_bytes());
            v.extend_from_slice(&0xD503_201Fu32.to_le_bytes());
            n += 1;
        }
        v.resize(len, 0);
        v
    }

    #[test]
    fn x86_round_trip_with_known_range() {
        let src = x86_block(8192);
        let out = forward(&src, Some(Arch::X86), Some(64..8000)).expect("accepted");
        assert_eq!(out[0], TAG_X86);
        assert_eq!(le32(&out, 1), 64);
        assert!(out.len() <= src.len() + src.len() / 25);
        assert_eq!(inverse(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn x86_escapes_survive() {
        let mut src = x86_block(6000);
        // 0x0F followed by the escape byte and a bare escape byte
        src[100..103].copy_from_slice(&[0x0F, 0x9B, 0x9B]);
        let out = forward(&src, Some(Arch::X86), Some(0..6000)).unwrap();
        assert_eq!(inverse(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn arm64_round_trip() {
        let src = arm64_block(8192);
        let out = forward(&src, Some(Arch::Arm64), Some(0..8192)).expect("accepted");
        assert_eq!(out[0], TAG_ARM64);
        assert!(out.len() <= src.len() + src.len() / 50);
        assert_eq!(inverse(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn refuses_small_or_branchless_input() {
        assert!(forward(&x86_block(4000), Some(Arch::X86), Some(0..4000)).is_none());
        assert!(forward(&vec![0x11u8; 8192], Some(Arch::X86), Some(0..8192)).is_none());
        assert!(forward(&vec![0x11u8; 8192], Some(Arch::Arm64), Some(0..8192)).is_none());
    }

    #[test]
    fn refuses_text_when_guessing() {
        let text = b"The quick brown fox jumps over the lazy dog. ".repeat(200);
        assert!(forward(&text, None, None).is_none());
    }

    #[test]
    fn guesses_x86_from_statistics() {
        let src = x86_block(8192);
        let out = forward(&src, None, None).expect("detected as x86");
        assert_eq!(sniff(&out), Some(Arch::X86));
        assert_eq!(inverse(&out, src.len()).unwrap(), src);
    }

    #[test]
    fn inverse_reports_mismatch_and_garbage() {
        let src = x86_block(8192);
        let out = forward(&src, Some(Arch::X86), Some(0..8192)).unwrap();
        match inverse(&out, src.len() + 1) {
            Err(FilterError::LengthMismatch { expected, actual, .. }) => {
                assert_eq!(expected, src.len() + 1);
                assert_eq!(actual, src.len());
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut bad = out.clone();
        bad[5..9].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(inverse(&bad, src.len()), Err(FilterError::MalformedHeader { .. })));
        assert!(inverse(&[0x7F; 4], 4).is_err());
    }
}
