//! Branch/call/jump converters, applied in place.
//!
//! x86 rewrites the rel32 of `E8`/`E9` into absolute form using the xz BCJ
//! state machine; ARM64 rewrites B/BL imm26 and ADRP page immediates. Both are
//! exact inverses of each other for any input, code or not.

const MASK_TO_BIT_NUMBER: [u32; 5] = [0, 1, 2, 2, 3];

fn is_ms_byte(b: u8) -> bool {
    b == 0 || b == 0xFF
}

fn x86_code(buf: &mut [u8], start: u32, encoding: bool) -> usize {
    if buf.len() < 5 {
        return 0;
    }

    let mut prev_mask: u32 = 0;
    let mut prev_pos: u32 = 0u32.wrapping_sub(5);
    if start.wrapping_sub(prev_pos) > 5 {
        prev_pos = start.wrapping_sub(5);
    }

    let limit = buf.len() - 5;
    let mut pos = 0usize;

    while pos <= limit {
        let opcode = buf[pos];
        if opcode != 0xE8 && opcode != 0xE9 {
            pos += 1;
            continue;
        }

        let here = start.wrapping_add(pos as u32);
        let distance = here.wrapping_sub(prev_pos);
        prev_pos = here;

        if distance > 5 {
            prev_mask = 0;
        } else {
            for _ in 0..distance {
                prev_mask &= 0x77;
                prev_mask <<= 1;
            }
        }

        let mut b = buf[pos + 4];
        let state = prev_mask >> 1;

        if is_ms_byte(b) && state <= 4 && state != 3 {
            let mut src = u32::from_le_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], b]);
            let next = here.wrapping_add(5);
            let mut dest;
            loop {
                dest = if encoding {
                    src.wrapping_add(next)
                } else {
                    src.wrapping_sub(next)
                };
                if prev_mask == 0 {
                    break;
                }
                let idx = MASK_TO_BIT_NUMBER[(prev_mask >> 1) as usize];
                b = (dest >> (24 - idx * 8)) as u8;
                if !is_ms_byte(b) {
                    break;
                }
                src = dest ^ ((1u32 << (32 - idx * 8)) - 1);
            }

            buf[pos + 4] = !(((dest >> 24) & 1).wrapping_sub(1)) as u8;
            buf[pos + 3] = (dest >> 16) as u8;
            buf[pos + 2] = (dest >> 8) as u8;
            buf[pos + 1] = dest as u8;
            pos += 5;
            prev_mask = 0;
        } else {
            pos += 1;
            prev_mask |= 1;
            if is_ms_byte(b) {
                prev_mask |= 0x10;
            }
        }
    }

    pos
}

/// Returns how far processing got; the last 4 bytes are never converted.
pub fn x86_encode(buf: &mut [u8], start: u32) -> usize {
    x86_code(buf, start, true)
}

pub fn x86_decode(buf: &mut [u8], start: u32) -> usize {
    x86_code(buf, start, false)
}

fn arm64_code(buf: &mut [u8], start_ip: u64, encoding: bool) -> usize {
    let size = buf.len() & !3;

    for i in (0..size).step_by(4) {
        let word = &mut buf[i..i + 4];
        let mut instr = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        let ip = start_ip.wrapping_add(i as u64);

        let op6 = instr >> 26;
        if op6 == 0x05 || op6 == 0x25 {
            // B / BL
            let pc = (ip >> 2) as u32;
            let imm26 = instr & 0x03FF_FFFF;
            let imm26 = if encoding {
                imm26.wrapping_add(pc)
            } else {
                imm26.wrapping_sub(pc)
            } & 0x03FF_FFFF;
            instr = (instr & 0xFC00_0000) | imm26;
            word.copy_from_slice(&instr.to_le_bytes());
            continue;
        }

        if instr & 0x9F00_0000 == 0x9000_0000 {
            // ADRP, only within +-512 MiB so the sign bits stay recoverable
            let mut addr = ((instr >> 29) & 3) | ((instr >> 3) & 0x001F_FFFC);
            if addr.wrapping_add(0x0002_0000) & 0x001C_0000 != 0 {
                continue;
            }

            let page = (ip >> 12) as u32;
            addr = if encoding {
                addr.wrapping_add(page)
            } else {
                addr.wrapping_sub(page)
            };

            instr &= 0x9000_001F;
            instr |= (addr & 3) << 29;
            instr |= (addr & 0x0003_FFFC) << 3;
            instr |= 0u32.wrapping_sub(addr & 0x0002_0000) & 0x00E0_0000;
            word.copy_from_slice(&instr.to_le_bytes());
        }
    }

    size
}

pub fn arm64_encode(buf: &mut [u8], start_ip: u64) -> usize {
    arm64_code(buf, start_ip, true)
}

pub fn arm64_decode(buf: &mut [u8], start_ip: u64) -> usize {
    arm64_code(buf, start_ip, false)
}
