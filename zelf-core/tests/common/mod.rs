#![allow(dead_code)]

use goblin::elf::header::{EM_X86_64, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_X, PT_INTERP, PT_LOAD};
use zelf_core::header::{Elf64Ehdr, Elf64Phdr};

pub const BASE: u64 = 0x40_0000;
pub const CODE_START: usize = 0x140;
const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

/// x86-64 code where every block calls the first instruction of the block
/// run, so all rel32 targets land in the same segment.
pub fn x86_text(len: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(len + 16);
    while v.len() < len {
        let p = v.len();
        let disp = -((p + 9) as i32);
        v.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xE8]);
        v.extend_from_slice(&disp.to_le_bytes());
        v.extend_from_slice(&[0x48, 0x31, 0xC0, 0x5D, 0xC3, 0x90, 0x90]);
    }
    v.truncate(len);
    v
}

pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

fn write_headers(buf: &mut [u8], ehdr: &Elf64Ehdr, phdrs: &[Elf64Phdr]) {
    let mut head = Vec::new();
    ehdr.write_to(&mut head).unwrap();
    for ph in phdrs {
        ph.write_to(&mut head).unwrap();
    }
    buf[..head.len()].copy_from_slice(&head);
}

/// A `total`-byte ELF64 executable: a text `PT_LOAD` from offset 0 holding
/// `body` at [`CODE_START`], then a read-only `PT_LOAD` with strings. With
/// `interp` a `PT_INTERP` entry is added.
pub fn elf_with_body(total: usize, machine: u16, interp: bool, body: &[u8]) -> Vec<u8> {
    let text_end = total * 3 / 4;
    assert!(CODE_START + body.len() <= text_end);

    let mut buf = vec![0u8; total];
    buf[CODE_START..CODE_START + body.len()].copy_from_slice(body);
    for (i, b) in buf[text_end..].iter_mut().enumerate() {
        *b = b"zelf test rodata\0"[i % 17];
    }

    let mut phdrs = vec![
        Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0,
            p_vaddr: BASE,
            p_paddr: BASE,
            p_filesz: text_end as u64,
            p_memsz: text_end as u64,
            p_align: 0x1000,
        },
        Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: text_end as u64,
            p_vaddr: BASE + 0x10_0000 + text_end as u64,
            p_paddr: BASE + 0x10_0000 + text_end as u64,
            p_filesz: (total - text_end) as u64,
            p_memsz: (total - text_end) as u64 + 0x80,
            p_align: 0x1000,
        },
    ];
    if interp {
        let off = Elf64Ehdr::SIZE + 3 * Elf64Phdr::SIZE;
        buf[off..off + INTERP.len()].copy_from_slice(INTERP);
        phdrs.push(Elf64Phdr {
            p_type: PT_INTERP,
            p_flags: PF_R,
            p_offset: off as u64,
            p_vaddr: BASE + off as u64,
            p_paddr: BASE + off as u64,
            p_filesz: INTERP.len() as u64,
            p_memsz: INTERP.len() as u64,
            p_align: 1,
        });
    }

    let ehdr = Elf64Ehdr::new(ET_EXEC, machine, BASE + CODE_START as u64, phdrs.len() as u16);
    write_headers(&mut buf, &ehdr, &phdrs);
    buf
}

/// Call-heavy x86-64 executable of `total` bytes.
pub fn synthetic_elf(total: usize) -> Vec<u8> {
    let text = x86_text(total * 3 / 4 - CODE_START);
    elf_with_body(total, EM_X86_64, false, &text)
}

/// ELF with `n` disjoint file-backed `PT_LOAD` segments of `size` bytes each.
/// Segment `i` sits at file offset `0x1000 * (i + 1)` and vaddr
/// `BASE + 0x10_0000 * i`.
pub fn elf_with_loads(n: usize, size: u64) -> Vec<u8> {
    let total = 0x1000 * (n + 1);
    let mut buf = vec![0u8; total];
    let phdrs: Vec<Elf64Phdr> = (0..n)
        .map(|i| {
            let offset = 0x1000 * (i as u64 + 1);
            let vaddr = BASE + 0x10_0000 * i as u64;
            Elf64Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: offset,
                p_vaddr: vaddr,
                p_paddr: vaddr,
                p_filesz: size,
                p_memsz: size * 2,
                p_align: 0x1000,
            }
        })
        .collect();
    let ehdr = Elf64Ehdr::new(ET_EXEC, EM_X86_64, BASE, n as u16);
    write_headers(&mut buf, &ehdr, &phdrs);
    buf
}
