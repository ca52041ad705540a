pub mod elf;

pub use elf::*;

/// `e_ident[EI_CLASS]` value for 64-bit objects.
pub const ELFCLASS64: u8 = 2;

/// `e_ident[EI_DATA]` value for little-endian objects.
pub const ELFDATA2LSB: u8 = 1;

/// ELF identification magic.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Reads `e_machine` straight from raw bytes when they start with an ELF header.
pub fn sniff_machine(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 20 || bytes[..4] != ELF_MAGIC {
        return None;
    }
    Some(u16::from_le_bytes([bytes[18], bytes[19]]))
}
