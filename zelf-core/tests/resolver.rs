mod common;

use common::{elf_with_loads, BASE};
use zelf_core::error::ResolutionError;
use zelf_core::locator;
use zelf_core::params::{self, ParamsBlock, PACKED_DATA_VADDR_OFFSET};
use zelf_core::{AddressResolver, ElfImage};

#[test]
fn resolves_through_many_segments() {
    for n in [1usize, 2, 5, 12] {
        let bytes = elf_with_loads(n, 0x200);
        let image = ElfImage::parse(bytes).unwrap();
        assert_eq!(image.segments.len(), n);

        let resolver = AddressResolver::new(&image.segments);
        for i in 0..n as u64 {
            let vaddr = BASE + 0x10_0000 * i;
            let offset = 0x1000 * (i + 1);
            assert_eq!(resolver.resolve(vaddr).unwrap(), offset);
            assert_eq!(resolver.resolve(vaddr + 0x1ff).unwrap(), offset + 0x1ff);
            assert_eq!(resolver.vaddr_of(offset + 0x10), Some(vaddr + 0x10));
        }
        assert_eq!(resolver.loaded_file_end(), 0x1000 * n as u64 + 0x200);
    }
}

#[test]
fn bss_tail_and_gaps_do_not_resolve() {
    let image = ElfImage::parse(elf_with_loads(3, 0x200)).unwrap();
    let resolver = AddressResolver::new(&image.segments);

    // memsz is twice filesz; the extra half has no file bytes
    let bss = BASE + 0x10_0000 + 0x300;
    assert!(matches!(resolver.resolve(bss), Err(ResolutionError { vaddr }) if vaddr == bss));
    assert!(resolver.resolve(BASE + 0x8_0000).is_err());
    assert!(resolver.resolve(0).is_err());
    assert_eq!(resolver.vaddr_of(0x800), None);
}

#[test]
fn params_in_the_tail_win_over_loaded_bytes() {
    let mut bytes = elf_with_loads(2, 0x100);
    let decoy = ParamsBlock::new(true, false, None);
    let mut real = ParamsBlock::new(false, true, None);
    real.packed_data_vaddr = BASE + 0x40;

    // decoy inside the first segment, real one past every PT_LOAD
    let decoy_at = 0x1000 + 0x20;
    bytes[decoy_at..decoy_at + decoy.encoded_len()].copy_from_slice(&decoy.encode());
    let real_at = bytes.len();
    bytes.extend_from_slice(&real.encode());

    let segments = locator::load_segments(&bytes);
    let found = params::find(&bytes, &AddressResolver::new(&segments)).unwrap();
    assert_eq!(found.offset, real_at);
    assert!(found.block.kanzi());
    assert_eq!(
        u64::from_le_bytes(
            bytes[real_at + PACKED_DATA_VADDR_OFFSET..real_at + PACKED_DATA_VADDR_OFFSET + 8]
                .try_into()
                .unwrap()
        ),
        BASE + 0x40
    );
}

#[test]
fn unmapped_packed_vaddr_is_fatal() {
    let mut bytes = elf_with_loads(1, 0x100);
    let mut block = ParamsBlock::new(false, false, None);
    block.packed_data_vaddr = 0xdead_0000;
    bytes.extend_from_slice(&block.encode());

    let segments = locator::load_segments(&bytes);
    let err = locator::locate(&bytes, &segments).unwrap_err();
    assert!(matches!(err, zelf_core::Error::Resolution(_)), "{err}");
}
