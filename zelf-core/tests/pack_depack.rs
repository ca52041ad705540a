mod common;

use byteorder::{ByteOrder, LE};
use common::{elf_with_body, noise, synthetic_elf, x86_text, CODE_START};
use goblin::elf::header::{EM_AARCH64, EM_X86_64};
use zelf_core::container::{LEGACY_HEADER_LEN, MODERN_HEADER_LEN};
use zelf_core::depack::{self, DepackOptions};
use zelf_core::error::{CodecError, FilterError, FormatError};
use zelf_core::params::PARAMS_MAGIC;
use zelf_core::{
    AddressMode, Arch, CodecKind, ContainerHeader, Depacker, Discovery, Error, FilterChoice, FilterKind,
    LayoutKind, LayoutSource, MismatchPolicy, PackOptions, Packer, SystemResources,
};

fn packer(codec: CodecKind, filter: FilterChoice) -> Packer<'static> {
    Packer::new(PackOptions {
        codec,
        filter,
        allow_growth: true,
        ..PackOptions::default()
    })
    .with_resources(SystemResources::unlimited())
}

fn params_offset(packed: &[u8]) -> usize {
    packed
        .windows(PARAMS_MAGIC.len())
        .position(|w| w == PARAMS_MAGIC)
        .expect("artifact carries a ParamsBlock")
}

#[test]
fn lz4_without_filter_is_modern_and_round_trips() {
    let input = synthetic_elf(4096);
    let (packed, report) = packer(CodecKind::Lz4, FilterChoice::None)
        .pack_bytes(input.clone())
        .unwrap();

    assert_eq!(report.filter, FilterKind::None);
    assert_eq!(report.layout, LayoutKind::Modern);
    assert_eq!(report.address_mode, AddressMode::Static);
    assert!(report.packed_size < input.len());

    let at = report.container_offset;
    assert_eq!(&packed[at..at + 6], b"zELFl4");
    assert_eq!(LE::read_u64(&packed[at + 6..at + 14]), 4096);
    assert_eq!(LE::read_i32(&packed[at + 26..at + 30]), 4096);

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(out, input);
    assert_eq!(depacked.inspection.discovery, Discovery::Structured);
    assert_eq!(depacked.inspection.decision.source, LayoutSource::ParamsFlag);
    assert_eq!(depacked.filter, FilterKind::None);
    assert!(!depacked.recovered);
}

#[test]
fn brieflz_with_bcj_is_legacy() {
    let input = synthetic_elf(8192);
    let (packed, report) = packer(CodecKind::BriefLz, FilterChoice::Bcj)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.filter, FilterKind::Bcj);
    assert_eq!(report.layout, LayoutKind::Legacy);

    let inspection = depack::inspect(&packed).unwrap();
    assert_eq!(inspection.codec(), CodecKind::BriefLz);
    assert_eq!(inspection.header().filtered_size, None);
    assert_eq!(
        inspection.container.payload.start,
        report.container_offset + LEGACY_HEADER_LEN
    );
    assert!(inspection.decision.bcj);
    assert_eq!(inspection.decision.source, LayoutSource::ParamsFlag);

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(out, input);
    assert_eq!(depacked.filter, FilterKind::Bcj);
}

#[test]
fn stripped_params_fall_back_to_scan_and_heuristic() {
    let input = synthetic_elf(8192);
    let (mut packed, _) = packer(CodecKind::BriefLz, FilterChoice::Bcj)
        .pack_bytes(input.clone())
        .unwrap();
    let at = params_offset(&packed);
    packed[at..at + PARAMS_MAGIC.len()].fill(0);

    let (out, report) = Depacker::default().unpack_bytes(&packed).unwrap();
    let inspection = &report.inspection;
    assert!(inspection.params.is_none());
    assert_eq!(inspection.discovery, Discovery::MarkerScan);
    assert_eq!(inspection.decision.source, LayoutSource::Heuristic);
    assert_eq!(inspection.decision.layout, LayoutKind::Legacy);
    assert!(inspection.decision.bcj);
    assert_eq!(out, input);
}

#[test]
fn stripped_params_modern_container_is_recognised() {
    let input = synthetic_elf(4096);
    let (mut packed, _) = packer(CodecKind::Lz4, FilterChoice::None)
        .pack_bytes(input.clone())
        .unwrap();
    let at = params_offset(&packed);
    packed[at..at + PARAMS_MAGIC.len()].fill(0);

    let (out, report) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(report.inspection.decision.layout, LayoutKind::Modern);
    assert!(!report.inspection.decision.bcj);
    assert_eq!(out, input);
}

#[test]
fn pie_output_is_found_by_marker_scan() {
    let text = x86_text(8192 * 3 / 4 - CODE_START);
    let input = elf_with_body(8192, EM_X86_64, true, &text);
    let (packed, report) = packer(CodecKind::Snappy, FilterChoice::None)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.address_mode, AddressMode::PositionIndependent);
    assert_eq!(report.packed_data_vaddr, 0);

    let elf = goblin::elf::Elf::parse(&packed).unwrap();
    assert_eq!(elf.header.e_type, goblin::elf::header::ET_DYN);

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    let inspection = &depacked.inspection;
    assert_eq!(inspection.discovery, Discovery::MarkerScan);
    // the block still decides the layout even though it could not locate
    assert_eq!(inspection.decision.source, LayoutSource::ParamsFlag);
    assert_eq!(inspection.container.offset, report.container_offset);
    assert_eq!(out, input);
}

#[test]
fn explicit_address_mode_overrides_the_input() {
    let input = synthetic_elf(8192);
    let (packed, report) = Packer::new(PackOptions {
        codec: CodecKind::Lz4,
        filter: FilterChoice::None,
        address_mode: Some(AddressMode::PositionIndependent),
        allow_growth: true,
        ..PackOptions::default()
    })
    .with_resources(SystemResources::unlimited())
    .pack_bytes(input.clone())
    .unwrap();
    assert_eq!(report.address_mode, AddressMode::PositionIndependent);
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn kanzi_filter_round_trips() {
    let input = synthetic_elf(16384);
    let (packed, report) = packer(CodecKind::Lz4, FilterChoice::Kanzi)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.filter, FilterKind::Kanzi);
    assert_eq!(report.layout, LayoutKind::Modern);
    assert!(report.filtered_size > input.len());

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(depacked.filter, FilterKind::Kanzi);
    assert!(depacked.inspection.params.unwrap().block.kanzi());
    assert_eq!(out, input);
}

#[test]
fn kanzi_refusal_packs_unfiltered() {
    // below the Kanzi minimum block size
    let input = synthetic_elf(2048);
    let (packed, report) = packer(CodecKind::Lz4, FilterChoice::Kanzi)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.requested_filter, FilterKind::Kanzi);
    assert_eq!(report.filter, FilterKind::None);
    assert_eq!(report.filtered_size, input.len());
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn zstd_is_always_legacy() {
    let input = synthetic_elf(8192);
    let (packed, report) = packer(CodecKind::Zstd, FilterChoice::None)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.layout, LayoutKind::Legacy);

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(depacked.inspection.decision.source, LayoutSource::CodecRule);
    assert!(!depacked.inspection.decision.bcj);
    assert_eq!(out, input);
}

#[test]
fn zstd_with_kanzi_uses_the_widened_buffer() {
    let input = synthetic_elf(16384);
    let (packed, report) = packer(CodecKind::Zstd, FilterChoice::Kanzi)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(report.layout, LayoutKind::Legacy);
    assert_eq!(report.filter, FilterKind::Kanzi);

    let (out, depacked) = Depacker::default().unpack_bytes(&packed).unwrap();
    assert_eq!(depacked.filter, FilterKind::Kanzi);
    assert_eq!(out, input);
}

#[test]
fn lzma_and_snappy_round_trip_with_bcj() {
    let input = synthetic_elf(8192);
    for codec in [CodecKind::Lzma, CodecKind::Snappy] {
        let (packed, report) = packer(codec, FilterChoice::Bcj)
            .pack_bytes(input.clone())
            .unwrap();
        assert_eq!(report.layout, LayoutKind::Legacy);
        assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input, "{codec}");
    }
}

#[test]
fn aarch64_input_round_trips() {
    let mut text = Vec::new();
    while text.len() < 8192 * 3 / 4 - CODE_START {
        // bl #-n; nop
        let back = (text.len() / 4) as u32;
        text.extend_from_slice(&(0x9400_0000 | (0x03FF_FFFF & back.wrapping_neg())).to_le_bytes());
        text.extend_from_slice(&0xD503_201Fu32.to_le_bytes());
    }
    text.truncate(8192 * 3 / 4 - CODE_START);
    let input = elf_with_body(8192, EM_AARCH64, false, &text);

    let (packed, _) = packer(CodecKind::Lz4, FilterChoice::Bcj)
        .pack_bytes(input.clone())
        .unwrap();
    let elf = goblin::elf::Elf::parse(&packed).unwrap();
    assert_eq!(elf.header.e_machine, EM_AARCH64);
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn auto_filter_round_trips() {
    let input = synthetic_elf(16384);
    let (packed, report) = packer(CodecKind::Lz4, FilterChoice::Auto)
        .pack_bytes(input.clone())
        .unwrap();
    assert_ne!(report.requested_filter, FilterKind::None);
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn growth_guard_rejects_incompressible_input() {
    let mut input = synthetic_elf(4096);
    input[CODE_START..].copy_from_slice(&noise(4096 - CODE_START, 7));
    let guarded = Packer::new(PackOptions {
        codec: CodecKind::Lz4,
        filter: FilterChoice::None,
        ..PackOptions::default()
    })
    .with_resources(SystemResources::unlimited());

    match guarded.pack_bytes(input.clone()) {
        Err(Error::NoGain { original, packed }) => {
            assert_eq!(original, 4096);
            assert!(packed >= original);
        }
        other => panic!("expected NoGain, got {other:?}"),
    }

    let (packed, _) = packer(CodecKind::Lz4, FilterChoice::None)
        .pack_bytes(input.clone())
        .unwrap();
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn admission_refuses_before_compressing() {
    let input = synthetic_elf(8192);
    let tight = SystemResources {
        available_ram: Some(1 << 20),
        rlimit_as: None,
    };
    let err = packer(CodecKind::Exomizer, FilterChoice::None)
        .with_resources(tight)
        .pack_bytes(input)
        .unwrap_err();
    assert!(matches!(err, Error::Resource(_)), "{err}");
}

#[test]
fn unavailable_backend_is_reported() {
    let err = packer(CodecKind::Apultra, FilterChoice::None)
        .pack_bytes(synthetic_elf(8192))
        .unwrap_err();
    assert!(matches!(err, Error::Codec(CodecError::Unavailable("Apultra"))), "{err}");
}

#[test]
fn non_elf_input_is_rejected() {
    let err = packer(CodecKind::Lz4, FilterChoice::None)
        .pack_bytes(b"#!/bin/sh\necho hi\n".to_vec())
        .unwrap_err();
    assert!(matches!(err, Error::Format(FormatError::NotElf(_))), "{err}");
}

#[test]
fn password_seal_is_checked() {
    let input = synthetic_elf(8192);
    let (packed, report) = Packer::new(PackOptions {
        codec: CodecKind::Lz4,
        filter: FilterChoice::None,
        allow_growth: true,
        password: Some("hunter2".into()),
        ..PackOptions::default()
    })
    .with_resources(SystemResources::unlimited())
    .pack_bytes(input.clone())
    .unwrap();
    assert!(report.sealed);

    let with = |pw: Option<&str>| {
        Depacker::new(DepackOptions {
            password: pw.map(str::to_owned),
            ..DepackOptions::default()
        })
    };

    let err = with(Some("wrong")).unpack_bytes(&packed).unwrap_err();
    assert!(matches!(err, Error::PasswordMismatch));
    assert_eq!(with(Some("hunter2")).unpack_bytes(&packed).unwrap().0, input);
    // no password given: warn and carry on
    assert_eq!(with(None).unpack_bytes(&packed).unwrap().0, input);
}

#[test]
fn pack_best_keeps_the_smallest_candidate() {
    let input = synthetic_elf(16384);
    let image = zelf_core::ElfImage::parse(input.clone()).unwrap();
    let p = packer(CodecKind::Lz4, FilterChoice::Auto);

    let (packed, report) = p
        .pack_best(&image, &[CodecKind::Lz4, CodecKind::Zstd, CodecKind::Apultra])
        .unwrap();
    assert_ne!(report.codec, CodecKind::Apultra);

    for codec in [CodecKind::Lz4, CodecKind::Zstd] {
        for filter in [FilterChoice::Bcj, FilterChoice::Kanzi, FilterChoice::None] {
            let (other, _) = packer(codec, filter).pack_image(&image).unwrap();
            assert!(packed.len() <= other.len());
        }
    }
    assert_eq!(Depacker::default().unpack_bytes(&packed).unwrap().0, input);

    let err = p.pack_best(&image, &[CodecKind::Apultra]).unwrap_err();
    assert!(matches!(err, Error::Codec(CodecError::Unavailable(_))));
}

#[test]
fn missing_container_is_not_found() {
    let err = Depacker::default()
        .unpack_bytes(&synthetic_elf(4096))
        .unwrap_err();
    assert!(matches!(err, Error::Format(FormatError::NotFound)), "{err}");
}

#[test]
fn corrupt_payload_fails_decompression() {
    let input = synthetic_elf(8192);
    let (mut packed, report) = packer(CodecKind::Lz4, FilterChoice::None)
        .pack_bytes(input)
        .unwrap();
    let start = report.container_offset + MODERN_HEADER_LEN;
    packed[start..start + 16].fill(0xFF);
    assert!(Depacker::default().unpack_bytes(&packed).is_err());
}

/// A bare Kanzi-filtered container whose `orig_size` disagrees with what the
/// inverse produces.
fn mismatched_kanzi_container() -> (Vec<u8>, Vec<u8>) {
    let input = synthetic_elf(16384);
    let filtered = zelf_core::filter::kanzi::forward(&input, Some(Arch::X86), Some(0..12288)).unwrap();
    let compressed = CodecKind::Lz4.backend().unwrap().compress(&filtered).unwrap();
    let header = ContainerHeader::new(
        CodecKind::Lz4,
        input.len() as u64 + 1,
        0,
        compressed.len(),
        Some(filtered.len()),
    )
    .unwrap();
    let mut file = vec![0u8; 32];
    file.extend_from_slice(&header.encode(&compressed));
    (file, filtered)
}

#[test]
fn kanzi_mismatch_is_lenient_by_default() {
    let (file, filtered) = mismatched_kanzi_container();
    let (out, report) = Depacker::default().unpack_bytes(&file).unwrap();
    assert!(report.recovered);
    assert_eq!(report.filter, FilterKind::Kanzi);
    assert_eq!(out, filtered);
}

#[test]
fn kanzi_mismatch_fails_when_strict() {
    let (file, _) = mismatched_kanzi_container();
    let strict = Depacker::new(DepackOptions {
        mismatch_policy: MismatchPolicy::Strict,
        ..DepackOptions::default()
    });
    let err = strict.unpack_bytes(&file).unwrap_err();
    assert!(
        matches!(err, Error::Filter(FilterError::LengthMismatch { .. })),
        "{err}"
    );
}
