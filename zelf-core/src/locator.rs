use crate::codec::CodecKind;
use crate::container::{LEGACY_HEADER_LEN, MARKER_PREFIX};
use crate::error::{FormatError, Result};
use crate::params::{self, FoundParams};
use crate::resolver::AddressResolver;
use crate::segments::SegmentInfo;
use byteorder::{ByteOrder, LE};
use std::fmt;

/// How the container was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Through the ParamsBlock's patched `packed_data_vaddr`.
    Structured,
    /// By scanning the file for an allow-listed marker.
    MarkerScan,
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discovery::Structured => f.write_str("structured"),
            Discovery::MarkerScan => f.write_str("marker scan"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub discovery: Discovery,
    pub offset: usize,
    /// The ParamsBlock, when one was found, even if it could not locate the
    /// container by itself.
    pub params: Option<FoundParams>,
}

/// `PT_LOAD` entries of `bytes`, or none when it does not parse as ELF.
pub fn load_segments(bytes: &[u8]) -> Vec<SegmentInfo> {
    match goblin::elf::Elf::parse(bytes) {
        Ok(elf) => SegmentInfo::from_goblin_ph(&elf),
        Err(e) => {
            log::debug!("input does not parse as ELF ({e}); scanning raw bytes");
            Vec::new()
        }
    }
}

/// Finds the container: the ParamsBlock's address when it is patched, the
/// marker scan otherwise. An address that no segment maps is an error rather
/// than a reason to scan.
pub fn locate(bytes: &[u8], segments: &[SegmentInfo]) -> Result<Located> {
    let resolver = AddressResolver::new(segments);
    let params = params::find(bytes, &resolver);

    if let Some(found) = params {
        log::debug!(
            "ParamsBlock at {:#x}: version {:#x}, packed_data_vaddr {:#x}",
            found.offset,
            found.block.version,
            found.block.packed_data_vaddr
        );
        let vaddr = found.block.packed_data_vaddr;
        if vaddr != 0 {
            let offset = resolver.resolve(vaddr)?;
            let offset = usize::try_from(offset).map_err(|_| FormatError::InvalidField {
                field: "packed_data_vaddr",
                value: vaddr as i64,
            })?;
            log::info!("container at {offset:#x} (structured, vaddr {vaddr:#x})");
            return Ok(Located {
                discovery: Discovery::Structured,
                offset,
                params,
            });
        }
        log::info!("ParamsBlock has no packed_data_vaddr; falling back to marker scan");
    } else {
        log::info!("no ParamsBlock; falling back to marker scan");
    }

    let offset = scan_markers(bytes).ok_or(FormatError::NotFound)?;
    log::info!("container at {offset:#x} (marker scan)");
    Ok(Located {
        discovery: Discovery::MarkerScan,
        offset,
        params,
    })
}

/// First offset holding `"zELF"` plus an allow-listed suffix whose fixed
/// header is plausible.
pub fn scan_markers(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(MARKER_PREFIX.len())
        .enumerate()
        .filter(|(_, w)| *w == MARKER_PREFIX)
        .map(|(i, _)| i)
        .find(|&i| plausible_at(bytes, i))
}

fn plausible_at(bytes: &[u8], i: usize) -> bool {
    let Some(h) = bytes.get(i..i + LEGACY_HEADER_LEN) else {
        return false;
    };
    if !CodecKind::from_suffix(&h[4..6]).is_some_and(CodecKind::is_scan_visible) {
        return false;
    }
    let orig_size = LE::read_u64(&h[6..14]);
    let comp_size = LE::read_i32(&h[22..26]);
    let remaining = bytes.len() - i - LEGACY_HEADER_LEN;
    orig_size > 0 && comp_size > 0 && comp_size as usize <= remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerHeader;
    use crate::params::ParamsBlock;
    use crate::segments::SegmentFlags;

    fn container(codec: CodecKind) -> Vec<u8> {
        ContainerHeader::new(codec, 100, 0, 4, Some(100))
            .unwrap()
            .encode(&[1, 2, 3, 4])
    }

    #[test]
    fn scan_skips_structured_only_suffixes_and_implausible_headers() {
        let mut file = vec![0u8; 16];
        // Density is reachable only through a ParamsBlock
        file.extend_from_slice(&container(CodecKind::Density));
        // bare marker with an empty header
        file.extend_from_slice(b"zELFl4");
        file.extend_from_slice(&[0u8; 20]);
        let good = file.len();
        file.extend_from_slice(&container(CodecKind::Lz4));

        assert_eq!(scan_markers(&file), Some(good));
    }

    #[test]
    fn scan_rejects_comp_size_past_end() {
        let mut c = container(CodecKind::Lz4);
        // three bytes after the fixed header, comp_size says four
        c.truncate(LEGACY_HEADER_LEN + 3);
        assert_eq!(scan_markers(&c), None);
    }

    #[test]
    fn unpatched_params_fall_back_to_scan() {
        let mut file = ParamsBlock::new(false, false, None).encode();
        let at = file.len();
        file.extend_from_slice(&container(CodecKind::Lz4));

        let located = locate(&file, &[]).unwrap();
        assert_eq!(located.discovery, Discovery::MarkerScan);
        assert_eq!(located.offset, at);
        assert!(located.params.is_some());
    }

    #[test]
    fn patched_params_resolve_through_segments() {
        let mut p = ParamsBlock::new(false, false, None);
        p.packed_data_vaddr = 0x400100;
        let mut file = p.encode();
        file.resize(0x100, 0);
        file.extend_from_slice(&container(CodecKind::Lz4));

        let segs = [SegmentInfo {
            offset: 0,
            vaddr: 0x400000,
            filesz: file.len() as u64,
            memsz: file.len() as u64,
            align: 0x1000,
            flags: SegmentFlags::from_bits(4),
        }];
        let located = locate(&file, &segs).unwrap();
        assert_eq!(located.discovery, Discovery::Structured);
        assert_eq!(located.offset, 0x100);
    }

    #[test]
    fn unmapped_vaddr_is_fatal() {
        let mut p = ParamsBlock::new(false, false, None);
        p.packed_data_vaddr = 0x900000;
        let mut file = p.encode();
        file.extend_from_slice(&container(CodecKind::Lz4));
        assert!(matches!(locate(&file, &[]), Err(crate::Error::Resolution(_))));
    }

    #[test]
    fn nothing_to_find() {
        assert!(matches!(
            locate(&[0u8; 128], &[]),
            Err(crate::Error::Format(FormatError::NotFound))
        ));
    }
}
