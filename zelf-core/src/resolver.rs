use crate::error::ResolutionError;
use crate::segments::SegmentInfo;

/// Translates between virtual addresses and file offsets through a `PT_LOAD` table.
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver<'a> {
    segments: &'a [SegmentInfo],
}

impl<'a> AddressResolver<'a> {
    pub fn new(segments: &'a [SegmentInfo]) -> Self {
        AddressResolver { segments }
    }

    /// File offset backing `vaddr`.
    ///
    /// The first segment whose `[p_vaddr, p_vaddr + p_filesz)` holds the address
    /// wins. Addresses only covered by the zero-filled `memsz` tail have no file
    /// bytes and fail like unmapped ones.
    pub fn resolve(&self, vaddr: u64) -> Result<u64, ResolutionError> {
        self.segments
            .iter()
            .find(|seg| seg.contains_vaddr(vaddr))
            .and_then(|seg| seg.offset.checked_add(vaddr - seg.vaddr))
            .ok_or(ResolutionError { vaddr })
    }

    /// Virtual address a file offset is loaded at, used when patching addresses
    /// into a freshly built image.
    pub fn vaddr_of(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|seg| seg.contains_offset(offset))
            .and_then(|seg| seg.vaddr.checked_add(offset - seg.offset))
    }

    /// End of the furthest file-backed `PT_LOAD` range.
    pub fn loaded_file_end(&self) -> u64 {
        self.segments
            .iter()
            .map(SegmentInfo::file_end)
            .max()
            .unwrap_or(0)
    }
}
