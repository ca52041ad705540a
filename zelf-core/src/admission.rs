//! Pre-flight memory check for codecs whose working set grows with the input.
//!
//! [`admit`] is pure; [`SystemResources::detect`] is the only part that looks at
//! the running system.

use crate::codec::CodecKind;
use crate::error::{ResourceError, ResourceLimit};
use nix::sys::resource::{getrlimit, Resource};

const MIB: u64 = 1 << 20;

pub const EXOMIZER_FIXED_OVERHEAD: u64 = 128 * MIB;
pub const EXOMIZER_BYTES_PER_INPUT_BYTE: u64 = 5000;

pub const LZHAM_FIXED_OVERHEAD: u64 = 256 * MIB;
pub const LZHAM_DICT_SIZE: u64 = 1 << 29;
pub const LZHAM_DICT_FACTOR: u64 = 8;

impl CodecKind {
    /// Estimated peak memory for compressing `input_size` bytes, for codecs
    /// that need a pre-flight check. `None` means the codec is always admitted.
    pub fn working_set(self, input_size: u64) -> Option<u64> {
        match self {
            CodecKind::Exomizer => Some(
                EXOMIZER_FIXED_OVERHEAD
                    .saturating_add(input_size.saturating_mul(EXOMIZER_BYTES_PER_INPUT_BYTE)),
            ),
            CodecKind::Lzham => Some(LZHAM_FIXED_OVERHEAD + LZHAM_DICT_SIZE * LZHAM_DICT_FACTOR),
            _ => None,
        }
    }
}

/// Decides whether `codec` may run on `input_size` bytes. Unknown limits
/// (`None`) never refuse.
pub fn admit(
    codec: CodecKind,
    input_size: u64,
    available_ram: Option<u64>,
    rlimit_as: Option<u64>,
) -> Result<(), ResourceError> {
    let Some(needed) = codec.working_set(input_size) else {
        return Ok(());
    };

    let limits = [
        (ResourceLimit::AvailableRam, available_ram),
        (ResourceLimit::AddressSpace, rlimit_as),
    ];
    for (limit, available) in limits {
        if let Some(available) = available {
            if needed > available {
                return Err(ResourceError {
                    codec: codec.display_name(),
                    limit,
                    needed,
                    available,
                });
            }
        }
    }

    log::debug!(
        "{codec}: admitted, needs ~{} MiB (ram {:?}, rlimit_as {:?})",
        needed / MIB,
        available_ram,
        rlimit_as
    );
    Ok(())
}

/// Snapshot of the limits admission control compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemResources {
    pub available_ram: Option<u64>,
    pub rlimit_as: Option<u64>,
}

impl SystemResources {
    pub fn detect() -> Self {
        SystemResources {
            available_ram: std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|s| parse_mem_available(&s)),
            rlimit_as: address_space_limit(),
        }
    }

    /// No limits known; every codec is admitted.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn admit(&self, codec: CodecKind, input_size: u64) -> Result<(), ResourceError> {
        admit(codec, input_size, self.available_ram, self.rlimit_as)
    }
}

/// `MemAvailable` in bytes.
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        kib.checked_mul(1024)
    })
}

fn address_space_limit() -> Option<u64> {
    match getrlimit(Resource::RLIMIT_AS) {
        Ok((soft, _hard)) if soft != nix::libc::RLIM_INFINITY => Some(soft as u64),
        Ok(_) => None,
        Err(e) => {
            log::debug!("getrlimit(RLIMIT_AS) failed: {e}");
            None
        }
    }
}
